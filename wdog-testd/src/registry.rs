//! Registration bookkeeping.
//!
//! Pure state, no I/O and no clock of its own: callers pass `Instant::now()`
//! in, which keeps the deadline arithmetic unit-testable without sleeping.
//! Registrations live only in memory — a daemon restart starts from an empty
//! table, which is exactly what drives the client's transparent re-subscribe.
//! Each table seeds its ack sequence differently, so tokens issued before a
//! restart read as stale afterwards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use wdog_proto::{AckToken, DaemonStatus, ErrorCode, RegistrationId, WireError};

/// One subscriber as the daemon tracks it.
#[derive(Debug, Clone)]
pub struct Registration {
    pub id: RegistrationId,
    pub pid: u32,
    pub label: Option<Vec<u8>>,
    pub timeout: Duration,
    pub ack: AckToken,
    pub deadline: Instant,
}

/// The registration table plus the enforcement switch.
#[derive(Debug)]
pub struct Registry {
    min_timeout: Duration,
    enabled: bool,
    next_id: i32,
    next_ack: u32,
    subscribers: HashMap<i32, Registration>,
}

impl Registry {
    pub fn new(min_timeout: Duration) -> Self {
        Self {
            min_timeout,
            enabled: true,
            // Ids restart at zero on every instance; the per-instance ack
            // seed is what makes a pre-restart (id, ack) pair read as stale.
            next_id: 0,
            next_ack: ack_seed(),
            subscribers: HashMap::new(),
        }
    }

    /// Admits a new subscriber. Ids are never reused within one instance.
    pub fn subscribe(
        &mut self,
        pid: u32,
        label: Option<Vec<u8>>,
        timeout_ms: u32,
        now: Instant,
    ) -> Result<(RegistrationId, AckToken), WireError> {
        let timeout = check_timeout(self.min_timeout, timeout_ms)?;
        let id = RegistrationId(self.next_id);
        self.next_id += 1;
        let ack = AckToken(self.next_ack);
        self.next_ack = self.next_ack.wrapping_add(1);
        self.subscribers.insert(
            id.0,
            Registration {
                id,
                pid,
                label,
                timeout,
                ack,
                deadline: now + timeout,
            },
        );
        Ok((id, ack))
    }

    /// Drops a subscriber after the usual id/ack fencing.
    pub fn unsubscribe(&mut self, id: RegistrationId, ack: AckToken) -> Result<(), WireError> {
        self.lookup(id, ack)?;
        self.subscribers.remove(&id.0);
        Ok(())
    }

    /// Pushes the deadline one timeout window out and issues a fresh ack.
    pub fn kick(
        &mut self,
        id: RegistrationId,
        ack: AckToken,
        now: Instant,
    ) -> Result<AckToken, WireError> {
        let next = AckToken(self.next_ack);
        let reg = self.lookup(id, ack)?;
        reg.ack = next;
        reg.deadline = now + reg.timeout;
        self.next_ack = self.next_ack.wrapping_add(1);
        Ok(next)
    }

    /// Installs a new timeout window, effective from `now`, and issues a
    /// fresh ack. The minimum applies here just as at subscribe time, but the
    /// (id, ack) fence is checked first: a stale caller hears stale even when
    /// its new timeout is also invalid.
    pub fn extend(
        &mut self,
        id: RegistrationId,
        timeout_ms: u32,
        ack: AckToken,
        now: Instant,
    ) -> Result<AckToken, WireError> {
        let next = AckToken(self.next_ack);
        let min_timeout = self.min_timeout;
        let reg = self.lookup(id, ack)?;
        let timeout = check_timeout(min_timeout, timeout_ms)?;
        reg.timeout = timeout;
        reg.deadline = now + timeout;
        reg.ack = next;
        self.next_ack = self.next_ack.wrapping_add(1);
        Ok(next)
    }

    /// Switches deadline enforcement. Re-enabling re-bases every deadline to
    /// `now + timeout`, so time spent disabled counts against nobody.
    pub fn set_enabled(&mut self, enable: bool, now: Instant) -> bool {
        if enable && !self.enabled {
            for reg in self.subscribers.values_mut() {
                reg.deadline = now + reg.timeout;
            }
        }
        self.enabled = enable;
        self.enabled
    }

    pub fn status(&self) -> DaemonStatus {
        DaemonStatus {
            enabled: self.enabled,
            subscribers: self.subscribers.len(),
        }
    }

    /// Removes and returns every registration whose deadline has passed.
    /// No-op while enforcement is disabled.
    pub fn expire(&mut self, now: Instant) -> Vec<Registration> {
        if !self.enabled {
            return Vec::new();
        }
        let expired: Vec<i32> = self
            .subscribers
            .values()
            .filter(|reg| now >= reg.deadline)
            .map(|reg| reg.id.0)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.subscribers.remove(&id))
            .collect()
    }

    fn lookup(
        &mut self,
        id: RegistrationId,
        ack: AckToken,
    ) -> Result<&mut Registration, WireError> {
        match self.subscribers.get_mut(&id.0) {
            Some(reg) if reg.ack == ack => Ok(reg),
            Some(_) => Err(stale(format!("ack token out of date for registration {id}"))),
            None => Err(stale(format!("unknown registration {id}"))),
        }
    }
}

fn check_timeout(min_timeout: Duration, timeout_ms: u32) -> Result<Duration, WireError> {
    let timeout = Duration::from_millis(u64::from(timeout_ms));
    if timeout_ms == 0 || timeout < min_timeout {
        return Err(WireError::new(
            ErrorCode::InvalidTimeout,
            format!(
                "timeout {timeout_ms} ms is below the daemon minimum of {} ms",
                min_timeout.as_millis()
            ),
        ));
    }
    Ok(timeout)
}

fn stale(message: String) -> WireError {
    WireError::new(ErrorCode::StaleRegistration, message)
}

/// Starting ack for a fresh registry. The clock, the pid, and an in-process
/// counter are mixed so a new instance never begins at a token its
/// predecessor handed out.
fn ack_seed() -> u32 {
    static INSTANCE: AtomicU32 = AtomicU32::new(0);
    let clock = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|epoch| epoch.subsec_nanos())
        .unwrap_or(0);
    let instance = INSTANCE.fetch_add(1, Ordering::Relaxed);
    // Golden-ratio increment spreads in-process instances far apart.
    clock
        .wrapping_add(std::process::id().rotate_left(12))
        .wrapping_add(instance.wrapping_mul(0x9e37_79b9))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Registry {
        Registry::new(Duration::from_millis(100))
    }

    #[test]
    fn subscribe_assigns_distinct_ids_and_acks() {
        let mut reg = table();
        let now = Instant::now();
        let (id_a, ack_a) = reg.subscribe(1, None, 200, now).expect("subscribe a");
        let (id_b, ack_b) = reg.subscribe(2, Some(b"b".to_vec()), 200, now).expect("subscribe b");
        assert_ne!(id_a, id_b);
        assert_ne!(ack_a, ack_b);
        assert_eq!(reg.status().subscribers, 2);
    }

    #[test]
    fn below_minimum_timeout_is_rejected() {
        let mut reg = table();
        let err = reg.subscribe(1, None, 50, Instant::now()).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTimeout);
        assert!(err.message.contains("100 ms"), "got: {}", err.message);
        assert_eq!(reg.status().subscribers, 0);
    }

    #[test]
    fn zero_timeout_is_rejected_even_with_no_minimum() {
        let mut reg = Registry::new(Duration::ZERO);
        let err = reg.subscribe(1, None, 0, Instant::now()).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTimeout);
    }

    #[test]
    fn kick_needs_the_current_ack() {
        let mut reg = table();
        let now = Instant::now();
        let (id, ack) = reg.subscribe(1, None, 200, now).expect("subscribe");
        let err = reg.kick(id, AckToken(ack.0.wrapping_add(1)), now).unwrap_err();
        assert_eq!(err.code, ErrorCode::StaleRegistration);
        // The real ack still works afterwards.
        reg.kick(id, ack, now).expect("kick with the current ack");
    }

    #[test]
    fn unknown_id_reads_as_stale() {
        let mut reg = table();
        let err = reg.kick(RegistrationId(9), AckToken(1), Instant::now()).unwrap_err();
        assert_eq!(err.code, ErrorCode::StaleRegistration);
    }

    #[test]
    fn kick_pushes_the_deadline() {
        let mut reg = table();
        let t0 = Instant::now();
        let (id, ack) = reg.subscribe(1, None, 1_000, t0).expect("subscribe");
        let ack = reg.kick(id, ack, t0 + Duration::from_millis(500)).expect("kick");
        assert!(reg.expire(t0 + Duration::from_millis(1_200)).is_empty());
        let expired = reg.expire(t0 + Duration::from_millis(1_600));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].ack, ack);
    }

    #[test]
    fn extend_installs_the_new_window() {
        let mut reg = table();
        let t0 = Instant::now();
        let (id, ack) = reg.subscribe(1, None, 200, t0).expect("subscribe");
        let _ack = reg.extend(id, 1_000, ack, t0).expect("extend");
        assert!(reg.expire(t0 + Duration::from_millis(500)).is_empty());
        assert_eq!(reg.expire(t0 + Duration::from_millis(1_100)).len(), 1);
    }

    #[test]
    fn extend_enforces_the_minimum() {
        let mut reg = table();
        let t0 = Instant::now();
        let (id, ack) = reg.subscribe(1, None, 200, t0).expect("subscribe");
        let err = reg.extend(id, 50, ack, t0).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidTimeout);
        // Rejected extend leaves the registration untouched.
        reg.kick(id, ack, t0).expect("kick after rejected extend");
    }

    #[test]
    fn extend_fences_before_validating_the_timeout() {
        let mut reg = table();
        let t0 = Instant::now();
        let (id, ack) = reg.subscribe(1, None, 200, t0).expect("subscribe");
        // Bad pair and bad timeout together: the fence answers first, so a
        // client whose registration is gone always hears stale.
        let err = reg.extend(id, 50, AckToken(ack.0.wrapping_add(1)), t0).unwrap_err();
        assert_eq!(err.code, ErrorCode::StaleRegistration);
        reg.kick(id, ack, t0).expect("kick with the current ack");
    }

    #[test]
    fn expired_registrations_are_removed_and_returned() {
        let mut reg = table();
        let t0 = Instant::now();
        let (_, _) = reg.subscribe(7, Some(b"late".to_vec()), 200, t0).expect("subscribe");
        let expired = reg.expire(t0 + Duration::from_millis(300));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].pid, 7);
        assert_eq!(reg.status().subscribers, 0);
    }

    #[test]
    fn disabled_enforcement_never_expires() {
        let mut reg = table();
        let t0 = Instant::now();
        reg.subscribe(1, None, 200, t0).expect("subscribe");
        assert!(!reg.set_enabled(false, t0));
        assert!(reg.expire(t0 + Duration::from_secs(60)).is_empty());
        assert_eq!(reg.status().subscribers, 1);
    }

    #[test]
    fn reenabling_rebases_deadlines() {
        let mut reg = table();
        let t0 = Instant::now();
        reg.subscribe(1, None, 200, t0).expect("subscribe");
        reg.set_enabled(false, t0);
        let resumed = t0 + Duration::from_secs(5);
        assert!(reg.set_enabled(true, resumed));
        assert!(reg.expire(resumed + Duration::from_millis(100)).is_empty());
        assert_eq!(reg.expire(resumed + Duration::from_millis(300)).len(), 1);
    }

    #[test]
    fn unsubscribe_checks_the_ack_and_removes() {
        let mut reg = table();
        let now = Instant::now();
        let (id, ack) = reg.subscribe(1, None, 200, now).expect("subscribe");
        let err = reg.unsubscribe(id, AckToken(ack.0.wrapping_add(1))).unwrap_err();
        assert_eq!(err.code, ErrorCode::StaleRegistration);
        reg.unsubscribe(id, ack).expect("unsubscribe");
        assert_eq!(reg.status().subscribers, 0);
        let err = reg.unsubscribe(id, ack).unwrap_err();
        assert_eq!(err.code, ErrorCode::StaleRegistration);
    }

    #[test]
    fn a_fresh_table_does_not_reissue_its_predecessors_acks() {
        let now = Instant::now();
        let mut old = table();
        let (old_id, old_ack) = old.subscribe(1, None, 200, now).expect("subscribe on old");
        drop(old);

        // A replacement table stands in for a restarted daemon: the first
        // subscriber lands on the same id, but never on the same ack.
        let mut fresh = table();
        let (new_id, new_ack) = fresh.subscribe(2, None, 200, now).expect("subscribe on fresh");
        assert_eq!(new_id, old_id);
        assert_ne!(new_ack, old_ack);

        let err = fresh.kick(old_id, old_ack, now).unwrap_err();
        assert_eq!(err.code, ErrorCode::StaleRegistration);
        // The surviving registration is untouched by the stale attempt.
        fresh.kick(new_id, new_ack, now).expect("kick with the current ack");
    }
}
