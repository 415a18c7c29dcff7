//! The failure side channel: reset-reason records and the supervisor script.
//!
//! On a missed deadline the daemon records who failed and why. The record is
//! a plain `Key : Value` text file so harnesses (and humans) can read it
//! without the wire protocol, and an optional supervisor script receives the
//! same facts as positional arguments.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::{io_err, TestdError};
use crate::registry::Registration;

/// Reset-reason code for a missed deadline; mirrored in the record and in the
/// supervisor arguments.
pub const RESET_CODE_MISSED_DEADLINE: u32 = 1;
/// Fixed first argument passed to the supervisor script.
pub const SUPERVISOR_TAG: &str = "supervised-reset";

/// Writes the reset-reason record for one expired registration.
///
/// Write flow: format → `.tmp` sibling → `chmod 0600` → `rename`, so readers
/// never observe a half-written record.
pub fn write_reset_reason(path: &Path, reg: &Registration) -> Result<(), TestdError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }

    let record = format!(
        "Reset reason : Failed to meet deadline\n\
         Reset code   : {code}\n\
         PID          : {pid}\n\
         Label        : {label}\n\
         Timestamp    : {stamp}\n",
        code = RESET_CODE_MISSED_DEADLINE,
        pid = reg.pid,
        label = label_lossy(reg),
        stamp = Utc::now().to_rfc3339(),
    );

    let tmp = tmp_sibling(path);
    std::fs::write(&tmp, record).map_err(|e| io_err(&tmp, e))?;
    set_file_permissions(&tmp)?;
    std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

/// Parses a reset-reason record back into its key/value pairs.
pub fn parse_reset_reason(contents: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for line in contents.lines() {
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            let value = value.trim();
            if !key.is_empty() && !value.is_empty() {
                fields.insert(key.to_owned(), value.to_owned());
            }
        }
    }
    fields
}

/// Fire-and-forget supervisor invocation:
/// `<script> supervised-reset <code> <pid> <label>`.
pub fn spawn_supervisor(script: &Path, reg: &Registration) {
    let result = Command::new(script)
        .arg(SUPERVISOR_TAG)
        .arg(RESET_CODE_MISSED_DEADLINE.to_string())
        .arg(reg.pid.to_string())
        .arg(label_lossy(reg))
        .spawn();
    match result {
        Ok(mut child) => {
            // Reap off the hot path; the daemon never waits on the script.
            std::thread::spawn(move || {
                let _ = child.wait();
            });
            info!(script = %script.display(), pid = reg.pid, "supervisor invoked");
        }
        Err(err) => {
            warn!(script = %script.display(), error = %err, "supervisor failed to start");
        }
    }
}

fn label_lossy(reg: &Registration) -> String {
    match &reg.label {
        Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        None => "-".to_owned(),
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "reset-reason".to_owned());
    path.with_file_name(format!("{name}.tmp"))
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), TestdError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), TestdError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
