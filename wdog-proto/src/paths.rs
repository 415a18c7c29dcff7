//! Where the daemon socket lives.
//!
//! Resolution order for the default path: `WDOG_SOCK` override, then
//! `$XDG_RUNTIME_DIR/wdog/`, then `~/.wdog/`, then the system temp dir.
//! Tests never rely on the ambient environment; they pass explicit paths
//! through [`socket_path_in`].

use std::env;
use std::io;
use std::path::{Path, PathBuf};

/// Environment variable overriding the full socket path.
pub const SOCKET_ENV: &str = "WDOG_SOCK";
/// Socket filename inside a wdog runtime directory.
pub const SOCKET_FILE: &str = "wdogd.sock";

/// Socket path for this environment.
pub fn socket_path() -> PathBuf {
    if let Ok(path) = env::var(SOCKET_ENV) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    socket_path_in(&runtime_dir())
}

/// Socket path inside an explicit runtime directory.
pub fn socket_path_in(dir: &Path) -> PathBuf {
    dir.join(SOCKET_FILE)
}

/// Directory the daemon socket lives in when no override is set.
pub fn runtime_dir() -> PathBuf {
    if let Ok(dir) = env::var("XDG_RUNTIME_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir).join("wdog");
        }
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".wdog");
    }
    env::temp_dir().join("wdog")
}

/// Creates the runtime directory (if needed) with owner-only access.
pub fn ensure_runtime_dir(dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dir)?;
    set_dir_permissions(dir)
}

#[cfg(unix)]
fn set_dir_permissions(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
}
#[cfg(not(unix))]
fn set_dir_permissions(_dir: &Path) -> io::Result<()> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
