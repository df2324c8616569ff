use nix::unistd::geteuid;

use crate::errors::{AppError, Result};

/// Stopping services, rewriting the live directories and administering the
/// database all need root.
pub fn is_elevated() -> bool {
    geteuid().is_root()
}

pub fn ensure_elevated(check: fn() -> bool) -> Result<()> {
    if check() {
        Ok(())
    } else {
        Err(AppError::Privilege(format!(
            "must run as root (effective uid is {})",
            geteuid()
        )))
    }
}
