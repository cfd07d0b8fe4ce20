//! Parent-side checks before a credential switch is attempted.

use super::Credentials;
use crate::config::types::{JudgeError, Result};
use nix::unistd::geteuid;

/// Only root may change identity.
pub fn validate_credentials(creds: &Credentials) -> Result<()> {
    if !geteuid().is_root() {
        return Err(JudgeError::RootRequired(format!(
            "switching to uid={:?} gid={:?} needs euid 0 (current euid {})",
            creds.uid,
            creds.gid,
            geteuid()
        )));
    }

    if creds.uid == Some(0) {
        log::warn!("Target uid is 0; the program keeps root privileges");
    }
    Ok(())
}
