#![forbid(unsafe_code)]

//! Process-level guards for the backend binary.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when the backend is started as root. Privileged crontab and
/// script operations go through `sudo` with a narrow sudoers rule; running
/// the whole HTTP service as root would bypass that boundary.
pub fn ensure_not_root(process: &str) -> Result<()> {
    if Uid::current().is_root() {
        bail!("{process} must not be run as root; run it as the web service user and grant crontab access through sudo");
    }
    Ok(())
}
