//! Advisory lock scoped to the data directory.
//!
//! Several server workers may share the same JSON files and the same crontab.
//! Every read-modify-write cycle holds this lock so concurrent writers queue
//! up instead of overwriting each other.

use std::{
    fs::{self, File, OpenOptions},
    io,
    path::Path,
};

use nix::fcntl::{Flock, FlockArg};

const LOCK_FILE: &str = ".lock";

/// Exclusive `flock(2)` held until dropped.
#[derive(Debug)]
pub struct DirLock {
    _lock: Flock<File>,
}

impl DirLock {
    /// Blocks until the lock on `dir` is acquired. Creates `dir` if needed.
    pub fn acquire(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(LOCK_FILE))?;
        let lock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| io::Error::from(errno))?;
        Ok(Self { _lock: lock })
    }
}
