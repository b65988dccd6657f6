//! Plain-text download log shown in the UI.

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::PathBuf,
};

use chrono::Local;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct ActivityLog {
    path: PathBuf,
}

impl ActivityLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn record_download(&self, title: &str, channel: &str, url: &str) -> io::Result<()> {
        self.append(&format!(
            "Downloaded: {title} | Channel: {channel} | URL: {url}"
        ))
    }

    /// Appends `[<timestamp>] <message>`.
    pub fn append(&self, message: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        writeln!(file, "[{timestamp}] {message}")
    }

    /// Like [`append`](Self::append) but never fails; the error only reaches
    /// the tracing output.
    pub fn append_soft(&self, message: &str) {
        if let Err(err) = self.append(message) {
            warn!(path = %self.path.display(), error = %err, "could not write download log");
        }
    }

    /// Whole log, or an empty string when it does not exist or is unreadable.
    pub fn read_all(&self) -> String {
        match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "could not read download log");
                String::new()
            }
        }
    }
}
