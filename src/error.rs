//! Error types for the store, the schedule reconciler and the download
//! executor.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Channel already subscribed")]
    DuplicateSubscription(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("serializing {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{} is not a valid subscriptions file: {source}", path.display())]
    Corrupt {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("{field} must be between 0 and {max}")]
    InvalidTimeRange {
        field: &'static str,
        max: u8,
        value: i64,
    },

    #[error("{0}")]
    SchedulerCommandFailed(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Invalid YouTube URL")]
    InvalidUrl,

    #[error("yt-dlp failed: {0}")]
    Tool(String),

    #[error("Failed to extract video information")]
    NoInfo,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl ScheduleError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl DownloadError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
