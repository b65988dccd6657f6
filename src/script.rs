//! The shell script the cron entry runs.
//!
//! Content depends only on configured paths, so regenerating it on every
//! schedule write is idempotent.

use std::path::{Path, PathBuf};

use crate::config::ServiceConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronScript {
    pub subscriptions_file: PathBuf,
    pub settings_file: PathBuf,
    pub download_dir: PathBuf,
    pub archive_file: PathBuf,
    pub ytdlp_path: PathBuf,
}

impl CronScript {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            subscriptions_file: config.subscriptions_file.clone(),
            settings_file: config.settings_file.clone(),
            download_dir: config.download_dir.clone(),
            archive_file: config.archive_file.clone(),
            ytdlp_path: config.ytdlp_path.clone(),
        }
    }

    pub fn render(&self) -> String {
        format!(
            r#"#!/bin/bash
# HOMESERVER YouTube Subscription Check
# Generated by yt-premium; edits are overwritten on the next schedule change.

SUBSCRIPTIONS_FILE={subscriptions}
SETTINGS_FILE={settings}
DOWNLOAD_DIR={download_dir}
ARCHIVE_FILE={archive}
YTDLP={ytdlp}

mkdir -p "$DOWNLOAD_DIR"

if [ -f "$SETTINGS_FILE" ]; then
    QUALITY=$(jq -r '.quality // "best"' "$SETTINGS_FILE")
    FORMAT=$(jq -r '.format // "bestvideo+bestaudio"' "$SETTINGS_FILE")
else
    QUALITY="best"
    FORMAT="bestvideo+bestaudio"
fi
if [ -z "$FORMAT" ] || [ "$FORMAT" = "null" ]; then
    FORMAT="$QUALITY"
fi

if [ -f "$SUBSCRIPTIONS_FILE" ]; then
    jq -c '.subscriptions[]?' "$SUBSCRIPTIONS_FILE" | while read -r subscription; do
        channel_url=$(echo "$subscription" | jq -r '.url // empty')
        audio_only=$(echo "$subscription" | jq -r '.audio_only // false')

        if [ -n "$channel_url" ]; then
            if [ "$audio_only" = "true" ]; then
                "$YTDLP" \
                    --extract-audio \
                    --audio-format mp3 \
                    --audio-quality 0 \
                    --download-archive "$ARCHIVE_FILE" \
                    --output "$DOWNLOAD_DIR/%(uploader)s/%(title)s.%(ext)s" \
                    --quiet \
                    --no-warnings \
                    "$channel_url" || true
            else
                "$YTDLP" \
                    --format "$FORMAT" \
                    --download-archive "$ARCHIVE_FILE" \
                    --output "$DOWNLOAD_DIR/%(uploader)s/%(title)s.%(ext)s" \
                    --quiet \
                    --no-warnings \
                    "$channel_url" || true
            fi
        fi
    done
fi
"#,
            subscriptions = shell_quote(&self.subscriptions_file),
            settings = shell_quote(&self.settings_file),
            download_dir = shell_quote(&self.download_dir),
            archive = shell_quote(&self.archive_file),
            ytdlp = shell_quote(&self.ytdlp_path),
        )
    }
}

pub fn shell_quote(path: &Path) -> String {
    let value = path.to_string_lossy();
    let mut quoted = String::from("'");
    for ch in value.chars() {
        if ch == '\'' {
            quoted.push_str("'\"'\"'");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}
