//! Download executor: turns requests into yt-dlp invocations.
//!
//! Files land in `<download_dir>/<channel>/<title>.<ext>`; the shared archive
//! file keeps repeated runs from fetching the same video twice. Download-log
//! and hardlink problems never fail a download, they are reported through the
//! `warnings` field of the result instead.

use std::{
    io,
    path::{Path, PathBuf},
    process::Command,
    sync::LazyLock,
    time::{Duration, SystemTime},
};

use regex::RegexSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{
    activity::ActivityLog,
    channel::{channel_dir_from_url, sanitize_channel_name},
    config::ServiceConfig,
    error::DownloadError,
    hardlink::{LinkOutcome, link_into},
    process::{MKDIR_TIMEOUT, run_with_timeout},
    store::{DEFAULT_QUALITY, Settings},
};

const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";
const DESCRIPTION_LIMIT: usize = 500;

static YOUTUBE_URL: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)(?:https?://)?(?:www\.)?(?:youtube\.com|youtu\.be)",
        r"(?i)youtube\.com/watch",
        r"(?i)youtube\.com/channel",
        r"(?i)youtube\.com/c/",
        r"(?i)youtube\.com/user/",
        r"(?i)youtu\.be/",
    ])
    .expect("static regex set")
});

pub fn is_youtube_url(url: &str) -> bool {
    !url.is_empty() && YOUTUBE_URL.is_match(url)
}

/// Format and post-processing choices for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOptions {
    pub quality: String,
    pub format: Option<String>,
    pub audio_only: bool,
    pub auto_hardlink: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            quality: DEFAULT_QUALITY.to_string(),
            format: None,
            audio_only: false,
            auto_hardlink: false,
        }
    }
}

impl DownloadOptions {
    /// Options for a subscription fetch: global settings plus the
    /// subscription's own audio flag.
    pub fn from_settings(settings: &Settings, audio_only: bool) -> Self {
        Self {
            quality: settings.quality().to_string(),
            format: settings.format().map(str::to_owned),
            audio_only,
            auto_hardlink: settings.auto_hardlink(),
        }
    }

    fn format_args(&self) -> Vec<String> {
        if self.audio_only {
            return [
                "--format",
                "bestaudio/best",
                "--extract-audio",
                "--audio-format",
                "mp3",
                "--audio-quality",
                "0",
            ]
            .map(String::from)
            .to_vec();
        }
        let format = self
            .format
            .as_deref()
            .filter(|format| !format.is_empty())
            .unwrap_or(&self.quality);
        vec!["--format".to_string(), format.to_string()]
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VideoDownload {
    pub title: String,
    pub channel: String,
    pub duration: i64,
    pub filesize: i64,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardlinked: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VideoInfo {
    pub title: String,
    pub channel: String,
    pub duration: i64,
    pub view_count: i64,
    pub upload_date: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelDownload {
    pub downloaded_count: usize,
    /// Playlist entries that produced nothing: failed or already archived.
    pub skipped_count: usize,
    pub channel: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardlinked_count: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// The handful of yt-dlp JSON fields we report back.
#[derive(Debug, Default, Deserialize)]
struct RawInfo {
    title: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    duration: Option<f64>,
    filesize: Option<i64>,
    filesize_approx: Option<f64>,
    view_count: Option<i64>,
    upload_date: Option<String>,
    description: Option<String>,
    entries: Option<Vec<Value>>,
}

impl RawInfo {
    fn uploader_name(&self) -> Option<&str> {
        self.uploader
            .as_deref()
            .or(self.channel.as_deref())
            .filter(|name| !name.is_empty())
    }

    fn duration_secs(&self) -> i64 {
        self.duration.map(|d| d.round() as i64).unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct Downloader {
    ytdlp: PathBuf,
    probe_timeout: Duration,
    download_timeout: Duration,
    download_dir: PathBuf,
    archive_file: PathBuf,
    media_dir: PathBuf,
    log: ActivityLog,
}

impl Downloader {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            ytdlp: config.ytdlp_path.clone(),
            probe_timeout: config.ytdlp_probe_timeout,
            download_timeout: config.ytdlp_download_timeout,
            download_dir: config.download_dir.clone(),
            archive_file: config.archive_file.clone(),
            media_dir: config.media_dir.clone(),
            log: ActivityLog::new(config.log_file.clone()),
        }
    }

    pub fn activity_log(&self) -> &ActivityLog {
        &self.log
    }

    pub fn download_video(
        &self,
        url: &str,
        options: &DownloadOptions,
    ) -> Result<VideoDownload, DownloadError> {
        if !is_youtube_url(url) {
            return Err(DownloadError::InvalidUrl);
        }
        let (channel_name, channel_dir) = self.prepare_channel_dir(url)?;

        let mut command = self.download_command(&channel_dir, options);
        command.arg(url);
        let (success, stdout, stderr) = self.run(command, self.download_timeout)?;
        let info = parse_info(&stdout).ok_or_else(|| failure(success, &stderr))?;

        let mut result = VideoDownload {
            title: info.title.clone().unwrap_or_else(|| "Unknown".to_string()),
            channel: info
                .uploader_name()
                .map(str::to_owned)
                .unwrap_or_else(|| channel_name.clone()),
            duration: info.duration_secs(),
            filesize: info
                .filesize
                .or(info.filesize_approx.map(|size| size as i64))
                .unwrap_or(0),
            path: channel_dir.display().to_string(),
            hardlinked: None,
            warnings: Vec::new(),
        };

        if options.auto_hardlink
            && let Some(file) = newest_file(&channel_dir)
        {
            let linked = self.hardlink(&file, &mut result.warnings);
            result.hardlinked = Some(linked);
        }

        if let Err(err) = self
            .log
            .record_download(&result.title, &result.channel, url)
        {
            warn!(error = %err, "could not append to download log");
            result.warnings.push(format!("Download log error: {err}"));
        }

        info!(url, title = %result.title, channel = %result.channel, "video downloaded");
        Ok(result)
    }

    /// Metadata only; nothing is written to disk.
    pub fn video_info(&self, url: &str) -> Result<VideoInfo, DownloadError> {
        if !is_youtube_url(url) {
            return Err(DownloadError::InvalidUrl);
        }
        let mut command = Command::new(&self.ytdlp);
        command
            .args(["--dump-single-json", "--skip-download", "--no-warnings"])
            .arg(url);
        let (success, stdout, stderr) = self.run(command, self.probe_timeout)?;
        let info = parse_info(&stdout).ok_or_else(|| failure(success, &stderr))?;

        Ok(VideoInfo {
            title: info.title.clone().unwrap_or_else(|| "Unknown".to_string()),
            channel: info
                .uploader_name()
                .unwrap_or("Unknown")
                .to_string(),
            duration: info.duration_secs(),
            view_count: info.view_count.unwrap_or(0),
            upload_date: info.upload_date.clone().unwrap_or_default(),
            description: info
                .description
                .as_deref()
                .unwrap_or_default()
                .chars()
                .take(DESCRIPTION_LIMIT)
                .collect(),
        })
    }

    /// Pulls every new upload of a channel. Individual entry failures do not
    /// stop the batch; they only show up in `skipped_count`.
    pub fn download_channel(
        &self,
        channel_url: &str,
        options: &DownloadOptions,
    ) -> Result<ChannelDownload, DownloadError> {
        if !is_youtube_url(channel_url) {
            return Err(DownloadError::InvalidUrl);
        }
        let (channel_name, channel_dir) = self.prepare_channel_dir(channel_url)?;

        let mut command = self.download_command(&channel_dir, options);
        command.arg("--ignore-errors").arg(channel_url);
        let (success, stdout, stderr) = self.run(command, self.download_timeout)?;
        let info = parse_info(&stdout).ok_or_else(|| failure(success, &stderr))?;
        if !success {
            debug!(channel_url, stderr = %stderr.trim(), "yt-dlp reported per-entry errors");
        }

        let (downloaded_count, skipped_count) = match &info.entries {
            Some(entries) => {
                let downloaded = entries.iter().filter(|entry| !entry.is_null()).count();
                (downloaded, entries.len() - downloaded)
            }
            None => (1, 0),
        };

        let mut warnings = Vec::new();
        let hardlinked_count = options
            .auto_hardlink
            .then(|| self.hardlink_all(&channel_dir, &mut warnings));

        info!(
            channel_url,
            downloaded_count, skipped_count, "channel fetch finished"
        );
        Ok(ChannelDownload {
            downloaded_count,
            skipped_count,
            channel: channel_name,
            path: channel_dir.display().to_string(),
            hardlinked_count,
            warnings,
        })
    }

    fn download_command(&self, channel_dir: &Path, options: &DownloadOptions) -> Command {
        let mut command = Command::new(&self.ytdlp);
        command
            .arg("--output")
            .arg(channel_dir.join(OUTPUT_TEMPLATE))
            .arg("--download-archive")
            .arg(&self.archive_file)
            .args(["--dump-single-json", "--no-simulate", "--no-progress"])
            .args(options.format_args());
        command
    }

    fn run(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<(bool, String, String), DownloadError> {
        let output = run_with_timeout(command, timeout).map_err(|err| {
            if err.kind() == io::ErrorKind::TimedOut {
                DownloadError::Tool(format!(
                    "yt-dlp timed out after {}s",
                    timeout.as_secs()
                ))
            } else {
                DownloadError::io(format!("running {}", self.ytdlp.display()), err)
            }
        })?;
        Ok((output.success(), output.stdout, output.stderr))
    }

    /// `mkdir -p` on the download root is best effort. The channel directory
    /// itself must be creatable.
    fn prepare_channel_dir(&self, url: &str) -> Result<(String, PathBuf), DownloadError> {
        let mut mkdir = Command::new("mkdir");
        mkdir.arg("-p").arg(&self.download_dir);
        match run_with_timeout(mkdir, MKDIR_TIMEOUT) {
            Ok(output) if output.success() => {}
            Ok(output) => warn!(output = %output.combined(), "mkdir -p download dir failed"),
            Err(err) => warn!(error = %err, "mkdir -p download dir failed"),
        }

        let channel_name = self.resolve_channel_name(url);
        let channel_dir = self.download_dir.join(&channel_name);
        std::fs::create_dir_all(&channel_dir)
            .map_err(|err| DownloadError::io(format!("creating {}", channel_dir.display()), err))?;
        Ok((channel_name, channel_dir))
    }

    fn resolve_channel_name(&self, url: &str) -> String {
        let mut command = Command::new(&self.ytdlp);
        command
            .args(["--flat-playlist", "--dump-single-json", "--quiet", "--no-warnings"])
            .arg(url);
        let reported = match self.run(command, self.probe_timeout) {
            Ok((true, stdout, _)) => parse_info(&stdout)
                .and_then(|info| info.uploader_name().and_then(sanitize_channel_name)),
            Ok((false, _, stderr)) => {
                debug!(url, stderr = %stderr.trim(), "channel lookup failed");
                None
            }
            Err(err) => {
                debug!(url, error = %err, "channel lookup failed");
                None
            }
        };
        reported.unwrap_or_else(|| channel_dir_from_url(url))
    }

    fn hardlink(&self, file: &Path, warnings: &mut Vec<String>) -> bool {
        match link_into(file, &self.media_dir) {
            Ok(LinkOutcome::Linked) => true,
            Ok(LinkOutcome::Skipped) => false,
            Err(err) => {
                warn!(file = %file.display(), error = %err, "hardlink failed");
                self.log.append_soft(&format!("Hardlink error: {err}"));
                warnings.push(format!("Hardlink error: {err}"));
                false
            }
        }
    }

    fn hardlink_all(&self, channel_dir: &Path, warnings: &mut Vec<String>) -> usize {
        files_in(channel_dir)
            .into_iter()
            .filter(|file| self.hardlink(file, warnings))
            .count()
    }
}

/// yt-dlp may print progress or warnings before the JSON document, so the
/// last line that parses wins.
fn parse_info(stdout: &str) -> Option<RawInfo> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str(line).ok())
}

fn failure(success: bool, stderr: &str) -> DownloadError {
    let message = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty());
    match (success, message) {
        (false, Some(message)) => DownloadError::Tool(message.to_string()),
        _ => DownloadError::NoInfo,
    }
}

fn files_in(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect()
}

/// The file yt-dlp most likely just wrote.
fn newest_file(dir: &Path) -> Option<PathBuf> {
    files_in(dir).into_iter().max_by_key(|path| {
        path.metadata()
            .and_then(|meta| meta.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH)
    })
}
