use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/yt-premium.toml";
pub const DEFAULT_DATA_DIR: &str = "/var/www/homeserver/data/youtube";
pub const DEFAULT_DOWNLOAD_DIR: &str = "/mnt/nas/youtube";
pub const DEFAULT_LOG_FILE: &str = "/var/www/homeserver/premium/youtube_logs.txt";
pub const DEFAULT_MEDIA_DIR: &str = "/mnt/nas/media/YouTube";
pub const DEFAULT_CRON_SCRIPT_PATH: &str = "/usr/local/bin/youtube-subscription-check.sh";
pub const DEFAULT_YTDLP_PATH: &str = "/usr/local/bin/yt-dlp";
pub const DEFAULT_SUDO_PATH: &str = "/usr/bin/sudo";
pub const DEFAULT_CRONTAB_PATH: &str = "crontab";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_YTDLP_PROBE_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_YTDLP_DOWNLOAD_TIMEOUT_SECS: u64 = 6 * 60 * 60;

const SUBSCRIPTIONS_FILE: &str = "subscriptions.json";
const SETTINGS_FILE: &str = "settings.json";
const ARCHIVE_FILE: &str = "downloaded.txt";

/// Raw contents of the TOML config file. Every key is optional; anything left
/// out falls back to the defaults above.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub data_dir: Option<PathBuf>,
    pub subscriptions_file: Option<PathBuf>,
    pub settings_file: Option<PathBuf>,
    pub download_dir: Option<PathBuf>,
    pub archive_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub media_dir: Option<PathBuf>,
    pub cron_script_path: Option<PathBuf>,
    pub ytdlp_path: Option<PathBuf>,
    pub sudo_path: Option<PathBuf>,
    pub crontab_path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ytdlp_probe_timeout_secs: Option<u64>,
    pub ytdlp_download_timeout_secs: Option<u64>,
}

/// Fully resolved locations handed to every component at construction.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub data_dir: PathBuf,
    pub subscriptions_file: PathBuf,
    pub settings_file: PathBuf,
    pub download_dir: PathBuf,
    pub archive_file: PathBuf,
    pub log_file: PathBuf,
    pub media_dir: PathBuf,
    pub cron_script_path: PathBuf,
    pub ytdlp_path: PathBuf,
    /// `None` runs privileged commands directly.
    pub sudo_path: Option<PathBuf>,
    pub crontab_path: PathBuf,
    pub host: String,
    pub port: u16,
    /// Limit for metadata-only yt-dlp calls.
    pub ytdlp_probe_timeout: Duration,
    /// Limit for a yt-dlp run that downloads media.
    pub ytdlp_download_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig::from_file_config(FileConfig::default())
    }
}

impl ServiceConfig {
    pub fn from_file_config(cfg: FileConfig) -> Self {
        let data_dir = cfg.data_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        let download_dir = cfg
            .download_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_DIR));
        let sudo_path = match cfg.sudo_path {
            Some(path) if path.as_os_str().is_empty() => None,
            Some(path) => Some(path),
            None => Some(PathBuf::from(DEFAULT_SUDO_PATH)),
        };
        Self {
            subscriptions_file: cfg
                .subscriptions_file
                .unwrap_or_else(|| data_dir.join(SUBSCRIPTIONS_FILE)),
            settings_file: cfg
                .settings_file
                .unwrap_or_else(|| data_dir.join(SETTINGS_FILE)),
            archive_file: cfg
                .archive_file
                .unwrap_or_else(|| download_dir.join(ARCHIVE_FILE)),
            log_file: cfg.log_file.unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE)),
            media_dir: cfg
                .media_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MEDIA_DIR)),
            cron_script_path: cfg
                .cron_script_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CRON_SCRIPT_PATH)),
            ytdlp_path: cfg
                .ytdlp_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_PATH)),
            crontab_path: cfg
                .crontab_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CRONTAB_PATH)),
            host: cfg
                .host
                .filter(|host| !host.is_empty())
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: cfg.port.unwrap_or(DEFAULT_PORT),
            ytdlp_probe_timeout: Duration::from_secs(
                cfg.ytdlp_probe_timeout_secs
                    .unwrap_or(DEFAULT_YTDLP_PROBE_TIMEOUT_SECS),
            ),
            ytdlp_download_timeout: Duration::from_secs(
                cfg.ytdlp_download_timeout_secs
                    .unwrap_or(DEFAULT_YTDLP_DOWNLOAD_TIMEOUT_SECS),
            ),
            sudo_path,
            data_dir,
            download_dir,
        }
    }

    /// Lays every path out under `root`, for running against a scratch
    /// directory.
    pub fn rooted_at(root: &Path) -> Self {
        ServiceConfig::from_file_config(FileConfig {
            data_dir: Some(root.join("data")),
            download_dir: Some(root.join("downloads")),
            log_file: Some(root.join("logs").join("youtube_logs.txt")),
            media_dir: Some(root.join("media")),
            cron_script_path: Some(root.join("bin").join("youtube-subscription-check.sh")),
            ..FileConfig::default()
        })
    }
}

pub fn read_file_config(path: &Path) -> Result<Option<FileConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let cfg = toml::from_str(&content).with_context(|| format!("Parsing {}", path.display()))?;
    Ok(Some(cfg))
}

pub fn load_config_from(path: impl AsRef<Path>) -> Result<ServiceConfig> {
    let cfg = read_file_config(path.as_ref())?.unwrap_or_default();
    Ok(ServiceConfig::from_file_config(cfg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = load_config_from("/nonexistent/yt-premium.toml").unwrap();
        assert_eq!(
            cfg.subscriptions_file,
            PathBuf::from("/var/www/homeserver/data/youtube/subscriptions.json")
        );
        assert_eq!(
            cfg.archive_file,
            PathBuf::from("/mnt/nas/youtube/downloaded.txt")
        );
        assert_eq!(cfg.sudo_path, Some(PathBuf::from(DEFAULT_SUDO_PATH)));
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.host, DEFAULT_HOST);
    }

    #[test]
    fn data_dir_moves_both_json_files() {
        let file = make_config("data_dir = \"/srv/yt\"\nport = 4242\n");
        let cfg = load_config_from(file.path()).unwrap();
        assert_eq!(cfg.subscriptions_file, PathBuf::from("/srv/yt/subscriptions.json"));
        assert_eq!(cfg.settings_file, PathBuf::from("/srv/yt/settings.json"));
        assert_eq!(cfg.port, 4242);
    }

    #[test]
    fn empty_sudo_path_disables_sudo() {
        let file = make_config("sudo_path = \"\"\n");
        let cfg = load_config_from(file.path()).unwrap();
        assert!(cfg.sudo_path.is_none());
    }

    #[test]
    fn ytdlp_timeouts_are_configurable() {
        let cfg = ServiceConfig::default();
        assert_eq!(cfg.ytdlp_probe_timeout, Duration::from_secs(120));

        let file = make_config("ytdlp_probe_timeout_secs = 5\nytdlp_download_timeout_secs = 60\n");
        let cfg = load_config_from(file.path()).unwrap();
        assert_eq!(cfg.ytdlp_probe_timeout, Duration::from_secs(5));
        assert_eq!(cfg.ytdlp_download_timeout, Duration::from_secs(60));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let file = make_config("media_root = \"/yt\"\n");
        assert!(load_config_from(file.path()).is_err());
    }
}
