//! Keeps the nightly subscription check in sync with the system crontab.
//!
//! There is no local copy of the schedule: the crontab is the source of truth
//! and [`ScheduleReconciler::read`] projects it back into a [`Schedule`].
//! Reconciler-owned lines carry [`CRON_MARKER`]; every other line belongs to
//! someone else and survives every write verbatim.

use std::{
    io::Write,
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::Builder;
use tracing::{debug, info, warn};

use crate::{
    config::ServiceConfig,
    error::ScheduleError,
    lock::DirLock,
    process::{CRONTAB_TIMEOUT, CommandOutput, run_with_timeout},
    script::CronScript,
};

pub const CRON_MARKER: &str = "homeserver-youtube-subscriptions";
pub const DEFAULT_HOUR: u8 = 2;
pub const DEFAULT_MINUTE: u8 = 0;

/// What `crontab -l` prints to stderr when the user has no crontab.
const NO_CRONTAB: &str = "no crontab for";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub enabled: bool,
    pub hour: u8,
    pub minute: u8,
}

impl Schedule {
    /// What an absent or unreadable crontab entry looks like.
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            hour: DEFAULT_HOUR,
            minute: DEFAULT_MINUTE,
        }
    }

    pub fn new(enabled: bool, hour: i64, minute: i64) -> Result<Self, ScheduleError> {
        if !(0..=23).contains(&hour) {
            return Err(ScheduleError::InvalidTimeRange {
                field: "Hour",
                max: 23,
                value: hour,
            });
        }
        if !(0..=59).contains(&minute) {
            return Err(ScheduleError::InvalidTimeRange {
                field: "Minute",
                max: 59,
                value: minute,
            });
        }
        Ok(Self {
            enabled,
            hour: hour as u8,
            minute: minute as u8,
        })
    }

    fn cron_line(&self, script_path: &Path) -> String {
        format!(
            "{} {} * * * {} # {}",
            self.minute,
            self.hour,
            script_path.display(),
            CRON_MARKER
        )
    }
}

/// Privileged access to the OS scheduler.
pub trait CronHost: Send + Sync {
    /// Current crontab text. `Ok(None)` only when no crontab is installed;
    /// any other listing failure is an error.
    fn list_entries(&self) -> Result<Option<String>, ScheduleError>;

    /// Replaces the whole crontab with `lines`.
    fn install_entries(&self, lines: &[String]) -> Result<(), ScheduleError>;

    /// Deletes the crontab outright.
    fn remove_entries(&self) -> Result<(), ScheduleError>;

    /// Places `contents` at `path` with mode 0755.
    fn install_script(&self, path: &Path, contents: &str) -> Result<(), ScheduleError>;
}

/// Talks to the real `crontab` binary, through `sudo` unless disabled.
#[derive(Debug, Clone)]
pub struct SudoCronHost {
    sudo: Option<PathBuf>,
    crontab: PathBuf,
}

impl SudoCronHost {
    pub fn new(sudo: Option<PathBuf>, crontab: impl Into<PathBuf>) -> Self {
        Self {
            sudo,
            crontab: crontab.into(),
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(config.sudo_path.clone(), config.crontab_path.clone())
    }

    fn privileged(&self, program: &Path) -> Command {
        match &self.sudo {
            Some(sudo) => {
                let mut command = Command::new(sudo);
                command.arg(program);
                command
            }
            None => Command::new(program),
        }
    }

    fn run(&self, program: &Path, args: &[&str]) -> Result<CommandOutput, ScheduleError> {
        let mut command = self.privileged(program);
        command.args(args);
        run_with_timeout(command, CRONTAB_TIMEOUT).map_err(|err| {
            ScheduleError::SchedulerCommandFailed(format!(
                "{} {}: {err}",
                program.display(),
                args.join(" ")
            ))
        })
    }
}

impl CronHost for SudoCronHost {
    fn list_entries(&self) -> Result<Option<String>, ScheduleError> {
        let output = self.run(&self.crontab, &["-l"])?;
        if output.success() {
            return Ok(Some(output.stdout));
        }
        if output.stderr.contains(NO_CRONTAB) {
            debug!(output = %output.combined(), "crontab -l reported no crontab");
            return Ok(None);
        }
        Err(ScheduleError::SchedulerCommandFailed(format!(
            "Failed to list crontab: {}",
            output.combined()
        )))
    }

    fn install_entries(&self, lines: &[String]) -> Result<(), ScheduleError> {
        let mut file = Builder::new()
            .suffix(".cron")
            .tempfile()
            .map_err(|err| ScheduleError::io("creating crontab temp file", err))?;
        let mut body = lines.join("\n");
        body.push('\n');
        file.write_all(body.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|err| ScheduleError::io("writing crontab temp file", err))?;

        let path = file.path().to_string_lossy().into_owned();
        let output = self.run(&self.crontab, &[&path])?;
        if !output.success() {
            return Err(ScheduleError::SchedulerCommandFailed(format!(
                "Failed to update crontab: {}",
                output.combined()
            )));
        }
        Ok(())
    }

    fn remove_entries(&self) -> Result<(), ScheduleError> {
        let output = self.run(&self.crontab, &["-r"])?;
        if !output.success() {
            return Err(ScheduleError::SchedulerCommandFailed(format!(
                "Failed to remove crontab: {}",
                output.combined()
            )));
        }
        Ok(())
    }

    fn install_script(&self, path: &Path, contents: &str) -> Result<(), ScheduleError> {
        let mut file = Builder::new()
            .suffix(".sh")
            .tempfile()
            .map_err(|err| ScheduleError::io("creating script temp file", err))?;
        file.write_all(contents.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|err| ScheduleError::io("writing script temp file", err))?;

        let source = file.path().to_string_lossy().into_owned();
        let target = path.to_string_lossy().into_owned();
        let output = self.run(Path::new("install"), &["-m", "0755", &source, &target])?;
        if !output.success() {
            return Err(ScheduleError::SchedulerCommandFailed(format!(
                "Failed to create cron script: {}",
                output.combined()
            )));
        }
        Ok(())
    }
}

/// Crontab kept in memory. Useful anywhere a real scheduler must not be
/// touched.
#[derive(Debug, Default)]
pub struct InMemoryCrontab {
    table: Mutex<Option<String>>,
    script: Mutex<Option<(PathBuf, String)>>,
    fail_installs: Mutex<bool>,
    fail_listing: Mutex<bool>,
}

impl InMemoryCrontab {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(contents: &str) -> Self {
        let host = Self::default();
        *host.table.lock() = Some(contents.to_string());
        host
    }

    /// Installed crontab text, `None` if removed or never installed.
    pub fn contents(&self) -> Option<String> {
        self.table.lock().clone()
    }

    pub fn installed_script(&self) -> Option<(PathBuf, String)> {
        self.script.lock().clone()
    }

    /// Makes every later `install_entries` call fail.
    pub fn fail_installs(&self) {
        *self.fail_installs.lock() = true;
    }

    /// Makes every later `list_entries` call fail.
    pub fn fail_listing(&self) {
        *self.fail_listing.lock() = true;
    }
}

impl CronHost for InMemoryCrontab {
    fn list_entries(&self) -> Result<Option<String>, ScheduleError> {
        if *self.fail_listing.lock() {
            return Err(ScheduleError::SchedulerCommandFailed(
                "Failed to list crontab: permission denied".to_string(),
            ));
        }
        Ok(self.contents())
    }

    fn install_entries(&self, lines: &[String]) -> Result<(), ScheduleError> {
        if *self.fail_installs.lock() {
            return Err(ScheduleError::SchedulerCommandFailed(
                "Failed to update crontab: install rejected".to_string(),
            ));
        }
        let mut body = lines.join("\n");
        body.push('\n');
        *self.table.lock() = Some(body);
        Ok(())
    }

    fn remove_entries(&self) -> Result<(), ScheduleError> {
        *self.table.lock() = None;
        Ok(())
    }

    fn install_script(&self, path: &Path, contents: &str) -> Result<(), ScheduleError> {
        *self.script.lock() = Some((path.to_path_buf(), contents.to_string()));
        Ok(())
    }
}

#[derive(Clone)]
pub struct ScheduleReconciler {
    host: Arc<dyn CronHost>,
    script: CronScript,
    script_path: PathBuf,
    lock_dir: PathBuf,
}

impl ScheduleReconciler {
    pub fn new(host: Arc<dyn CronHost>, config: &ServiceConfig) -> Self {
        Self {
            host,
            script: CronScript::from_config(config),
            script_path: config.cron_script_path.clone(),
            lock_dir: config.data_dir.clone(),
        }
    }

    pub fn read(&self) -> Schedule {
        match self.host.list_entries() {
            Ok(Some(table)) => parse_schedule(&table),
            Ok(None) => Schedule::disabled(),
            Err(err) => {
                warn!(error = %err, "could not list crontab");
                Schedule::disabled()
            }
        }
    }

    /// Validates, refreshes the script, and rewrites the crontab so exactly
    /// one marker line exists when `enabled` and none otherwise. Foreign lines
    /// are kept; comments and blank lines are dropped. Nothing is touched
    /// unless the current crontab could be listed.
    pub fn write(&self, enabled: bool, hour: i64, minute: i64) -> Result<Schedule, ScheduleError> {
        let schedule = Schedule::new(enabled, hour, minute)?;
        let _lock = DirLock::acquire(&self.lock_dir).map_err(|err| {
            ScheduleError::io(format!("locking {}", self.lock_dir.display()), err)
        })?;

        let mut lines: Vec<String> = self
            .host
            .list_entries()?
            .map(|table| foreign_lines(&table))
            .unwrap_or_default();

        self.host
            .install_script(&self.script_path, &self.script.render())?;

        if schedule.enabled {
            lines.push(schedule.cron_line(&self.script_path));
        }

        if lines.is_empty() {
            if let Err(err) = self.host.remove_entries() {
                warn!(error = %err, "removing empty crontab failed");
            }
        } else {
            self.host.install_entries(&lines)?;
        }

        info!(
            enabled = schedule.enabled,
            hour = schedule.hour,
            minute = schedule.minute,
            "subscription schedule updated"
        );
        Ok(schedule)
    }
}

fn is_marker_line(line: &str) -> bool {
    line.contains(CRON_MARKER)
}

fn parse_schedule(table: &str) -> Schedule {
    let Some(line) = table.lines().find(|line| is_marker_line(line)) else {
        return Schedule::disabled();
    };
    let mut fields = line.split_whitespace();
    let parsed = fields
        .next()
        .and_then(|minute| minute.parse::<u8>().ok())
        .zip(fields.next().and_then(|hour| hour.parse::<u8>().ok()));
    match parsed {
        Some((minute, hour)) if hour <= 23 && minute <= 59 => Schedule {
            enabled: true,
            hour,
            minute,
        },
        _ => {
            warn!(line, "unparsable schedule line in crontab");
            Schedule::disabled()
        }
    }
}

fn foreign_lines(table: &str) -> Vec<String> {
    table
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            !trimmed.is_empty() && !trimmed.starts_with('#') && !is_marker_line(line)
        })
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::{TempDir, tempdir};

    const FOREIGN: &str = "15 4 * * 1 /usr/local/bin/backup.sh --full";

    fn reconciler(host: Arc<InMemoryCrontab>) -> (TempDir, ScheduleReconciler) {
        let dir = tempdir().unwrap();
        let config = ServiceConfig::rooted_at(dir.path());
        let reconciler = ScheduleReconciler::new(host, &config);
        (dir, reconciler)
    }

    fn marker_lines(host: &InMemoryCrontab) -> usize {
        host.contents()
            .unwrap_or_default()
            .lines()
            .filter(|line| line.contains(CRON_MARKER))
            .count()
    }

    #[test]
    fn no_crontab_reads_as_disabled_default() {
        let (_dir, reconciler) = reconciler(Arc::new(InMemoryCrontab::new()));
        assert_eq!(reconciler.read(), Schedule::disabled());
    }

    #[test]
    fn write_then_read_round_trips_every_time() {
        let host = Arc::new(InMemoryCrontab::new());
        let (_dir, reconciler) = reconciler(host.clone());
        for hour in 0..=23 {
            for minute in [0, 1, 29, 30, 58, 59] {
                reconciler.write(true, hour, minute).unwrap();
                let schedule = reconciler.read();
                assert_eq!(
                    schedule,
                    Schedule {
                        enabled: true,
                        hour: hour as u8,
                        minute: minute as u8
                    }
                );
            }
        }
        assert_eq!(marker_lines(&host), 1);
    }

    #[test]
    fn out_of_range_leaves_crontab_untouched() {
        let host = Arc::new(InMemoryCrontab::with_entries(&format!("{FOREIGN}\n")));
        let (_dir, reconciler) = reconciler(host.clone());
        for (hour, minute) in [(24, 0), (-1, 0), (0, 60), (0, -5), (99, 99)] {
            let err = reconciler.write(true, hour, minute).unwrap_err();
            assert!(matches!(err, ScheduleError::InvalidTimeRange { .. }));
        }
        assert_eq!(host.contents().unwrap(), format!("{FOREIGN}\n"));
        assert!(host.installed_script().is_none());
    }

    #[test]
    fn second_enable_replaces_first() {
        let host = Arc::new(InMemoryCrontab::new());
        let (_dir, reconciler) = reconciler(host.clone());
        reconciler.write(true, 1, 5).unwrap();
        reconciler.write(true, 6, 45).unwrap();
        assert_eq!(marker_lines(&host), 1);
        assert!(host.contents().unwrap().starts_with("45 6 * * * "));
    }

    #[test]
    fn disable_keeps_foreign_lines_verbatim() {
        let host = Arc::new(InMemoryCrontab::with_entries(&format!(
            "# m h dom mon dow command\n{FOREIGN}\n\n"
        )));
        let (_dir, reconciler) = reconciler(host.clone());
        reconciler.write(true, 3, 30).unwrap();
        reconciler.write(false, 3, 30).unwrap();

        assert_eq!(host.contents().unwrap(), format!("{FOREIGN}\n"));
        assert!(!reconciler.read().enabled);
    }

    #[test]
    fn disable_with_nothing_left_removes_crontab() {
        let host = Arc::new(InMemoryCrontab::new());
        let (_dir, reconciler) = reconciler(host.clone());
        reconciler.write(true, 2, 0).unwrap();
        assert!(host.contents().is_some());

        let schedule = reconciler.write(false, 2, 0).unwrap();
        assert!(!schedule.enabled);
        assert!(host.contents().is_none());
    }

    #[test]
    fn cron_line_format() {
        let host = Arc::new(InMemoryCrontab::new());
        let (dir, reconciler) = reconciler(host.clone());
        reconciler.write(true, 3, 30).unwrap();
        let script = dir.path().join("bin").join("youtube-subscription-check.sh");
        assert_eq!(
            host.contents().unwrap(),
            format!("30 3 * * * {} # {CRON_MARKER}\n", script.display())
        );
    }

    #[test]
    fn script_is_installed_on_every_write() {
        let host = Arc::new(InMemoryCrontab::new());
        let (dir, reconciler) = reconciler(host.clone());
        reconciler.write(false, 2, 0).unwrap();
        let (path, contents) = host.installed_script().unwrap();
        assert_eq!(path, dir.path().join("bin").join("youtube-subscription-check.sh"));
        assert!(contents.contains("--download-archive"));
    }

    #[test]
    fn install_failure_is_surfaced() {
        let host = Arc::new(InMemoryCrontab::new());
        host.fail_installs();
        let (_dir, reconciler) = reconciler(host.clone());
        let err = reconciler.write(true, 2, 0).unwrap_err();
        assert!(matches!(err, ScheduleError::SchedulerCommandFailed(_)));
    }

    #[test]
    fn first_marker_line_wins_and_garbage_reads_disabled() {
        assert_eq!(
            parse_schedule(&format!(
                "{FOREIGN}\n10 22 * * * /x # {CRON_MARKER}\n0 1 * * * /y # {CRON_MARKER}\n"
            )),
            Schedule {
                enabled: true,
                hour: 22,
                minute: 10
            }
        );
        assert_eq!(
            parse_schedule(&format!("*/5 * * * * /x # {CRON_MARKER}\n")),
            Schedule::disabled()
        );
    }

    fn install_crontab_stub(dir: &Path) -> PathBuf {
        let store = dir.join("table");
        let script_path = dir.join("crontab");
        let script = format!(
            r#"#!/usr/bin/env bash
set -euo pipefail
store='{}'
case "$1" in
    -l)
        if [[ -f "$store.broken" ]]; then
            echo "sudo: crontab: permission denied" >&2
            exit 1
        fi
        if [[ ! -f "$store" ]]; then
            echo "no crontab for $(id -un)" >&2
            exit 1
        fi
        cat "$store"
        ;;
    -r)
        rm -f "$store"
        ;;
    *)
        cp "$1" "$store"
        ;;
esac
"#,
            store.display()
        );
        fs::write(&script_path, script).unwrap();
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755)).unwrap();
        script_path
    }

    #[test]
    fn sudo_host_drives_crontab_binary() {
        let dir = tempdir().unwrap();
        let crontab = install_crontab_stub(dir.path());
        fs::write(dir.path().join("table"), format!("{FOREIGN}\n")).unwrap();

        let mut config = ServiceConfig::rooted_at(dir.path());
        config.sudo_path = None;
        config.crontab_path = crontab;
        fs::create_dir_all(config.cron_script_path.parent().unwrap()).unwrap();

        let reconciler = ScheduleReconciler::new(Arc::new(SudoCronHost::from_config(&config)), &config);
        reconciler.write(true, 4, 20).unwrap();

        let table = fs::read_to_string(dir.path().join("table")).unwrap();
        assert!(table.starts_with(&format!("{FOREIGN}\n20 4 * * * ")));
        assert_eq!(
            reconciler.read(),
            Schedule {
                enabled: true,
                hour: 4,
                minute: 20
            }
        );

        let mode = fs::metadata(&config.cron_script_path)
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);

        fs::write(dir.path().join("table"), "").unwrap();
        reconciler.write(false, 4, 20).unwrap();
        assert!(!dir.path().join("table").exists());
        assert_eq!(reconciler.read(), Schedule::disabled());
    }

    #[test]
    fn listing_failure_aborts_write() {
        let host = Arc::new(InMemoryCrontab::with_entries(&format!("{FOREIGN}\n")));
        host.fail_listing();
        let (_dir, reconciler) = reconciler(host.clone());

        for enabled in [true, false] {
            let err = reconciler.write(enabled, 3, 30).unwrap_err();
            assert!(matches!(err, ScheduleError::SchedulerCommandFailed(_)));
        }
        assert_eq!(host.contents().unwrap(), format!("{FOREIGN}\n"));
        assert!(host.installed_script().is_none());
        assert_eq!(reconciler.read(), Schedule::disabled());
    }

    #[test]
    fn sudo_host_keeps_foreign_jobs_when_listing_fails() {
        let dir = tempdir().unwrap();
        let crontab = install_crontab_stub(dir.path());
        let table = dir.path().join("table");
        fs::write(&table, format!("{FOREIGN}\n")).unwrap();
        fs::write(dir.path().join("table.broken"), "").unwrap();

        let mut config = ServiceConfig::rooted_at(dir.path());
        config.sudo_path = None;
        config.crontab_path = crontab;
        let reconciler = ScheduleReconciler::new(Arc::new(SudoCronHost::from_config(&config)), &config);

        assert!(reconciler.write(true, 3, 30).is_err());
        assert_eq!(fs::read_to_string(&table).unwrap(), format!("{FOREIGN}\n"));
        assert!(reconciler.write(false, 3, 30).is_err());
        assert_eq!(fs::read_to_string(&table).unwrap(), format!("{FOREIGN}\n"));
    }
}
