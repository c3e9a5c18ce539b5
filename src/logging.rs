use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Datelike, Local};
use log::LevelFilter;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use crate::config::logging::{LogOutput, LogRotation, LoggingConfig};

pub fn setup_logging(config: &LoggingConfig) -> Result<()> {
    let level = config.level.parse::<LevelFilter>()?;

    match &config.output {
        LogOutput::Stdout => {
            env_logger::Builder::new()
                .filter_level(level)
                .format_timestamp_millis()
                .init();
        }
        LogOutput::File => {
            let writer = RollingFileWriter::new(
                config.directory.clone(),
                config.rotation,
                config.retention_days,
            )?;

            env_logger::Builder::new()
                .filter_level(level)
                .format_timestamp_millis()
                .target(env_logger::Target::Pipe(Box::new(writer)))
                .init();
        }
        LogOutput::Syslog => {
            let formatter = syslog::Formatter3164 {
                facility: syslog::Facility::LOG_DAEMON,
                hostname: None,
                process: "querypush".into(),
                pid: std::process::id(),
            };

            let logger = syslog::unix(formatter)
                .map_err(|e| anyhow!("Failed to connect to syslog: {}", e))?;
            log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
                .map(|()| log::set_max_level(level))?;
        }
    }

    Ok(())
}

/// Suffix identifying the rotation period `now` falls in
fn period(rotation: LogRotation, now: DateTime<Local>) -> Option<String> {
    match rotation {
        LogRotation::None => None,
        LogRotation::Daily => Some(now.format("%Y%m%d").to_string()),
        LogRotation::Weekly => {
            let week = now.iso_week();
            Some(format!("{}W{:02}", week.year(), week.week()))
        }
        LogRotation::Monthly => Some(now.format("%Y%m").to_string()),
    }
}

fn file_name(period: Option<&str>) -> String {
    match period {
        Some(period) => format!("querypush-{}.log", period),
        None => "querypush.log".to_string(),
    }
}

/// Appends log lines to `<directory>/querypush-<period>.log`, switching files
/// when the period changes and deleting files older than the retention
pub struct RollingFileWriter {
    directory: PathBuf,
    rotation: LogRotation,
    retention: Duration,
    period: Option<String>,
    file: File,
}

impl RollingFileWriter {
    pub fn new(directory: PathBuf, rotation: LogRotation, retention_days: u32) -> Result<Self> {
        fs::create_dir_all(&directory)
            .with_context(|| format!("Unable to create log directory '{}'", directory.display()))?;

        let period = period(rotation, Local::now());
        let file = Self::open(&directory, period.as_deref())?;
        let writer = Self {
            directory,
            rotation,
            retention: Duration::from_secs(retention_days as u64 * 86_400),
            period,
            file,
        };
        writer.remove_expired();
        Ok(writer)
    }

    fn open(directory: &std::path::Path, period: Option<&str>) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(directory.join(file_name(period)))
    }

    fn rotate_if_needed(&mut self) -> io::Result<()> {
        let current = period(self.rotation, Local::now());
        if current != self.period {
            self.file = Self::open(&self.directory, current.as_deref())?;
            self.period = current;
            self.remove_expired();
        }
        Ok(())
    }

    fn remove_expired(&self) {
        let Ok(entries) = fs::read_dir(&self.directory) else {
            return;
        };
        let active = file_name(self.period.as_deref());
        let now = SystemTime::now();

        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == active || !name.starts_with("querypush") || !name.ends_with(".log") {
                continue;
            }

            let expired = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age > self.retention);

            if expired {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

impl Write for RollingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.rotate_if_needed()?;
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
