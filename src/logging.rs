use crate::config::{LogConfig, LogRotation};
use crate::errors::{AppError, Result};
use std::io::{self, Write};
use std::path::Path;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

const LOG_FILE_PREFIX: &str = "app";
const LOG_FILE_SUFFIX: &str = "log";

/// Log file in `log_dir` named `app.<date>.log`, or `app.log` when rotation is
/// off. Only the newest `max_files` files are kept.
pub fn file_appender(log_dir: &Path, config: &LogConfig) -> Result<RollingFileAppender> {
    let rotation = match config.rotation {
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Daily => Rotation::DAILY,
        LogRotation::Never => Rotation::NEVER,
    };

    let mut builder = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX);
    if config.max_files > 0 {
        builder = builder.max_log_files(config.max_files);
    }

    builder
        .build(log_dir)
        .map_err(|e| AppError::InvalidState(format!("Cannot open log file in {}: {}", log_dir.display(), e)))
}

/// Writes everything to stderr and, when available, to the log file.
struct Tee {
    file: Option<RollingFileAppender>,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.write_all(buf) {
                let _ = writeln!(io::stderr(), "log file write failed, disabling it: {}", e);
                self.file = None;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

/// Initialises the global logger. `RUST_LOG` still overrides the level.
pub fn init(verbose: bool, log_dir: Option<&Path>, config: &LogConfig) -> Result<()> {
    let file = match log_dir {
        Some(dir) => Some(file_appender(dir, config)?),
        None => None,
    };

    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .target(env_logger::Target::Pipe(Box::new(Tee { file })))
        .try_init()
        .map_err(|e| AppError::InvalidState(format!("Logger already initialised: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn daily_file_is_dated() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let mut appender = file_appender(&logs, &LogConfig::default()).unwrap();
        writeln!(appender, "[RUNNER] Job 1 started").unwrap();
        appender.flush().unwrap();

        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let files = log_files(&logs);
        assert_eq!(files.len(), 1);
        let name = &files[0];
        assert_eq!(name, &format!("app.{}.log", today));
        let text = std::fs::read_to_string(logs.join(name)).unwrap();
        assert!(text.contains("Job 1 started"));
    }

    #[test]
    fn unrotated_file_keeps_appending() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            rotation: LogRotation::Never,
            max_files: 0,
        };

        for line in ["first run", "second run"] {
            let mut appender = file_appender(dir.path(), &config).unwrap();
            writeln!(appender, "{}", line).unwrap();
            appender.flush().unwrap();
        }

        assert_eq!(log_files(dir.path()), vec!["app.log".to_string()]);
        let text = std::fs::read_to_string(dir.path().join("app.log")).unwrap();
        assert!(text.contains("first run") && text.contains("second run"));
    }
}
