use anyhow::Context;
use std::str::FromStr;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

/// Tracing subscriber configuration. Without a `file_dir` logs go to
/// stdout; with one they go to a rolling file through a non-blocking
/// writer, so a realtime loop never stalls on log I/O.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct LoggerConfig {
    pub level: String,
    pub file_dir: Option<String>,
    pub file_prefix: Option<String>,
    pub rolling: Option<String>,
    #[serde(default)]
    pub max_files: usize,
}

impl LoggerConfig {
    /// Reads LOG_LEVEL, LOG_FILE_DIR, LOG_FILE_PREFIX and LOG_ROLLING,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Self {
        Self {
            level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            file_dir: std::env::var("LOG_FILE_DIR").ok(),
            file_prefix: std::env::var("LOG_FILE_PREFIX").ok(),
            rolling: std::env::var("LOG_ROLLING").ok(),
            max_files: 2,
        }
    }

    /// Install the global subscriber. The returned guard must stay alive
    /// for the lifetime of the process when file logging is active; drop
    /// it and buffered lines are lost.
    pub fn init(&self) -> anyhow::Result<Option<WorkerGuard>> {
        let level = Level::from_str(&self.level).unwrap_or(Level::INFO);

        let Some(dir) = self.file_dir.as_deref() else {
            let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
            return Ok(None);
        };

        let rotation = match self.rolling.as_deref() {
            Some("hourly") => Rotation::HOURLY,
            Some("minutely") => Rotation::MINUTELY,
            _ => Rotation::DAILY,
        };
        let prefix = self.file_prefix.as_deref().unwrap_or("");

        let appender: RollingFileAppender = RollingFileAppender::builder()
            .rotation(rotation)
            .max_log_files(self.max_files)
            .filename_prefix(prefix)
            .build(dir)
            .with_context(|| format!("failed to create rolling appender in {dir}"))?;
        let (writer, guard) = tracing_appender::non_blocking(appender);

        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(writer)
            .try_init();
        tracing::info!(dir, prefix, rotation = ?self.rolling, "logging to file");
        Ok(Some(guard))
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_dir: None,
            file_prefix: None,
            rolling: Some("daily".to_string()),
            max_files: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_level_is_info() {
        let config = LoggerConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.file_dir.is_none());
    }

    #[test]
    fn config_roundtrips_through_serde() {
        let json = r#"{"level":"debug","file_dir":"/tmp/logs","file_prefix":"rt","rolling":"hourly"}"#;
        let config: LoggerConfig = serde_json::from_str(json).expect("bad config");
        assert_eq!(config.level, "debug");
        assert_eq!(config.file_dir.as_deref(), Some("/tmp/logs"));
        assert_eq!(config.max_files, 0); // serde default
    }
}
