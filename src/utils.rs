//! Utility functions and helpers
//!
//! Logging setup and small parsers shared by the configuration layer.

use crate::config::LogFormat;
use crate::{Error, Result};
use std::path::Path;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over `level` when set. With a log file the output goes
/// through a non-blocking writer; keep the returned guard alive until exit so
/// buffered lines are flushed.
pub fn init_logging(
    level: &str,
    format: LogFormat,
    file: Option<&Path>,
) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| Error::config(format!("Invalid log level {:?}: {}", level, e)))?;

    let (writer, guard) = match file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| Error::config(format!("Invalid log file {}", path.display())))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(writer), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };
    let ansi = file.is_none();

    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_ansi(ansi).with_writer(writer))
            .try_init(),
        LogFormat::Plain => registry
            .with(fmt::layer().with_target(false).with_ansi(ansi).with_writer(writer))
            .try_init(),
    };
    result.map_err(|e| Error::config(format!("Failed to install logger: {}", e)))?;
    Ok(guard)
}

/// Parse a compact target written as hex, with or without `0x`
pub fn parse_compact_target(s: &str) -> Result<u32> {
    let digits = s.trim().trim_start_matches("0x").trim_start_matches("0X");
    if digits.is_empty() || digits.len() > 8 {
        return Err(Error::config(format!("Invalid compact target {:?}", s)));
    }
    u32::from_str_radix(digits, 16)
        .map_err(|e| Error::config(format!("Invalid compact target {:?}: {}", s, e)))
}

/// Parse a duration such as `30s` or `1m 30s`
pub fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s.trim())
        .map_err(|e| Error::config(format!("Invalid duration {:?}: {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compact_target() {
        assert_eq!(parse_compact_target("207fffff").unwrap(), 0x207fffff);
        assert_eq!(parse_compact_target("0x1d00ffff").unwrap(), 0x1d00ffff);
        assert!(parse_compact_target("").is_err());
        assert!(parse_compact_target("123456789").is_err());
        assert!(parse_compact_target("zz").is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("1m 30s").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("soon").is_err());
    }
}
