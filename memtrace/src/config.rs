//! Session configuration

use memtrace_common::DEFAULT_BUFFER_RECORDS;

use crate::domain::MemtraceError;
use crate::flush::sink::{SinkTarget, TraceFormat};

#[derive(Debug, Clone)]
pub struct TracerConfig {
    /// Records per thread buffer
    pub buffer_records: usize,
    pub format: TraceFormat,
    pub target: SinkTarget,
    /// Use lea + jrcxz when the host supports it; otherwise always save flags
    pub prefer_flag_safe_test: bool,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            buffer_records: DEFAULT_BUFFER_RECORDS,
            format: TraceFormat::default(),
            target: SinkTarget::default(),
            prefer_flag_safe_test: true,
        }
    }
}

impl TracerConfig {
    /// # Errors
    /// `InvalidConfig` for a zero capacity or a missing output directory.
    pub fn validate(&self) -> Result<(), MemtraceError> {
        if self.buffer_records == 0 {
            return Err(MemtraceError::InvalidConfig("buffer capacity must be at least one record".into()));
        }
        if let SinkTarget::Directory(dir) = &self.target {
            if !dir.is_dir() {
                return Err(MemtraceError::InvalidConfig(format!(
                    "output directory {} does not exist",
                    dir.display()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_default_is_text_in_cwd() {
        let config = TracerConfig::default();
        assert_eq!(config.format, TraceFormat::Text);
        assert_eq!(config.buffer_records, 8192);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = TracerConfig { buffer_records: 0, ..TracerConfig::default() };
        assert!(matches!(config.validate(), Err(MemtraceError::InvalidConfig(_))));
    }

    #[test]
    fn test_missing_directory_rejected() {
        let config = TracerConfig {
            target: SinkTarget::Directory(PathBuf::from("/nonexistent/memtrace-out")),
            ..TracerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
