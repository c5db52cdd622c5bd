//! Runtime configuration of the instrumentation manager

use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;

use crate::domain::ManagerError;

/// Matches the executables of tlsprobe itself so it never hooks its own components
pub const DEFAULT_EXCLUDE_PATTERN: &str = r"(^|/)tlsprobe(-[a-z]+)?$";

/// Tunables of the [`crate::manager::InstrumentationManager`] and the `/proc` event source
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Master switch; a disabled manager is never started
    pub enabled: bool,

    /// Mount point of procfs (tests point this at a temporary directory)
    pub proc_root: PathBuf,

    /// Interval of the dead-process reconciliation pass
    pub scan_interval: Duration,

    /// Interval at which the `/proc` event source looks for new and exited processes
    pub poll_interval: Duration,

    /// Capacity of the negative result cache (0 disables it)
    pub negative_cache_capacity: usize,

    /// How long to keep retrying `readlink(/proc/<pid>/exe)` right after an exec
    pub resolve_retry_window: Duration,

    /// Sleep between two resolution attempts
    pub resolve_retry_sleep: Duration,

    /// Executables whose path matches are never instrumented
    pub exclude_pattern: String,

    /// Report processes already running at start as execs
    pub scan_existing: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            proc_root: PathBuf::from("/proc"),
            scan_interval: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
            negative_cache_capacity: 1000,
            resolve_retry_window: Duration::from_millis(10),
            resolve_retry_sleep: Duration::from_millis(1),
            exclude_pattern: DEFAULT_EXCLUDE_PATTERN.to_string(),
            scan_existing: true,
        }
    }
}

impl ManagerConfig {
    /// Reject settings the manager cannot run with
    ///
    /// # Errors
    /// Returns [`ManagerError::InvalidConfig`] for a zero interval or an
    /// exclusion pattern that is not a valid regex.
    pub fn validate(&self) -> Result<(), ManagerError> {
        if self.scan_interval.is_zero() {
            return Err(ManagerError::InvalidConfig("scan interval must be non-zero".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(ManagerError::InvalidConfig("poll interval must be non-zero".into()));
        }
        self.exclude_regex()?;
        Ok(())
    }

    /// Compile the exclusion pattern
    ///
    /// # Errors
    /// Returns [`ManagerError::InvalidConfig`] if the pattern does not compile.
    pub fn exclude_regex(&self) -> Result<Regex, ManagerError> {
        Regex::new(&self.exclude_pattern).map_err(|e| {
            ManagerError::InvalidConfig(format!("invalid exclude pattern '{}': {e}", self.exclude_pattern))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ManagerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scan_interval, Duration::from_secs(30));
        assert_eq!(config.negative_cache_capacity, 1000);
    }

    #[test]
    fn test_default_pattern_matches_own_binaries() {
        let re = ManagerConfig::default().exclude_regex().unwrap();
        assert!(re.is_match("/usr/local/bin/tlsprobe"));
        assert!(re.is_match("/opt/tlsprobe/bin/tlsprobe-helper"));
        assert!(!re.is_match("/usr/bin/my-go-service"));
        assert!(!re.is_match("/usr/bin/tlsprobesque"));
    }

    #[test]
    fn test_zero_scan_interval_rejected() {
        let config = ManagerConfig { scan_interval: Duration::ZERO, ..Default::default() };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("scan interval"));
    }

    #[test]
    fn test_bad_pattern_rejected() {
        let config = ManagerConfig { exclude_pattern: "(unclosed".into(), ..Default::default() };
        assert!(matches!(config.validate(), Err(ManagerError::InvalidConfig(_))));
    }
}
