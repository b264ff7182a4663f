//! Run settings.
//!
//! Defaults, then environment (`BINPATH`, `CONFORMANCE_TIMEOUT_SECS`,
//! `CONFORMANCE_PROBE_TIMEOUT_SECS`), then whatever the CLI overrides.

use std::path::PathBuf;
use std::time::Duration;

/// Deadline for one whole run.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(15);

/// Upper bound for a single DNS exchange.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_BINARY_NAME: &str = "dnscrypt-proxy";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be a whole number of seconds, got {value:?}")]
    InvalidSeconds { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Daemon binary, or a directory containing it.
    pub binpath: Option<PathBuf>,
    pub binary_name: String,
    pub run_timeout: Duration,
    pub probe_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            binpath: None,
            binary_name: platform_binary_name(DEFAULT_BINARY_NAME),
            run_timeout: DEFAULT_RUN_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl Settings {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        if let Some(path) = lookup("BINPATH").filter(|p| !p.is_empty()) {
            settings.binpath = Some(PathBuf::from(path));
        }
        if let Some(secs) = seconds(&lookup, "CONFORMANCE_TIMEOUT_SECS")? {
            settings.run_timeout = secs;
        }
        if let Some(secs) = seconds(&lookup, "CONFORMANCE_PROBE_TIMEOUT_SECS")? {
            settings.probe_timeout = secs;
        }
        Ok(settings)
    }
}

fn seconds(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    value
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|secs| *secs > 0)
        .map(|secs| Some(Duration::from_secs(secs)))
        .ok_or(ConfigError::InvalidSeconds { var, value })
}

/// Appends `.exe` on Windows.
pub fn platform_binary_name(name: &str) -> String {
    if cfg!(windows) {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from(vars: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|var| vars.get(var).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let settings = from(&[]).unwrap();
        assert_eq!(settings.binpath, None);
        assert_eq!(settings.run_timeout, DEFAULT_RUN_TIMEOUT);
        assert_eq!(settings.probe_timeout, DEFAULT_PROBE_TIMEOUT);
        assert!(settings.binary_name.starts_with("dnscrypt-proxy"));
    }

    #[test]
    fn environment_overrides() {
        let settings = from(&[
            ("BINPATH", "/opt/dnscrypt"),
            ("CONFORMANCE_TIMEOUT_SECS", "30"),
            ("CONFORMANCE_PROBE_TIMEOUT_SECS", " 2 "),
        ])
        .unwrap();
        assert_eq!(settings.binpath, Some(PathBuf::from("/opt/dnscrypt")));
        assert_eq!(settings.run_timeout, Duration::from_secs(30));
        assert_eq!(settings.probe_timeout, Duration::from_secs(2));
    }

    #[test]
    fn empty_binpath_is_ignored() {
        assert_eq!(from(&[("BINPATH", "")]).unwrap().binpath, None);
    }

    #[test]
    fn rejects_bad_seconds() {
        for bad in ["soon", "0", "-3"] {
            let err = from(&[("CONFORMANCE_TIMEOUT_SECS", bad)]).unwrap_err();
            assert!(err.to_string().contains("CONFORMANCE_TIMEOUT_SECS"));
        }
    }
}
