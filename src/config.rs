use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ResvError};

pub const CONFIG_FILE: &str = "config.yaml";

/// Upper bound for every `*_secs` setting (100 years).
pub const MAX_DURATION_SECS: u64 = 100 * 365 * 86_400;

fn default_ttl_secs() -> u64 {
    3600
}
fn max_ttl_secs() -> u64 {
    86_400
}
fn sweep_interval_secs() -> u64 {
    5
}
fn stale_after_secs() -> u64 {
    7200
}
fn expiring_soon_secs() -> u64 {
    300
}
fn history_retention_secs() -> u64 {
    86_400
}
fn wait_timeout_secs() -> u64 {
    300
}

/// Settings read from `.resv/config.yaml`. Missing keys take defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    #[serde(default = "max_ttl_secs")]
    pub max_ttl_secs: u64,
    #[serde(default = "sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Age past which a live reservation is reported stale.
    #[serde(default = "stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "expiring_soon_secs")]
    pub expiring_soon_secs: u64,
    /// How long released and expired records stay queryable.
    #[serde(default = "history_retention_secs")]
    pub history_retention_secs: u64,
    /// Give-up point for `reservations wait` when no `--timeout` is passed.
    #[serde(default = "wait_timeout_secs")]
    pub wait_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinator_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
            max_ttl_secs: max_ttl_secs(),
            sweep_interval_secs: sweep_interval_secs(),
            stale_after_secs: stale_after_secs(),
            expiring_soon_secs: expiring_soon_secs(),
            history_retention_secs: history_retention_secs(),
            wait_timeout_secs: wait_timeout_secs(),
            coordinator_token: None,
        }
    }
}

impl Config {
    /// Load `<state_dir>/config.yaml` if present, then apply environment
    /// overrides. A missing file is not an error.
    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            Self::parse(&raw).map_err(|err| {
                ResvError::Config(format!("failed to parse '{}': {err}", path.display()))
            })?
        } else {
            Self::default()
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(token) = std::env::var("RESV_COORDINATOR_TOKEN")
            && !token.is_empty()
        {
            self.coordinator_token = Some(token);
        }
        if let Ok(raw) = std::env::var("RESV_SWEEP_INTERVAL_SECS") {
            self.sweep_interval_secs = parse_env_secs("RESV_SWEEP_INTERVAL_SECS", &raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_ttl_secs == 0 || self.max_ttl_secs == 0 {
            return Err(ResvError::Config("ttl settings must be positive".into()));
        }
        if self.default_ttl_secs > self.max_ttl_secs {
            return Err(ResvError::Config(format!(
                "default_ttl_secs ({}) exceeds max_ttl_secs ({})",
                self.default_ttl_secs, self.max_ttl_secs
            )));
        }
        if self.sweep_interval_secs == 0 || self.wait_timeout_secs == 0 {
            return Err(ResvError::Config(
                "sweep_interval_secs and wait_timeout_secs must be positive".into(),
            ));
        }
        for (name, value) in [
            ("default_ttl_secs", self.default_ttl_secs),
            ("max_ttl_secs", self.max_ttl_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("stale_after_secs", self.stale_after_secs),
            ("expiring_soon_secs", self.expiring_soon_secs),
            ("history_retention_secs", self.history_retention_secs),
            ("wait_timeout_secs", self.wait_timeout_secs),
        ] {
            if value > MAX_DURATION_SECS {
                return Err(ResvError::Config(format!(
                    "{name} ({value}) exceeds the {MAX_DURATION_SECS}s limit"
                )));
            }
        }
        Ok(())
    }

    pub fn stale_after(&self) -> chrono::Duration {
        secs(self.stale_after_secs)
    }

    pub fn expiring_soon(&self) -> chrono::Duration {
        secs(self.expiring_soon_secs)
    }

    pub fn history_retention(&self) -> chrono::Duration {
        secs(self.history_retention_secs)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn wait_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.wait_timeout_secs)
    }
}

fn parse_env_secs(name: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse()
        .map_err(|_| ResvError::Config(format!("{name} must be an integer, got '{raw}'")))
}

fn secs(value: u64) -> chrono::Duration {
    i64::try_from(value)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn partial_yaml_fills_defaults() {
        let config = Config::parse("max_ttl_secs: 600\ndefault_ttl_secs: 60\n").unwrap();
        assert_eq!(config.max_ttl_secs, 600);
        assert_eq!(config.default_ttl_secs, 60);
        assert_eq!(config.stale_after_secs, 7200);
        assert_eq!(config.wait_timeout_secs, 300);
        assert!(config.coordinator_token.is_none());
    }

    #[test]
    fn empty_document_is_default() {
        assert_eq!(Config::parse("  \n").unwrap(), Config::default());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Config::parse("ttl: 5\n").unwrap_err();
        assert_eq!(err.code(), "yaml_error");
    }

    #[test]
    fn validate_rejects_inverted_ttls() {
        let config = Config {
            default_ttl_secs: 100,
            max_ttl_secs: 10,
            ..Config::default()
        };
        assert_eq!(config.validate().unwrap_err().code(), "config_error");

        let config = Config {
            wait_timeout_secs: 0,
            ..Config::default()
        };
        assert_eq!(config.validate().unwrap_err().code(), "config_error");
    }

    #[test]
    fn validate_bounds_every_duration() {
        let config = Config::parse("history_retention_secs: 18446744073709551615\n").unwrap();
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), "config_error");
        assert!(err.to_string().contains("history_retention_secs"), "{err}");

        let config = Config {
            max_ttl_secs: MAX_DURATION_SECS + 1,
            ..Config::default()
        };
        assert_eq!(config.validate().unwrap_err().code(), "config_error");

        let config = Config {
            max_ttl_secs: MAX_DURATION_SECS,
            history_retention_secs: MAX_DURATION_SECS,
            ..Config::default()
        };
        config.validate().unwrap();
        assert_eq!(config.history_retention().num_seconds(), MAX_DURATION_SECS as i64);
    }

    #[test]
    fn load_reads_file_and_env() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            "coordinator_token: from-file\nsweep_interval_secs: 30\n",
        )
        .unwrap();

        unsafe { std::env::remove_var("RESV_COORDINATOR_TOKEN") };
        unsafe { std::env::remove_var("RESV_SWEEP_INTERVAL_SECS") };
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.coordinator_token.as_deref(), Some("from-file"));
        assert_eq!(config.sweep_interval_secs, 30);

        unsafe { std::env::set_var("RESV_COORDINATOR_TOKEN", "from-env") };
        unsafe { std::env::set_var("RESV_SWEEP_INTERVAL_SECS", "2") };
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.coordinator_token.as_deref(), Some("from-env"));
        assert_eq!(config.sweep_interval_secs, 2);

        unsafe { std::env::remove_var("RESV_COORDINATOR_TOKEN") };
        unsafe { std::env::remove_var("RESV_SWEEP_INTERVAL_SECS") };
    }

    #[test]
    fn env_seconds_must_be_integers() {
        assert_eq!(parse_env_secs("X", " 12 ").unwrap(), 12);
        assert_eq!(parse_env_secs("X", "soon").unwrap_err().code(), "config_error");
    }

    #[test]
    fn missing_file_is_default() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.max_ttl_secs, 86_400);
    }
}
