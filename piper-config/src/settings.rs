//! Runtime settings not carried by the worker arguments
//!
//! Defaults suit a normal deployment; each field can be overridden through a
//! `PIPER_*` environment variable.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};
use crate::validation::{validate_positive, validate_required_string, Validatable};

pub const ENV_PREFIX: &str = "PIPER";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Cache manager address; port 0 picks a free port
    #[serde(default = "default_cache_address")]
    pub cache_address: String,

    #[serde(default = "default_cache_token")]
    pub cache_token: String,

    /// Lock file guarding cache inserts; defaults to one inside the tmp dir
    pub cache_lock_file: Option<PathBuf>,

    /// Record cache accesses and write a profile on shutdown
    pub cache_profiler: bool,

    /// Time a child gets between SIGTERM and SIGKILL
    #[serde(with = "serde_millis", default = "default_shutdown_grace")]
    pub shutdown_grace: Duration,

    /// Overrides the level derived from the debug flag
    pub log_level: Option<String>,

    /// Pause before reopening a FIFO that has no peer yet
    #[serde(with = "serde_millis", default = "default_fifo_retry")]
    pub fifo_retry: Duration,
}

fn default_cache_address() -> String {
    "127.0.0.1:50000".to_string()
}

fn default_cache_token() -> String {
    "compss_cache".to_string()
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_fifo_retry() -> Duration {
    Duration::from_millis(50)
}

/// Serde helper module for Duration serialization as milliseconds
mod serde_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            cache_address: default_cache_address(),
            cache_token: default_cache_token(),
            cache_lock_file: None,
            cache_profiler: false,
            shutdown_grace: default_shutdown_grace(),
            log_level: None,
            fifo_retry: default_fifo_retry(),
        }
    }
}

impl RuntimeSettings {
    /// Defaults with environment overrides applied
    pub fn from_env() -> ConfigResult<Self> {
        let mut settings = Self::default();
        settings.apply_env_overrides(ENV_PREFIX)?;
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self, prefix: &str) -> ConfigResult<()> {
        let var = |name: &str| std::env::var(format!("{}_{}", prefix, name)).ok();
        let millis = |name: &str, raw: String| -> ConfigResult<Duration> {
            raw.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| ConfigError::EnvError(format!("Invalid {}_{}: {}", prefix, name, e)))
        };

        if let Some(address) = var("CACHE_ADDRESS") {
            self.cache_address = address;
        }
        if let Some(token) = var("CACHE_TOKEN") {
            self.cache_token = token;
        }
        if let Some(path) = var("CACHE_LOCK_FILE") {
            self.cache_lock_file = Some(PathBuf::from(path));
        }
        if let Some(flag) = var("CACHE_PROFILER") {
            self.cache_profiler = matches!(flag.as_str(), "1" | "true" | "TRUE" | "True");
        }
        if let Some(raw) = var("SHUTDOWN_GRACE_MS") {
            self.shutdown_grace = millis("SHUTDOWN_GRACE_MS", raw)?;
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.log_level = Some(level);
        }
        if let Some(raw) = var("FIFO_RETRY_MS") {
            self.fifo_retry = millis("FIFO_RETRY_MS", raw)?;
        }
        Ok(())
    }

    pub fn lock_file(&self, tmp_dir: &Path) -> PathBuf {
        self.cache_lock_file
            .clone()
            .unwrap_or_else(|| tmp_dir.join("piper_cache.lock"))
    }
}

impl Validatable for RuntimeSettings {
    fn validate(&self) -> ConfigResult<()> {
        validate_required_string(&self.cache_address, "cache_address", self.domain_name())?;
        validate_required_string(&self.cache_token, "cache_token", self.domain_name())?;
        validate_positive(self.fifo_retry.as_millis(), "fifo_retry", self.domain_name())?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "runtime"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        temp_env::with_vars_unset(
            ["PIPER_CACHE_ADDRESS", "PIPER_SHUTDOWN_GRACE_MS", "PIPER_CACHE_PROFILER"],
            || {
                let settings = RuntimeSettings::from_env().unwrap();
                assert_eq!(settings.cache_address, "127.0.0.1:50000");
                assert_eq!(settings.cache_token, "compss_cache");
                assert_eq!(settings.shutdown_grace, Duration::from_secs(5));
                assert!(!settings.cache_profiler);
                assert_eq!(
                    settings.lock_file(Path::new("/tmp/w")),
                    PathBuf::from("/tmp/w/piper_cache.lock")
                );
            },
        );
    }

    #[test]
    fn test_env_overrides() {
        temp_env::with_vars(
            [
                ("PIPER_CACHE_ADDRESS", Some("127.0.0.1:0")),
                ("PIPER_SHUTDOWN_GRACE_MS", Some("250")),
                ("PIPER_CACHE_PROFILER", Some("1")),
            ],
            || {
                let settings = RuntimeSettings::from_env().unwrap();
                assert_eq!(settings.cache_address, "127.0.0.1:0");
                assert_eq!(settings.shutdown_grace, Duration::from_millis(250));
                assert!(settings.cache_profiler);
            },
        );
    }

    #[test]
    fn test_invalid_env_value() {
        temp_env::with_var("PIPER_FIFO_RETRY_MS", Some("soon"), || {
            assert!(matches!(
                RuntimeSettings::from_env(),
                Err(ConfigError::EnvError(_))
            ));
        });
    }

    #[test]
    fn test_json_uses_defaults_for_missing_fields() {
        let settings: RuntimeSettings =
            serde_json::from_str(r#"{"cache_token":"secret"}"#).unwrap();
        assert_eq!(settings.cache_token, "secret");
        assert_eq!(settings.fifo_retry, Duration::from_millis(50));
    }
}
