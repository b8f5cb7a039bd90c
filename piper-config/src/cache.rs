//! Cache token of the worker arguments

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

use crate::error::ConfigError;

/// Where shared memory segments live
pub const SHM_DIR: &str = "/dev/shm";

/// Whether the shared cache runs, and how large it may grow
///
/// Parsed from `false`, `true` or `true:<bytes>`. Any other token disables
/// the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheSpec {
    Disabled,
    Enabled { size: Option<u64> },
}

impl CacheSpec {
    pub fn is_enabled(&self) -> bool {
        matches!(self, CacheSpec::Enabled { .. })
    }

    /// Capacity in bytes, defaulting to a quarter of the shared memory mount
    pub fn resolved_size(&self) -> Option<u64> {
        match self {
            CacheSpec::Disabled => None,
            CacheSpec::Enabled { size: Some(size) } => Some(*size),
            CacheSpec::Enabled { size: None } => Some(default_cache_size(Path::new(SHM_DIR))),
        }
    }
}

impl FromStr for CacheSpec {
    type Err = ConfigError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        match token.split_once(':') {
            None if token == "true" => Ok(CacheSpec::Enabled { size: None }),
            Some(("true", size)) => {
                let size = size.parse::<u64>().map_err(|e| ConfigError::ArgumentError {
                    position: 12,
                    name: "cache",
                    message: format!("invalid cache size {:?}: {}", size, e),
                })?;
                Ok(CacheSpec::Enabled { size: Some(size) })
            }
            _ => Ok(CacheSpec::Disabled),
        }
    }
}

impl fmt::Display for CacheSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheSpec::Disabled => f.write_str("false"),
            CacheSpec::Enabled { size: None } => f.write_str("true"),
            CacheSpec::Enabled { size: Some(size) } => write!(f, "true:{}", size),
        }
    }
}

/// A quarter of the file system holding `path`, or 0 if it cannot be read
pub fn default_cache_size(path: &Path) -> u64 {
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => {
            let total = (stat.blocks() as u64).saturating_mul(stat.fragment_size() as u64);
            total / 4
        }
        Err(errno) => {
            warn!("Cannot stat {}: {}; cache size falls back to 0", path.display(), errno);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cache_tokens() {
        assert_eq!("false".parse::<CacheSpec>().unwrap(), CacheSpec::Disabled);
        assert_eq!(
            "true".parse::<CacheSpec>().unwrap(),
            CacheSpec::Enabled { size: None }
        );
        assert_eq!(
            "true:1048576".parse::<CacheSpec>().unwrap(),
            CacheSpec::Enabled {
                size: Some(1048576)
            }
        );
        // Anything else leaves the cache off
        assert_eq!("1".parse::<CacheSpec>().unwrap(), CacheSpec::Disabled);
        assert!("true:lots".parse::<CacheSpec>().is_err());
    }

    #[test]
    fn test_display_round_trips() {
        for spec in [
            CacheSpec::Disabled,
            CacheSpec::Enabled { size: None },
            CacheSpec::Enabled { size: Some(42) },
        ] {
            assert_eq!(spec.to_string().parse::<CacheSpec>().unwrap(), spec);
        }
    }

    #[test]
    fn test_default_size_is_quarter_of_mount() {
        let dir = tempfile::TempDir::new().unwrap();
        let quarter = default_cache_size(dir.path());
        let stat = nix::sys::statvfs::statvfs(dir.path()).unwrap();
        assert_eq!(
            quarter,
            (stat.blocks() as u64 * stat.fragment_size() as u64) / 4
        );
        assert_eq!(default_cache_size(Path::new("/definitely/not/here")), 0);
        assert_eq!(CacheSpec::Disabled.resolved_size(), None);
    }
}
