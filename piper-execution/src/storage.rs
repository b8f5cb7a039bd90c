//! Persistent storage hooks

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use piper_core::Value;

use crate::error::{ExecutionError, ExecutionResult};

/// Calls into a persistent storage backend
///
/// Executors call `init` before the first task and `finish` on the way
/// out. Persistent parameters are resolved through `get_by_id`.
pub trait StorageHooks: Send + Sync {
    fn init(&self) -> ExecutionResult<()>;

    fn finish(&self) -> ExecutionResult<()>;

    fn get_by_id(&self, id: &str) -> ExecutionResult<Value>;
}

/// Hooks without a backend: objects are handed to the task by id
#[derive(Debug)]
pub struct PassThroughStorage {
    conf: PathBuf,
    initialized: AtomicBool,
}

impl PassThroughStorage {
    pub fn new(conf: impl Into<PathBuf>) -> Self {
        Self {
            conf: conf.into(),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn conf(&self) -> &Path {
        &self.conf
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }
}

impl StorageHooks for PassThroughStorage {
    fn init(&self) -> ExecutionResult<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(ExecutionError::Storage("storage already initialized".into()));
        }
        info!("Storage initialized with {}", self.conf.display());
        Ok(())
    }

    fn finish(&self) -> ExecutionResult<()> {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return Err(ExecutionError::Storage("storage was never initialized".into()));
        }
        info!("Storage finished");
        Ok(())
    }

    fn get_by_id(&self, id: &str) -> ExecutionResult<Value> {
        if !self.is_initialized() {
            return Err(ExecutionError::Storage(format!(
                "cannot resolve {} before init",
                id
            )));
        }
        debug!("Resolving persistent object {}", id);
        Ok(Value::Str(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let storage = PassThroughStorage::new("/etc/storage.cfg");
        assert!(storage.get_by_id("obj-1").is_err());
        storage.init().unwrap();
        assert!(storage.init().is_err());
        assert_eq!(
            storage.get_by_id("obj-1").unwrap(),
            Value::Str("obj-1".into())
        );
        storage.finish().unwrap();
        assert!(!storage.is_initialized());
        assert!(storage.finish().is_err());
    }
}
