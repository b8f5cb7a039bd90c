//! JSON-lines protocol between cache clients and the manager

use piper_core::DType;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::stats::CacheStats;

/// Default manager address
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:50000";

/// Default authentication token, sent as the first line of every connection
pub const DEFAULT_TOKEN: &str = "compss_cache";

/// Line printed by a manager process once it accepts connections
pub const LISTENING_PREFIX: &str = "LISTENING";

/// How a cached payload is laid out in its segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SharedKind {
    /// Raw array buffer
    SharedArray,
    /// Serialized list of primitives
    SharedList,
    /// Serialized tuple of primitives
    SharedTuple,
}

/// Manager-side record of one cached object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub shm_name: String,
    pub shape: Vec<usize>,
    pub dtype: Option<DType>,
    pub size: usize,
    pub hits: u64,
    pub kind: SharedKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheRequest {
    Put {
        key: String,
        entry: CacheEntry,
        parameter: String,
        function: String,
    },
    Get {
        key: String,
        parameter: String,
        function: String,
    },
    Remove {
        key: String,
    },
    Lock {
        key: String,
    },
    Unlock {
        key: String,
    },
    IsLocked {
        key: String,
    },
    IsInCache {
        key: String,
    },
    Stats,
    EndProfiling,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheReply {
    Ack,
    /// Answer to `PUT`; `false` means the key was already present
    Stored {
        stored: bool,
    },
    Bool {
        value: bool,
    },
    Entry {
        entry: Option<CacheEntry>,
    },
    Stats {
        stats: CacheStats,
    },
    Error {
        message: String,
    },
}

/// Cache key of a file backed object: the base name of its path
pub fn cache_key(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}
