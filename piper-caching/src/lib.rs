//! Shared-memory object cache for piper executors
//!
//! Large arrays and flat sequences produced by one executor are copied into
//! POSIX shared memory once and mapped by every other executor that needs
//! them. A single [`CacheManager`] owns the bookkeeping; executors talk to it
//! through [`SharedCache`] clients. A file lock serializes the
//! check-then-lock step so that concurrent inserts of one key collapse into
//! exactly one store.

pub mod client;
pub mod errors;
pub mod lease;
pub mod lock;
pub mod manager;
pub mod profiler;
pub mod protocol;
pub mod shm;
pub mod stats;

// Re-export main types
pub use client::{is_cacheable, InsertOutcome, SharedCache};
pub use errors::{CacheError, CacheResult};
pub use lease::{CachedView, Lease};
pub use lock::CacheLock;
pub use manager::{CacheManager, CacheState, ManagerConfig};
pub use protocol::{
    cache_key, CacheEntry, CacheReply, CacheRequest, SharedKind, DEFAULT_ADDRESS, DEFAULT_TOKEN,
    LISTENING_PREFIX,
};
pub use stats::CacheStats;

/// Run a manager inside the current runtime
///
/// Returns the bound address and the manager task. Used when the cache lives
/// in the same process as its clients, and by tests.
pub async fn spawn_manager(
    config: ManagerConfig,
) -> CacheResult<(std::net::SocketAddr, tokio::task::JoinHandle<CacheResult<()>>)> {
    let manager = CacheManager::bind(config).await?;
    let addr = manager.local_addr()?;
    Ok((addr, tokio::spawn(manager.run())))
}
