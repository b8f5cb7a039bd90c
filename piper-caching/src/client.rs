//! Client side of the shared cache

use piper_core::{serialize_to_bytes, DType, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::errors::{CacheError, CacheResult};
use crate::lease::Lease;
use crate::lock::CacheLock;
use crate::protocol::{CacheEntry, CacheReply, CacheRequest, SharedKind};
use crate::shm::{create_segment, unlink_segment};
use crate::stats::CacheStats;

/// Result of an insert attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// This call stored the object
    Inserted,
    /// The key was present or locked by another client
    Skipped,
}

struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    /// Requests written whose reply was never read
    unanswered: usize,
}

impl Connection {
    async fn read_reply(&mut self) -> CacheResult<CacheReply> {
        let line = self
            .lines
            .next_line()
            .await?
            .ok_or(CacheError::ConnectionClosed)?;
        Ok(serde_json::from_str(&line)?)
    }
}

struct ClientInner {
    conn: Mutex<Connection>,
    lock: CacheLock,
}

impl ClientInner {
    async fn request(&self, request: &CacheRequest) -> CacheResult<CacheReply> {
        let mut conn = self.conn.lock().await;
        // A dropped request leaves its reply in the stream
        while conn.unanswered > 0 {
            let stale = conn.read_reply().await?;
            debug!("Discarding stale cache reply {:?}", stale);
            conn.unanswered -= 1;
        }

        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        conn.writer.write_all(&line).await?;
        conn.unanswered += 1;
        let reply = conn.read_reply().await?;
        conn.unanswered -= 1;
        Ok(reply)
    }

    async fn unlock(&self, key: &str) -> CacheResult<()> {
        let reply = self
            .request(&CacheRequest::Unlock {
                key: key.to_string(),
            })
            .await?;
        expect_ack(reply)
    }
}

fn reply_error(reply: CacheReply) -> CacheError {
    match reply {
        CacheReply::Error { message } => CacheError::Manager(message),
        other => CacheError::UnexpectedReply(format!("{:?}", other)),
    }
}

fn expect_ack(reply: CacheReply) -> CacheResult<()> {
    match reply {
        CacheReply::Ack => Ok(()),
        other => Err(reply_error(other)),
    }
}

fn expect_bool(reply: CacheReply) -> CacheResult<bool> {
    match reply {
        CacheReply::Bool { value } => Ok(value),
        other => Err(reply_error(other)),
    }
}

/// Sends `UNLOCK` for a key on every exit path
///
/// [`UnlockGuard::unlock`] is the normal path. If the guard is dropped
/// instead, for example because the insert future was cancelled, the unlock
/// is sent from a spawned task.
struct UnlockGuard {
    inner: Option<Arc<ClientInner>>,
    key: String,
}

impl UnlockGuard {
    fn new(inner: Arc<ClientInner>, key: &str) -> Self {
        Self {
            inner: Some(inner),
            key: key.to_string(),
        }
    }

    /// The manager refused the lock, so there is nothing to release
    fn disarm(mut self) {
        self.inner = None;
    }

    async fn unlock(mut self) -> CacheResult<()> {
        match self.inner.take() {
            Some(inner) => inner.unlock(&self.key).await,
            None => Ok(()),
        }
    }
}

impl Drop for UnlockGuard {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = inner.unlock(&key).await {
                        warn!("Deferred unlock of {} failed: {}", key, e);
                    }
                });
            }
            Err(_) => warn!("No runtime to unlock {}; the manager releases it on disconnect", key),
        }
    }
}

/// Encoded form of a cacheable value
struct Payload {
    kind: SharedKind,
    shape: Vec<usize>,
    dtype: Option<DType>,
    bytes: Vec<u8>,
}

/// Arrays and flat sequences of primitives
pub fn is_cacheable(value: &Value) -> bool {
    match value {
        Value::Array(_) => true,
        Value::List(items) | Value::Tuple(items) => items.iter().all(Value::is_primitive),
        _ => false,
    }
}

fn encode_payload(value: &Value) -> CacheResult<Payload> {
    if !is_cacheable(value) {
        return Err(CacheError::Unsupported(value.type_name().to_string()));
    }
    Ok(match value {
        Value::Array(array) => Payload {
            kind: SharedKind::SharedArray,
            shape: array.shape().to_vec(),
            dtype: Some(array.dtype()),
            bytes: array.data().to_vec(),
        },
        Value::Tuple(items) => Payload {
            kind: SharedKind::SharedTuple,
            shape: vec![items.len()],
            dtype: None,
            bytes: serialize_to_bytes(value)?,
        },
        Value::List(items) => Payload {
            kind: SharedKind::SharedList,
            shape: vec![items.len()],
            dtype: None,
            bytes: serialize_to_bytes(value)?,
        },
        other => return Err(CacheError::Unsupported(other.type_name().to_string())),
    })
}

/// Handle on the cache manager
///
/// Clones share one connection.
#[derive(Clone)]
pub struct SharedCache {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for SharedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedCache")
            .field("lock", &self.inner.lock.path())
            .finish()
    }
}

impl SharedCache {
    /// Connect and authenticate
    pub async fn connect(
        address: &str,
        token: &str,
        lock_path: impl Into<PathBuf>,
    ) -> CacheResult<Self> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        let (read_half, mut writer) = stream.into_split();
        writer.write_all(format!("{}\n", token).as_bytes()).await?;

        let mut conn = Connection {
            lines: BufReader::new(read_half).lines(),
            writer,
            unanswered: 0,
        };
        match conn.read_reply().await? {
            CacheReply::Ack => {}
            _ => return Err(CacheError::Unauthorized),
        }
        debug!("Connected to cache manager at {}", address);

        Ok(Self {
            inner: Arc::new(ClientInner {
                conn: Mutex::new(conn),
                lock: CacheLock::new(lock_path),
            }),
        })
    }

    async fn request(&self, request: CacheRequest) -> CacheResult<CacheReply> {
        self.inner.request(&request).await
    }

    pub async fn is_locked(&self, key: &str) -> CacheResult<bool> {
        expect_bool(
            self.request(CacheRequest::IsLocked {
                key: key.to_string(),
            })
            .await?,
        )
    }

    pub async fn in_cache(&self, key: &str) -> CacheResult<bool> {
        expect_bool(
            self.request(CacheRequest::IsInCache {
                key: key.to_string(),
            })
            .await?,
        )
    }

    /// Store `value` under `key` unless another client got there first
    pub async fn insert(
        &self,
        value: &Value,
        key: &str,
        parameter: &str,
        function: &str,
    ) -> CacheResult<InsertOutcome> {
        let payload = encode_payload(value)?;

        let guard = {
            let _flock = self.inner.lock.acquire().await?;
            if self.is_locked(key).await? {
                debug!("{} is being inserted by another client", key);
                return Ok(InsertOutcome::Skipped);
            }
            if self.in_cache(key).await? {
                debug!("{} already cached", key);
                return Ok(InsertOutcome::Skipped);
            }
            // Armed before LOCK goes out, so a cancelled request still unlocks
            let guard = UnlockGuard::new(self.inner.clone(), key);
            let reply = self
                .request(CacheRequest::Lock {
                    key: key.to_string(),
                })
                .await?;
            if let Err(e) = expect_ack(reply) {
                guard.disarm();
                return Err(e);
            }
            guard
        };

        let stored = self.store(key, payload, parameter, function).await;
        let unlocked = guard.unlock().await;
        let outcome = stored?;
        unlocked?;
        Ok(outcome)
    }

    async fn store(
        &self,
        key: &str,
        payload: Payload,
        parameter: &str,
        function: &str,
    ) -> CacheResult<InsertOutcome> {
        let Payload {
            kind,
            shape,
            dtype,
            bytes,
        } = payload;
        let size = bytes.len();
        let shm_name = tokio::task::spawn_blocking(move || create_segment(&bytes))
            .await
            .map_err(|e| CacheError::SharedMemory(e.to_string()))??;

        let entry = CacheEntry {
            shm_name: shm_name.clone(),
            shape,
            dtype,
            size,
            hits: 0,
            kind,
        };
        let reply = self
            .request(CacheRequest::Put {
                key: key.to_string(),
                entry,
                parameter: parameter.to_string(),
                function: function.to_string(),
            })
            .await;

        match reply {
            Ok(CacheReply::Stored { stored: true }) => {
                debug!("Cached {} in {} ({} bytes)", key, shm_name, size);
                Ok(InsertOutcome::Inserted)
            }
            Ok(CacheReply::Stored { stored: false }) => {
                unlink_segment(&shm_name);
                Ok(InsertOutcome::Skipped)
            }
            Ok(other) => {
                unlink_segment(&shm_name);
                Err(reply_error(other))
            }
            Err(e) => {
                unlink_segment(&shm_name);
                Err(e)
            }
        }
    }

    /// Insert only values the cache supports; failures are logged, never raised
    pub async fn insert_with_filter(
        &self,
        value: &Value,
        key: &str,
        parameter: &str,
        function: &str,
    ) -> InsertOutcome {
        if !is_cacheable(value) {
            debug!("Not caching {}: {} is not supported", key, value.type_name());
            return InsertOutcome::Skipped;
        }
        match self.insert(value, key, parameter, function).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Could not cache {}: {}", key, e);
                InsertOutcome::Skipped
            }
        }
    }

    /// Map a cached object, counting the hit
    pub async fn retrieve(
        &self,
        key: &str,
        parameter: &str,
        function: &str,
    ) -> CacheResult<Option<Lease>> {
        let reply = self
            .request(CacheRequest::Get {
                key: key.to_string(),
                parameter: parameter.to_string(),
                function: function.to_string(),
            })
            .await?;
        match reply {
            CacheReply::Entry { entry: Some(entry) } => Lease::open(key, entry).map(Some),
            CacheReply::Entry { entry: None } => Ok(None),
            other => Err(reply_error(other)),
        }
    }

    pub async fn remove(&self, key: &str) -> CacheResult<()> {
        expect_ack(
            self.request(CacheRequest::Remove {
                key: key.to_string(),
            })
            .await?,
        )
    }

    /// Remove then insert; a reader in between sees a miss
    pub async fn replace(
        &self,
        value: &Value,
        key: &str,
        parameter: &str,
        function: &str,
    ) -> CacheResult<InsertOutcome> {
        self.remove(key).await?;
        self.insert(value, key, parameter, function).await
    }

    pub async fn stats(&self) -> CacheResult<CacheStats> {
        match self.request(CacheRequest::Stats).await? {
            CacheReply::Stats { stats } => Ok(stats),
            other => Err(reply_error(other)),
        }
    }

    pub async fn end_profiling(&self) -> CacheResult<()> {
        expect_ack(self.request(CacheRequest::EndProfiling).await?)
    }

    /// Stop the manager
    pub async fn quit(&self) -> CacheResult<()> {
        expect_ack(self.request(CacheRequest::Quit).await?)
    }
}
