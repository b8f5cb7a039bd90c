//! Cache manager: the single owner of cache bookkeeping
//!
//! Clients connect over loopback TCP, authenticate with a token line and then
//! exchange one JSON request line for one JSON reply line. All bookkeeping
//! lives in [`CacheState`], guarded by one mutex, so requests are applied in
//! arrival order. Segments handed over through `PUT` belong to the manager
//! from then on and are unlinked on eviction, removal and shutdown.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::{CacheError, CacheResult};
use crate::profiler::Profiler;
use crate::protocol::{CacheEntry, CacheReply, CacheRequest, DEFAULT_ADDRESS, DEFAULT_TOKEN};
use crate::shm::unlink_segment;
use crate::stats::{CacheStats, StatsCollector};

/// Manager settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    pub address: String,
    pub token: String,
    pub max_size: usize,
    /// Where the profile report goes, on `END_PROFILING` and at shutdown
    pub log_dir: Option<PathBuf>,
    pub profiling: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            token: DEFAULT_TOKEN.to_string(),
            max_size: 0,
            log_dir: None,
            profiling: false,
        }
    }
}

/// Identity of one client connection
pub type ConnId = u64;

/// What the manager should do after answering a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Continue,
    Stop,
}

/// Cache bookkeeping
#[derive(Debug)]
pub struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// hit count -> key -> size, for least-hit eviction
    hits: BTreeMap<u64, HashMap<String, usize>>,
    locked: HashMap<String, ConnId>,
    used_size: usize,
    max_size: usize,
    stats: StatsCollector,
    profiler: Option<Profiler>,
    log_dir: Option<PathBuf>,
}

impl CacheState {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            hits: BTreeMap::new(),
            locked: HashMap::new(),
            used_size: 0,
            max_size,
            stats: StatsCollector::new(),
            profiler: None,
            log_dir: None,
        }
    }

    pub fn with_profiling(mut self, log_dir: Option<PathBuf>) -> Self {
        self.profiler = Some(Profiler::new());
        self.log_dir = log_dir;
        self
    }

    pub fn used_size(&self) -> usize {
        self.used_size
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.locked.contains_key(key)
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
            .get_stats(self.entries.len(), self.used_size, self.max_size)
    }

    fn index_hits(&mut self, key: &str, hits: u64, size: usize) {
        self.hits.entry(hits).or_default().insert(key.to_string(), size);
    }

    fn unindex_hits(&mut self, key: &str, hits: u64) {
        if let Some(bucket) = self.hits.get_mut(&hits) {
            bucket.remove(key);
            if bucket.is_empty() {
                self.hits.remove(&hits);
            }
        }
    }

    fn drop_entry(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.unindex_hits(key, entry.hits);
        self.used_size = self.used_size.saturating_sub(entry.size);
        Some(entry)
    }

    /// Evict least-hit entries until `requested` more bytes fit
    ///
    /// Returns the segment names to unlink.
    fn make_room(&mut self, requested: usize) -> Vec<String> {
        let mut to_recover = (self.used_size + requested).saturating_sub(self.max_size);
        let mut victims = Vec::new();
        'outer: for bucket in self.hits.values() {
            for key in bucket.keys() {
                if to_recover == 0 {
                    break 'outer;
                }
                let size = self.entries.get(key).map_or(0, |e| e.size);
                victims.push(key.clone());
                to_recover = to_recover.saturating_sub(size);
            }
        }

        debug!("Evicting {} entries to fit {} bytes", victims.len(), requested);
        self.stats.record_evictions(victims.len() as u64);
        victims
            .iter()
            .filter_map(|key| self.drop_entry(key))
            .map(|entry| entry.shm_name)
            .collect()
    }

    /// Store an entry
    ///
    /// Returns whether it was stored and the segments evicted to make room.
    pub fn put(
        &mut self,
        key: &str,
        mut entry: CacheEntry,
        parameter: &str,
        function: &str,
    ) -> CacheResult<(bool, Vec<String>)> {
        if self.entries.contains_key(key) {
            debug!("Object {} already cached, not adding", key);
            return Ok((false, Vec::new()));
        }
        if entry.size > self.max_size {
            return Err(CacheError::CapacityExceeded(format!(
                "{} needs {} bytes, cache holds {}",
                key, entry.size, self.max_size
            )));
        }

        let evicted = if self.used_size + entry.size > self.max_size {
            self.make_room(entry.size)
        } else {
            Vec::new()
        };

        entry.hits = 0;
        self.used_size += entry.size;
        self.index_hits(key, 0, entry.size);
        debug!("Cache add entry {} ({} bytes)", key, entry.size);
        self.entries.insert(key.to_string(), entry);
        self.stats.record_put();
        if let Some(profiler) = self.profiler.as_mut() {
            profiler.record_put(function, parameter, key);
        }
        Ok((true, evicted))
    }

    /// Look up an entry and count the hit
    pub fn get(&mut self, key: &str, parameter: &str, function: &str) -> Option<CacheEntry> {
        let Some(entry) = self.entries.get_mut(key) else {
            debug!("Cache miss {}", key);
            self.stats.record_miss();
            return None;
        };
        let previous = entry.hits;
        entry.hits += 1;
        let (hits, size) = (entry.hits, entry.size);
        let found = entry.clone();

        self.unindex_hits(key, previous);
        self.index_hits(key, hits, size);
        self.stats.record_hit();
        if let Some(profiler) = self.profiler.as_mut() {
            profiler.record_get(function, parameter, key);
        }
        debug!("Cache hit {}", key);
        Some(found)
    }

    /// Forget an entry, returning its segment name
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let removed = self.drop_entry(key).map(|e| e.shm_name);
        if removed.is_none() {
            debug!("Remove of uncached object {}", key);
        }
        removed
    }

    pub fn lock(&mut self, key: &str, conn: ConnId) -> CacheResult<()> {
        if self.locked.contains_key(key) {
            return Err(CacheError::Coherence(format!(
                "tried to lock already locked entry {}",
                key
            )));
        }
        self.locked.insert(key.to_string(), conn);
        self.stats.record_lock();
        Ok(())
    }

    /// Release a lock held by `conn`; a lock owned by another client stays
    pub fn unlock(&mut self, key: &str, conn: ConnId) -> CacheResult<()> {
        match self.locked.get(key) {
            None => Err(CacheError::Coherence(format!(
                "tried to unlock entry {} that was not locked",
                key
            ))),
            Some(owner) if *owner != conn => Err(CacheError::Coherence(format!(
                "client {} tried to unlock entry {} locked by client {}",
                conn, key, owner
            ))),
            Some(_) => {
                self.locked.remove(key);
                self.stats.record_unlock();
                Ok(())
            }
        }
    }

    /// Drop every lock held by a connection; returns the released keys
    pub fn release_locks(&mut self, conn: ConnId) -> Vec<String> {
        let keys: Vec<String> = self
            .locked
            .iter()
            .filter(|(_, owner)| **owner == conn)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            self.locked.remove(key);
        }
        keys
    }

    /// Remove everything, returning all segment names
    pub fn drain(&mut self) -> Vec<String> {
        for (hits, bucket) in &self.hits {
            for (key, size) in bucket {
                debug!("{} hits: {} {}", hits, key, size);
            }
        }
        self.hits.clear();
        self.locked.clear();
        self.used_size = 0;
        self.entries.drain().map(|(_, e)| e.shm_name).collect()
    }

    /// Write the access profile, if profiling is on
    pub fn end_profiling(&self) -> CacheResult<()> {
        match (&self.profiler, &self.log_dir) {
            (Some(profiler), Some(dir)) => {
                let path = profiler.write(dir)?;
                info!("Cache profile written to {}", path.display());
                Ok(())
            }
            (Some(_), None) => {
                warn!("Cache profiling enabled without a log directory");
                Ok(())
            }
            (None, _) => Ok(()),
        }
    }

    /// Apply one request
    pub fn handle(&mut self, conn: ConnId, request: CacheRequest) -> (CacheReply, Control) {
        let reply = match request {
            CacheRequest::Put {
                key,
                entry,
                parameter,
                function,
            } => match self.put(&key, entry, &parameter, &function) {
                Ok((stored, evicted)) => {
                    evicted.iter().for_each(|name| unlink_segment(name));
                    CacheReply::Stored { stored }
                }
                Err(e) => error_reply(e),
            },
            CacheRequest::Get {
                key,
                parameter,
                function,
            } => CacheReply::Entry {
                entry: self.get(&key, &parameter, &function),
            },
            CacheRequest::Remove { key } => {
                if let Some(name) = self.remove(&key) {
                    unlink_segment(&name);
                }
                CacheReply::Ack
            }
            CacheRequest::Lock { key } => match self.lock(&key, conn) {
                Ok(()) => CacheReply::Ack,
                Err(e) => error_reply(e),
            },
            CacheRequest::Unlock { key } => match self.unlock(&key, conn) {
                Ok(()) => CacheReply::Ack,
                Err(e) => error_reply(e),
            },
            CacheRequest::IsLocked { key } => CacheReply::Bool {
                value: self.is_locked(&key),
            },
            CacheRequest::IsInCache { key } => CacheReply::Bool {
                value: self.contains(&key),
            },
            CacheRequest::Stats => CacheReply::Stats {
                stats: self.stats(),
            },
            CacheRequest::EndProfiling => match self.end_profiling() {
                Ok(()) => CacheReply::Ack,
                Err(e) => error_reply(e),
            },
            CacheRequest::Quit => {
                info!("Stopping cache manager: {:?}", self.stats());
                return (CacheReply::Ack, Control::Stop);
            }
        };
        (reply, Control::Continue)
    }
}

fn error_reply(err: CacheError) -> CacheReply {
    warn!("Cache request failed: {}", err);
    CacheReply::Error {
        message: err.to_string(),
    }
}

/// Listening cache manager
pub struct CacheManager {
    listener: TcpListener,
    token: String,
    state: Arc<Mutex<CacheState>>,
    shutdown: CancellationToken,
    next_conn: Arc<AtomicU64>,
}

impl CacheManager {
    pub async fn bind(config: ManagerConfig) -> CacheResult<Self> {
        let listener = TcpListener::bind(&config.address).await?;
        let mut state = CacheState::new(config.max_size);
        if config.profiling {
            state = state.with_profiling(config.log_dir.clone());
        }
        info!(
            "Cache manager listening on {} (max size {} bytes)",
            listener.local_addr()?,
            config.max_size
        );
        Ok(Self {
            listener,
            token: config.token,
            state: Arc::new(Mutex::new(state)),
            shutdown: CancellationToken::new(),
            next_conn: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn local_addr(&self) -> CacheResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Token that stops the manager when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve until `QUIT` or shutdown, then unlink every owned segment
    pub async fn run(self) -> CacheResult<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                            continue;
                        }
                    };
                    let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
                    debug!("Cache client {} connected from {}", conn, peer);
                    let state = self.state.clone();
                    let token = self.token.clone();
                    let shutdown = self.shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, conn, &token, state, shutdown).await {
                            debug!("Cache client {} ended: {}", conn, e);
                        }
                    });
                }
            }
        }

        let mut state = self.state.lock().await;
        if let Err(e) = state.end_profiling() {
            warn!("Failed to write cache profile: {}", e);
        }
        let names = state.drain();
        info!("Cache manager stopped, unlinking {} segments", names.len());
        names.iter().for_each(|name| unlink_segment(name));
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    conn: ConnId,
    token: &str,
    state: Arc<Mutex<CacheState>>,
    shutdown: CancellationToken,
) -> CacheResult<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    match lines.next_line().await? {
        Some(line) if line.trim() == token => {}
        _ => {
            let reply = CacheReply::Error {
                message: CacheError::Unauthorized.to_string(),
            };
            write_reply(&mut write_half, &reply).await?;
            return Err(CacheError::Unauthorized);
        }
    }
    write_reply(&mut write_half, &CacheReply::Ack).await?;

    let result = loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(CacheError::from(e)),
        };
        if line.trim().is_empty() {
            continue;
        }

        let (reply, control) = match serde_json::from_str::<CacheRequest>(&line) {
            Ok(request) => state.lock().await.handle(conn, request),
            Err(e) => (error_reply(CacheError::from(e)), Control::Continue),
        };
        if let Err(e) = write_reply(&mut write_half, &reply).await {
            break Err(e);
        }
        if control == Control::Stop {
            shutdown.cancel();
            break Ok(());
        }
    };

    let released = state.lock().await.release_locks(conn);
    if !released.is_empty() {
        warn!("Released locks of disconnected client {}: {:?}", conn, released);
    }
    result
}

async fn write_reply(
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    reply: &CacheReply,
) -> CacheResult<()> {
    let mut line = serde_json::to_vec(reply)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    Ok(())
}
