//! Spawning executor and cache manager processes

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use piper_caching::{ManagerConfig, LISTENING_PREFIX};
use piper_ipc::PipePair;

use crate::error::{ExecutionResult, ProcessLifecycleError};

/// Subcommand that turns the binary into an executor
pub const EXECUTOR_SUBCOMMAND: &str = "executor";
/// Subcommand that turns the binary into the cache manager
pub const CACHE_MANAGER_SUBCOMMAND: &str = "cache-manager";

/// How long the cache manager gets to report its address
pub const CACHE_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// How an executor reaches the shared cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheClientSettings {
    pub address: String,
    pub token: String,
    pub lock_file: PathBuf,
}

/// Everything an executor process needs, handed over as one JSON argument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorSettings {
    pub name: String,
    /// Seen from the executor: it reads `input` and writes `output`
    pub pipe: PipePair,
    pub log_dir: PathBuf,
    pub debug: bool,
    #[serde(default)]
    pub log_level: Option<String>,
    /// Set when the storage hooks are enabled
    #[serde(default)]
    pub storage_conf: Option<String>,
    #[serde(default)]
    pub cache: Option<CacheClientSettings>,
    #[serde(default = "default_fifo_retry_ms")]
    pub fifo_retry_ms: u64,
    #[serde(default)]
    pub tracker_report: bool,
}

fn default_fifo_retry_ms() -> u64 {
    50
}

impl ExecutorSettings {
    pub fn to_json(&self) -> ExecutionResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> ExecutionResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn fifo_retry(&self) -> Duration {
        Duration::from_millis(self.fifo_retry_ms)
    }
}

/// Creates the child processes of a worker pool
#[async_trait]
pub trait ExecutorLauncher: Send + Sync {
    async fn launch_executor(
        &self,
        settings: &ExecutorSettings,
    ) -> Result<Child, ProcessLifecycleError>;

    /// Start a cache manager and return it with the address it listens on
    async fn launch_cache_manager(
        &self,
        config: &ManagerConfig,
    ) -> Result<(Child, SocketAddr), ProcessLifecycleError>;
}

/// Re-executes a binary with its hidden child subcommands
#[derive(Debug, Clone)]
pub struct BinaryLauncher {
    program: PathBuf,
}

impl BinaryLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Launcher for the running binary
    pub fn current_exe() -> Result<Self, ProcessLifecycleError> {
        let program = std::env::current_exe().map_err(|source| ProcessLifecycleError::Spawn {
            what: "current executable".to_string(),
            source,
        })?;
        Ok(Self::new(program))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self, subcommand: &str, flag: &str, json: String) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg(subcommand)
            .arg(flag)
            .arg(json)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

fn to_json<T: Serialize>(what: &str, value: &T) -> Result<String, ProcessLifecycleError> {
    serde_json::to_string(value).map_err(|e| ProcessLifecycleError::Spawn {
        what: what.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
    })
}

#[async_trait]
impl ExecutorLauncher for BinaryLauncher {
    async fn launch_executor(
        &self,
        settings: &ExecutorSettings,
    ) -> Result<Child, ProcessLifecycleError> {
        let json = to_json(&settings.name, settings)?;
        debug!("Launching {} with {}", settings.name, json);
        self.command(EXECUTOR_SUBCOMMAND, "--settings", json)
            .spawn()
            .map_err(|source| ProcessLifecycleError::Spawn {
                what: settings.name.clone(),
                source,
            })
    }

    async fn launch_cache_manager(
        &self,
        config: &ManagerConfig,
    ) -> Result<(Child, SocketAddr), ProcessLifecycleError> {
        let json = to_json("cache manager", config)?;
        let mut child = self
            .command(CACHE_MANAGER_SUBCOMMAND, "--config", json)
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|source| ProcessLifecycleError::Spawn {
                what: "cache manager".to_string(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProcessLifecycleError::Handshake("no stdout".to_string()))?;
        let addr = tokio::time::timeout(CACHE_STARTUP_TIMEOUT, read_listening(stdout))
            .await
            .map_err(|_| {
                ProcessLifecycleError::Handshake(format!(
                    "no address after {:?}",
                    CACHE_STARTUP_TIMEOUT
                ))
            })??;
        info!("Cache manager listening on {}", addr);
        Ok((child, addr))
    }
}

/// Read lines until the `LISTENING <addr>` announcement
async fn read_listening<R>(reader: R) -> Result<SocketAddr, ProcessLifecycleError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| ProcessLifecycleError::Handshake(e.to_string()))?
    {
        if let Some(addr) = parse_listening(&line) {
            return addr;
        }
        debug!("Cache manager said: {}", line);
    }
    Err(ProcessLifecycleError::Handshake(
        "cache manager exited before listening".to_string(),
    ))
}

/// `Some` when the line is an announcement, with the parsed address
pub fn parse_listening(line: &str) -> Option<Result<SocketAddr, ProcessLifecycleError>> {
    let rest = line.strip_prefix(LISTENING_PREFIX)?;
    Some(rest.trim().parse().map_err(|e| {
        ProcessLifecycleError::Handshake(format!("bad address {:?}: {}", rest.trim(), e))
    }))
}
