//! Worker pool: supervisor of the executors and relay of the control pipe
//!
//! The pool owns one child process per executor, keyed by the executor's
//! input pipe, plus the optional cache manager. Control commands are handled
//! strictly one after another. A dead executor is not restarted; its entry
//! stays until it is removed.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::sys::signal::Signal;
use tokio::process::Child;
use tracing::{debug, error, info, warn};

use piper_caching::ManagerConfig;
use piper_config::{RuntimeSettings, WorkerConfig};
use piper_ipc::{parse_line, Command, IpcError, LineTransport, PipePair, Reply};

use crate::error::{ExecutionResult, ProcessLifecycleError};
use crate::executor::LoopControl;
use crate::launcher::{CacheClientSettings, ExecutorLauncher, ExecutorSettings};
use crate::shutdown::{send_signal, stop_all, PoolChild};

/// One running executor
#[derive(Debug)]
pub struct ExecutorHandle {
    pub name: String,
    pub pipe: PipePair,
    pub pid: u32,
    child: Child,
}

#[derive(Debug)]
struct CacheManagerHandle {
    addr: SocketAddr,
    child: Child,
}

pub struct WorkerPool {
    config: WorkerConfig,
    settings: RuntimeSettings,
    launcher: Arc<dyn ExecutorLauncher>,
    executors: HashMap<PathBuf, ExecutorHandle>,
    cache: Option<CacheManagerHandle>,
    spawned: usize,
}

impl WorkerPool {
    pub fn new(
        config: WorkerConfig,
        settings: RuntimeSettings,
        launcher: Arc<dyn ExecutorLauncher>,
    ) -> Self {
        Self {
            config,
            settings,
            launcher,
            executors: HashMap::new(),
            cache: None,
            spawned: 0,
        }
    }

    /// Start the cache manager if enabled, then the initial executors
    pub async fn start(&mut self) -> ExecutionResult<()> {
        if let Some(max_size) = self.config.cache.resolved_size() {
            let manager = ManagerConfig {
                address: self.settings.cache_address.clone(),
                token: self.settings.cache_token.clone(),
                max_size: usize::try_from(max_size).unwrap_or(usize::MAX),
                log_dir: Some(self.config.log_dir()),
                profiling: self.settings.cache_profiler,
            };
            info!("Starting cache manager with {} bytes", max_size);
            let (child, addr) = self.launcher.launch_cache_manager(&manager).await?;
            self.cache = Some(CacheManagerHandle { addr, child });
        }

        info!("Starting {} executors", self.config.tasks_x_node);
        for pipe in self.config.executor_pipes.clone() {
            self.add_executor(pipe).await?;
        }
        Ok(())
    }

    /// [`WorkerPool::start`], abandoned as soon as `shutdown` resolves
    ///
    /// Whatever was launched is stopped again on failure or shutdown.
    /// Returns false when the pool was stopped before it finished starting.
    pub async fn start_unless<S>(&mut self, shutdown: &mut S) -> ExecutionResult<bool>
    where
        S: Future<Output = ()> + Unpin,
    {
        let started = tokio::select! {
            biased;
            _ = shutdown => None,
            started = self.start() => Some(started),
        };
        match started {
            Some(Ok(())) => Ok(true),
            Some(Err(e)) => {
                self.shutdown().await;
                Err(e)
            }
            None => {
                info!("Stopped while starting, {} executors were up", self.executors.len());
                self.shutdown().await;
                Ok(false)
            }
        }
    }

    pub fn executor_count(&self) -> usize {
        self.executors.len()
    }

    pub fn pid_of(&self, in_pipe: &Path) -> Option<u32> {
        self.executors.get(in_pipe).map(|handle| handle.pid)
    }

    pub fn executors(&self) -> impl Iterator<Item = &ExecutorHandle> {
        self.executors.values()
    }

    pub fn cache_address(&self) -> Option<SocketAddr> {
        self.cache.as_ref().map(|cache| cache.addr)
    }

    fn executor_settings(&self, name: &str, pipe: PipePair) -> ExecutorSettings {
        ExecutorSettings {
            name: name.to_string(),
            pipe,
            log_dir: self.config.log_dir(),
            debug: self.config.debug,
            log_level: self.settings.log_level.clone(),
            storage_conf: self
                .config
                .storage_enabled()
                .then(|| self.config.storage_conf.clone()),
            cache: self.cache.as_ref().map(|cache| CacheClientSettings {
                address: cache.addr.to_string(),
                token: self.settings.cache_token.clone(),
                lock_file: self.settings.lock_file(&self.config.tmp_dir),
            }),
            fifo_retry_ms: self.settings.fifo_retry.as_millis() as u64,
            tracker_report: self.config.debug,
        }
    }

    /// Spawn an executor bound to `pipe` and return its pid
    pub async fn add_executor(&mut self, pipe: PipePair) -> Result<u32, ProcessLifecycleError> {
        if let Some(existing) = self.executors.get(&pipe.input) {
            return Err(ProcessLifecycleError::Pipe(format!(
                "{} is already bound to process {}",
                pipe.input.display(),
                existing.pid
            )));
        }
        pipe.create()
            .map_err(|e| ProcessLifecycleError::Pipe(e.to_string()))?;

        let name = format!("executor_{}", self.spawned);
        self.spawned += 1;
        let settings = self.executor_settings(&name, pipe.clone());
        let child = self.launcher.launch_executor(&settings).await?;
        let pid = child
            .id()
            .ok_or_else(|| ProcessLifecycleError::NoPid(name.clone()))?;

        info!("Executor {} started with pid {} on {}", name, pid, pipe.input.display());
        self.executors.insert(
            pipe.input.clone(),
            ExecutorHandle {
                name,
                pipe,
                pid,
                child,
            },
        );
        Ok(pid)
    }

    /// Terminate and reap the executor reading `in_pipe`
    ///
    /// Returns false when nothing was bound to the pipe.
    pub async fn remove_executor(&mut self, in_pipe: &Path) -> bool {
        let Some(handle) = self.executors.remove(in_pipe) else {
            warn!("No executor bound to {}", in_pipe.display());
            return false;
        };
        info!("Removing executor {} (pid {})", handle.name, handle.pid);
        let child = PoolChild::new(handle.name, handle.child);
        if let Err(e) = child.stop(self.settings.shutdown_grace).await {
            error!("Executor did not stop cleanly: {}", e);
        }
        true
    }

    /// Ask the executor on `in_pipe` to cancel its task; does not wait
    pub fn cancel_task(&self, in_pipe: &Path) -> Result<(), ProcessLifecycleError> {
        let pid = self.pid_of(in_pipe).ok_or_else(|| {
            ProcessLifecycleError::Pipe(format!("no executor bound to {}", in_pipe.display()))
        })?;
        debug!("Sending SIGUSR2 to {}", pid);
        send_signal(pid, Signal::SIGUSR2)
    }

    /// Terminate every executor, then the cache manager
    pub async fn shutdown(&mut self) {
        let children: Vec<PoolChild> = self
            .executors
            .drain()
            .map(|(_, handle)| PoolChild::new(handle.name, handle.child))
            .collect();
        info!("Stopping {} executors", children.len());
        let grace = self.settings.shutdown_grace;
        for result in stop_all(children, grace).await {
            if let Err(e) = result {
                error!("Executor did not stop cleanly: {}", e);
            }
        }

        if let Some(cache) = self.cache.take() {
            info!("Stopping cache manager at {}", cache.addr);
            if let Err(e) = PoolChild::new("cache manager", cache.child).stop(grace).await {
                error!("Cache manager did not stop cleanly: {}", e);
            }
        }
    }

    /// Apply one control command
    pub async fn handle_command(&mut self, command: Command) -> (Option<Reply>, LoopControl) {
        let reply = match command {
            Command::AddExecutor { in_pipe, out_pipe } => {
                match self.add_executor(PipePair::new(&in_pipe, &out_pipe)).await {
                    Ok(pid) => Reply::AddedExecutor {
                        out_pipe,
                        in_pipe,
                        pid,
                    },
                    Err(e) => {
                        error!("Cannot add executor on {}: {}", in_pipe, e);
                        Reply::AddExecutorFailed { out_pipe, in_pipe }
                    }
                }
            }
            Command::RemoveExecutor { in_pipe, out_pipe } => {
                self.remove_executor(Path::new(&in_pipe)).await;
                Reply::RemovedExecutor { out_pipe, in_pipe }
            }
            Command::QueryExecutorId { in_pipe, out_pipe } => Reply::ReplyExecutorId {
                pid: self.pid_of(Path::new(&in_pipe)),
                out_pipe,
                in_pipe,
            },
            Command::CancelTask { in_pipe } => {
                if let Err(e) = self.cancel_task(Path::new(&in_pipe)) {
                    warn!("Cannot cancel task on {}: {}", in_pipe, e);
                }
                return (None, LoopControl::Continue);
            }
            Command::Ping => Reply::Pong,
            Command::Quit => {
                self.shutdown().await;
                return (Some(Reply::Quit), LoopControl::Quit);
            }
            Command::ExecuteTask(task) => {
                warn!("Task {} sent to the control pipe, ignoring it", task.job_id);
                return (None, LoopControl::Continue);
            }
        };
        (Some(reply), LoopControl::Continue)
    }

    /// Serve the control pipe until `QUIT`, `shutdown` or a closed pipe
    pub async fn run<T, S>(&mut self, control: &mut T, shutdown: S) -> ExecutionResult<()>
    where
        T: LineTransport,
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            let line = tokio::select! {
                line = control.read_line() => line,
                _ = &mut shutdown => {
                    info!("Worker pool asked to stop");
                    self.shutdown().await;
                    return Ok(());
                }
            };

            let line = match line {
                Ok(line) => line,
                Err(IpcError::ConnectionClosed) => {
                    info!("Control pipe closed");
                    self.shutdown().await;
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    warn!("Control pipe read error: {}", e);
                    continue;
                }
                Err(e) => {
                    self.shutdown().await;
                    return Err(e.into());
                }
            };

            let command = match parse_line(&line) {
                Ok(command) => command,
                Err(e) => {
                    warn!("Skipping control line {:?}: {}", line, e);
                    continue;
                }
            };

            debug!("Control command {}", command.tag());
            let (reply, control_flow) = self.handle_command(command).await;
            if let Some(reply) = reply {
                control.write_line(&reply.to_line()).await?;
            }
            if control_flow == LoopControl::Quit {
                info!("Worker pool finished");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use piper_config::CacheSpec;
    use piper_ipc::MemoryTransport;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::process::Command as ProcessCommand;

    /// Stands in for executors with plain `sleep` processes
    struct SleepLauncher;

    #[async_trait]
    impl ExecutorLauncher for SleepLauncher {
        async fn launch_executor(
            &self,
            settings: &ExecutorSettings,
        ) -> Result<Child, ProcessLifecycleError> {
            ProcessCommand::new("sleep")
                .arg("60")
                .kill_on_drop(true)
                .spawn()
                .map_err(|source| ProcessLifecycleError::Spawn {
                    what: settings.name.clone(),
                    source,
                })
        }

        async fn launch_cache_manager(
            &self,
            _config: &ManagerConfig,
        ) -> Result<(Child, SocketAddr), ProcessLifecycleError> {
            Err(ProcessLifecycleError::Unsupported("cache manager"))
        }
    }

    /// Launches `executor_0` and never returns from any later launch
    struct StallLauncher {
        launched: Arc<std::sync::Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl ExecutorLauncher for StallLauncher {
        async fn launch_executor(
            &self,
            settings: &ExecutorSettings,
        ) -> Result<Child, ProcessLifecycleError> {
            if settings.name != "executor_0" {
                return std::future::pending().await;
            }
            let child = SleepLauncher.launch_executor(settings).await?;
            if let Some(pid) = child.id() {
                self.launched.lock().unwrap().push(pid);
            }
            Ok(child)
        }

        async fn launch_cache_manager(
            &self,
            config: &ManagerConfig,
        ) -> Result<(Child, SocketAddr), ProcessLifecycleError> {
            SleepLauncher.launch_cache_manager(config).await
        }
    }

    fn pool(dir: &TempDir, executors: usize) -> WorkerPool {
        pool_with(dir, executors, Arc::new(SleepLauncher))
    }

    fn pool_with(
        dir: &TempDir,
        executors: usize,
        launcher: Arc<dyn ExecutorLauncher>,
    ) -> WorkerPool {
        let pipes = (0..executors)
            .map(|i| {
                PipePair::new(
                    dir.path().join(format!("executor_{}.in", i)),
                    dir.path().join(format!("executor_{}.out", i)),
                )
            })
            .collect();
        let config = WorkerConfig {
            tmp_dir: dir.path().to_path_buf(),
            debug: false,
            persistent_storage: false,
            tracing_level: 0,
            storage_conf: "null".into(),
            stream_backend: "NONE".into(),
            stream_master_host: "localhost".into(),
            stream_master_port: "0".into(),
            cpu_affinity: "-".into(),
            gpu_affinity: "-".into(),
            tasks_x_node: executors,
            cache: CacheSpec::Disabled,
            executor_pipes: pipes,
            control_pipe: PipePair::new(
                dir.path().join("control.in"),
                dir.path().join("control.out"),
            ),
        };
        let settings = RuntimeSettings {
            shutdown_grace: Duration::from_secs(2),
            ..RuntimeSettings::default()
        };
        WorkerPool::new(config, settings, launcher)
    }

    fn pipe_arg(dir: &TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn test_start_spawns_one_process_per_pipe() {
        let dir = TempDir::new().unwrap();
        let mut pool = pool(&dir, 2);
        pool.start().await.unwrap();
        assert_eq!(pool.executor_count(), 2);
        assert!(dir.path().join("executor_0.in").exists());

        let pids: Vec<u32> = pool.executors().map(|handle| handle.pid).collect();
        assert_ne!(pids[0], pids[1]);
        assert!(pool.cache_address().is_none());
        pool.shutdown().await;
        assert_eq!(pool.executor_count(), 0);
    }

    #[tokio::test]
    async fn test_add_query_remove() {
        let dir = TempDir::new().unwrap();
        let mut pool = pool(&dir, 2);
        pool.start().await.unwrap();
        let existing: Vec<u32> = pool.executors().map(|handle| handle.pid).collect();

        let in_pipe = pipe_arg(&dir, "extra.in");
        let out_pipe = pipe_arg(&dir, "extra.out");
        let (reply, _) = pool
            .handle_command(Command::AddExecutor {
                in_pipe: in_pipe.clone(),
                out_pipe: out_pipe.clone(),
            })
            .await;
        let pid = match reply {
            Some(Reply::AddedExecutor { pid, .. }) => pid,
            other => panic!("unexpected reply {:?}", other),
        };
        assert!(!existing.contains(&pid));

        // Binding the same pipe twice fails without killing the pool
        let (reply, control) = pool
            .handle_command(Command::AddExecutor {
                in_pipe: in_pipe.clone(),
                out_pipe: out_pipe.clone(),
            })
            .await;
        assert!(matches!(reply, Some(Reply::AddExecutorFailed { .. })));
        assert_eq!(control, LoopControl::Continue);

        let query = Command::QueryExecutorId {
            in_pipe: in_pipe.clone(),
            out_pipe: out_pipe.clone(),
        };
        let (reply, _) = pool.handle_command(query.clone()).await;
        assert_eq!(
            reply.unwrap().to_line(),
            format!("REPLY_EXECUTOR_ID {} {} {}", out_pipe, in_pipe, pid)
        );

        let (reply, _) = pool
            .handle_command(Command::RemoveExecutor {
                in_pipe: in_pipe.clone(),
                out_pipe: out_pipe.clone(),
            })
            .await;
        assert_eq!(
            reply.unwrap().to_line(),
            format!("REMOVED_EXECUTOR {} {}", out_pipe, in_pipe)
        );

        let (reply, _) = pool.handle_command(query).await;
        assert_eq!(
            reply.unwrap().to_line(),
            format!("REPLY_EXECUTOR_ID {} {} -1", out_pipe, in_pipe)
        );
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_cache_start_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let mut pool = pool(&dir, 1);
        pool.config.cache = CacheSpec::Enabled { size: Some(1024) };
        assert!(pool.start().await.is_err());
        assert_eq!(pool.executor_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_pipe_is_an_error() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir, 1);
        assert!(pool.cancel_task(Path::new("/nowhere")).is_err());
    }

    #[tokio::test]
    async fn test_control_loop() {
        let dir = TempDir::new().unwrap();
        let mut pool = pool(&dir, 1);
        pool.start().await.unwrap();

        let (mut control, mut orchestrator) = MemoryTransport::pair();
        orchestrator.write_line("PING").await.unwrap();
        orchestrator.write_line("NOT_A_COMMAND at all").await.unwrap();
        orchestrator
            .write_line(&format!("CANCEL_TASK {}", pipe_arg(&dir, "missing.in")))
            .await
            .unwrap();
        orchestrator.write_line("QUIT").await.unwrap();

        pool.run(&mut control, std::future::pending()).await.unwrap();

        assert_eq!(orchestrator.read_line().await.unwrap(), "PONG");
        assert_eq!(orchestrator.read_line().await.unwrap(), "QUIT");
        assert_eq!(pool.executor_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_children() {
        let dir = TempDir::new().unwrap();
        let mut pool = pool(&dir, 2);
        pool.start().await.unwrap();
        let (mut control, _orchestrator) = MemoryTransport::pair();
        pool.run(&mut control, async {}).await.unwrap();
        assert_eq!(pool.executor_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_while_starting_stops_launched_children() {
        let dir = TempDir::new().unwrap();
        let launched = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut pool = pool_with(
            &dir,
            2,
            Arc::new(StallLauncher {
                launched: launched.clone(),
            }),
        );

        let mut shutdown = Box::pin(tokio::time::sleep(Duration::from_millis(300)));
        assert!(!pool.start_unless(&mut shutdown).await.unwrap());
        assert_eq!(pool.executor_count(), 0);

        let launched = launched.lock().unwrap().clone();
        assert_eq!(launched.len(), 1);
        let pid = nix::unistd::Pid::from_raw(launched[0] as i32);
        assert!(nix::sys::signal::kill(pid, None).is_err());
    }

    #[tokio::test]
    async fn test_start_unless_completes_when_not_stopped() {
        let dir = TempDir::new().unwrap();
        let mut pool = pool(&dir, 2);
        let mut shutdown = Box::pin(std::future::pending::<()>());
        assert!(pool.start_unless(&mut shutdown).await.unwrap());
        assert_eq!(pool.executor_count(), 2);
        pool.shutdown().await;
    }
}
