//! The per-process task loop
//!
//! An executor reads one command at a time from its own pipe, runs it and
//! writes exactly one line back. Task failures of any kind are reported on
//! the pipe and never end the loop; only `QUIT`, SIGTERM or a closed pipe
//! do.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use piper_caching::{cache_key, SharedCache};
use piper_core::{deserialize_from_file, serialize_to_file, ObjectTracker, TrackToken, Value};
use piper_ipc::{
    parse_line, Command, IpcError, LineTransport, Param, ParamType, Reply, ReturnedParam,
    TaskCommand,
};

use crate::error::{ExecutionResult, TaskError};
use crate::outcome::{Outcome, EXIT_PROTOCOL};
use crate::params::{call_order, decode_inline, echo_param, return_slots};
use crate::registry::{FunctionRegistry, TaskContext, TaskFunction};
use crate::scope::TaskScope;
use crate::signals::CancelHandle;
use crate::storage::StorageHooks;

/// Whether the loop keeps reading after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Quit,
}

/// A call argument and where it was loaded from
struct LoadedArg {
    value: Value,
    file: Option<FileBacking>,
}

struct FileBacking {
    path: PathBuf,
    key: String,
    name: String,
    token: TrackToken,
    object_id: String,
}

impl LoadedArg {
    fn inline(value: Value) -> Self {
        Self { value, file: None }
    }
}

pub struct Executor<T> {
    name: String,
    transport: T,
    registry: Arc<FunctionRegistry>,
    cache: Option<SharedCache>,
    storage: Option<Arc<dyn StorageHooks>>,
    tracker: ObjectTracker,
    report_dir: Option<PathBuf>,
    redirect_stdio: bool,
    cancel_handle: CancelHandle,
    cancel_rx: mpsc::UnboundedReceiver<()>,
}

impl<T: LineTransport> Executor<T> {
    pub fn new(name: impl Into<String>, transport: T, registry: Arc<FunctionRegistry>) -> Self {
        let (cancel_handle, cancel_rx) = CancelHandle::channel();
        Self {
            name: name.into(),
            transport,
            registry,
            cache: None,
            storage: None,
            tracker: ObjectTracker::new(std::env::temp_dir()),
            report_dir: None,
            redirect_stdio: true,
            cancel_handle,
            cancel_rx,
        }
    }

    pub fn with_cache(mut self, cache: SharedCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn StorageHooks>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Point process stdout/stderr at the job files while a task runs
    pub fn with_stdio_redirect(mut self, enabled: bool) -> Self {
        self.redirect_stdio = enabled;
        self
    }

    /// Record object tracker snapshots and write them to `dir` on exit
    pub fn with_tracker_report(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tracker.enable_report();
        self.report_dir = Some(dir.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tracker(&self) -> &ObjectTracker {
        &self.tracker
    }

    /// Handle used to cancel whatever task is running
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel_handle.clone()
    }

    /// Read and handle commands until `QUIT`, a closed pipe or `shutdown`
    pub async fn run<S>(&mut self, shutdown: S) -> ExecutionResult<()>
    where
        S: Future<Output = ()>,
    {
        info!("Executor {} started", self.name);
        if let Some(storage) = &self.storage {
            storage.init()?;
        }
        tokio::pin!(shutdown);

        loop {
            let line = tokio::select! {
                line = self.transport.read_line() => line,
                _ = &mut shutdown => {
                    info!("Executor {} asked to stop", self.name);
                    break;
                }
            };

            let line = match line {
                Ok(line) => line,
                Err(IpcError::ConnectionClosed) => {
                    info!("Executor {} input closed", self.name);
                    break;
                }
                Err(e) if e.is_retryable() => {
                    warn!("Executor {} read error: {}", self.name, e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if self.handle_line(&line).await? == LoopControl::Quit {
                break;
            }
        }

        self.finish();
        info!("Executor {} stopped", self.name);
        Ok(())
    }

    fn finish(&mut self) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.finish() {
                warn!("Storage finish hook failed: {}", e);
            }
        }
        if let Some(dir) = &self.report_dir {
            if let Err(e) = self.tracker.generate_report(dir) {
                warn!("Cannot write object tracker report: {}", e);
            }
        }
        self.tracker.clean_object_tracker();
    }

    /// Decode and answer one line
    pub async fn handle_line(&mut self, line: &str) -> ExecutionResult<LoopControl> {
        let command = match parse_line(line) {
            Ok(command) => command,
            Err(e) => {
                match e.job_id() {
                    Some(job_id) => {
                        warn!("Executor {} rejected job {}: {}", self.name, job_id, e);
                        let reply = Outcome::failed(job_id, EXIT_PROTOCOL).into_reply();
                        self.write(&reply).await?;
                    }
                    None => warn!("Executor {} dropped line {:?}: {}", self.name, line, e),
                }
                return Ok(LoopControl::Continue);
            }
        };

        match command {
            Command::ExecuteTask(cmd) => {
                let outcome = self.process_task(&cmd).await;
                self.write(&outcome.into_reply()).await?;
            }
            Command::Ping => self.write(&Reply::Pong).await?,
            Command::Quit => {
                self.write(&Reply::Quit).await?;
                return Ok(LoopControl::Quit);
            }
            other => warn!(
                "Executor {} ignores control command {}",
                self.name,
                other.tag()
            ),
        }
        Ok(LoopControl::Continue)
    }

    async fn write(&mut self, reply: &Reply) -> ExecutionResult<()> {
        let line = reply.to_line();
        debug!("Executor {} replies: {}", self.name, line);
        self.transport.write_line(&line).await?;
        Ok(())
    }

    /// Run one task inside its scope and report a single outcome
    pub async fn process_task(&mut self, cmd: &TaskCommand) -> Outcome {
        info!(
            "Executor {} running job {} ({}.{})",
            self.name, cmd.job_id, cmd.module, cmd.function
        );
        if self.cancel_requested() {
            debug!("Executor {} dropped a stale cancel request", self.name);
        }
        let _scope = TaskScope::enter(cmd, self.redirect_stdio);

        let outcome = match self.run_task(cmd).await {
            Ok(params) => Outcome::Success {
                job_id: cmd.job_id.clone(),
                params,
            },
            Err(err) => {
                match &err {
                    TaskError::Application(message) => {
                        warn!("Job {} raised: {}", cmd.job_id, message)
                    }
                    TaskError::Cancelled => info!("Job {} cancelled", cmd.job_id),
                    TaskError::Failed(reason) => error!("Job {} failed: {}", cmd.job_id, reason),
                }
                Outcome::from_error(cmd.job_id.clone(), err)
            }
        };
        debug!("Job {} exit value {}", cmd.job_id, outcome.exit_value());
        outcome
    }

    async fn run_task(&mut self, cmd: &TaskCommand) -> Result<Vec<ReturnedParam>, TaskError> {
        let function = self.registry.get(&cmd.module, &cmd.function).ok_or_else(|| {
            TaskError::failed(format!("Unknown function {}.{}", cmd.module, cmd.function))
        })?;
        let order = call_order(cmd)?;
        let slots = return_slots(cmd)?;

        let mut loaded = Vec::with_capacity(order.len());
        for &index in &order {
            match self.load_arg(cmd, &cmd.params[index]).await {
                Ok(arg) => loaded.push(arg),
                Err(e) => {
                    self.release(&loaded);
                    return Err(e);
                }
            }
            if self.cancel_requested() {
                self.release(&loaded);
                return Err(TaskError::Cancelled);
            }
        }

        let args: Vec<Value> = loaded.iter().map(|arg| arg.value.clone()).collect();
        let result = self.invoke(function, cmd, args).await;
        let result = match result {
            Ok(_) if self.cancel_requested() => Err(TaskError::Cancelled),
            Ok((args, results)) => self.store_results(cmd, &loaded, args, results, slots).await,
            Err(e) => Err(e),
        };
        self.release(&loaded);
        result?;

        let regular = cmd.params.len() - cmd.return_length;
        Ok(cmd
            .params
            .iter()
            .enumerate()
            .map(|(index, param)| echo_param(param, index >= regular))
            .collect())
    }

    /// Drain pending cancel requests, reporting whether there were any
    fn cancel_requested(&mut self) -> bool {
        let mut pending = false;
        while self.cancel_rx.try_recv().is_ok() {
            pending = true;
        }
        pending
    }

    async fn load_arg(&mut self, cmd: &TaskCommand, param: &Param) -> Result<LoadedArg, TaskError> {
        if let Some(value) = decode_inline(param)? {
            return Ok(LoadedArg::inline(value));
        }

        if matches!(param.param_type, ParamType::Psco | ParamType::ExternalPsco) {
            let value = match &self.storage {
                Some(storage) => storage
                    .get_by_id(&param.value)
                    .map_err(|e| TaskError::failed(e.to_string()))?,
                None => Value::Str(param.value.clone()),
            };
            return Ok(LoadedArg::inline(value));
        }

        let path = PathBuf::from(param.file_path());
        let key = cache_key(param.file_path());
        let value = match self.from_cache(&key, &param.name, &cmd.function).await {
            Some(value) => value,
            None => {
                let value = deserialize_from_file(&path)?;
                if let Some(cache) = &self.cache {
                    cache
                        .insert_with_filter(&value, &key, &param.name, &cmd.function)
                        .await;
                }
                value
            }
        };

        let token = TrackToken::new();
        let (object_id, _) = self.tracker.track(token, Some(&param.name), false);
        self.tracker
            .set_file_name(&object_id, path.to_string_lossy(), false);
        Ok(LoadedArg {
            value,
            file: Some(FileBacking {
                path,
                key,
                name: param.name.clone(),
                token,
                object_id,
            }),
        })
    }

    /// Cached copy of a file-backed argument; errors count as a miss
    async fn from_cache(&self, key: &str, parameter: &str, function: &str) -> Option<Value> {
        let cache = self.cache.as_ref()?;
        let lease = match cache.retrieve(key, parameter, function).await {
            Ok(Some(lease)) => lease,
            Ok(None) => return None,
            Err(e) => {
                warn!("Cache lookup of {} failed: {}", key, e);
                return None;
            }
        };
        let value = lease.to_value();
        lease.release();
        match value {
            Ok(value) => {
                debug!("Argument {} served from cache", key);
                Some(value)
            }
            Err(e) => {
                warn!("Cached entry {} is unreadable: {}", key, e);
                None
            }
        }
    }

    async fn invoke(
        &mut self,
        function: Arc<dyn TaskFunction>,
        cmd: &TaskCommand,
        mut args: Vec<Value>,
    ) -> Result<(Vec<Value>, Vec<Value>), TaskError> {
        let cancel = CancellationToken::new();
        let mut ctx = TaskContext::new(&cmd.job_id, &cmd.module, &cmd.function)
            .with_cancel(cancel.clone());
        ctx.task_id = cmd.task_id.clone();
        ctx.nodes = cmd.nodes.clone();
        ctx.computing_units = cmd.computing_units;
        ctx.has_target = cmd.has_target;
        ctx.layouts = cmd.layouts.clone();

        let handle = tokio::task::spawn_blocking(move || {
            let result = function.call(&ctx, &mut args);
            (args, result)
        });

        tokio::select! {
            joined = handle => match joined {
                Ok((args, Ok(results))) => Ok((args, results)),
                Ok((_, Err(e))) => Err(e),
                Err(e) => Err(TaskError::failed(format!("Task panicked: {}", e))),
            },
            Some(()) = self.cancel_rx.recv() => {
                cancel.cancel();
                Err(TaskError::Cancelled)
            }
        }
    }

    async fn store_results(
        &mut self,
        cmd: &TaskCommand,
        loaded: &[LoadedArg],
        args: Vec<Value>,
        results: Vec<Value>,
        slots: &[Param],
    ) -> Result<(), TaskError> {
        if results.len() != slots.len() {
            return Err(TaskError::failed(format!(
                "{}.{} returned {} values for {} return slots",
                cmd.module,
                cmd.function,
                results.len(),
                slots.len()
            )));
        }

        for (arg, updated) in loaded.iter().zip(args) {
            let Some(file) = &arg.file else { continue };
            if updated == arg.value {
                continue;
            }
            debug!("Argument {} changed, writing it back", file.name);
            serialize_to_file(&updated, &file.path)?;
            self.tracker
                .set_file_name(&file.object_id, file.path.to_string_lossy(), true);
            if let Some(cache) = &self.cache {
                if let Err(e) = cache
                    .replace(&updated, &file.key, &file.name, &cmd.function)
                    .await
                {
                    warn!("Cache refresh of {} failed: {}", file.key, e);
                }
            }
        }

        for (slot, value) in slots.iter().zip(results) {
            let path = Path::new(slot.file_path());
            serialize_to_file(&value, path)?;
            if let Some(cache) = &self.cache {
                cache
                    .insert_with_filter(&value, &cache_key(slot.file_path()), &slot.name, &cmd.function)
                    .await;
            }
        }
        Ok(())
    }

    /// Forget the file-backed arguments of a finished task
    fn release(&mut self, loaded: &[LoadedArg]) {
        for file in loaded.iter().filter_map(|arg| arg.file.as_ref()) {
            if self.tracker.has_been_written(&file.object_id) {
                self.tracker.pop_written_obj(&file.object_id);
            }
            self.tracker.pop_pending_to_synchronize(&file.object_id);
            self.tracker.stop_tracking(file.token, false);
        }
    }
}
