//! Process state that belongs to the running task
//!
//! A task changes the working directory, the stdout/stderr targets, the log
//! destination and a handful of environment variables. [`TaskScope`] applies
//! all of them and undoes them in reverse order when dropped, whatever way
//! the task ended.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use piper_ipc::TaskCommand;
use piper_logging::JobLogScope;

/// Variables exported while a task runs
pub mod vars {
    pub const NUM_NODES: &str = "COMPSS_NUM_NODES";
    pub const HOSTNAMES: &str = "COMPSS_HOSTNAMES";
    pub const NUM_THREADS: &str = "COMPSS_NUM_THREADS";
    pub const OMP_NUM_THREADS: &str = "OMP_NUM_THREADS";
    pub const BINDED_CPUS: &str = "COMPSS_BINDED_CPUS";
    pub const BINDED_GPUS: &str = "COMPSS_BINDED_GPUS";
    pub const CUDA_VISIBLE_DEVICES: &str = "CUDA_VISIBLE_DEVICES";
    pub const GPU_DEVICE_ORDINAL: &str = "GPU_DEVICE_ORDINAL";
}

/// Environment variables set for one task, removed on drop
pub struct TaskEnv {
    names: Vec<&'static str>,
}

impl TaskEnv {
    pub fn apply(cmd: &TaskCommand) -> Self {
        let mut env = Self { names: Vec::new() };
        let units = cmd.computing_units.to_string();
        env.set(vars::NUM_NODES, &cmd.nodes.len().to_string());
        env.set(vars::HOSTNAMES, &cmd.nodes.join(","));
        env.set(vars::NUM_THREADS, &units);
        env.set(vars::OMP_NUM_THREADS, &units);
        if let Some(cpus) = &cmd.affinity.cpus {
            env.set(vars::BINDED_CPUS, cpus);
        }
        if let Some(gpus) = &cmd.affinity.gpus {
            env.set(vars::BINDED_GPUS, gpus);
            env.set(vars::CUDA_VISIBLE_DEVICES, gpus);
            env.set(vars::GPU_DEVICE_ORDINAL, gpus);
        }
        env
    }

    fn set(&mut self, name: &'static str, value: &str) {
        std::env::set_var(name, value);
        self.names.push(name);
    }
}

impl Drop for TaskEnv {
    fn drop(&mut self) {
        for name in self.names.drain(..) {
            std::env::remove_var(name);
        }
    }
}

/// Scoped change of the process working directory
pub struct WorkingDir {
    previous: PathBuf,
}

impl WorkingDir {
    pub fn enter(dir: &Path) -> std::io::Result<Self> {
        let previous = std::env::current_dir()?;
        std::env::set_current_dir(dir)?;
        Ok(Self { previous })
    }
}

impl Drop for WorkingDir {
    fn drop(&mut self) {
        if let Err(e) = std::env::set_current_dir(&self.previous) {
            warn!(
                "Cannot return to working directory {}: {}",
                self.previous.display(),
                e
            );
        }
    }
}

fn open_job_file(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Process stdout and stderr pointed at the job files
pub struct StdioRedirect {
    saved_out: OwnedFd,
    saved_err: OwnedFd,
}

impl StdioRedirect {
    pub fn enter(out: &Path, err: &Path) -> std::io::Result<Self> {
        let out_file = open_job_file(out)?;
        let err_file = open_job_file(err)?;
        flush_stdio();

        let saved_out = nix::unistd::dup(std::io::stdout())?;
        let saved_err = nix::unistd::dup(std::io::stderr())?;
        nix::unistd::dup2_stdout(&out_file)?;
        if let Err(e) = nix::unistd::dup2_stderr(&err_file) {
            let _ = nix::unistd::dup2_stdout(&saved_out);
            return Err(e.into());
        }
        Ok(Self {
            saved_out,
            saved_err,
        })
    }
}

fn flush_stdio() {
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
}

impl Drop for StdioRedirect {
    fn drop(&mut self) {
        flush_stdio();
        if let Err(e) = nix::unistd::dup2_stdout(&self.saved_out) {
            warn!("Cannot restore stdout: {}", e);
        }
        if let Err(e) = nix::unistd::dup2_stderr(&self.saved_err) {
            warn!("Cannot restore stderr: {}", e);
        }
    }
}

/// Everything a task changes about the process
///
/// Fields drop top to bottom, which undoes the setup in reverse.
pub struct TaskScope {
    _env: TaskEnv,
    _log: JobLogScope,
    _stdio: Option<StdioRedirect>,
    _cwd: Option<WorkingDir>,
}

impl TaskScope {
    pub fn enter(cmd: &TaskCommand, redirect_stdio: bool) -> Self {
        let cwd = match WorkingDir::enter(&cmd.working_dir) {
            Ok(cwd) => Some(cwd),
            Err(e) => {
                warn!(
                    "Job {} keeps the current directory, {} is unusable: {}",
                    cmd.job_id,
                    cmd.working_dir.display(),
                    e
                );
                None
            }
        };

        let stdio = if redirect_stdio {
            StdioRedirect::enter(&cmd.job_out, &cmd.job_err)
                .map_err(|e| warn!("Job {} output stays on the executor: {}", cmd.job_id, e))
                .ok()
        } else {
            None
        };

        let log = piper_logging::enter_job(&cmd.job_out, &cmd.job_err);
        debug!("Job {} entered its task scope", cmd.job_id);

        Self {
            _env: TaskEnv::apply(cmd),
            _log: log,
            _stdio: stdio,
            _cwd: cwd,
        }
    }
}
