use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::sync::Arc;
use tracing::info;

use piper_caching::{CacheManager, ManagerConfig, SharedCache, LISTENING_PREFIX};
use piper_config::{RuntimeSettings, WorkerConfig};
use piper_execution::{
    forward_cancel_signal, terminated, BinaryLauncher, Executor, ExecutorSettings,
    PassThroughStorage, WorkerPool,
};
use piper_ipc::FifoPipe;
use piper_logging::{init_process_logging, LoggingConfig};

mod builtins;
mod cli;
use cli::{Cli, Commands};

/// Log file stem of the worker process
const WORKER_PROCESS_NAME: &str = "piper_worker";
/// Log file stem of the cache manager process
const CACHE_PROCESS_NAME: &str = "piper_cache_manager";

/// Serve the control pipe with a pool of executors
async fn worker_command(args: &[String]) -> Result<()> {
    let config = WorkerConfig::from_args(args).context("Invalid worker arguments")?;
    let settings = RuntimeSettings::from_env().context("Invalid PIPER_* settings")?;

    let logging = LoggingConfig::new(config.log_dir(), WORKER_PROCESS_NAME, config.debug)
        .with_level(settings.log_level.as_deref());
    let _logging = init_process_logging(&logging)?;
    info!(
        "Piper worker starting with {} executors in {}",
        config.tasks_x_node,
        config.tmp_dir.display()
    );

    config
        .control_pipe
        .create()
        .context("Failed to create the control pipe")?;

    let launcher = BinaryLauncher::current_exe().context("Cannot locate the worker binary")?;
    let mut pool = WorkerPool::new(config.clone(), settings.clone(), Arc::new(launcher));

    // Listen before the first child exists
    let shutdown = terminated();
    tokio::pin!(shutdown);
    if !pool
        .start_unless(&mut shutdown)
        .await
        .context("Failed to start the worker pool")?
    {
        return Ok(());
    }

    let mut control = FifoPipe::with_reopen_delay(config.control_pipe.clone(), settings.fifo_retry);
    pool.run(&mut control, shutdown)
        .await
        .context("Control loop failed")?;
    info!("Piper worker finished");
    Ok(())
}

/// Run tasks from one executor pipe until `QUIT` or SIGTERM
async fn executor_command(json: &str) -> Result<()> {
    let settings = ExecutorSettings::from_json(json).context("Invalid executor settings")?;

    let logging = LoggingConfig::new(&settings.log_dir, &settings.name, settings.debug)
        .with_level(settings.log_level.as_deref());
    let _logging = init_process_logging(&logging)?;
    info!(
        "Executor {} reading {}",
        settings.name,
        settings.pipe.input.display()
    );

    let transport = FifoPipe::with_reopen_delay(settings.pipe.clone(), settings.fifo_retry());
    let mut executor = Executor::new(
        settings.name.clone(),
        transport,
        Arc::new(builtins::registry()),
    );

    if let Some(cache) = &settings.cache {
        let client = SharedCache::connect(&cache.address, &cache.token, cache.lock_file.clone())
            .await
            .with_context(|| format!("Cannot reach the cache manager at {}", cache.address))?;
        executor = executor.with_cache(client);
    }
    if let Some(conf) = &settings.storage_conf {
        executor = executor.with_storage(Arc::new(PassThroughStorage::new(conf.clone())));
    }
    if settings.tracker_report {
        executor = executor.with_tracker_report(&settings.log_dir);
    }

    let _cancel = forward_cancel_signal(executor.cancel_handle())
        .context("Cannot listen for SIGUSR2")?;
    executor
        .run(terminated())
        .await
        .with_context(|| format!("Executor {} failed", settings.name))?;
    info!("Executor {} finished", settings.name);
    Ok(())
}

/// Own the shared cache until `QUIT` or SIGTERM
///
/// The parent learns the bound address from the `LISTENING` line on stdout.
async fn cache_manager_command(json: &str) -> Result<()> {
    let config: ManagerConfig =
        serde_json::from_str(json).context("Invalid cache manager configuration")?;

    let _logging = match &config.log_dir {
        Some(dir) => Some(init_process_logging(&LoggingConfig::new(
            dir,
            CACHE_PROCESS_NAME,
            false,
        ))?),
        None => None,
    };

    let manager = CacheManager::bind(config)
        .await
        .context("Failed to bind the cache manager")?;
    let addr = manager.local_addr()?;

    let mut stdout = std::io::stdout();
    writeln!(stdout, "{} {}", LISTENING_PREFIX, addr)?;
    stdout.flush()?;

    let shutdown = manager.shutdown_token();
    tokio::spawn(async move {
        terminated().await;
        shutdown.cancel();
    });

    manager.run().await.context("Cache manager failed")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Executor { settings }) => executor_command(&settings).await,
        Some(Commands::CacheManager { config }) => cache_manager_command(&config).await,
        None => worker_command(&cli.args).await,
    }
}
