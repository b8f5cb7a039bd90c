//! Drives the `piper-worker` binary over real named pipes

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::{Child, Command};

use piper_caching::{profiler::PROFILE_FILE_NAME, SharedCache};
use piper_core::{deserialize_from_file, serialize_to_file, Value};
use piper_ipc::{FifoPipe, LineTransport, PipePair};

const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// The orchestrator's view of a running worker
struct Worker {
    dir: TempDir,
    child: Child,
    control: FifoPipe,
}

impl Worker {
    async fn start(executors: usize) -> Worker {
        Self::start_with(executors, "false", &[]).await
    }

    async fn start_with(executors: usize, cache: &str, env: &[(&str, String)]) -> Worker {
        let dir = TempDir::new().unwrap();
        let mut args: Vec<String> = vec![
            dir.path().to_string_lossy().into_owned(),
            "false".into(),
            "false".into(),
            "0".into(),
            "null".into(),
            "NONE".into(),
            "localhost".into(),
            "0".into(),
            "-".into(),
            "-".into(),
            executors.to_string(),
            cache.into(),
        ];
        for i in 0..executors {
            let pipe = executor_pipe(dir.path(), i);
            pipe.create().unwrap();
            args.push(path_arg(&pipe.input));
            args.push(path_arg(&pipe.output));
        }
        let control = PipePair::new(dir.path().join("control.in"), dir.path().join("control.out"));
        control.create().unwrap();
        args.push(path_arg(&control.input));
        args.push(path_arg(&control.output));

        let child = Command::new(env!("CARGO_BIN_EXE_piper-worker"))
            .args(&args)
            .env("PIPER_SHUTDOWN_GRACE_MS", "2000")
            .envs(env.iter().map(|(key, value)| (*key, value.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        Worker {
            dir,
            child,
            control: FifoPipe::new(control.reversed()),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    async fn control(&mut self, line: &str) -> String {
        self.control.write_line(line).await.unwrap();
        reply(&mut self.control).await
    }

    /// Orchestrator end of executor `i`
    fn executor(&self, i: usize) -> FifoPipe {
        FifoPipe::new(executor_pipe(self.dir.path(), i).reversed())
    }

    async fn quit(mut self) {
        assert_eq!(self.control("QUIT").await, "QUIT");
        let status = tokio::time::timeout(REPLY_TIMEOUT, self.child.wait())
            .await
            .expect("worker should exit after QUIT")
            .unwrap();
        assert!(status.success());
    }
}

fn executor_pipe(dir: &Path, i: usize) -> PipePair {
    PipePair::new(
        dir.join(format!("executor_{}.in", i)),
        dir.join(format!("executor_{}.out", i)),
    )
}

/// Pids whose parent is `parent`, read from /proc
fn children_of(parent: u32) -> Vec<i32> {
    let mut children = Vec::new();
    for entry in std::fs::read_dir("/proc").unwrap().flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        // "pid (comm) state ppid ...", comm may contain spaces
        let Some((_, rest)) = stat.rsplit_once(')') else {
            continue;
        };
        let ppid = rest.split_whitespace().nth(1).and_then(|p| p.parse::<u32>().ok());
        if ppid == Some(parent) {
            children.push(pid);
        }
    }
    children
}

fn is_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

async fn reply(pipe: &mut FifoPipe) -> String {
    tokio::time::timeout(REPLY_TIMEOUT, pipe.read_line())
        .await
        .expect("no reply in time")
        .unwrap()
}

fn task_line(worker: &Worker, job: u32, function: &str, rlen: usize, count: usize, params: &str) -> String {
    let wd = worker.dir.path().display();
    format!(
        "EXECUTE_TASK {job} {wd} {wd}/job{job}.out {wd}/job{job}.err 0 {job} false null \
         METHOD common_piper_tester {function} 0 1 localhost 1 false null {rlen} {count} {params} - - -"
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ping_and_quit() {
    let mut worker = Worker::start(1).await;
    assert_eq!(worker.control("PING").await, "PONG");
    assert_eq!(worker.control("PING").await, "PONG");
    worker.quit().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_noop_task() {
    let worker = Worker::start(1).await;
    let mut executor = worker.executor(0);

    let line = task_line(&worker, 1, "simple", 0, 0, "");
    executor.write_line(&line).await.unwrap();
    assert_eq!(reply(&mut executor).await, "END_TASK 1 0 0");

    executor.write_line("PING").await.unwrap();
    assert_eq!(reply(&mut executor).await, "PONG");
    worker.quit().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_increment_task() {
    let worker = Worker::start(1).await;
    let mut executor = worker.executor(0);
    let result = worker.path("d1v2_1599560599402.IT");
    let result = result.display();

    let params = format!(
        "4 3 null value null 1 10 3 # $return_0 null {result}:d1v2_1599560599402.IT:false:true:{result}"
    );
    let line = task_line(&worker, 2, "increment", 1, 2, &params);
    executor.write_line(&line).await.unwrap();
    assert_eq!(
        reply(&mut executor).await,
        format!("END_TASK 2 0 2 4 null 10 {}", result)
    );
    assert_eq!(
        deserialize_from_file(&worker.path("d1v2_1599560599402.IT")).unwrap(),
        Value::Int(2)
    );

    // Unknown functions fail without taking the executor down
    let line = task_line(&worker, 3, "missing", 0, 0, "");
    executor.write_line(&line).await.unwrap();
    assert_eq!(reply(&mut executor).await, "END_TASK 3 1");
    worker.quit().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_add_query_remove_executor() {
    let mut worker = Worker::start(2).await;
    let mut pids = Vec::new();
    for i in 0..2 {
        let pipe = executor_pipe(worker.dir.path(), i);
        let line = format!(
            "QUERY_EXECUTOR_ID {} {}",
            pipe.input.display(),
            pipe.output.display()
        );
        let reply = worker.control(&line).await;
        let pid: i64 = reply.rsplit(' ').next().unwrap().parse().unwrap();
        assert!(pid > 0, "{}", reply);
        pids.push(pid);
    }

    let extra_in = path_arg(&worker.path("executor_2.in"));
    let extra_out = path_arg(&worker.path("executor_2.out"));
    let added = worker
        .control(&format!("ADD_EXECUTOR {} {}", extra_in, extra_out))
        .await;
    let prefix = format!("ADDED_EXECUTOR {} {} ", extra_out, extra_in);
    assert!(added.starts_with(&prefix), "{}", added);
    let pid: i64 = added[prefix.len()..].parse().unwrap();
    assert!(!pids.contains(&pid));

    // The new executor serves tasks
    let mut executor = worker.executor(2);
    let line = task_line(&worker, 4, "simple", 0, 0, "");
    executor.write_line(&line).await.unwrap();
    assert_eq!(reply(&mut executor).await, "END_TASK 4 0 0");

    assert_eq!(
        worker
            .control(&format!("REMOVE_EXECUTOR {} {}", extra_in, extra_out))
            .await,
        format!("REMOVED_EXECUTOR {} {}", extra_out, extra_in)
    );
    assert_eq!(
        worker
            .control(&format!("QUERY_EXECUTOR_ID {} {}", extra_in, extra_out))
            .await,
        format!("REPLY_EXECUTOR_ID {} {} -1", extra_out, extra_in)
    );
    worker.quit().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sigterm_stops_the_worker() {
    let mut worker = Worker::start(1).await;
    assert_eq!(worker.control("PING").await, "PONG");

    let pid = worker.child.id().unwrap() as i32;
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid),
        nix::sys::signal::Signal::SIGTERM,
    )
    .unwrap();
    let status = tokio::time::timeout(REPLY_TIMEOUT, worker.child.wait())
        .await
        .expect("worker should exit on SIGTERM")
        .unwrap();
    assert!(status.success());
    assert!(worker.path("log").join("piper_worker.out").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cached_worker_leaves_no_processes() {
    let address = format!("127.0.0.1:{}", free_port());
    let mut worker = Worker::start_with(
        2,
        "true:1048576",
        &[
            ("PIPER_CACHE_ADDRESS", address.clone()),
            ("PIPER_CACHE_TOKEN", "e2e_token".to_string()),
            ("PIPER_CACHE_PROFILER", "1".to_string()),
        ],
    )
    .await;
    assert_eq!(worker.control("PING").await, "PONG");

    // Object arguments that fit the cache are published by the executor
    let data = worker.path("d3v1_1.IT");
    serialize_to_file(&Value::List(vec![Value::Int(1), Value::Int(2)]), &data).unwrap();
    let mut executor = worker.executor(0);
    let params = format!("11 3 null data null {}", data.display());
    let line = task_line(&worker, 1, "simple", 0, 1, &params);
    executor.write_line(&line).await.unwrap();
    assert_eq!(reply(&mut executor).await, "END_TASK 1 0 1 11 null");

    let cache = SharedCache::connect(&address, "e2e_token", worker.path("observer.lock"))
        .await
        .unwrap();
    assert!(cache.in_cache("d3v1_1.IT").await.unwrap());
    drop(cache);

    // Two executors plus the cache manager
    let worker_pid = worker.child.id().unwrap();
    let children = children_of(worker_pid);
    assert_eq!(children.len(), 3, "{:?}", children);

    let log_dir = worker.path("log");
    worker.quit().await;
    for pid in children {
        assert!(!is_alive(pid), "child {} outlived the worker", pid);
    }
    assert!(log_dir.join(PROFILE_FILE_NAME).exists());
}
