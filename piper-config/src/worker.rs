//! Positional argument contract of the worker process

use piper_ipc::PipePair;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::cache::CacheSpec;
use crate::error::{ConfigError, ConfigResult};
use crate::validation::{validate_positive, validate_required_string, Validatable};

/// Number of fixed arguments before the pipe list
pub const FIXED_ARGS: usize = 12;

/// Worker configuration as handed over by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub tmp_dir: PathBuf,
    pub debug: bool,
    pub persistent_storage: bool,
    pub tracing_level: i32,
    /// `null` when unused
    pub storage_conf: String,
    pub stream_backend: String,
    pub stream_master_host: String,
    pub stream_master_port: String,
    pub cpu_affinity: String,
    pub gpu_affinity: String,
    pub tasks_x_node: usize,
    pub cache: CacheSpec,
    /// One pair per executor, seen from the executor side
    pub executor_pipes: Vec<PipePair>,
    /// Control pair, seen from the worker side
    pub control_pipe: PipePair,
}

struct Args<'a> {
    args: &'a [String],
}

impl<'a> Args<'a> {
    fn get(&self, position: usize, name: &'static str) -> ConfigResult<&'a str> {
        self.args
            .get(position - 1)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::ArgumentError {
                position,
                name,
                message: "missing".to_string(),
            })
    }

    fn flag(&self, position: usize, name: &'static str) -> ConfigResult<bool> {
        Ok(self.get(position, name)? == "true")
    }

    fn parse<T>(&self, position: usize, name: &'static str) -> ConfigResult<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self.get(position, name)?;
        raw.parse().map_err(|e: T::Err| ConfigError::ArgumentError {
            position,
            name,
            message: format!("{:?}: {}", raw, e),
        })
    }
}

impl WorkerConfig {
    /// Parse the positional arguments, program name excluded
    pub fn from_args(args: &[String]) -> ConfigResult<Self> {
        let a = Args { args };
        let tasks_x_node = a.parse::<usize>(11, "tasks_x_node")?;

        let pipes = args.get(FIXED_ARGS..).unwrap_or_default();
        let expected = 2 * tasks_x_node + 2;
        if pipes.len() != expected {
            return Err(ConfigError::ValidationError(format!(
                "{} executors need {} pipe paths, got {}",
                tasks_x_node,
                expected,
                pipes.len()
            )));
        }
        let (executor_paths, control_paths) = pipes.split_at(2 * tasks_x_node);
        let executor_pipes = executor_paths
            .chunks_exact(2)
            .map(|pair| PipePair::new(&pair[0], &pair[1]))
            .collect();
        let control_pipe = PipePair::new(&control_paths[0], &control_paths[1]);

        let config = Self {
            tmp_dir: PathBuf::from(a.get(1, "tmp_dir")?),
            debug: a.flag(2, "debug")?,
            persistent_storage: a.flag(3, "persistent_storage")?,
            tracing_level: a.parse(4, "tracing")?,
            storage_conf: a.get(5, "storage_conf")?.to_string(),
            stream_backend: a.get(6, "stream_backend")?.to_string(),
            stream_master_host: a.get(7, "stream_master_name")?.to_string(),
            stream_master_port: a.get(8, "stream_master_port")?.to_string(),
            cpu_affinity: a.get(9, "cpu_affinity")?.to_string(),
            gpu_affinity: a.get(10, "gpu_affinity")?.to_string(),
            tasks_x_node,
            cache: a.parse(12, "cache")?,
            executor_pipes,
            control_pipe,
        };
        config.validate()?;
        Ok(config)
    }

    /// Inverse of [`WorkerConfig::from_args`]
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            self.tmp_dir.to_string_lossy().into_owned(),
            self.debug.to_string(),
            self.persistent_storage.to_string(),
            self.tracing_level.to_string(),
            self.storage_conf.clone(),
            self.stream_backend.clone(),
            self.stream_master_host.clone(),
            self.stream_master_port.clone(),
            self.cpu_affinity.clone(),
            self.gpu_affinity.clone(),
            self.tasks_x_node.to_string(),
            self.cache.to_string(),
        ];
        for pair in self.executor_pipes.iter().chain(Some(&self.control_pipe)) {
            args.push(pair.input.to_string_lossy().into_owned());
            args.push(pair.output.to_string_lossy().into_owned());
        }
        args
    }

    pub fn log_dir(&self) -> PathBuf {
        self.tmp_dir.join("log")
    }

    /// Storage hooks run only with the flag set and a real configuration
    pub fn storage_enabled(&self) -> bool {
        self.persistent_storage && self.storage_conf != "null"
    }

    pub fn tracing_enabled(&self) -> bool {
        self.tracing_level > 0
    }
}

impl Validatable for WorkerConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_required_string(
            &self.tmp_dir.to_string_lossy(),
            "tmp_dir",
            self.domain_name(),
        )?;
        validate_positive(self.tasks_x_node, "tasks_x_node", self.domain_name())?;
        if self.executor_pipes.len() != self.tasks_x_node {
            return Err(self.validation_error(format!(
                "{} executor pipe pairs for {} executors",
                self.executor_pipes.len(),
                self.tasks_x_node
            )));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "worker"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(tasks: usize, cache: &str) -> Vec<String> {
        let mut args: Vec<String> = [
            "/tmp/piper", "false", "false", "0", "null", "NONE", "localhost", "49049", "-",
            "-",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(tasks.to_string());
        args.push(cache.to_string());
        for i in 0..tasks {
            args.push(format!("/tmp/piper/pipe_{}.in", i));
            args.push(format!("/tmp/piper/pipe_{}.out", i));
        }
        args.push("/tmp/piper/control.in".to_string());
        args.push("/tmp/piper/control.out".to_string());
        args
    }

    #[test]
    fn test_parse_two_executors() {
        let config = WorkerConfig::from_args(&argv(2, "false")).unwrap();
        assert_eq!(config.tasks_x_node, 2);
        assert_eq!(config.executor_pipes.len(), 2);
        assert_eq!(
            config.executor_pipes[1],
            PipePair::new("/tmp/piper/pipe_1.in", "/tmp/piper/pipe_1.out")
        );
        assert_eq!(config.control_pipe.input, PathBuf::from("/tmp/piper/control.in"));
        assert_eq!(config.log_dir(), PathBuf::from("/tmp/piper/log"));
        assert!(!config.cache.is_enabled());
        assert!(!config.storage_enabled());
    }

    #[test]
    fn test_args_round_trip() {
        let args = argv(3, "true:4096");
        let config = WorkerConfig::from_args(&args).unwrap();
        assert_eq!(config.to_args(), args);
    }

    #[test]
    fn test_pipe_count_mismatch() {
        let mut args = argv(2, "false");
        args.pop();
        assert!(matches!(
            WorkerConfig::from_args(&args),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_zero_executors_rejected() {
        let err = WorkerConfig::from_args(&argv(0, "false")).unwrap_err();
        assert!(matches!(err, ConfigError::DomainError { .. }));
    }

    #[test]
    fn test_bad_number_names_position() {
        let mut args = argv(1, "false");
        args[3] = "verbose".to_string();
        match WorkerConfig::from_args(&args) {
            Err(ConfigError::ArgumentError { position, name, .. }) => {
                assert_eq!(position, 4);
                assert_eq!(name, "tracing");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
