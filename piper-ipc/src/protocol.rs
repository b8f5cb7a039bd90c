//! Protocol types exchanged over the worker pipes

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Wire tags, exactly as the orchestrator spells them
pub mod tags {
    pub const EXECUTE_TASK: &str = "EXECUTE_TASK";
    pub const END_TASK: &str = "END_TASK";
    pub const COMPSS_EXCEPTION: &str = "COMPSS_EXCEPTION";
    pub const ADD_EXECUTOR: &str = "ADD_EXECUTOR";
    pub const ADDED_EXECUTOR: &str = "ADDED_EXECUTOR";
    pub const ADD_EXECUTOR_FAILED: &str = "ADD_EXECUTOR_FAILED";
    pub const REMOVE_EXECUTOR: &str = "REMOVE_EXECUTOR";
    pub const REMOVED_EXECUTOR: &str = "REMOVED_EXECUTOR";
    pub const QUERY_EXECUTOR_ID: &str = "QUERY_EXECUTOR_ID";
    pub const REPLY_EXECUTOR_ID: &str = "REPLY_EXECUTOR_ID";
    pub const CANCEL_TASK: &str = "CANCEL_TASK";
    pub const PING: &str = "PING";
    pub const PONG: &str = "PONG";
    pub const QUIT: &str = "QUIT";
}

/// Pid placeholder sent when a pipe has no executor bound to it
pub const UNKNOWN_PID: i64 = -1;

/// Parameter type codes shared with the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ParamType {
    Boolean = 0,
    Char = 1,
    Byte = 2,
    Short = 3,
    Int = 4,
    Long = 5,
    Float = 6,
    Double = 7,
    String = 8,
    String64 = 9,
    File = 10,
    Object = 11,
    Psco = 12,
    ExternalPsco = 13,
    BindingObject = 14,
    Collection = 27,
    DictCollection = 28,
    Stream = 29,
    ExternalStream = 30,
    Enum = 31,
    Null = 32,
    Directory = 33,
}

impl ParamType {
    /// Numeric code used on the wire
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        use ParamType::*;
        let ty = match code {
            0 => Boolean,
            1 => Char,
            2 => Byte,
            3 => Short,
            4 => Int,
            5 => Long,
            6 => Float,
            7 => Double,
            8 => String,
            9 => String64,
            10 => File,
            11 => Object,
            12 => Psco,
            13 => ExternalPsco,
            14 => BindingObject,
            27 => Collection,
            28 => DictCollection,
            29 => Stream,
            30 => ExternalStream,
            31 => Enum,
            32 => Null,
            33 => Directory,
            _ => return None,
        };
        Some(ty)
    }

    /// Values of this type live in a serialized file rather than on the line
    pub fn is_serialized_object(self) -> bool {
        matches!(
            self,
            ParamType::Object
                | ParamType::BindingObject
                | ParamType::Collection
                | ParamType::DictCollection
        )
    }

    /// Types that travel with one extra direction token
    pub(crate) fn has_direction_token(self) -> bool {
        matches!(self, ParamType::ExternalPsco | ParamType::ExternalStream)
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// One decoded parameter tuple
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub param_type: ParamType,
    pub stream: i32,
    pub prefix: String,
    pub name: String,
    pub content_type: String,
    /// Raw value token, or the reassembled text for string types
    pub value: String,
    /// Direction token carried by external objects and streams
    pub direction: Option<String>,
}

impl Param {
    /// Return slots are named `$return_<n>` by the orchestrator
    pub fn is_return_slot(&self) -> bool {
        self.name.starts_with("$return")
    }

    /// File location of a file-backed value
    ///
    /// File values look like `path:data_id:keep_rename:...`; only the path
    /// part matters here.
    pub fn file_path(&self) -> &str {
        self.value.split(':').next().unwrap_or(&self.value)
    }
}

/// Partitioning of a flattened aggregate parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionLayout {
    pub name: String,
    pub block_count: i64,
    pub block_length: i64,
    pub stride: i64,
}

/// Trailing cpu/gpu/fpga binding tokens, `-` meaning unbound
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Affinity {
    pub cpus: Option<String>,
    pub gpus: Option<String>,
    pub fpgas: Option<String>,
}

impl Affinity {
    pub(crate) fn from_tokens(cpus: &str, gpus: &str, fpgas: &str) -> Self {
        let bound = |token: &str| (token != "-").then(|| token.to_string());
        Self {
            cpus: bound(cpus),
            gpus: bound(gpus),
            fpgas: bound(fpgas),
        }
    }
}

/// A decoded `EXECUTE_TASK` line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCommand {
    pub job_id: String,
    pub working_dir: PathBuf,
    pub job_out: PathBuf,
    pub job_err: PathBuf,
    pub tracing: bool,
    pub task_id: String,
    pub debug: bool,
    pub storage_conf: String,
    pub operation: String,
    pub module: String,
    pub function: String,
    pub timeout: u64,
    pub nodes: Vec<String>,
    pub computing_units: u32,
    pub has_target: bool,
    pub return_type: String,
    pub return_length: usize,
    pub params: Vec<Param>,
    pub layouts: Vec<CollectionLayout>,
    pub affinity: Affinity,
}

/// Everything that can arrive on a worker or executor pipe
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ExecuteTask(Box<TaskCommand>),
    AddExecutor { in_pipe: String, out_pipe: String },
    RemoveExecutor { in_pipe: String, out_pipe: String },
    QueryExecutorId { in_pipe: String, out_pipe: String },
    CancelTask { in_pipe: String },
    Ping,
    Quit,
}

impl Command {
    pub fn tag(&self) -> &'static str {
        match self {
            Command::ExecuteTask(_) => tags::EXECUTE_TASK,
            Command::AddExecutor { .. } => tags::ADD_EXECUTOR,
            Command::RemoveExecutor { .. } => tags::REMOVE_EXECUTOR,
            Command::QueryExecutorId { .. } => tags::QUERY_EXECUTOR_ID,
            Command::CancelTask { .. } => tags::CANCEL_TASK,
            Command::Ping => tags::PING,
            Command::Quit => tags::QUIT,
        }
    }
}

/// Parameter echoed back in an `END_TASK` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnedParam {
    pub param_type: ParamType,
    /// `None` is written as `null`
    pub value: Option<String>,
}

impl ReturnedParam {
    pub fn null(param_type: ParamType) -> Self {
        Self {
            param_type,
            value: None,
        }
    }

    pub fn with_value(param_type: ParamType, value: impl Into<String>) -> Self {
        Self {
            param_type,
            value: Some(value.into()),
        }
    }
}

/// Everything the worker writes back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Task finished; `params` is `None` for failure lines, which carry no count
    EndTask {
        job_id: String,
        exit_value: i32,
        params: Option<Vec<ReturnedParam>>,
    },
    CompssException {
        job_id: String,
        message: String,
    },
    AddedExecutor {
        out_pipe: String,
        in_pipe: String,
        pid: u32,
    },
    AddExecutorFailed {
        out_pipe: String,
        in_pipe: String,
    },
    RemovedExecutor {
        out_pipe: String,
        in_pipe: String,
    },
    ReplyExecutorId {
        out_pipe: String,
        in_pipe: String,
        pid: Option<u32>,
    },
    Pong,
    Quit,
}

impl Reply {
    /// Single wire line, without the trailing newline
    pub fn to_line(&self) -> String {
        match self {
            Reply::EndTask {
                job_id,
                exit_value,
                params,
            } => crate::codec::format_end_task(job_id, *exit_value, params.as_deref()),
            Reply::CompssException { job_id, message } => {
                crate::codec::format_exception(job_id, message)
            }
            Reply::AddedExecutor {
                out_pipe,
                in_pipe,
                pid,
            } => format!("{} {} {} {}", tags::ADDED_EXECUTOR, out_pipe, in_pipe, pid),
            Reply::AddExecutorFailed { out_pipe, in_pipe } => {
                format!("{} {} {} 0", tags::ADD_EXECUTOR_FAILED, out_pipe, in_pipe)
            }
            Reply::RemovedExecutor { out_pipe, in_pipe } => {
                format!("{} {} {}", tags::REMOVED_EXECUTOR, out_pipe, in_pipe)
            }
            Reply::ReplyExecutorId {
                out_pipe,
                in_pipe,
                pid,
            } => {
                let pid = pid.map(i64::from).unwrap_or(UNKNOWN_PID);
                format!("{} {} {} {}", tags::REPLY_EXECUTOR_ID, out_pipe, in_pipe, pid)
            }
            Reply::Pong => tags::PONG.to_string(),
            Reply::Quit => tags::QUIT.to_string(),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}
