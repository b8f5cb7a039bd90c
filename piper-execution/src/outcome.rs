//! The single result of one task

use piper_ipc::{Reply, ReturnedParam};

use crate::error::TaskError;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_EXCEPTION: i32 = 2;
pub const EXIT_CANCELLED: i32 = 3;
pub const EXIT_PROTOCOL: i32 = 7;

/// What a task produced; turned into exactly one line on the executor pipe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success {
        job_id: String,
        params: Vec<ReturnedParam>,
    },
    Exception {
        job_id: String,
        message: String,
    },
    Failed {
        job_id: String,
        exit_value: i32,
    },
}

impl Outcome {
    pub fn failed(job_id: impl Into<String>, exit_value: i32) -> Self {
        Outcome::Failed {
            job_id: job_id.into(),
            exit_value,
        }
    }

    pub fn from_error(job_id: impl Into<String>, err: TaskError) -> Self {
        let job_id = job_id.into();
        match err {
            TaskError::Application(message) => Outcome::Exception { job_id, message },
            TaskError::Cancelled => Outcome::failed(job_id, EXIT_CANCELLED),
            TaskError::Failed(_) => Outcome::failed(job_id, EXIT_FAILURE),
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            Outcome::Success { job_id, .. }
            | Outcome::Exception { job_id, .. }
            | Outcome::Failed { job_id, .. } => job_id,
        }
    }

    pub fn exit_value(&self) -> i32 {
        match self {
            Outcome::Success { .. } => EXIT_OK,
            Outcome::Exception { .. } => EXIT_EXCEPTION,
            Outcome::Failed { exit_value, .. } => *exit_value,
        }
    }

    pub fn into_reply(self) -> Reply {
        match self {
            Outcome::Success { job_id, params } => Reply::EndTask {
                job_id,
                exit_value: EXIT_OK,
                params: Some(params),
            },
            Outcome::Exception { job_id, message } => Reply::CompssException { job_id, message },
            Outcome::Failed { job_id, exit_value } => Reply::EndTask {
                job_id,
                exit_value,
                params: None,
            },
        }
    }
}
