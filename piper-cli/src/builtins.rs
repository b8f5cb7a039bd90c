//! Functions compiled into the worker binary

use piper_core::Value;
use piper_execution::{FunctionRegistry, TaskContext, TaskError};

pub const TESTER_MODULE: &str = "common_piper_tester";

/// Registry the executors of this binary resolve tasks against
pub fn registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    registry
        .register(TESTER_MODULE, "simple", simple)
        .register(TESTER_MODULE, "increment", increment);
    registry
}

fn simple(_ctx: &TaskContext, _args: &mut [Value]) -> Result<Vec<Value>, TaskError> {
    Ok(vec![])
}

fn increment(_ctx: &TaskContext, args: &mut [Value]) -> Result<Vec<Value>, TaskError> {
    match args {
        [value] => {
            let n = value
                .as_int()
                .ok_or_else(|| TaskError::Application(format!("cannot increment {:?}", value)))?;
            Ok(vec![Value::Int(n + 1)])
        }
        _ => Err(TaskError::failed(format!(
            "increment takes one argument, got {}",
            args.len()
        ))),
    }
}
