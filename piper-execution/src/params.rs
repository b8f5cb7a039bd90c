//! Decoding of task parameters into call arguments

use piper_core::Value;
use piper_ipc::{Param, ParamType, ReturnedParam, TaskCommand};

use crate::error::TaskError;

/// Decode a parameter whose value travels on the command line
///
/// Returns `None` for values that live elsewhere: serialized objects on disk
/// and persistent objects behind the storage hooks.
pub fn decode_inline(param: &Param) -> Result<Option<Value>, TaskError> {
    let raw = param.value.as_str();
    let bad = |what: &str| {
        TaskError::failed(format!(
            "Parameter {} carries an invalid {}: {:?}",
            param.name, what, raw
        ))
    };

    let value = match param.param_type {
        ParamType::Boolean => Value::Bool(matches!(raw, "true" | "True" | "1")),
        ParamType::Char => Value::Str(raw.to_string()),
        ParamType::Byte | ParamType::Short | ParamType::Int | ParamType::Long => {
            Value::Int(raw.parse().map_err(|_| bad("integer"))?)
        }
        ParamType::Float | ParamType::Double => {
            Value::Float(raw.parse().map_err(|_| bad("float"))?)
        }
        ParamType::String | ParamType::String64 => Value::Str(raw.to_string()),
        ParamType::File | ParamType::Directory => Value::Str(param.file_path().to_string()),
        ParamType::Stream | ParamType::ExternalStream | ParamType::Enum => {
            Value::Str(raw.to_string())
        }
        ParamType::Null => Value::Null,
        ParamType::Psco
        | ParamType::ExternalPsco
        | ParamType::Object
        | ParamType::BindingObject
        | ParamType::Collection
        | ParamType::DictCollection => return Ok(None),
    };
    Ok(Some(value))
}

/// Wire index of the target object, which sits right before the returns
pub fn target_index(cmd: &TaskCommand) -> Result<Option<usize>, TaskError> {
    check_return_length(cmd)?;
    if !cmd.has_target {
        return Ok(None);
    }
    cmd.params
        .len()
        .checked_sub(cmd.return_length + 1)
        .map(Some)
        .ok_or_else(|| TaskError::failed("Task declares a target but has no parameter for it"))
}

fn check_return_length(cmd: &TaskCommand) -> Result<(), TaskError> {
    if cmd.return_length > cmd.params.len() {
        return Err(TaskError::failed(format!(
            "{} return slots declared for {} parameters",
            cmd.return_length,
            cmd.params.len()
        )));
    }
    Ok(())
}

/// Wire indices of the call arguments, target first
pub fn call_order(cmd: &TaskCommand) -> Result<Vec<usize>, TaskError> {
    let target = target_index(cmd)?;
    let regular = cmd.params.len() - cmd.return_length;
    let mut order: Vec<usize> = target.into_iter().collect();
    order.extend((0..regular).filter(|index| Some(*index) != target));
    Ok(order)
}

/// Return slot parameters, in wire order
pub fn return_slots(cmd: &TaskCommand) -> Result<&[Param], TaskError> {
    check_return_length(cmd)?;
    Ok(&cmd.params[cmd.params.len() - cmd.return_length..])
}

/// What `END_TASK` reports back for one parameter
///
/// Return slots carry the location of the written result and persistent
/// objects keep their id; everything else comes back as `null`.
pub fn echo_param(param: &Param, is_return: bool) -> ReturnedParam {
    match param.param_type {
        _ if is_return => ReturnedParam::with_value(param.param_type, param.file_path()),
        ParamType::Psco | ParamType::ExternalPsco => {
            ReturnedParam::with_value(param.param_type, param.value.clone())
        }
        other => ReturnedParam::null(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use piper_ipc::{parse_line, Command};

    fn task(line: &str) -> TaskCommand {
        match parse_line(line).unwrap() {
            Command::ExecuteTask(cmd) => *cmd,
            other => panic!("expected a task, got {:?}", other),
        }
    }

    fn param(param_type: ParamType, value: &str) -> Param {
        Param {
            param_type,
            stream: 3,
            prefix: "null".into(),
            name: "p".into(),
            content_type: "null".into(),
            value: value.into(),
            direction: None,
        }
    }

    #[test]
    fn test_decode_primitives() {
        assert_eq!(
            decode_inline(&param(ParamType::Int, "41")).unwrap(),
            Some(Value::Int(41))
        );
        assert_eq!(
            decode_inline(&param(ParamType::Double, "2.5")).unwrap(),
            Some(Value::Float(2.5))
        );
        assert_eq!(
            decode_inline(&param(ParamType::Boolean, "true")).unwrap(),
            Some(Value::Bool(true))
        );
        assert_eq!(
            decode_inline(&param(ParamType::File, "/data/in:d3v1_1.IT:false:true:/data/in"))
                .unwrap(),
            Some(Value::Str("/data/in".into()))
        );
        assert_eq!(
            decode_inline(&param(ParamType::Null, "null")).unwrap(),
            Some(Value::Null)
        );
        assert_eq!(decode_inline(&param(ParamType::Object, "/tmp/o")).unwrap(), None);
        assert!(decode_inline(&param(ParamType::Long, "many")).is_err());
    }

    #[test]
    fn test_target_goes_first() {
        // Two regular params, the target, one return slot
        let cmd = task(
            "EXECUTE_TASK 4 /w /w/4.out /w/4.err 0 4 false null METHOD m f 0 1 localhost 1 true \
             10 1 4 4 3 null a null 1 4 3 null b null 2 11 3 null self null /w/self \
             10 3 # $return_0 null /w/ret - - -",
        );
        assert_eq!(target_index(&cmd).unwrap(), Some(2));
        assert_eq!(call_order(&cmd).unwrap(), vec![2, 0, 1]);
        assert_eq!(return_slots(&cmd).unwrap().len(), 1);
        assert!(return_slots(&cmd).unwrap()[0].is_return_slot());
    }

    #[test]
    fn test_missing_target_slot() {
        let mut cmd = task(
            "EXECUTE_TASK 5 /w /w/5.out /w/5.err 0 5 false null METHOD m f 0 1 localhost 1 \
             false null 0 0 - - -",
        );
        assert_eq!(call_order(&cmd).unwrap(), Vec::<usize>::new());
        cmd.has_target = true;
        assert!(target_index(&cmd).is_err());
        cmd.return_length = 2;
        assert!(return_slots(&cmd).is_err());
    }

    #[test]
    fn test_echo() {
        let ret = param(ParamType::File, "/tmp/res:d1v2_1.IT:false:true:/tmp/res");
        assert_eq!(echo_param(&ret, true).value.as_deref(), Some("/tmp/res"));
        assert_eq!(echo_param(&param(ParamType::Int, "1"), false).value, None);
        assert_eq!(
            echo_param(&param(ParamType::Psco, "obj-17"), false).value.as_deref(),
            Some("obj-17")
        );
    }
}
