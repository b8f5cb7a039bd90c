//! Decoding of command lines and formatting of task replies

use base64::Engine as _;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ProtocolError;
use crate::protocol::{
    tags, Affinity, CollectionLayout, Command, Param, ParamType, ReturnedParam, TaskCommand,
};

/// Number of affinity tokens closing every task line
const AFFINITY_TOKENS: usize = 3;

/// Decode one line read from a pipe
pub fn parse_line(line: &str) -> Result<Command, ProtocolError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some((&tag, rest)) = tokens.split_first() else {
        return Err(ProtocolError::Empty);
    };

    match tag {
        tags::EXECUTE_TASK => parse_execute_task(rest).map(|task| Command::ExecuteTask(Box::new(task))),
        tags::ADD_EXECUTOR => {
            let (in_pipe, out_pipe) = pipe_pair(tag, rest)?;
            Ok(Command::AddExecutor { in_pipe, out_pipe })
        }
        tags::REMOVE_EXECUTOR => {
            let (in_pipe, out_pipe) = pipe_pair(tag, rest)?;
            Ok(Command::RemoveExecutor { in_pipe, out_pipe })
        }
        tags::QUERY_EXECUTOR_ID => {
            let (in_pipe, out_pipe) = pipe_pair(tag, rest)?;
            Ok(Command::QueryExecutorId { in_pipe, out_pipe })
        }
        tags::CANCEL_TASK => match rest.first() {
            Some(in_pipe) => Ok(Command::CancelTask {
                in_pipe: in_pipe.to_string(),
            }),
            None => Err(ProtocolError::malformed(tag, None, "missing pipe name")),
        },
        tags::PING => Ok(Command::Ping),
        tags::QUIT => Ok(Command::Quit),
        other => Err(ProtocolError::UnknownTag(other.to_string())),
    }
}

fn pipe_pair(tag: &str, rest: &[&str]) -> Result<(String, String), ProtocolError> {
    match rest {
        [in_pipe, out_pipe, ..] => Ok((in_pipe.to_string(), out_pipe.to_string())),
        _ => Err(ProtocolError::malformed(
            tag,
            None,
            format!("expected 2 pipe names, got {}", rest.len()),
        )),
    }
}

/// Forward reader over the body of a task line
struct Cursor<'a> {
    tokens: &'a [&'a str],
    pos: usize,
    job_id: Option<&'a str>,
}

impl<'a> Cursor<'a> {
    fn new(tokens: &'a [&'a str]) -> Self {
        Self {
            tokens,
            pos: 0,
            job_id: tokens.first().copied(),
        }
    }

    fn error(&self, reason: impl Into<String>) -> ProtocolError {
        ProtocolError::malformed(tags::EXECUTE_TASK, self.job_id, reason)
    }

    fn next(&mut self, field: &str) -> Result<&'a str, ProtocolError> {
        let token = self
            .tokens
            .get(self.pos)
            .copied()
            .ok_or_else(|| self.error(format!("line ends before {}", field)))?;
        self.pos += 1;
        Ok(token)
    }

    fn parse<T: FromStr>(&mut self, field: &str) -> Result<T, ProtocolError> {
        let token = self.next(field)?;
        token
            .parse()
            .map_err(|_| self.error(format!("invalid {}: {:?}", field, token)))
    }

    fn take(&mut self, count: usize, field: &str) -> Result<&'a [&'a str], ProtocolError> {
        let end = self.pos.checked_add(count).filter(|end| *end <= self.tokens.len());
        let Some(end) = end else {
            return Err(self.error(format!(
                "{} announces {} tokens, only {} left",
                field,
                count,
                self.tokens.len() - self.pos
            )));
        };
        let slice = &self.tokens[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn rest(&self) -> &'a [&'a str] {
        &self.tokens[self.pos..]
    }
}

fn flag(token: &str) -> bool {
    matches!(token, "true" | "1")
}

fn parse_execute_task(rest: &[&str]) -> Result<TaskCommand, ProtocolError> {
    if rest.len() < AFFINITY_TOKENS {
        return Err(ProtocolError::malformed(
            tags::EXECUTE_TASK,
            rest.first().copied(),
            "line too short",
        ));
    }

    // Affinity tokens close the line, so carve them before walking the
    // variable width regions forward.
    let (body, tail) = rest.split_at(rest.len() - AFFINITY_TOKENS);
    let affinity = Affinity::from_tokens(tail[0], tail[1], tail[2]);

    let mut cur = Cursor::new(body);
    // A line cut short still names its job
    cur.job_id = rest.first().copied();
    let job_id = cur.next("job id")?.to_string();
    let working_dir = PathBuf::from(cur.next("working directory")?);
    let job_out = PathBuf::from(cur.next("job stdout path")?);
    let job_err = PathBuf::from(cur.next("job stderr path")?);
    let tracing = flag(cur.next("tracing flag")?);
    let task_id = cur.next("task id")?.to_string();
    let debug = flag(cur.next("debug flag")?);
    let storage_conf = cur.next("storage configuration")?.to_string();
    let operation = cur.next("operation kind")?.to_string();
    let module = cur.next("module")?.to_string();
    let function = cur.next("function name")?.to_string();
    let timeout = cur.parse::<u64>("timeout")?;

    let node_count = cur.parse::<usize>("node count")?;
    let nodes = cur
        .take(node_count, "node count")?
        .iter()
        .map(|n| n.to_string())
        .collect();

    let computing_units = cur.parse::<u32>("computing units")?;
    let has_target = flag(cur.next("has-target flag")?);
    let return_type = cur.next("return type")?.to_string();
    let return_length = cur.parse::<usize>("return length")?;
    let param_count = cur.parse::<usize>("parameter count")?;
    if return_length > param_count {
        return Err(cur.error(format!(
            "return length {} exceeds parameter count {}",
            return_length, param_count
        )));
    }

    let mut params = Vec::with_capacity(param_count);
    for index in 0..param_count {
        params.push(parse_param(&mut cur, index)?);
    }

    let layouts = parse_layouts(&cur)?;

    Ok(TaskCommand {
        job_id,
        working_dir,
        job_out,
        job_err,
        tracing,
        task_id,
        debug,
        storage_conf,
        operation,
        module,
        function,
        timeout,
        nodes,
        computing_units,
        has_target,
        return_type,
        return_length,
        params,
        layouts,
        affinity,
    })
}

fn parse_param(cur: &mut Cursor<'_>, index: usize) -> Result<Param, ProtocolError> {
    let code = cur.parse::<u8>("parameter type")?;
    let param_type = ParamType::from_code(code)
        .ok_or_else(|| cur.error(format!("parameter {} has unknown type {}", index, code)))?;
    let stream = cur.parse::<i32>("parameter stream")?;
    let prefix = cur.next("parameter prefix")?.to_string();
    let name = cur.next("parameter name")?.to_string();
    let content_type = cur.next("parameter content type")?.to_string();
    let raw_value = cur.next("parameter value")?;

    let mut direction = None;
    let value = match param_type {
        ParamType::String | ParamType::String64 => {
            let count = raw_value
                .parse::<usize>()
                .map_err(|_| cur.error(format!("invalid substring count {:?}", raw_value)))?;
            let text = cur.take(count, "substring count")?.join(" ");
            if param_type == ParamType::String64 {
                decode_string64(&text).map_err(|reason| cur.error(reason))?
            } else {
                text
            }
        }
        ty if ty.has_direction_token() => {
            direction = Some(cur.next("direction")?.to_string());
            raw_value.to_string()
        }
        _ => raw_value.to_string(),
    };

    Ok(Param {
        param_type,
        stream,
        prefix,
        name,
        content_type,
        value,
        direction,
    })
}

/// Base64 strings are sent with a leading `#` so empty strings still encode
fn decode_string64(text: &str) -> Result<String, String> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(text.as_bytes())
        .map_err(|e| format!("invalid base64 string: {}", e))?;
    let payload = bytes.get(1..).unwrap_or_default();
    Ok(String::from_utf8_lossy(payload).into_owned())
}

fn parse_layouts(cur: &Cursor<'_>) -> Result<Vec<CollectionLayout>, ProtocolError> {
    let rest = cur.rest();
    let Some((count, tuples)) = rest.split_first() else {
        return Ok(Vec::new());
    };
    let count = count
        .parse::<usize>()
        .map_err(|_| cur.error(format!("unexpected token {:?} after parameters", count)))?;
    if tuples.len() != count * 4 {
        return Err(cur.error(format!(
            "collection layout count {} does not match {} trailing tokens",
            count,
            tuples.len()
        )));
    }

    tuples
        .chunks_exact(4)
        .map(|chunk| {
            let number = |token: &str| {
                token
                    .parse::<i64>()
                    .map_err(|_| cur.error(format!("invalid collection layout value {:?}", token)))
            };
            Ok(CollectionLayout {
                name: chunk[0].to_string(),
                block_count: number(chunk[1])?,
                block_length: number(chunk[2])?,
                stride: number(chunk[3])?,
            })
        })
        .collect()
}

/// `END_TASK <job_id> <exit_value> [<count> (<type> <value>)*]`
///
/// Failure lines pass `None` and carry no parameter block at all.
pub fn format_end_task(job_id: &str, exit_value: i32, params: Option<&[ReturnedParam]>) -> String {
    let mut line = format!("{} {} {}", tags::END_TASK, job_id, exit_value);
    if let Some(params) = params {
        line.push(' ');
        line.push_str(&params.len().to_string());
        for param in params {
            line.push(' ');
            line.push_str(&param.param_type.to_string());
            line.push(' ');
            line.push_str(param.value.as_deref().unwrap_or("null"));
        }
    }
    line
}

/// `COMPSS_EXCEPTION <job_id> <message>` with whitespace folded to `_`
///
/// The substitution is lossy: a message containing `_` cannot be told apart
/// from one containing spaces.
pub fn format_exception(job_id: &str, message: &str) -> String {
    let encoded: String = message
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect();
    format!("{} {} {}", tags::COMPSS_EXCEPTION, job_id, encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = "EXECUTE_TASK 1 /work /tmp/job1.out /tmp/job1.err 0 1 true null METHOD \
                          common_piper_tester simple 0 1 localhost 1 false None 0 0 - 0 0";

    const INCREMENT: &str = "EXECUTE_TASK 2 /work /tmp/job2.out /tmp/job2.err 0 1 true null METHOD \
                             common_piper_tester increment 0 1 localhost 1 false 10 1 2 \
                             4 3 null value null 1 \
                             10 3 # $return_0 null /tmp/res:d1v2_1599560599402.IT:false:true:/tmp/res \
                             - 0 0";

    fn task(line: &str) -> TaskCommand {
        match parse_line(line).expect("line should parse") {
            Command::ExecuteTask(task) => *task,
            other => panic!("expected a task, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_zero_argument_task() {
        let task = task(SIMPLE);
        assert_eq!(task.job_id, "1");
        assert_eq!(task.module, "common_piper_tester");
        assert_eq!(task.function, "simple");
        assert_eq!(task.nodes, vec!["localhost".to_string()]);
        assert_eq!(task.computing_units, 1);
        assert!(!task.has_target);
        assert!(task.params.is_empty());
        assert!(task.layouts.is_empty());
        assert_eq!(task.affinity.cpus, None);
        assert_eq!(task.affinity.gpus.as_deref(), Some("0"));
    }

    #[test]
    fn test_parse_task_with_return_slot() {
        let task = task(INCREMENT);
        assert_eq!(task.return_length, 1);
        assert_eq!(task.params.len(), 2);
        assert_eq!(task.params[0].param_type, ParamType::Int);
        assert_eq!(task.params[0].name, "value");
        assert_eq!(task.params[0].value, "1");
        assert!(task.params[1].is_return_slot());
        assert_eq!(task.params[1].file_path(), "/tmp/res");
    }

    #[test]
    fn test_multiple_nodes_and_layouts() {
        let line = "EXECUTE_TASK 9 /w /o /e 0 3 false null METHOD mod fn 0 3 n1 n2 n3 4 false null 0 1 \
                    8 3 null s null 2 hello world \
                    1 col 2 10 1 \
                    0,1 - -";
        let task = task(line);
        assert_eq!(task.nodes, vec!["n1", "n2", "n3"]);
        assert_eq!(task.computing_units, 4);
        assert_eq!(task.params[0].value, "hello world");
        assert_eq!(
            task.layouts,
            vec![CollectionLayout {
                name: "col".into(),
                block_count: 2,
                block_length: 10,
                stride: 1
            }]
        );
        assert_eq!(task.affinity.cpus.as_deref(), Some("0,1"));
        assert_eq!(task.affinity.gpus, None);
    }

    #[test]
    fn test_parameter_count_mismatch_is_protocol_error() {
        // Announces two parameters but carries one
        let line = "EXECUTE_TASK 5 /w /o /e 0 1 true null METHOD m f 0 1 localhost 1 false None 0 2 \
                    4 3 null value null 1 - 0 0";
        let err = parse_line(line).unwrap_err();
        assert_eq!(err.job_id(), Some("5"));
    }

    #[test]
    fn test_layout_count_mismatch_is_protocol_error() {
        let line = "EXECUTE_TASK 6 /w /o /e 0 1 true null METHOD m f 0 1 localhost 1 false None 0 0 \
                    2 col 1 1 1 - 0 0";
        assert!(matches!(
            parse_line(line),
            Err(ProtocolError::Malformed { job_id: Some(ref id), .. }) if id == "6"
        ));
    }

    #[test]
    fn test_string64_and_external_tokens() {
        // "#hi there" in base64
        let line = "EXECUTE_TASK 7 /w /o /e 0 1 true null METHOD m f 0 1 h 1 false None 0 2 \
                    9 3 null s null 1 I2hpIHRoZXJl \
                    13 3 null p null psco-id W \
                    - - -";
        let task = task(line);
        assert_eq!(task.params[0].value, "hi there");
        assert_eq!(task.params[1].value, "psco-id");
        assert_eq!(task.params[1].direction.as_deref(), Some("W"));
    }

    #[test]
    fn test_control_commands() {
        assert_eq!(parse_line("PING\n").unwrap(), Command::Ping);
        assert_eq!(parse_line("QUIT").unwrap(), Command::Quit);
        assert_eq!(
            parse_line("ADD_EXECUTOR /p/in /p/out").unwrap(),
            Command::AddExecutor {
                in_pipe: "/p/in".into(),
                out_pipe: "/p/out".into()
            }
        );
        assert_eq!(
            parse_line("CANCEL_TASK /p/in").unwrap(),
            Command::CancelTask {
                in_pipe: "/p/in".into()
            }
        );
        assert!(matches!(
            parse_line("REMOVE_EXECUTOR /p/in"),
            Err(ProtocolError::Malformed { .. })
        ));
        assert_eq!(parse_line("   "), Err(ProtocolError::Empty));
        assert_eq!(
            parse_line("BOGUS 1"),
            Err(ProtocolError::UnknownTag("BOGUS".into()))
        );
    }

    #[test]
    fn test_format_end_task() {
        assert_eq!(format_end_task("1", 0, Some(&[])), "END_TASK 1 0 0");
        assert_eq!(format_end_task("3", 7, None), "END_TASK 3 7");
        let params = [
            ReturnedParam::null(ParamType::Int),
            ReturnedParam::with_value(ParamType::File, "/tmp/res"),
        ];
        assert_eq!(
            format_end_task("2", 0, Some(&params)),
            "END_TASK 2 0 2 4 null 10 /tmp/res"
        );
    }

    #[test]
    fn test_format_exception_folds_spaces() {
        assert_eq!(
            format_exception("4", "value out of range"),
            "COMPSS_EXCEPTION 4 value_out_of_range"
        );
    }
}
