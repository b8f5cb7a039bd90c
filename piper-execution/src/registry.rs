//! User functions resolved by module and function name

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use piper_core::Value;
use piper_ipc::CollectionLayout;

use crate::error::TaskError;

/// What a running function can see about its task
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub job_id: String,
    pub task_id: String,
    pub module: String,
    pub function: String,
    pub nodes: Vec<String>,
    pub computing_units: u32,
    /// The first argument is the target object
    pub has_target: bool,
    pub layouts: Vec<CollectionLayout>,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(
        job_id: impl Into<String>,
        module: impl Into<String>,
        function: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            task_id: String::new(),
            module: module.into(),
            function: function.into(),
            nodes: Vec::new(),
            computing_units: 1,
            has_target: false,
            layouts: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Long running functions should poll this and return
    /// [`TaskError::Cancelled`] once it turns true
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// A callable task body
///
/// `args` holds the decoded parameters in call order, the target first when
/// there is one. Functions may mutate them in place; changed file-backed
/// arguments are written back after the call. The returned values fill the
/// task's return slots in order.
pub trait TaskFunction: Send + Sync {
    fn call(&self, ctx: &TaskContext, args: &mut [Value]) -> Result<Vec<Value>, TaskError>;
}

impl<F> TaskFunction for F
where
    F: Fn(&TaskContext, &mut [Value]) -> Result<Vec<Value>, TaskError> + Send + Sync,
{
    fn call(&self, ctx: &TaskContext, args: &mut [Value]) -> Result<Vec<Value>, TaskError> {
        self(ctx, args)
    }
}

/// Function table of one executor process
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<(String, String), Arc<dyn TaskFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `module.function`, replacing any previous entry
    pub fn register<F>(&mut self, module: &str, function: &str, f: F) -> &mut Self
    where
        F: TaskFunction + 'static,
    {
        self.functions
            .insert((module.to_string(), function.to_string()), Arc::new(f));
        self
    }

    pub fn get(&self, module: &str, function: &str) -> Option<Arc<dyn TaskFunction>> {
        self.functions
            .get(&(module.to_string(), function.to_string()))
            .cloned()
    }

    pub fn contains(&self, module: &str, function: &str) -> bool {
        self.get(module, function).is_some()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self
            .functions
            .keys()
            .map(|(module, function)| format!("{}.{}", module, function))
            .collect();
        names.sort();
        f.debug_struct("FunctionRegistry")
            .field("functions", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn double(_ctx: &TaskContext, args: &mut [Value]) -> Result<Vec<Value>, TaskError> {
        let n = args
            .first()
            .and_then(Value::as_int)
            .ok_or_else(|| TaskError::failed("expected an int"))?;
        Ok(vec![Value::Int(n * 2)])
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = FunctionRegistry::new();
        registry
            .register("math", "double", double)
            .register("math", "noop", |_: &TaskContext, _: &mut [Value]| Ok(vec![]));

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("math", "noop"));
        assert!(!registry.contains("math", "triple"));
        assert!(!registry.contains("other", "double"));

        let f = registry.get("math", "double").unwrap();
        let ctx = TaskContext::new("1", "math", "double");
        let mut args = vec![Value::Int(21)];
        assert_eq!(f.call(&ctx, &mut args).unwrap(), vec![Value::Int(42)]);
        assert!(f.call(&ctx, &mut []).is_err());
    }

    #[test]
    fn test_context_cancellation() {
        let token = CancellationToken::new();
        let ctx = TaskContext::new("1", "m", "f").with_cancel(token.clone());
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_debug_lists_names() {
        let mut registry = FunctionRegistry::new();
        registry.register("b", "g", double).register("a", "f", double);
        let text = format!("{:?}", registry);
        assert!(text.contains("\"a.f\", \"b.g\""));
    }
}
