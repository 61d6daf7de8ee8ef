//! Registry of remote functions

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use super::context::TaskContext;
use crate::error::TaskFailure;

/// Result of running a task function
pub type TaskResult = Result<Value, TaskFailure>;

/// Type-erased task function
pub type TaskFunction = Arc<
    dyn Fn(TaskContext, Vec<Value>) -> Pin<Box<dyn Future<Output = TaskResult> + Send>>
        + Send
        + Sync,
>;

/// Maps function names to task functions
#[derive(Default)]
pub struct FunctionRegistry {
    functions: RwLock<HashMap<String, TaskFunction>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a function
    pub fn register<F, Fut>(&self, name: &str, function: F)
    where
        F: Fn(TaskContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let function: TaskFunction = Arc::new(move |ctx, args| Box::pin(function(ctx, args)));
        self.functions.write().insert(name.to_string(), function);
    }

    pub fn get(&self, name: &str) -> Option<TaskFunction> {
        self.functions.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.read().contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.functions.read().keys().cloned().collect();
        names.sort();
        names
    }
}
