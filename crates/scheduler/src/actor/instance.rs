//! Actor instances and their registry

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::TaskFailure;
use crate::task::TaskContext;

/// A stateful actor hosted by one worker at a time
///
/// Methods run one at a time in submission order. Returning
/// [`TaskFailure::Application`] fails only that call; a panic or
/// [`TaskFailure::Crash`] takes the whole actor down (and may restart it).
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use serde_json::{json, Value};
/// use tessera_scheduler::actor::Actor;
/// use tessera_scheduler::error::TaskFailure;
/// use tessera_scheduler::task::TaskContext;
///
/// struct Counter(i64);
///
/// #[async_trait]
/// impl Actor for Counter {
///     async fn call(
///         &mut self,
///         _ctx: &TaskContext,
///         method: &str,
///         _args: Vec<Value>,
///     ) -> Result<Value, TaskFailure> {
///         match method {
///             "incr" => {
///                 self.0 += 1;
///                 Ok(json!(self.0))
///             }
///             other => Err(TaskFailure::msg(format!("unknown method {other}"))),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait Actor: Send + 'static {
    async fn call(
        &mut self,
        ctx: &TaskContext,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, TaskFailure>;

    /// Run one collection pass; return whether anything was reclaimed
    async fn collect(&mut self) -> bool {
        false
    }
}

/// Builds a fresh actor instance from its constructor arguments
pub type ActorFactory = Arc<dyn Fn(Vec<Value>) -> Result<Box<dyn Actor>, TaskFailure> + Send + Sync>;

/// Maps actor class names to factories
#[derive(Default)]
pub struct ActorRegistry {
    factories: RwLock<HashMap<String, ActorFactory>>,
}

impl ActorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) an actor class
    pub fn register<A, F>(&self, class: &str, factory: F)
    where
        A: Actor,
        F: Fn(Vec<Value>) -> Result<A, TaskFailure> + Send + Sync + 'static,
    {
        let factory: ActorFactory =
            Arc::new(move |args| factory(args).map(|actor| Box::new(actor) as Box<dyn Actor>));
        self.factories.write().insert(class.to_string(), factory);
    }

    pub fn get(&self, class: &str) -> Option<ActorFactory> {
        self.factories.read().get(class).cloned()
    }

    pub fn contains(&self, class: &str) -> bool {
        self.factories.read().contains_key(class)
    }
}
