//! Task descriptors

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::duration_serde::option_millis;
use crate::object::ObjectRef;
use crate::resources::{ResourceRequest, CPU};

/// Default number of crash retries for a task
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A task argument: an inline value or a reference resolved before admission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskArg {
    Value(Value),
    Ref(ObjectRef),
}

impl From<Value> for TaskArg {
    fn from(value: Value) -> Self {
        TaskArg::Value(value)
    }
}

impl From<ObjectRef> for TaskArg {
    fn from(object: ObjectRef) -> Self {
        TaskArg::Ref(object)
    }
}

/// Immutable description of a submitted task
///
/// # Example
///
/// ```
/// use serde_json::json;
/// use tessera_scheduler::task::TaskDescriptor;
///
/// let task = TaskDescriptor::new("square")
///     .with_arg(json!(4))
///     .with_num_cpus(0.5)
///     .with_max_calls(1);
/// assert_eq!(task.resources.get("CPU"), Some(0.5));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Registered function name
    pub function: String,

    pub args: Vec<TaskArg>,

    /// Defaults to one CPU
    pub resources: ResourceRequest,

    /// Calls a worker may serve before it drains; 0 = unlimited
    pub max_calls: u32,

    /// Crash retries before the task fails permanently
    pub max_retries: u32,

    /// Fail with `AdmissionTimeout` if still queued after this long
    #[serde(default, with = "option_millis")]
    pub admission_timeout: Option<Duration>,
}

impl TaskDescriptor {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            args: Vec::new(),
            resources: ResourceRequest::cpu(1.0),
            max_calls: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            admission_timeout: None,
        }
    }

    pub fn with_arg(mut self, arg: impl Into<TaskArg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<TaskArg>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Replace the whole resource request
    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    /// Set the CPU demand, keeping other resources
    pub fn with_num_cpus(mut self, cpus: f64) -> Self {
        self.resources = self.resources.with(CPU, cpus);
        self
    }

    pub fn with_max_calls(mut self, max_calls: u32) -> Self {
        self.max_calls = max_calls;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.admission_timeout = Some(timeout);
        self
    }

    /// Object refs this task depends on
    pub fn dependencies(&self) -> impl Iterator<Item = &ObjectRef> {
        self.args.iter().filter_map(|arg| match arg {
            TaskArg::Ref(object) => Some(object),
            TaskArg::Value(_) => None,
        })
    }
}
