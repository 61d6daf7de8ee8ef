//! Tasks: descriptors, registered functions, and the execution context

mod context;
mod descriptor;
mod registry;

pub(crate) use context::ContextScope;
pub use context::TaskContext;
pub use descriptor::{TaskArg, TaskDescriptor, DEFAULT_MAX_RETRIES};
pub use registry::{FunctionRegistry, TaskFunction, TaskResult};
