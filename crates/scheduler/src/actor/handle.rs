//! Actor identity and creation parameters

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::ActorId;
use crate::resources::{ResourceRequest, CPU};

/// How to create an actor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorSpec {
    /// Registered actor class name
    pub class: String,

    /// Constructor arguments, replayed on every restart
    #[serde(default)]
    pub args: Vec<Value>,

    /// Held for the actor's whole lifetime; empty by default
    #[serde(default)]
    pub resources: ResourceRequest,

    /// Restarts allowed after a crash, self-exit or external kill
    #[serde(default)]
    pub max_restarts: u32,
}

impl ActorSpec {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            args: Vec::new(),
            resources: ResourceRequest::new(),
            max_restarts: 0,
        }
    }

    pub fn with_arg(mut self, arg: Value) -> Self {
        self.args.push(arg);
        self
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = Value>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_num_cpus(mut self, cpus: f64) -> Self {
        self.resources = self.resources.with(CPU, cpus);
        self
    }

    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }
}

/// Handle to a created actor; stays valid across restarts
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorHandle {
    id: ActorId,
    class: String,
}

impl ActorHandle {
    pub(crate) fn new(id: ActorId, class: impl Into<String>) -> Self {
        Self {
            id,
            class: class.into(),
        }
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn class(&self) -> &str {
        &self.class
    }
}

impl fmt::Display for ActorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.class, self.id)
    }
}

/// Actor lifecycle state
///
/// ```text
///   Starting ──bound──▶ Alive ──exit, budget left──▶ Restarting ──bound──▶ Alive
///       │                 │                              │
///       └─────────────────┴──── exit, no budget / kill(no_restart) ──▶ Killed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorState {
    Starting,
    Alive,
    Restarting,
    Killed,
}

impl ActorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActorState::Killed)
    }
}

impl fmt::Display for ActorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActorState::Starting => "starting",
            ActorState::Alive => "alive",
            ActorState::Restarting => "restarting",
            ActorState::Killed => "killed",
        };
        f.write_str(s)
    }
}

/// Why an actor's worker went away
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum ExitReason {
    Crash(String),
    SelfExit,
    ExternalKill,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Crash(detail) => write!(f, "crashed: {detail}"),
            ExitReason::SelfExit => f.write_str("exited"),
            ExitReason::ExternalKill => f.write_str("killed"),
        }
    }
}
