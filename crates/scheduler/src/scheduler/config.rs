//! Scheduler configuration

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration_serde::millis;
use crate::error::ConfigError;
use crate::gc::GcConfig;
use crate::ids::NodeId;
use crate::reliability::RetryPolicy;
use crate::resources::{ResourceRequest, CPU, GPU};
use crate::worker::WorkerPoolConfig;

/// One node and the resources it declares
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: NodeId,
    pub resources: ResourceRequest,
}

impl NodeConfig {
    pub fn new(id: impl Into<NodeId>, resources: ResourceRequest) -> Self {
        Self {
            id: id.into(),
            resources,
        }
    }

    /// A node with only CPUs
    pub fn with_cpus(id: impl Into<NodeId>, cpus: f64) -> Self {
        Self::new(id, ResourceRequest::cpu(cpus))
    }
}

/// Configuration for [`Scheduler`](super::Scheduler)
///
/// # Example
///
/// ```
/// use tessera_scheduler::scheduler::{NodeConfig, SchedulerConfig};
///
/// let config = SchedulerConfig::new()
///     .with_node(NodeConfig::with_cpus("node-0", 4.0))
///     .with_node(NodeConfig::with_cpus("node-1", 2.0));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Nodes registered at startup; more can be added later
    pub nodes: Vec<NodeConfig>,

    #[serde(default)]
    pub pool: WorkerPoolConfig,

    #[serde(default)]
    pub gc: GcConfig,

    /// Backoff between crash retries
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Fallback scheduling period; ticks also run on every submit and release
    #[serde(with = "millis")]
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            pool: WorkerPoolConfig::default(),
            gc: GcConfig::default(),
            retry: RetryPolicy::default(),
            tick_interval: Duration::from_millis(50),
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single node with `cpus` CPUs
    pub fn single_node(cpus: f64) -> Self {
        Self::new().with_node(NodeConfig::with_cpus("node-0", cpus))
    }

    pub fn with_node(mut self, node: NodeConfig) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_pool(mut self, pool: WorkerPoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_gc(mut self, gc: GcConfig) -> Self {
        self.gc = gc;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Build a single-node configuration from `TESSERA_*` variables
    ///
    /// Environment variables:
    /// - `TESSERA_NODE_ID`: node name (default: node-0)
    /// - `TESSERA_NUM_CPUS`: CPUs on the node (default: 4)
    /// - `TESSERA_NUM_GPUS`: GPUs on the node (default: 0)
    /// - `TESSERA_RESOURCES`: extra resources, e.g. `accel=2,license=1`
    /// - `TESSERA_MAX_ACTIVE_WORKERS`: cap on concurrently active task workers
    /// - `TESSERA_MAX_IDLE_WORKERS`: idle workers kept for reuse
    /// - `TESSERA_GC_HIGH_WATERMARK_BYTES`, `TESSERA_GC_LOW_WATERMARK_BYTES`
    /// - `TESSERA_TICK_INTERVAL_MS`
    pub fn from_env() -> Result<Self, ConfigError> {
        let node_id = env::var("TESSERA_NODE_ID").unwrap_or_else(|_| "node-0".to_string());
        let cpus: f64 = parse_env("TESSERA_NUM_CPUS")?.unwrap_or(4.0);
        let gpus: f64 = parse_env("TESSERA_NUM_GPUS")?.unwrap_or(0.0);

        let mut resources = ResourceRequest::cpu(cpus);
        if gpus > 0.0 {
            resources = resources.with(GPU, gpus);
        }
        if let Ok(custom) = env::var("TESSERA_RESOURCES") {
            for (name, amount) in parse_resource_list(&custom)? {
                resources = resources.with(name, amount);
            }
        }

        let mut config = Self::new().with_node(NodeConfig::new(node_id.as_str(), resources));

        if let Some(max) = parse_env("TESSERA_MAX_ACTIVE_WORKERS")? {
            config.pool = config.pool.with_max_active_workers(max);
        }
        if let Some(max) = parse_env("TESSERA_MAX_IDLE_WORKERS")? {
            config.pool = config.pool.with_max_idle_workers(max);
        }
        if let Some(bytes) = parse_env("TESSERA_GC_HIGH_WATERMARK_BYTES")? {
            config.gc = config.gc.with_high_watermark(bytes);
        }
        if let Some(bytes) = parse_env("TESSERA_GC_LOW_WATERMARK_BYTES")? {
            config.gc = config.gc.with_low_watermark(bytes);
        }
        if let Some(ms) = parse_env("TESSERA_TICK_INTERVAL_MS")? {
            config.tick_interval = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval.is_zero() {
            return Err(ConfigError::Invalid("tick_interval must be non-zero".into()));
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if self.nodes[..i].iter().any(|n| n.id == node.id) {
                return Err(ConfigError::Invalid(format!("duplicate node {}", node.id)));
            }
            for (name, amount) in node.resources.iter() {
                if !amount.is_finite() || amount < 0.0 {
                    return Err(ConfigError::Invalid(format!(
                        "node {} declares invalid {name} quantity {amount}",
                        node.id
                    )));
                }
            }
        }
        self.pool.validate()?;
        self.gc.validate()?;
        Ok(())
    }

    /// Sum of declared CPUs across nodes
    pub fn total_cpus(&self) -> f64 {
        self.nodes
            .iter()
            .filter_map(|n| n.resources.get(CPU))
            .sum()
    }
}

fn parse_env<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                key: key.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

/// Parse `name=amount` pairs separated by commas
fn parse_resource_list(list: &str) -> Result<Vec<(String, f64)>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let invalid = || ConfigError::InvalidEnv {
                key: "TESSERA_RESOURCES".to_string(),
                value: pair.to_string(),
            };
            let (name, amount) = pair.split_once('=').ok_or_else(invalid)?;
            let amount: f64 = amount.trim().parse().map_err(|_| invalid())?;
            Ok((name.trim().to_string(), amount))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SchedulerConfig::default().validate().is_ok());
        assert!(SchedulerConfig::single_node(2.0).validate().is_ok());
    }

    #[test]
    fn test_duplicate_nodes_rejected() {
        let config = SchedulerConfig::new()
            .with_node(NodeConfig::with_cpus("a", 1.0))
            .with_node(NodeConfig::with_cpus("a", 2.0));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_negative_resources_rejected() {
        let config = SchedulerConfig::new().with_node(NodeConfig::with_cpus("a", -1.0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_resource_list() {
        let parsed = parse_resource_list("accel=2, license=0.5,").unwrap();
        assert_eq!(
            parsed,
            vec![("accel".to_string(), 2.0), ("license".to_string(), 0.5)]
        );
        assert!(parse_resource_list("accel").is_err());
        assert!(parse_resource_list("accel=lots").is_err());
    }

    #[test]
    fn test_serde_tick_interval_as_millis() {
        let config = SchedulerConfig::single_node(1.0).with_tick_interval(Duration::from_millis(20));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["tick_interval"], 20);
        let parsed: SchedulerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_total_cpus() {
        let config = SchedulerConfig::new()
            .with_node(NodeConfig::with_cpus("a", 1.5))
            .with_node(NodeConfig::new("b", ResourceRequest::new().with("GPU", 1.0)));
        assert_eq!(config.total_cpus(), 1.5);
    }
}
