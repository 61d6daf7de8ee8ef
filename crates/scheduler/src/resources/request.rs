//! Resource requests and fixed-point resource sets

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::quantity::Quantity;

/// Well-known CPU resource label
pub const CPU: &str = "CPU";

/// Well-known GPU resource label
pub const GPU: &str = "GPU";

/// Well-known memory resource label
pub const MEMORY: &str = "memory";

/// A caller-facing resource request
///
/// Maps resource names (`CPU`, `GPU` or a custom label) to non-negative
/// fractional quantities. Validation against the cluster happens at
/// submission time, see [`super::ResourceLedger::validate`].
///
/// # Example
///
/// ```
/// use tessera_scheduler::resources::ResourceRequest;
///
/// let request = ResourceRequest::cpu(0.5).with("GPU", 1.0).with("Custom", 0.25);
/// assert_eq!(request.get("GPU"), Some(1.0));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceRequest {
    demands: BTreeMap<String, f64>,
}

impl ResourceRequest {
    /// An empty request (schedulable anywhere)
    pub fn new() -> Self {
        Self::default()
    }

    /// A request for `amount` CPUs
    pub fn cpu(amount: f64) -> Self {
        Self::new().with(CPU, amount)
    }

    /// Add or replace a named demand
    pub fn with(mut self, name: impl Into<String>, amount: f64) -> Self {
        self.demands.insert(name.into(), amount);
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.demands.get(name).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.demands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.demands.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for ResourceRequest {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        Self {
            demands: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// A validated, fixed-point set of resource quantities
///
/// Zero-valued entries are never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceSet {
    amounts: BTreeMap<String, Quantity>,
}

impl ResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a quantity, dropping the entry when it is zero
    pub fn insert(&mut self, name: impl Into<String>, amount: Quantity) {
        let name = name.into();
        if amount.is_zero() {
            self.amounts.remove(&name);
        } else {
            self.amounts.insert(name, amount);
        }
    }

    pub fn with(mut self, name: impl Into<String>, amount: Quantity) -> Self {
        self.insert(name, amount);
        self
    }

    pub fn get(&self, name: &str) -> Quantity {
        self.amounts.get(name).copied().unwrap_or(Quantity::ZERO)
    }

    pub fn is_empty(&self) -> bool {
        self.amounts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Quantity)> {
        self.amounts.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Remove and return the named entry
    pub fn take(&mut self, name: &str) -> Quantity {
        self.amounts.remove(name).unwrap_or(Quantity::ZERO)
    }

    /// Floating-point view for reporting
    pub fn to_f64_map(&self) -> BTreeMap<String, f64> {
        self.amounts
            .iter()
            .map(|(k, v)| (k.clone(), v.as_f64()))
            .collect()
    }
}

impl fmt::Display for ResourceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, amount)) in self.amounts.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}: {amount}")?;
        }
        write!(f, "}}")
    }
}
