//! Per-node resource ledger
//!
//! Tracks `(total, committed)` per node and resource name. Every mutation
//! happens under one lock, so reserve/release pairs are linearizable and a
//! concurrent reservation never observes a transient over-commit.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, trace};

use super::quantity::Quantity;
use super::request::{ResourceRequest, ResourceSet, CPU};
use crate::ids::{LeaseId, NodeId};

/// Ledger errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    /// Node is not registered
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    /// Node registered twice
    #[error("node already registered: {0}")]
    DuplicateNode(NodeId),

    /// Lease does not exist (already released)
    #[error("unknown lease: {0}")]
    UnknownLease(LeaseId),

    /// Request can never be satisfied by this cluster
    #[error("infeasible resource request: {0}")]
    Infeasible(String),

    /// Conservation check failed; indicates a bug
    #[error("ledger invariant violated: {0}")]
    InvariantViolation(String),
}

/// Why a reservation was not granted right now
///
/// This is a flow-control signal: the caller keeps the request queued.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// Not enough of one resource on the node
    Insufficient {
        node: NodeId,
        resource: String,
        requested: Quantity,
        available: Quantity,
    },
    /// The node is not part of the ledger
    UnknownNode(NodeId),
}

#[derive(Debug, Default)]
struct NodeLedger {
    total: ResourceSet,
    committed: ResourceSet,
}

impl NodeLedger {
    fn available(&self, name: &str) -> Quantity {
        self.total.get(name) - self.committed.get(name)
    }

    fn can_hold(&self, set: &ResourceSet) -> bool {
        set.iter().all(|(name, amount)| self.total.get(name) >= amount)
    }

    fn check(&self, node: &NodeId, set: &ResourceSet) -> Result<(), Rejection> {
        for (name, requested) in set.iter() {
            let available = self.available(name);
            if available < requested {
                return Err(Rejection::Insufficient {
                    node: node.clone(),
                    resource: name.to_string(),
                    requested,
                    available,
                });
            }
        }
        Ok(())
    }

    fn commit(&mut self, set: &ResourceSet) {
        for (name, amount) in set.iter() {
            let committed = self.committed.get(name) + amount;
            self.committed.insert(name, committed);
        }
    }

    fn uncommit(&mut self, node: &NodeId, set: &ResourceSet) -> Result<(), LedgerError> {
        // Check everything first so a violation leaves the node untouched.
        for (name, amount) in set.iter() {
            if self.committed.get(name).checked_sub(amount).is_none() {
                return Err(LedgerError::InvariantViolation(format!(
                    "releasing {amount} {name} on {node} but only {} committed",
                    self.committed.get(name)
                )));
            }
        }
        for (name, amount) in set.iter() {
            let remaining = self.committed.get(name) - amount;
            self.committed.insert(name, remaining);
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Lease {
    node: NodeId,
    held: ResourceSet,
    suspended: Quantity,
}

#[derive(Debug, Default)]
struct LedgerState {
    nodes: BTreeMap<NodeId, NodeLedger>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: u64,
}

impl LedgerState {
    fn grant(&mut self, node: &NodeId, set: &ResourceSet) -> Result<LeaseId, Rejection> {
        let ledger = self
            .nodes
            .get_mut(node)
            .ok_or_else(|| Rejection::UnknownNode(node.clone()))?;
        ledger.check(node, set)?;
        ledger.commit(set);

        self.next_lease += 1;
        let id = LeaseId::new(self.next_lease);
        self.leases.insert(
            id,
            Lease {
                node: node.clone(),
                held: set.clone(),
                suspended: Quantity::ZERO,
            },
        );
        Ok(id)
    }
}

/// Fixed-point resource ledger for every node in the cluster
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tessera_scheduler::ids::NodeId;
/// use tessera_scheduler::resources::{Quantity, ResourceLedger, ResourceSet};
///
/// let ledger = Arc::new(ResourceLedger::new());
/// let node = NodeId::new("node-0");
/// ledger
///     .add_node(node.clone(), ResourceSet::new().with("CPU", Quantity::from_f64(2.0).unwrap()))
///     .unwrap();
///
/// let lease = ledger
///     .try_reserve(&node, &ResourceSet::new().with("CPU", Quantity::from_f64(0.3).unwrap()))
///     .unwrap();
/// assert_eq!(ledger.available_total()["CPU"], 1.7);
/// drop(lease);
/// assert_eq!(ledger.available_total()["CPU"], 2.0);
/// ```
#[derive(Debug, Default)]
pub struct ResourceLedger {
    state: Mutex<LedgerState>,
    release_signal: Option<Arc<Notify>>,
}

impl ResourceLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Notify `signal` whenever resources return to a node
    pub fn with_release_signal(mut self, signal: Arc<Notify>) -> Self {
        self.release_signal = Some(signal);
        self
    }

    /// Register a node with its total capacity
    pub fn add_node(&self, node: NodeId, total: ResourceSet) -> Result<(), LedgerError> {
        let mut state = self.state.lock();
        if state.nodes.contains_key(&node) {
            return Err(LedgerError::DuplicateNode(node));
        }
        debug!(%node, %total, "registering node");
        state.nodes.insert(
            node,
            NodeLedger {
                total,
                committed: ResourceSet::new(),
            },
        );
        drop(state);
        self.signal_release();
        Ok(())
    }

    /// Registered nodes in id order
    pub fn nodes(&self) -> Vec<NodeId> {
        self.state.lock().nodes.keys().cloned().collect()
    }

    /// Validate a caller request against the configured totals
    ///
    /// Rejects unknown resource names, negative or non-finite quantities, and
    /// requests that no single node could ever hold.
    pub fn validate(&self, request: &ResourceRequest) -> Result<ResourceSet, LedgerError> {
        let state = self.state.lock();
        let mut set = ResourceSet::new();

        for (name, amount) in request.iter() {
            let known = state
                .nodes
                .values()
                .any(|n| !n.total.get(name).is_zero());
            if !known {
                return Err(LedgerError::Infeasible(format!(
                    "unknown resource {name}"
                )));
            }
            let quantity = Quantity::from_f64(amount).ok_or_else(|| {
                LedgerError::Infeasible(format!("invalid quantity {amount} for {name}"))
            })?;
            set.insert(name, quantity);
        }

        if !set.is_empty() && !state.nodes.values().any(|n| n.can_hold(&set)) {
            return Err(LedgerError::Infeasible(format!(
                "{set} exceeds the capacity of every node"
            )));
        }

        Ok(set)
    }

    /// Reserve `set` on `node`, all-or-nothing
    pub fn try_reserve(
        self: &Arc<Self>,
        node: &NodeId,
        set: &ResourceSet,
    ) -> Result<LeaseGuard, Rejection> {
        let id = self.state.lock().grant(node, set)?;
        trace!(%node, %id, %set, "lease granted");
        Ok(LeaseGuard::new(Arc::clone(self), id, node.clone()))
    }

    /// Reserve `set` on the preferred node, spilling to the others in id order
    pub fn reserve_any(
        self: &Arc<Self>,
        preferred: Option<&NodeId>,
        set: &ResourceSet,
    ) -> Option<LeaseGuard> {
        let mut state = self.state.lock();
        let mut order: Vec<NodeId> = Vec::with_capacity(state.nodes.len());
        if let Some(node) = preferred {
            if state.nodes.contains_key(node) {
                order.push(node.clone());
            }
        }
        order.extend(
            state
                .nodes
                .keys()
                .filter(|n| Some(*n) != preferred)
                .cloned(),
        );

        for node in order {
            if let Ok(id) = state.grant(&node, set) {
                trace!(%node, %id, %set, "lease granted");
                return Some(LeaseGuard::new(Arc::clone(self), id, node));
            }
        }
        None
    }

    /// Release a lease, restoring exactly what it still holds
    pub fn release(&self, lease: LeaseId) -> Result<ResourceSet, LedgerError> {
        let mut state = self.state.lock();
        let entry = state
            .leases
            .remove(&lease)
            .ok_or(LedgerError::UnknownLease(lease))?;
        let node = state
            .nodes
            .get_mut(&entry.node)
            .ok_or_else(|| LedgerError::InvariantViolation(format!(
                "{lease} references unknown node {}",
                entry.node
            )))?;
        node.uncommit(&entry.node, &entry.held)?;
        drop(state);

        trace!(%lease, released = %entry.held, "lease released");
        self.signal_release();
        Ok(entry.held)
    }

    /// Return the CPU share of a lease while its holder is blocked
    ///
    /// Returns the amount released; zero if nothing was held or the share is
    /// already suspended.
    pub fn suspend_cpu(&self, lease: LeaseId) -> Result<Quantity, LedgerError> {
        let mut state = self.state.lock();
        let LedgerState { nodes, leases, .. } = &mut *state;
        let entry = leases.get_mut(&lease).ok_or(LedgerError::UnknownLease(lease))?;
        let cpu = entry.held.get(CPU);
        if cpu.is_zero() {
            return Ok(Quantity::ZERO);
        }
        let node = nodes.get_mut(&entry.node).ok_or_else(|| {
            LedgerError::InvariantViolation(format!("{lease} references unknown node"))
        })?;
        node.uncommit(&entry.node, &ResourceSet::new().with(CPU, cpu))?;
        entry.held.take(CPU);
        entry.suspended = cpu;
        drop(state);

        self.signal_release();
        Ok(cpu)
    }

    /// Re-reserve a suspended CPU share
    ///
    /// Returns `Ok(false)` when the node cannot hold it yet.
    pub fn try_resume_cpu(&self, lease: LeaseId) -> Result<bool, LedgerError> {
        let mut state = self.state.lock();
        let LedgerState { nodes, leases, .. } = &mut *state;
        let entry = leases.get_mut(&lease).ok_or(LedgerError::UnknownLease(lease))?;
        if entry.suspended.is_zero() {
            return Ok(true);
        }
        let node = nodes.get_mut(&entry.node).ok_or_else(|| {
            LedgerError::InvariantViolation(format!("{lease} references unknown node"))
        })?;
        let share = ResourceSet::new().with(CPU, entry.suspended);
        if node.check(&entry.node, &share).is_err() {
            return Ok(false);
        }
        node.commit(&share);
        entry.held.insert(CPU, entry.suspended);
        entry.suspended = Quantity::ZERO;
        Ok(true)
    }

    /// Currently available quantities on one node
    pub fn available(&self, node: &NodeId) -> Option<BTreeMap<String, f64>> {
        let state = self.state.lock();
        let ledger = state.nodes.get(node)?;
        Some(
            ledger
                .total
                .iter()
                .map(|(name, _)| (name.to_string(), ledger.available(name).as_f64()))
                .collect(),
        )
    }

    /// Available quantities summed across nodes
    pub fn available_total(&self) -> BTreeMap<String, f64> {
        let state = self.state.lock();
        let mut totals: BTreeMap<String, Quantity> = BTreeMap::new();
        for ledger in state.nodes.values() {
            for (name, _) in ledger.total.iter() {
                *totals.entry(name.to_string()).or_default() += ledger.available(name);
            }
        }
        totals.into_iter().map(|(k, v)| (k, v.as_f64())).collect()
    }

    /// Configured totals summed across nodes
    pub fn totals(&self) -> BTreeMap<String, f64> {
        let state = self.state.lock();
        let mut totals: BTreeMap<String, Quantity> = BTreeMap::new();
        for ledger in state.nodes.values() {
            for (name, amount) in ledger.total.iter() {
                *totals.entry(name.to_string()).or_default() += amount;
            }
        }
        totals.into_iter().map(|(k, v)| (k, v.as_f64())).collect()
    }

    /// Number of outstanding leases
    pub fn lease_count(&self) -> usize {
        self.state.lock().leases.len()
    }

    /// Check conservation: `committed == Σ leases` and `committed <= total`
    pub fn verify(&self) -> Result<(), LedgerError> {
        let state = self.state.lock();
        let mut expected: BTreeMap<&NodeId, BTreeMap<&str, Quantity>> = BTreeMap::new();
        for lease in state.leases.values() {
            let per_node = expected.entry(&lease.node).or_default();
            for (name, amount) in lease.held.iter() {
                *per_node.entry(name).or_default() += amount;
            }
        }

        for (node_id, ledger) in &state.nodes {
            let leased = expected.remove(node_id).unwrap_or_default();
            for (name, committed) in ledger.committed.iter() {
                let sum = leased.get(name).copied().unwrap_or_default();
                if sum != committed {
                    return Err(LedgerError::InvariantViolation(format!(
                        "{node_id}: committed {committed} {name} but leases hold {sum}"
                    )));
                }
                if committed > ledger.total.get(name) {
                    return Err(LedgerError::InvariantViolation(format!(
                        "{node_id}: committed {committed} {name} exceeds total {}",
                        ledger.total.get(name)
                    )));
                }
            }
            for (name, sum) in leased {
                if ledger.committed.get(name) != sum {
                    return Err(LedgerError::InvariantViolation(format!(
                        "{node_id}: leases hold {sum} {name} but nothing committed"
                    )));
                }
            }
        }

        if let Some((node_id, _)) = expected.into_iter().next() {
            return Err(LedgerError::InvariantViolation(format!(
                "leases reference unknown node {node_id}"
            )));
        }
        Ok(())
    }

    fn signal_release(&self) {
        if let Some(signal) = &self.release_signal {
            signal.notify_one();
        }
    }
}

/// Scoped ownership of a ledger lease
///
/// The lease is released when the guard is dropped, so every exit path
/// (completion, error, panic, cancellation) returns the resources.
#[derive(Debug)]
pub struct LeaseGuard {
    ledger: Arc<ResourceLedger>,
    id: LeaseId,
    node: NodeId,
    released: bool,
}

impl LeaseGuard {
    fn new(ledger: Arc<ResourceLedger>, id: LeaseId, node: NodeId) -> Self {
        Self {
            ledger,
            id,
            node,
            released: false,
        }
    }

    pub fn id(&self) -> LeaseId {
        self.id
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Release now and report what was returned
    pub fn release(mut self) -> Result<ResourceSet, LedgerError> {
        self.released = true;
        self.ledger.release(self.id)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match self.ledger.release(self.id) {
            Ok(_) => {}
            Err(LedgerError::InvariantViolation(message)) => {
                crate::error::abort_on_invariant_violation(&message)
            }
            Err(e) => error!(lease = %self.id, "failed to release lease: {}", e),
        }
    }
}
