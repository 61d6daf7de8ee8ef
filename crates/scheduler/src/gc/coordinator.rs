//! Edge-triggered collection broadcast

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::duration_serde::millis;
use crate::error::ConfigError;
use crate::ids::WorkerId;

/// GC trigger configuration
///
/// The watermark applies to the cluster aggregate: object store bytes plus
/// every worker's reported heap plus any externally reported usage.
///
/// # Example
///
/// ```
/// use tessera_scheduler::gc::GcConfig;
///
/// let config = GcConfig::default()
///     .with_high_watermark(512 * 1024 * 1024)
///     .with_low_watermark(384 * 1024 * 1024);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GcConfig {
    pub enabled: bool,

    /// Crossing this many bytes triggers one broadcast
    pub high_watermark_bytes: u64,

    /// Dropping to this level re-arms the trigger; defaults to the high watermark
    pub low_watermark_bytes: Option<u64>,

    /// How long a round waits for worker reports
    #[serde(with = "millis")]
    pub collection_timeout: Duration,

    /// Completed rounds kept for inspection
    pub history_limit: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            high_watermark_bytes: 1024 * 1024 * 1024,
            low_watermark_bytes: None,
            collection_timeout: Duration::from_secs(5),
            history_limit: 32,
        }
    }
}

impl GcConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_high_watermark(mut self, bytes: u64) -> Self {
        self.high_watermark_bytes = bytes;
        self
    }

    pub fn with_low_watermark(mut self, bytes: u64) -> Self {
        self.low_watermark_bytes = Some(bytes);
        self
    }

    pub fn with_collection_timeout(mut self, timeout: Duration) -> Self {
        self.collection_timeout = timeout;
        self
    }

    /// Level at which the trigger re-arms
    pub fn rearm_level(&self) -> u64 {
        self.low_watermark_bytes.unwrap_or(self.high_watermark_bytes)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.high_watermark_bytes == 0 {
            return Err(ConfigError::Invalid(
                "gc high_watermark_bytes must be positive".into(),
            ));
        }
        if self.rearm_level() > self.high_watermark_bytes {
            return Err(ConfigError::Invalid(
                "gc low_watermark_bytes must not exceed high_watermark_bytes".into(),
            ));
        }
        Ok(())
    }
}

/// Aggregate memory usage sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub object_store_bytes: u64,
    pub worker_heap_bytes: u64,
    pub external_bytes: u64,
}

impl MemoryUsage {
    pub fn total(&self) -> u64 {
        self.object_store_bytes
            .saturating_add(self.worker_heap_bytes)
            .saturating_add(self.external_bytes)
    }
}

/// What an observation did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDecision {
    /// Crossed the watermark; a broadcast was started
    Triggered { round: u64 },
    /// Above the watermark while a round is in flight
    Coalesced,
    /// Still above the watermark since the last trigger
    AlreadyTriggered,
    /// Below the watermark
    BelowWatermark,
    Disabled,
}

/// One worker's answer to a collection request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionReport {
    pub worker: WorkerId,
    /// Whether the pass reclaimed anything
    pub reclaimed: bool,
}

/// A completed collection round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRound {
    pub round: u64,
    pub trigger_bytes: u64,
    /// Workers the request was sent to
    pub workers: usize,
    /// Reports received before the timeout
    pub reports: usize,
    /// Reports that reclaimed something
    pub reclaimed: usize,
    pub timed_out: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Something that can broadcast a collection request to its live workers
pub trait CollectionTarget: Send + Sync {
    /// Send one request to every live worker and return the reply channels
    fn request_collection(&self) -> Vec<oneshot::Receiver<CollectionReport>>;
}

#[derive(Debug)]
struct TriggerState {
    armed: bool,
    in_flight: bool,
    rounds_started: u64,
    history: VecDeque<CollectionRound>,
}

/// Debounced GC trigger
///
/// Implements hysteresis like a backpressure gate: the first observation at
/// or above the high watermark fires a broadcast and disarms the trigger;
/// it re-arms only once usage falls to the low watermark. Observations while
/// a round is in flight are coalesced.
pub struct GcCoordinator {
    config: GcConfig,
    target: Arc<dyn CollectionTarget>,
    state: Mutex<TriggerState>,
    completed: watch::Sender<u64>,
}

impl GcCoordinator {
    pub fn new(config: GcConfig, target: Arc<dyn CollectionTarget>) -> Self {
        let (completed, _) = watch::channel(0);
        Self {
            config,
            target,
            state: Mutex::new(TriggerState {
                armed: true,
                in_flight: false,
                rounds_started: 0,
                history: VecDeque::new(),
            }),
            completed,
        }
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Feed one memory sample; may start a collection round
    ///
    /// Must be called from within a tokio runtime.
    pub fn observe(self: &Arc<Self>, usage: MemoryUsage) -> TriggerDecision {
        if !self.config.enabled {
            return TriggerDecision::Disabled;
        }

        let total = usage.total();
        let round = {
            let mut state = self.state.lock();
            if total < self.config.high_watermark_bytes {
                if total <= self.config.rearm_level() && !state.armed {
                    debug!(total, "gc trigger re-armed");
                    state.armed = true;
                }
                return TriggerDecision::BelowWatermark;
            }
            if state.in_flight {
                return TriggerDecision::Coalesced;
            }
            if !state.armed {
                return TriggerDecision::AlreadyTriggered;
            }
            state.armed = false;
            state.in_flight = true;
            state.rounds_started += 1;
            state.rounds_started
        };

        info!(
            round,
            total,
            high_watermark = self.config.high_watermark_bytes,
            "memory above high watermark, broadcasting collection request"
        );
        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.run_round(round, total).await });
        TriggerDecision::Triggered { round }
    }

    /// Feed a sample taken after memory was freed
    ///
    /// Only ever re-arms the trigger, so it is safe outside a runtime (drop
    /// paths). Returns whether the trigger was re-armed.
    pub fn observe_release(&self, usage: MemoryUsage) -> bool {
        if !self.config.enabled {
            return false;
        }
        let total = usage.total();
        let mut state = self.state.lock();
        if total <= self.config.rearm_level() && !state.armed {
            debug!(total, "gc trigger re-armed after release");
            state.armed = true;
            return true;
        }
        false
    }

    async fn run_round(&self, round: u64, trigger_bytes: u64) {
        let started_at = Utc::now();
        let receivers = self.target.request_collection();
        let workers = receivers.len();
        let mut pending: FuturesUnordered<_> = receivers.into_iter().collect();

        let mut reports = 0;
        let mut reclaimed = 0;
        let deadline = tokio::time::Instant::now() + self.config.collection_timeout;
        let mut timed_out = false;

        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some(Ok(report))) => {
                    reports += 1;
                    if report.reclaimed {
                        reclaimed += 1;
                    }
                }
                // Worker exited before answering
                Ok(Some(Err(_))) => {}
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }

        if timed_out {
            warn!(round, workers, reports, "collection round timed out");
        } else {
            debug!(round, workers, reclaimed, "collection round complete");
        }

        {
            let mut state = self.state.lock();
            state.in_flight = false;
            state.history.push_back(CollectionRound {
                round,
                trigger_bytes,
                workers,
                reports,
                reclaimed,
                timed_out,
                started_at,
                completed_at: Utc::now(),
            });
            while state.history.len() > self.config.history_limit {
                state.history.pop_front();
            }
        }
        self.completed.send_replace(round);
    }

    /// Number of broadcasts started so far
    pub fn broadcast_count(&self) -> u64 {
        self.state.lock().rounds_started
    }

    pub fn is_armed(&self) -> bool {
        self.state.lock().armed
    }

    pub fn in_flight(&self) -> bool {
        self.state.lock().in_flight
    }

    /// Completed rounds, oldest first
    pub fn history(&self) -> Vec<CollectionRound> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// Wait until at least `rounds` rounds have completed
    pub async fn wait_for_rounds(&self, rounds: u64) {
        let mut rx = self.completed.subscribe();
        let _ = rx.wait_for(|completed| *completed >= rounds).await;
    }
}
