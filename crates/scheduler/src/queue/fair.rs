//! Depth-laned fair admission queue

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::resources::ResourceSet;

/// Lane a queued entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LaneKey {
    /// CPU re-reservations for workers returning from a blocking `get`/`wait`
    Resume,
    /// Work submitted at the given call depth (0 = driver)
    Depth(u32),
}

impl fmt::Display for LaneKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaneKey::Resume => f.write_str("resume"),
            LaneKey::Depth(d) => write!(f, "depth-{d}"),
        }
    }
}

/// Stable identifier of a queued entry; also its global sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(u64);

/// A queued item with its fairness metadata
#[derive(Debug)]
pub struct QueueEntry<T> {
    pub id: EntryId,
    pub lane: LaneKey,
    /// Resource shape, used for reporting and head-of-line skipping
    pub shape: ResourceSet,
    pub enqueued_at: Instant,
    pub deadline: Option<Instant>,
    pub item: T,
}

/// Outcome of offering an entry for admission
#[derive(Debug)]
pub enum Decision<G> {
    /// Admitted; `G` is whatever the admission produced (usually a lease)
    Admit(G),
    /// Not admissible right now; keep it in place
    Retain,
    /// Entry is obsolete (e.g. cancelled); remove it without serving the lane
    Drop,
}

/// Everything one scheduling tick produced
#[derive(Debug)]
pub struct Tick<T, G> {
    pub admitted: Vec<(QueueEntry<T>, G)>,
    pub expired: Vec<QueueEntry<T>>,
    pub dropped: Vec<QueueEntry<T>>,
}

impl<T, G> Default for Tick<T, G> {
    fn default() -> Self {
        Self {
            admitted: Vec::new(),
            expired: Vec::new(),
            dropped: Vec::new(),
        }
    }
}

impl<T, G> Tick<T, G> {
    pub fn is_empty(&self) -> bool {
        self.admitted.is_empty() && self.expired.is_empty() && self.dropped.is_empty()
    }
}

/// Queued demand for one resource shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeLoad {
    pub shape: BTreeMap<String, f64>,
    pub queued: usize,
}

struct Lane<T> {
    entries: VecDeque<QueueEntry<T>>,
    last_served: u64,
}

impl<T> Default for Lane<T> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
            last_served: 0,
        }
    }
}

/// Per-lane scan state within one tick
#[derive(Default)]
struct LaneCursor {
    from: usize,
    blocked: Vec<ResourceSet>,
    exhausted: bool,
}

/// Fair queue with one FIFO lane per call depth
///
/// Each tick repeatedly offers work from the non-empty lane served least
/// recently (ties go to the deeper lane), re-ranking after every admission.
/// The [`LaneKey::Resume`] lane always goes first. Within a lane entries are
/// offered in submission order; a retained entry keeps its position and
/// blocks later entries of the same shape for the rest of the tick, so two
/// equally admissible entries in one lane are always admitted in order.
pub struct FairQueue<T> {
    lanes: BTreeMap<LaneKey, Lane<T>>,
    next_id: u64,
    clock: u64,
    with_deadline: usize,
    len: usize,
}

impl<T> Default for FairQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FairQueue<T> {
    pub fn new() -> Self {
        Self {
            lanes: BTreeMap::new(),
            next_id: 0,
            clock: 0,
            with_deadline: 0,
            len: 0,
        }
    }

    /// Append an entry to the tail of its lane
    pub fn push(
        &mut self,
        lane: LaneKey,
        shape: ResourceSet,
        deadline: Option<Instant>,
        item: T,
    ) -> EntryId {
        self.next_id += 1;
        let id = EntryId(self.next_id);
        if deadline.is_some() {
            self.with_deadline += 1;
        }
        self.lanes.entry(lane).or_default().entries.push_back(QueueEntry {
            id,
            lane,
            shape,
            enqueued_at: Instant::now(),
            deadline,
            item,
        });
        self.len += 1;
        id
    }

    /// Remove a queued entry, e.g. on cancellation
    pub fn remove(&mut self, id: EntryId) -> Option<QueueEntry<T>> {
        for lane in self.lanes.values_mut() {
            // Ids are assigned monotonically, so every lane is sorted by id.
            if let Ok(index) = lane.entries.binary_search_by_key(&id, |e| e.id) {
                let entry = lane.entries.remove(index)?;
                self.forget(&entry);
                return Some(entry);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Non-empty lanes and their lengths
    pub fn lane_lengths(&self) -> Vec<(LaneKey, usize)> {
        self.lanes
            .iter()
            .filter(|(_, lane)| !lane.entries.is_empty())
            .map(|(key, lane)| (*key, lane.entries.len()))
            .collect()
    }

    /// Queued depth-lane demand grouped by resource shape
    ///
    /// Resume tickets are not new work and are left out.
    pub fn load_by_shape(&self) -> Vec<ShapeLoad> {
        let mut counts: BTreeMap<&ResourceSet, usize> = BTreeMap::new();
        for (key, lane) in &self.lanes {
            if *key == LaneKey::Resume {
                continue;
            }
            for entry in &lane.entries {
                *counts.entry(&entry.shape).or_default() += 1;
            }
        }
        counts
            .into_iter()
            .map(|(shape, queued)| ShapeLoad {
                shape: shape.to_f64_map(),
                queued,
            })
            .collect()
    }

    /// Iterate over every queued entry, lane by lane
    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry<T>> {
        self.lanes.values().flat_map(|lane| lane.entries.iter())
    }

    /// Run one scheduling tick
    ///
    /// Expired entries are removed first. Then entries are offered to
    /// `decide` until no lane can make progress.
    pub fn schedule<G, F>(&mut self, now: Instant, mut decide: F) -> Tick<T, G>
    where
        F: FnMut(&QueueEntry<T>) -> Decision<G>,
    {
        let mut tick = Tick::default();
        if self.with_deadline > 0 {
            self.expire(now, &mut tick.expired);
        }

        let mut cursors: HashMap<LaneKey, LaneCursor> = HashMap::new();

        while let Some(key) = self.next_lane(&cursors) {
            let cursor = cursors.entry(key).or_default();
            let Some(lane) = self.lanes.get_mut(&key) else {
                cursor.exhausted = true;
                continue;
            };

            let Some(index) = (cursor.from..lane.entries.len())
                .find(|i| !cursor.blocked.contains(&lane.entries[*i].shape))
            else {
                cursor.exhausted = true;
                continue;
            };

            match decide(&lane.entries[index]) {
                Decision::Admit(grant) => {
                    let Some(entry) = lane.entries.remove(index) else {
                        cursor.exhausted = true;
                        continue;
                    };
                    self.clock += 1;
                    lane.last_served = self.clock;
                    cursor.from = index;
                    self.forget(&entry);
                    tick.admitted.push((entry, grant));
                }
                Decision::Retain => {
                    cursor.blocked.push(lane.entries[index].shape.clone());
                    cursor.from = index + 1;
                }
                Decision::Drop => {
                    if let Some(entry) = lane.entries.remove(index) {
                        cursor.from = index;
                        self.forget(&entry);
                        tick.dropped.push(entry);
                    }
                }
            }
        }

        self.lanes.retain(|key, lane| {
            // Depth lanes keep their service history while empty so a lane
            // that drains and refills does not jump ahead of older lanes.
            *key != LaneKey::Resume || !lane.entries.is_empty()
        });
        tick
    }

    /// Pick the next lane to offer from, or `None` when the tick is done
    fn next_lane(&self, cursors: &HashMap<LaneKey, LaneCursor>) -> Option<LaneKey> {
        let open = |key: &LaneKey, lane: &Lane<T>| {
            !lane.entries.is_empty() && !cursors.get(key).is_some_and(|c| c.exhausted)
        };

        if let Some(lane) = self.lanes.get(&LaneKey::Resume) {
            if open(&LaneKey::Resume, lane) {
                return Some(LaneKey::Resume);
            }
        }

        self.lanes
            .iter()
            .filter(|(key, lane)| **key != LaneKey::Resume && open(key, lane))
            .min_by_key(|(key, lane)| {
                let depth = match key {
                    LaneKey::Depth(d) => *d,
                    LaneKey::Resume => 0,
                };
                (lane.last_served, Reverse(depth))
            })
            .map(|(key, _)| *key)
    }

    fn expire(&mut self, now: Instant, expired: &mut Vec<QueueEntry<T>>) {
        for lane in self.lanes.values_mut() {
            let mut index = 0;
            while index < lane.entries.len() {
                if lane.entries[index].deadline.is_some_and(|d| d <= now) {
                    if let Some(entry) = lane.entries.remove(index) {
                        expired.push(entry);
                    }
                } else {
                    index += 1;
                }
            }
        }
        for entry in expired.iter() {
            self.forget(entry);
        }
    }

    fn forget(&mut self, entry: &QueueEntry<T>) {
        self.len -= 1;
        if entry.deadline.is_some() {
            self.with_deadline -= 1;
        }
    }
}

impl<T> fmt::Debug for FairQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FairQueue")
            .field("len", &self.len)
            .field("lanes", &self.lane_lengths())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::resources::Quantity;

    fn cpu(v: f64) -> ResourceSet {
        ResourceSet::new().with("CPU", Quantity::from_f64(v).unwrap())
    }

    fn admit_all(queue: &mut FairQueue<&'static str>) -> Vec<&'static str> {
        queue
            .schedule(Instant::now(), |_| Decision::Admit(()))
            .admitted
            .into_iter()
            .map(|(e, _)| e.item)
            .collect()
    }

    #[test]
    fn test_fifo_within_lane() {
        let mut queue = FairQueue::new();
        queue.push(LaneKey::Depth(0), cpu(1.0), None, "a");
        queue.push(LaneKey::Depth(0), cpu(1.0), None, "b");
        queue.push(LaneKey::Depth(0), cpu(1.0), None, "c");

        assert_eq!(admit_all(&mut queue), vec!["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_lanes_are_served_round_robin() {
        let mut queue = FairQueue::new();
        for item in ["f1", "f2", "f3"] {
            queue.push(LaneKey::Depth(0), cpu(1.0), None, item);
        }
        for item in ["g1", "g2"] {
            queue.push(LaneKey::Depth(1), cpu(1.0), None, item);
        }

        // Unserved lanes tie; the deeper lane goes first, then alternate.
        assert_eq!(admit_all(&mut queue), vec!["g1", "f1", "g2", "f2", "f3"]);
    }

    #[test]
    fn test_one_slot_per_tick_interleaves_lanes() {
        let mut queue = FairQueue::new();
        for item in ["f1", "f2"] {
            queue.push(LaneKey::Depth(0), cpu(1.0), None, item);
        }

        let mut slots = 1;
        let mut take_one = |_: &QueueEntry<&str>| {
            if slots > 0 {
                slots -= 1;
                Decision::Admit(())
            } else {
                Decision::Retain
            }
        };
        let first = queue.schedule(Instant::now(), &mut take_one);
        assert_eq!(first.admitted[0].0.item, "f1");

        // f1 spawned a child; the child lane has never been served.
        queue.push(LaneKey::Depth(1), cpu(1.0), None, "g1");
        let second = queue.schedule(Instant::now(), |_| Decision::Admit(()));
        assert_eq!(second.admitted[0].0.item, "g1");
    }

    #[test]
    fn test_resume_lane_goes_first() {
        let mut queue = FairQueue::new();
        queue.push(LaneKey::Depth(2), cpu(1.0), None, "h1");
        queue.push(LaneKey::Resume, cpu(1.0), None, "resume-g1");

        assert_eq!(admit_all(&mut queue), vec!["resume-g1", "h1"]);
    }

    #[test]
    fn test_retained_head_keeps_position() {
        let mut queue = FairQueue::new();
        queue.push(LaneKey::Depth(0), cpu(2.0), None, "big");
        queue.push(LaneKey::Depth(0), cpu(2.0), None, "big-2");

        let tick = queue.schedule(Instant::now(), |_: &QueueEntry<&str>| {
            Decision::<()>::Retain
        });
        assert!(tick.admitted.is_empty());
        assert_eq!(queue.len(), 2);

        assert_eq!(admit_all(&mut queue), vec!["big", "big-2"]);
    }

    #[test]
    fn test_other_shapes_pass_a_blocked_head() {
        let mut queue = FairQueue::new();
        queue.push(LaneKey::Depth(0), cpu(4.0), None, "large");
        queue.push(LaneKey::Depth(0), cpu(4.0), None, "large-2");
        queue.push(LaneKey::Depth(0), cpu(1.0), None, "small");

        let tick = queue.schedule(Instant::now(), |entry: &QueueEntry<&str>| {
            if entry.shape == cpu(1.0) {
                Decision::Admit(())
            } else {
                Decision::Retain
            }
        });
        let admitted: Vec<_> = tick.admitted.into_iter().map(|(e, _)| e.item).collect();
        assert_eq!(admitted, vec!["small"]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_drop_and_remove() {
        let mut queue = FairQueue::new();
        let a = queue.push(LaneKey::Depth(0), cpu(1.0), None, "a");
        queue.push(LaneKey::Depth(0), cpu(1.0), None, "b");
        queue.push(LaneKey::Depth(1), cpu(1.0), None, "c");

        assert_eq!(queue.remove(a).map(|e| e.item), Some("a"));
        assert!(queue.remove(a).is_none());

        let tick = queue.schedule(Instant::now(), |entry: &QueueEntry<&str>| {
            if entry.item == "c" {
                Decision::Drop
            } else {
                Decision::Admit(())
            }
        });
        assert_eq!(tick.dropped.len(), 1);
        assert_eq!(tick.admitted.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_expired_entries_are_surfaced() {
        let mut queue = FairQueue::new();
        let now = Instant::now();
        queue.push(LaneKey::Depth(0), cpu(1.0), Some(now), "late");
        queue.push(
            LaneKey::Depth(0),
            cpu(1.0),
            Some(now + Duration::from_secs(60)),
            "on-time",
        );

        let tick = queue.schedule(now, |_: &QueueEntry<&str>| Decision::<()>::Retain);
        assert_eq!(tick.expired.len(), 1);
        assert_eq!(tick.expired[0].item, "late");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_load_by_shape() {
        let mut queue = FairQueue::new();
        queue.push(LaneKey::Depth(0), cpu(1.0), None, "a");
        queue.push(LaneKey::Depth(1), cpu(1.0), None, "b");
        queue.push(LaneKey::Depth(0), cpu(0.5), None, "c");
        queue.push(LaneKey::Resume, cpu(1.0), None, "resume");

        let load = queue.load_by_shape();
        assert_eq!(load.len(), 2);
        let one_cpu = load.iter().find(|l| l.shape["CPU"] == 1.0).unwrap();
        assert_eq!(one_cpu.queued, 2);
    }
}
