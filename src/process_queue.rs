//! `ProcessQueue` — per-(uid, process) delivery state: a pending pool plus
//! at most one active dispatch, linked into the runnable list and (when
//! dispatching) the running set.
//!
//! Grounded on `ob-workflow::task_queue::TaskQueue` (per-key queue state
//! machine with a bounded number of concurrently-active slots) and
//! `sem_os_core::ports` for the uid/name key pattern used instead of a raw
//! pointer or handle.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::record::{BroadcastId, Uid};

/// Four priority lanes a pending broadcast can land in (spec.md §4.2).
/// Ordinal order is delivery priority: urgent drains before high, etc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PriorityLane {
    Urgent,
    High,
    Normal,
    Offload,
}

impl PriorityLane {
    pub const ALL: [PriorityLane; 4] = [
        PriorityLane::Urgent,
        PriorityLane::High,
        PriorityLane::Normal,
        PriorityLane::Offload,
    ];
}

/// Stable key for a process queue: one per (uid, process name) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessQueueKey {
    pub uid: Uid,
    pub process_name: String,
}

impl fmt::Display for ProcessQueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.uid, self.process_name)
    }
}

/// Reference into a `BroadcastRecord`'s receiver array, held instead of an
/// owned copy since multiple process queues can reference the same record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverRef {
    pub broadcast_id: BroadcastId,
    pub receiver_index: usize,
}

/// Four `VecDeque` lanes, drained strictly in `PriorityLane` order.
#[derive(Debug, Default)]
pub struct PendingPool {
    lanes: [VecDeque<ReceiverRef>; 4],
}

impl PendingPool {
    pub fn push_back(&mut self, lane: PriorityLane, item: ReceiverRef) {
        self.lanes[lane as usize].push_back(item);
    }

    pub fn push_front(&mut self, lane: PriorityLane, item: ReceiverRef) {
        self.lanes[lane as usize].push_front(item);
    }

    /// Pop the next item to dispatch: first non-empty lane, front item.
    pub fn pop_next(&mut self) -> Option<ReceiverRef> {
        for lane in PriorityLane::ALL {
            if let Some(item) = self.lanes[lane as usize].pop_front() {
                return Some(item);
            }
        }
        None
    }

    pub fn peek_next(&self) -> Option<&ReceiverRef> {
        PriorityLane::ALL
            .iter()
            .find_map(|lane| self.lanes[*lane as usize].front())
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }

    pub fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    pub fn remove_broadcast(&mut self, broadcast_id: BroadcastId) -> Vec<ReceiverRef> {
        let mut removed = Vec::new();
        for lane in &mut self.lanes {
            let mut kept = VecDeque::with_capacity(lane.len());
            for item in lane.drain(..) {
                if item.broadcast_id == broadcast_id {
                    removed.push(item);
                } else {
                    kept.push_back(item);
                }
            }
            *lane = kept;
        }
        removed
    }

    /// Drain every pending item regardless of broadcast, used when a whole
    /// process queue is torn down (package disabled, process cleanup).
    pub fn remove_broadcast_all(&mut self) -> Vec<ReceiverRef> {
        let mut removed = Vec::new();
        for lane in &mut self.lanes {
            removed.extend(lane.drain(..));
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReceiverRef> {
        PriorityLane::ALL
            .into_iter()
            .flat_map(move |lane| self.lanes[lane as usize].iter())
    }
}

/// Live host-process attachment. `None` while the queue is cold (no
/// process started yet, or the process has exited).
#[derive(Debug, Clone)]
pub struct AppHandle {
    pub pid: u32,
    pub cached: bool,
    pub attached_at: Instant,
}

/// Why a queue's `runnable_at` evaluated the way it did — used only for
/// diagnostics and the health-check audit, never for scheduling itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnableAtReason {
    Empty,
    Blocked,
    Cached,
    Normal,
    Foreground,
}

pub struct ProcessQueue {
    pub key: ProcessQueueKey,
    pub pending: PendingPool,
    pub active: Option<ReceiverRef>,
    pub app: Option<AppHandle>,
    /// Set once a cold-start request for this queue is in flight, so a
    /// second matching broadcast does not trigger a duplicate start.
    pub pending_cold_start: bool,
    pub active_via_cold_start: bool,
    /// Broadcasts delivered since the queue last transitioned pending->idle;
    /// reset to 0 on idle, compared against `max_running_active_broadcasts`.
    pub active_count_since_idle: u32,
    /// `q.lastCpuDelayTime` — the `app.cpuDelayTime` sample taken when the
    /// active receiver's soft timeout was armed; diffed against a fresh
    /// sample at soft-timeout-fire time to grant CPU-starved receivers extra
    /// time (spec.md §4.5 "Timeouts").
    pub last_cpu_delay_time: Option<Duration>,

    // Runnable-list linkage (spec.md §4.3) — indices into the dispatcher's
    // process-queue map, not raw pointers.
    pub runnable_at_cache: Option<(Instant, RunnableAtReason)>,
    pub runnable_at_prev: Option<ProcessQueueKey>,
    pub runnable_at_next: Option<ProcessQueueKey>,
    pub in_runnable_list: bool,
    pub in_running_set: bool,
}

impl ProcessQueue {
    pub fn new(key: ProcessQueueKey) -> Self {
        Self {
            key,
            pending: PendingPool::default(),
            active: None,
            app: None,
            pending_cold_start: false,
            active_via_cold_start: false,
            active_count_since_idle: 0,
            last_cpu_delay_time: None,
            runnable_at_cache: None,
            runnable_at_prev: None,
            runnable_at_next: None,
            in_runnable_list: false,
            in_running_set: false,
        }
    }

    pub fn is_process_warm(&self) -> bool {
        self.app.is_some()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.pending.is_empty()
    }

    /// `enqueueOrReplace` — append, unless `replace_pending` asks us to
    /// first drop every pending item from the same broadcast (used by
    /// MOST_RECENT delivery-group policy collapsing superseded sends).
    pub fn enqueue_or_replace(
        &mut self,
        lane: PriorityLane,
        item: ReceiverRef,
        replace_broadcast: Option<BroadcastId>,
    ) -> Vec<ReceiverRef> {
        let mut replaced = Vec::new();
        if let Some(broadcast_id) = replace_broadcast {
            replaced = self.pending.remove_broadcast(broadcast_id);
        }
        self.pending.push_back(lane, item);
        replaced
    }

    /// `forEachMatchingBroadcast` — used by `remove_matching_filter` to find
    /// and cancel every pending item belonging to `broadcast_id`.
    pub fn for_each_matching_broadcast(&self, broadcast_id: BroadcastId) -> Vec<ReceiverRef> {
        self.pending
            .iter()
            .filter(|item| item.broadcast_id == broadcast_id)
            .copied()
            .collect()
    }

    pub fn invalidate_runnable_at(&mut self) {
        self.runnable_at_cache = None;
    }

    pub fn note_idle(&mut self) {
        self.active_count_since_idle = 0;
    }

    pub fn note_dispatch_started(&mut self) {
        self.active_count_since_idle += 1;
    }

    pub fn should_retire_from_running_set(&self, max_active_since_idle: u32) -> bool {
        self.is_idle() || self.active_count_since_idle >= max_active_since_idle
    }
}

impl fmt::Debug for ProcessQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessQueue")
            .field("key", &self.key)
            .field("pending", &self.pending.len())
            .field("active", &self.active.is_some())
            .field("warm", &self.is_process_warm())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ProcessQueueKey {
        ProcessQueueKey {
            uid: Uid(1000),
            process_name: name.to_string(),
        }
    }

    fn item(broadcast_id: BroadcastId, index: usize) -> ReceiverRef {
        ReceiverRef {
            broadcast_id,
            receiver_index: index,
        }
    }

    #[test]
    fn pending_pool_drains_highest_priority_lane_first() {
        let mut pool = PendingPool::default();
        let b = BroadcastId::new();
        pool.push_back(PriorityLane::Normal, item(b, 0));
        pool.push_back(PriorityLane::Urgent, item(b, 1));

        assert_eq!(pool.pop_next().unwrap().receiver_index, 1);
        assert_eq!(pool.pop_next().unwrap().receiver_index, 0);
        assert!(pool.pop_next().is_none());
    }

    #[test]
    fn remove_broadcast_only_touches_matching_entries() {
        let mut pool = PendingPool::default();
        let keep = BroadcastId::new();
        let drop = BroadcastId::new();
        pool.push_back(PriorityLane::Normal, item(keep, 0));
        pool.push_back(PriorityLane::Normal, item(drop, 0));

        let removed = pool.remove_broadcast(drop);
        assert_eq!(removed.len(), 1);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.peek_next().unwrap().broadcast_id, keep);
    }

    #[test]
    fn queue_is_idle_only_with_no_active_and_empty_pending() {
        let mut queue = ProcessQueue::new(key("proc.a"));
        assert!(queue.is_idle());

        queue.pending.push_back(PriorityLane::Normal, item(BroadcastId::new(), 0));
        assert!(!queue.is_idle());
    }

    #[test]
    fn enqueue_or_replace_drops_superseded_broadcast_entries() {
        let mut queue = ProcessQueue::new(key("proc.a"));
        let old = BroadcastId::new();
        let new = BroadcastId::new();
        queue.pending.push_back(PriorityLane::Normal, item(old, 0));

        let replaced = queue.enqueue_or_replace(PriorityLane::Normal, item(new, 0), Some(old));
        assert_eq!(replaced.len(), 1);
        assert_eq!(queue.pending.len(), 1);
        assert_eq!(queue.pending.peek_next().unwrap().broadcast_id, new);
    }

    #[test]
    fn retires_from_running_set_once_active_budget_exhausted() {
        let mut queue = ProcessQueue::new(key("proc.a"));
        queue.active = Some(item(BroadcastId::new(), 0));
        queue.active_count_since_idle = 16;
        assert!(queue.should_retire_from_running_set(16));
        queue.active_count_since_idle = 3;
        assert!(!queue.should_retire_from_running_set(16));
    }
}
