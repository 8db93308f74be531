//! The dispatcher: a single process-wide lock plus a host message loop that
//! drains internal events (update-requested, receiver-finished,
//! receiver-timed-out, process-attached/exited) one at a time.
//!
//! Grounded on `bpmn_integration::pending_dispatch_worker::PendingDispatchWorker`
//! and `ob-workflow::task_queue::TaskQueueListener`: both run a
//! `tokio::sync::mpsc` receive loop over a `Mutex`-guarded state machine,
//! coalescing repeat "something changed, re-evaluate" signals instead of
//! processing them one by one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;

use crate::config::DispatcherConfig;
use crate::error::{DispatchError, Result};
use crate::ports::Ports;
use crate::process_queue::{PriorityLane, ProcessQueue, ProcessQueueKey, ReceiverRef};
use crate::record::{
    BroadcastId, BroadcastOptions, BroadcastRecord, BroadcastRecordBuilder, CallerIdentity,
    DeliveryGroupPolicy, DeliveryState, Intent, Receiver, Uid, RESULT_CANCELED,
};
use crate::runnable_list::{self, RunnableListHead};
use crate::running_set::RunningSet;

/// Internal events the message loop drains one at a time. Never exposed
/// outside the crate — callers only see `Dispatcher`'s public async methods.
enum DispatcherEvent {
    UpdateRequested,
    ProcessAttached {
        key: ProcessQueueKey,
        pid: u32,
    },
    ProcessExited {
        key: ProcessQueueKey,
    },
    ReceiverFinished {
        key: ProcessQueueKey,
        broadcast_id: BroadcastId,
        receiver_index: usize,
        result: crate::ports::ReceiverResult,
    },
    ReceiverSoftTimeout {
        key: ProcessQueueKey,
        broadcast_id: BroadcastId,
        receiver_index: usize,
        deadline_gen: u64,
    },
    ReceiverHardTimeout {
        key: ProcessQueueKey,
        broadcast_id: BroadcastId,
        receiver_index: usize,
        deadline_gen: u64,
    },
}

/// All dispatcher-owned state, behind one lock (spec.md §5).
pub struct DispatcherState {
    pub records: HashMap<BroadcastId, BroadcastRecord>,
    pub queues: HashMap<ProcessQueueKey, ProcessQueue>,
    pub runnable_list: RunnableListHead,
    pub running_set: RunningSet,
    /// Monotonic count of receivers that have reached a terminal state;
    /// `is_beyond_barrier` compares against a snapshot of this counter.
    pub terminal_sequence: u64,
    /// Bumped on every soft/hard timeout scheduled for a given receiver, so
    /// a stale timeout message (raced by a finish that beat it) is ignored.
    pub timeout_generation: HashMap<(BroadcastId, usize), u64>,
    /// The single process queue, if any, currently awaiting cold-start
    /// attach (spec.md §3: "at most one ProcessQueue is assigned to
    /// runningColdStart at a time").
    pub running_cold_start: Option<ProcessQueueKey>,
}

impl DispatcherState {
    fn new(config: &DispatcherConfig) -> Self {
        Self {
            records: HashMap::new(),
            queues: HashMap::new(),
            runnable_list: RunnableListHead::default(),
            running_set: RunningSet::new(config.max_running_process_queues),
            terminal_sequence: 0,
            timeout_generation: HashMap::new(),
            running_cold_start: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.queues.values().all(ProcessQueue::is_idle)
    }

    fn queue_mut(&mut self, key: &ProcessQueueKey) -> &mut ProcessQueue {
        self.queues
            .entry(key.clone())
            .or_insert_with(|| ProcessQueue::new(key.clone()))
    }
}

/// Receiver-priority lane derived from the intent and receiver kind
/// (spec.md §4.2): alarms and foreground intents jump the queue.
fn lane_for(record: &BroadcastRecord, receiver: &Receiver) -> PriorityLane {
    if record.alarm {
        PriorityLane::Urgent
    } else if record.intent.foreground || receiver.priority() > 0 {
        PriorityLane::High
    } else if record.push {
        PriorityLane::Normal
    } else {
        PriorityLane::Offload
    }
}

pub struct Dispatcher {
    state: Mutex<DispatcherState>,
    config: DispatcherConfig,
    ports: Ports,
    events: mpsc::UnboundedSender<DispatcherEvent>,
    inbox: Mutex<mpsc::UnboundedReceiver<DispatcherEvent>>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, ports: Ports) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            state: Mutex::new(DispatcherState::new(&config)),
            config,
            ports,
            events: tx,
            inbox: Mutex::new(rx),
        })
    }

    /// Runs the host message loop until the channel is dropped. Intended to
    /// be spawned once per dispatcher instance (`tokio::spawn(dispatcher.run())`).
    pub async fn run(self: Arc<Self>) {
        loop {
            let event = {
                let mut inbox = self.inbox.lock().await;
                match inbox.recv().await {
                    Some(event) => event,
                    None => return,
                }
            };
            self.handle_event(event).await;
        }
    }

    async fn handle_event(self: &Arc<Self>, event: DispatcherEvent) {
        match event {
            DispatcherEvent::UpdateRequested => self.update_running_list().await,
            DispatcherEvent::ProcessAttached { key, pid } => {
                self.on_application_attached(&key, pid).await;
            }
            DispatcherEvent::ProcessExited { key } => {
                self.on_application_cleanup(&key).await;
            }
            DispatcherEvent::ReceiverFinished {
                key,
                broadcast_id,
                receiver_index,
                result,
            } => {
                self.finish(&key, broadcast_id, receiver_index, result).await;
            }
            DispatcherEvent::ReceiverSoftTimeout {
                key,
                broadcast_id,
                receiver_index,
                deadline_gen,
            } => {
                self.on_soft_timeout(&key, broadcast_id, receiver_index, deadline_gen).await;
            }
            DispatcherEvent::ReceiverHardTimeout {
                key,
                broadcast_id,
                receiver_index,
                deadline_gen,
            } => {
                self.on_hard_timeout(&key, broadcast_id, receiver_index, deadline_gen).await;
            }
        }
    }

    fn request_update(&self) {
        let _ = self.events.send(DispatcherEvent::UpdateRequested);
    }

    /// `enqueueBroadcastLocked` — build the record, apply singleton and
    /// delivery-group policy, route receivers into process queues, and
    /// request an update pass.
    pub async fn enqueue(
        self: &Arc<Self>,
        intent: Intent,
        caller: CallerIdentity,
        receivers: Vec<Receiver>,
        ordered: bool,
        options: Option<BroadcastOptions>,
    ) -> Result<BroadcastId> {
        self.enqueue_with_callback(intent, caller, receivers, ordered, options, None).await
    }

    /// Same as `enqueue`, plus a caller-supplied final-result callback
    /// (spec.md §3's `finalResultCallback` field), invoked exactly once when
    /// every receiver reaches a terminal state.
    pub async fn enqueue_with_callback(
        self: &Arc<Self>,
        intent: Intent,
        caller: CallerIdentity,
        receivers: Vec<Receiver>,
        ordered: bool,
        options: Option<BroadcastOptions>,
        final_result_callback: Option<crate::record::FinalResultCallback>,
    ) -> Result<BroadcastId> {
        let mut builder = BroadcastRecordBuilder::new(intent, caller).ordered(ordered).receivers(receivers);
        if let Some(cb) = final_result_callback {
            builder = builder.final_result_callback(cb);
        }
        if let Some(options) = options.clone() {
            builder = builder.options(options);
        }
        let mut record = builder.build();
        record.apply_singleton_policy(|uid| uid);

        if let Some(BroadcastOptions {
            delivery_group_policy: Some(DeliveryGroupPolicy::Merged(_)),
            delivery_group_matcher: None,
            ..
        }) = &options
        {
            return Err(DispatchError::MissingMerger);
        }

        let broadcast_id = record.id;
        let receiver_count = record.receivers.len();
        let mut cancelled = Vec::new();

        {
            let mut state = self.state.lock().await;

            if let Some(opts) = &options {
                if let Some(filter) = &opts.remove_matching_filter {
                    cancelled.extend(self.cancel_matching(&mut state, filter, record.caller.uid));
                }
                if opts.replace_pending {
                    // `FLAG_RECEIVER_REPLACE_PENDING` (spec.md §4.5): cancel
                    // earlier same-caller, filter-equal broadcasts
                    // regardless of delivery-group policy — the two
                    // mechanisms are independent.
                    cancelled.extend(self.cancel_replace_pending(&mut state, &record));
                }
                match &opts.delivery_group_policy {
                    None | Some(DeliveryGroupPolicy::All) => {}
                    Some(DeliveryGroupPolicy::MostRecent) => {
                        cancelled.extend(self.cancel_delivery_group(&mut state, &record, opts.delivery_group_matcher.as_ref()));
                    }
                    Some(DeliveryGroupPolicy::Merged(merger)) => {
                        cancelled.extend(self.merge_delivery_group(&mut state, &mut record, merger, opts.delivery_group_matcher.as_ref()));
                    }
                }
            }

            for (index, receiver) in record.receivers.iter().enumerate() {
                let key = ProcessQueueKey {
                    uid: receiver.uid(),
                    process_name: receiver.process_name().to_string(),
                };
                let lane = lane_for(&record, receiver);
                let item = ReceiverRef {
                    broadcast_id,
                    receiver_index: index,
                };
                let queue = state.queue_mut(&key);
                queue.enqueue_or_replace(lane, item, None);
                queue.invalidate_runnable_at();
            }

            state.records.insert(broadcast_id, record);
        }

        for id in cancelled {
            self.maybe_fire_final_result(id).await;
        }
        self.ports.observability.on_broadcast_enqueued(broadcast_id, receiver_count).await;
        if receiver_count == 0 {
            // spec.md §8 boundary: a record with no receivers is already
            // fully terminal the instant it's built, so the final-result
            // callback fires immediately rather than waiting on an update
            // pass that would never find any work for it.
            self.maybe_fire_final_result(broadcast_id).await;
        }
        self.request_update();
        Ok(broadcast_id)
    }

    /// MOST_RECENT delivery-group policy: cancel every still-pending earlier
    /// broadcast the matcher (or, absent one, the same caller uid + action)
    /// considers part of the same group, so only the newest survives.
    fn cancel_delivery_group(
        &self,
        state: &mut DispatcherState,
        incoming: &BroadcastRecord,
        matcher: Option<&crate::record::DeliveryGroupMatcher>,
    ) -> Vec<BroadcastId> {
        let matching: Vec<BroadcastId> = state
            .records
            .iter()
            .filter(|(_, existing)| !existing.is_fully_terminal() && existing.id != incoming.id)
            .filter(|(_, existing)| match matcher {
                Some(matcher) => matcher(existing, incoming),
                None => existing.caller.uid == incoming.caller.uid && existing.intent.filter_equals(&incoming.intent),
            })
            .map(|(id, _)| *id)
            .collect();

        for broadcast_id in matching.iter().copied() {
            for queue in state.queues.values_mut() {
                let removed = queue.pending.remove_broadcast(broadcast_id);
                if !removed.is_empty() {
                    queue.invalidate_runnable_at();
                }
            }
            if let Some(record) = state.records.get_mut(&broadcast_id) {
                for i in 0..record.delivery_state.len() {
                    if !record.delivery_state[i].is_terminal() {
                        record.set_delivery_state(i, DeliveryState::skipped("superseded by most-recent delivery group"));
                    }
                }
                record.result_code = RESULT_CANCELED;
            }
        }
        matching
    }

    fn cancel_matching(&self, state: &mut DispatcherState, filter: &Intent, caller_uid: Uid) -> Vec<BroadcastId> {
        let matching: Vec<BroadcastId> = state
            .records
            .iter()
            .filter(|(_, record)| !record.is_fully_terminal() && record.caller.uid == caller_uid && record.intent.filter_equals(filter))
            .map(|(id, _)| *id)
            .collect();

        for broadcast_id in matching.clone() {
            for queue in state.queues.values_mut() {
                let removed = queue.pending.remove_broadcast(broadcast_id);
                if !removed.is_empty() {
                    queue.invalidate_runnable_at();
                }
            }
            if let Some(record) = state.records.get_mut(&broadcast_id) {
                for i in 0..record.delivery_state.len() {
                    record.set_delivery_state(i, DeliveryState::skipped("replaced"));
                }
                record.result_code = RESULT_CANCELED;
            }
        }
        matching
    }

    /// `FLAG_RECEIVER_REPLACE_PENDING` (spec.md §4.5, §8 scenario 3): an
    /// earlier still-pending broadcast from the same caller whose intent
    /// `filterEquals` the incoming one is skipped+cancelled, but its
    /// process-queue slot is left in place so the new entry can take it.
    fn cancel_replace_pending(&self, state: &mut DispatcherState, incoming: &BroadcastRecord) -> Vec<BroadcastId> {
        let matching: Vec<BroadcastId> = state
            .records
            .iter()
            .filter(|(id, existing)| {
                **id != incoming.id && !existing.is_fully_terminal() && existing.caller.uid == incoming.caller.uid && existing.intent.filter_equals(&incoming.intent)
            })
            .map(|(id, _)| *id)
            .collect();

        for broadcast_id in matching.iter().copied() {
            if let Some(record) = state.records.get_mut(&broadcast_id) {
                for i in 0..record.delivery_state.len() {
                    record.set_delivery_state(i, DeliveryState::skipped("replaced by pending broadcast"));
                }
                record.result_code = RESULT_CANCELED;
            }
        }
        matching
    }

    /// `MERGED` delivery-group policy (spec.md §4.5, §8 scenario 6): fold
    /// every matching prior broadcast's extras into the incoming intent via
    /// the caller-supplied merger, then skip+cancel the prior.
    fn merge_delivery_group(
        &self,
        state: &mut DispatcherState,
        incoming: &mut BroadcastRecord,
        merger: &crate::record::ExtrasMerger,
        matcher: Option<&crate::record::DeliveryGroupMatcher>,
    ) -> Vec<BroadcastId> {
        let matching: Vec<BroadcastId> = state
            .records
            .iter()
            .filter(|(id, existing)| {
                **id != incoming.id
                    && !existing.is_fully_terminal()
                    && match matcher {
                        Some(matcher) => matcher(existing, incoming),
                        None => existing.caller.uid == incoming.caller.uid && existing.intent.filter_equals(&incoming.intent),
                    }
            })
            .map(|(id, _)| *id)
            .collect();

        for broadcast_id in matching.iter().copied() {
            if let Some(existing) = state.records.get(&broadcast_id) {
                merger(&existing.intent.extras, &mut incoming.intent.extras);
            }
            for queue in state.queues.values_mut() {
                let removed = queue.pending.remove_broadcast(broadcast_id);
                if !removed.is_empty() {
                    queue.invalidate_runnable_at();
                }
            }
            if let Some(record) = state.records.get_mut(&broadcast_id) {
                for i in 0..record.delivery_state.len() {
                    if !record.delivery_state[i].is_terminal() {
                        record.set_delivery_state(i, DeliveryState::skipped("merged into newer delivery-group broadcast"));
                    }
                }
                record.result_code = RESULT_CANCELED;
            }
        }
        matching
    }

    /// `updateRunnableListLocked` plus one scheduling step: recompute each
    /// dirty queue's `runnable_at`, reposition it, then dispatch from the
    /// head of the runnable list while the running set has room.
    async fn update_running_list(self: &Arc<Self>) {
        let mut to_start_cold: Vec<(ProcessQueueKey, Uid, String)> = Vec::new();
        let mut to_dispatch_warm: Vec<(ProcessQueueKey, u32, ReceiverRef)> = Vec::new();

        {
            let mut state = self.state.lock().await;
            let keys: Vec<ProcessQueueKey> = state.queues.keys().cloned().collect();
            let now = Instant::now();

            for key in &keys {
                let runnable_at = {
                    let records = &state.records;
                    let queue = state.queues.get(key).unwrap();
                    Self::runnable_at(queue, records)
                };
                match runnable_at {
                    Some(at) => {
                        state.queues.get_mut(key).unwrap().runnable_at_cache =
                            Some((at, crate::process_queue::RunnableAtReason::Normal));
                        runnable_list::insert_sorted(&mut state.runnable_list, &mut state.queues, key, at);
                    }
                    None => runnable_list::remove(&mut state.runnable_list, &mut state.queues, key),
                }
            }

            // `avail` (spec.md §4.5 step 1: "avail = C − size(running)") is
            // tracked as admissions happen rather than snapshotted once,
            // since `running_set.try_admit` both checks and reserves a slot
            // atomically within this single lock hold — otherwise every
            // runnable queue would pass a stale capacity check and all get
            // force-admitted in the same pass.
            let ordered = runnable_list::iter_ordered(&state.runnable_list, &state.queues);
            for key in ordered {
                if now < state.queues[&key].runnable_at_cache.map(|(at, _)| at).unwrap_or(now) {
                    continue;
                }
                if state.queues[&key].active.is_some() {
                    continue;
                }
                if !state.running_set.has_room() && !state.running_set.contains(&key) {
                    continue;
                }

                let queue = state.queues.get(&key).unwrap();
                let next_item = match queue.pending.peek_next() {
                    Some(item) => *item,
                    None => continue,
                };
                if queue.is_process_warm() {
                    let pid = queue.app.as_ref().unwrap().pid;
                    if !state.running_set.try_admit(key.clone()) {
                        continue;
                    }
                    to_dispatch_warm.push((key.clone(), pid, next_item));
                } else if !queue.pending_cold_start {
                    // Single cold-start budget (spec.md §4.5 step 3d): only
                    // claim the slot if nothing else is already awaiting
                    // attach; otherwise this queue stays runnable and is
                    // reconsidered on the next pass.
                    if state.running_cold_start.is_some() {
                        continue;
                    }
                    if !state.running_set.try_admit(key.clone()) {
                        continue;
                    }
                    state.running_cold_start = Some(key.clone());
                    state.queues.get_mut(&key).unwrap().pending_cold_start = true;
                    to_start_cold.push((key.clone(), key.uid, key.process_name.clone()));
                }
            }
        }

        for (key, uid, process_name) in to_start_cold {
            self.schedule_cold(key, uid, process_name).await;
        }
        for (key, pid, item) in to_dispatch_warm {
            self.schedule_warm(key, pid, item).await;
        }
    }

    /// `getRunnableAt` (spec.md §4.2): `None` (+infinity) when empty or
    /// head-of-line blocked; otherwise the pending item's effective ready
    /// time, floored at "now" for already-ready work.
    fn runnable_at(queue: &ProcessQueue, records: &HashMap<BroadcastId, BroadcastRecord>) -> Option<Instant> {
        if queue.active.is_some() {
            return None; // already dispatching; not a candidate for (re)scheduling.
        }
        let item = queue.pending.peek_next()?;
        let record = records.get(&item.broadcast_id)?;
        if record.is_blocked(item.receiver_index) {
            return None;
        }
        Some(Instant::now())
    }

    async fn schedule_cold(self: &Arc<Self>, key: ProcessQueueKey, uid: Uid, process_name: String) {
        match self.ports.process_lifecycle.start_process(uid, &process_name, "broadcast").await {
            Ok(pid) => {
                self.events
                    .send(DispatcherEvent::ProcessAttached { key, pid })
                    .ok();
            }
            Err(err) => {
                tracing::warn!(%err, process_name, "cold start failed");
                // The receiver is still sitting in the pending pool (cold
                // start failure happens before `scheduleWarm` ever pops and
                // assigns an active receiver), so the next update pass will
                // either retry the start or pick up the next pending item.
                let mut state = self.state.lock().await;
                let queue = state.queue_mut(&key);
                queue.pending_cold_start = false;
                if state.running_cold_start.as_ref() == Some(&key) {
                    state.running_cold_start = None;
                }
                state.running_set.retire(&key);
                drop(state);
                self.request_update();
            }
        }
    }

    pub async fn on_application_attached(self: &Arc<Self>, key: &ProcessQueueKey, pid: u32) {
        {
            let mut state = self.state.lock().await;
            let queue = state.queue_mut(key);
            queue.app = Some(crate::process_queue::AppHandle {
                pid,
                cached: false,
                attached_at: Instant::now(),
            });
            queue.pending_cold_start = false;
            queue.active_via_cold_start = true;
            if state.running_cold_start.as_ref() == Some(key) {
                // Frees the single cold-start slot for the next-runnable
                // cold queue (spec.md §4.5 `onApplicationAttached`).
                state.running_cold_start = None;
            }
        }
        self.request_update();
    }

    pub async fn on_application_cleanup(self: &Arc<Self>, key: &ProcessQueueKey) {
        let orphaned: Vec<(BroadcastId, usize)> = {
            let mut state = self.state.lock().await;
            let queue = state.queue_mut(key);
            queue.app = None;
            queue.pending_cold_start = false;
            let mut orphaned = Vec::new();
            if let Some(active) = queue.active.take() {
                orphaned.push((active.broadcast_id, active.receiver_index));
            }
            if state.running_cold_start.as_ref() == Some(key) {
                state.running_cold_start = None;
            }
            state.running_set.retire(key);
            orphaned
        };

        for (broadcast_id, receiver_index) in orphaned {
            let mut state = self.state.lock().await;
            if let Some(record) = state.records.get_mut(&broadcast_id) {
                record.set_delivery_state(receiver_index, DeliveryState::failure("process died"));
            }
            drop(state);
            self.maybe_fire_final_result(broadcast_id).await;
        }
        self.request_update();
    }

    async fn schedule_warm(self: &Arc<Self>, key: ProcessQueueKey, pid: u32, item: ReceiverRef) {
        // First pass under the lock: pop the item, short-circuit to SKIPPED
        // for the cases spec.md §4.5 lists that need no collaborator call —
        // racing finish, extras filter, or a registered receiver whose
        // owning pid no longer matches the live process.
        let (intent, receiver, uid) = {
            let mut state = self.state.lock().await;
            let popped = state.queues.get_mut(&key).unwrap().pending.pop_next();
            debug_assert_eq!(popped, Some(item));
            let record = state.records.get(&item.broadcast_id).expect("record must exist for queued item");
            if record.delivery_state[item.receiver_index].is_terminal() {
                drop(state);
                self.request_update();
                return;
            }
            let receiver = record.receivers[item.receiver_index].clone();
            if receiver.pid_mismatch(pid) {
                drop(state);
                self.skip_and_continue(key, item, "registered receiver pid mismatch").await;
                return;
            }
            let intent = match record.receiver_intent(&receiver) {
                Some(intent) => intent,
                None => {
                    drop(state);
                    self.skip_and_continue(key, item, "extras filter").await;
                    return;
                }
            };
            let uid = receiver.uid();
            (intent, receiver, uid)
        };

        // Skip-policy is an external collaborator — called with the lock
        // released (spec.md §5: "suspension points: none inside critical
        // sections").
        if let Ok(Some(reason)) = self.ports.skip_policy.should_skip(uid, &key.process_name, &intent).await {
            self.skip_and_continue(key, item, &format!("skip policy: {reason}")).await;
            return;
        }

        let (foreground, ordered, gen, timeout_exempt, bg_activity_token, temp_allowlist_duration) = {
            let mut state = self.state.lock().await;
            if state
                .records
                .get(&item.broadcast_id)
                .map(|r| r.delivery_state[item.receiver_index].is_terminal())
                .unwrap_or(true)
            {
                drop(state);
                self.request_update();
                return;
            }
            let foreground = intent.foreground;
            let record = state.records.get(&item.broadcast_id).unwrap();
            let ordered = record.ordered;
            let timeout_exempt = record.timeout_exempt;
            let bg_activity_token = record.allow_background_activity_starts.clone();
            let temp_allowlist_duration = record
                .options
                .as_ref()
                .and_then(|opts| opts.temporary_allowlist_duration);
            state.queues.get_mut(&key).unwrap().active = Some(item);
            state.queues.get_mut(&key).unwrap().note_dispatch_started();
            let gen = {
                let counter = state.timeout_generation.entry((item.broadcast_id, item.receiver_index)).or_insert(0);
                *counter += 1;
                *counter
            };
            if let Some(record) = state.records.get_mut(&item.broadcast_id) {
                record.set_delivery_state(item.receiver_index, DeliveryState::Scheduled);
            }
            (foreground, ordered, gen, timeout_exempt, bg_activity_token, temp_allowlist_duration)
        };

        if let Some(token) = bg_activity_token {
            // spec.md §4.5 scheduleWarm step 2: register the
            // allow-background-activity-starts token on the app and post a
            // bg-start timeout at `now + T_bg_start` that revokes it.
            if self.ports.process_lifecycle.set_process_important(pid, true).await.is_ok() {
                let process_lifecycle = Arc::clone(&self.ports.process_lifecycle);
                let bg_start_timeout = self.config.allow_bg_activity_start_timeout;
                tokio::spawn(async move {
                    sleep(bg_start_timeout).await;
                    let _ = process_lifecycle.set_process_important(pid, false).await;
                    tracing::trace!(token = %token, "background-activity-start token expired");
                });
            }
        }
        if let Some(duration) = temp_allowlist_duration {
            // spec.md §4.5 scheduleWarm step 3: options requesting a
            // temporary allowlist grant it via the process-lifecycle port.
            let _ = self
                .ports
                .process_lifecycle
                .temp_allowlist_uid(uid, duration, "broadcast temporary allowlist")
                .await;
        }

        self.ports
            .observability
            .on_receiver_scheduled(item.broadcast_id, &key.process_name)
            .await;

        if !timeout_exempt {
            // `q.lastCpuDelayTime` (spec.md §4.5 `scheduleWarm` step 1):
            // sampled once here, before the soft timeout is armed, so the
            // soft-timeout handler can diff against a fresh sample to spot
            // CPU starvation rather than genuine unresponsiveness.
            let baseline = self.ports.process_lifecycle.cpu_delay_time(pid).await.unwrap_or_default();
            {
                let mut state = self.state.lock().await;
                if let Some(queue) = state.queues.get_mut(&key) {
                    queue.last_cpu_delay_time = Some(baseline);
                }
            }
            self.arm_timeout(key.clone(), item.broadcast_id, item.receiver_index, foreground, gen);
        }

        let receiver_id = match &receiver {
            Receiver::Registered(r) => r.receiver_id.clone(),
            Receiver::Manifest(m) => m.activity_info.component.clone(),
        };
        let events = self.events.clone();
        let ipc = Arc::clone(&self.ports.ipc);

        // spec.md §4.5 scheduleWarm step 5: "If the receiver is a
        // registered receiver and the record is unordered, delivery is
        // assumed-delivered — post an immediate finish(DELIVERED) without
        // waiting for a response." Ordered registered receivers, and all
        // manifest receivers, still wait on the IPC reply.
        let assumed_delivered = matches!(receiver, Receiver::Registered(_)) && !ordered;
        if assumed_delivered {
            tokio::spawn(async move {
                let _ = ipc.schedule_receiver(pid, &receiver_id, &intent, ordered).await;
            });
            let _ = events.send(DispatcherEvent::ReceiverFinished {
                key,
                broadcast_id: item.broadcast_id,
                receiver_index: item.receiver_index,
                result: crate::ports::ReceiverResult::default(),
            });
        } else {
            tokio::spawn(async move {
                let result = ipc
                    .schedule_receiver(pid, &receiver_id, &intent, ordered)
                    .await
                    .unwrap_or_default();
                let _ = events.send(DispatcherEvent::ReceiverFinished {
                    key,
                    broadcast_id: item.broadcast_id,
                    receiver_index: item.receiver_index,
                    result,
                });
            });
        }
    }

    async fn skip_and_continue(self: &Arc<Self>, key: ProcessQueueKey, item: ReceiverRef, reason: &str) {
        {
            let mut state = self.state.lock().await;
            if let Some(record) = state.records.get_mut(&item.broadcast_id) {
                record.set_delivery_state(item.receiver_index, DeliveryState::skipped(reason));
            }
        }
        self.maybe_fire_final_result(item.broadcast_id).await;
        self.request_update();
    }

    /// Arms only the soft-timeout timer. The hard timeout's delay is not
    /// known up front — it depends on how CPU-starved the process turned
    /// out to be — so it is computed and scheduled from `on_soft_timeout`
    /// once the soft deadline actually fires (spec.md §4.5 "Timeouts").
    fn arm_timeout(self: &Arc<Self>, key: ProcessQueueKey, broadcast_id: BroadcastId, receiver_index: usize, foreground: bool, gen: u64) {
        let soft = self.config.timeout_for(foreground);
        let events = self.events.clone();
        tokio::spawn(async move {
            sleep(soft).await;
            let _ = events.send(DispatcherEvent::ReceiverSoftTimeout {
                key,
                broadcast_id,
                receiver_index,
                deadline_gen: gen,
            });
        });
    }

    /// Soft timeout: the receiver has overrun its nominal budget. If the
    /// process is still alive, grant it `clamp(cpuDelayTime − lastCpuDelayTime,
    /// 0, TIMEOUT_CAP)` extra time before the hard timeout (the
    /// CPU-starvation extension); a dead process gets no grace and the hard
    /// timeout fires on the next tick.
    async fn on_soft_timeout(self: &Arc<Self>, key: &ProcessQueueKey, broadcast_id: BroadcastId, receiver_index: usize, gen: u64) {
        let (pid, still_current, baseline) = {
            let state = self.state.lock().await;
            let current_gen = state.timeout_generation.get(&(broadcast_id, receiver_index)).copied().unwrap_or(0);
            let still_current = current_gen == gen
                && state
                    .queues
                    .get(key)
                    .map(|q| q.active == Some(ReceiverRef { broadcast_id, receiver_index }))
                    .unwrap_or(false);
            let queue = state.queues.get(key);
            let pid = queue.and_then(|q| q.app.as_ref()).map(|a| a.pid);
            let baseline = queue.and_then(|q| q.last_cpu_delay_time).unwrap_or_default();
            (pid, still_current, baseline)
        };
        if !still_current {
            return;
        }

        let cap = self.config.timeout_cap;
        let extra = match pid {
            Some(pid) if self.ports.process_lifecycle.is_process_alive(pid).await.unwrap_or(false) => {
                let current = self.ports.process_lifecycle.cpu_delay_time(pid).await.unwrap_or_default();
                current.saturating_sub(baseline).min(cap)
            }
            _ => Duration::ZERO,
        };

        let events = self.events.clone();
        let key = key.clone();
        tokio::spawn(async move {
            sleep(extra).await;
            let _ = events.send(DispatcherEvent::ReceiverHardTimeout {
                key,
                broadcast_id,
                receiver_index,
                deadline_gen: gen,
            });
        });
    }

    /// Hard timeout: abandon the receiver, report the ANR, and move the
    /// queue on. ANR reporting happens here (not at the soft timeout) per
    /// spec.md §4.5: "Hard timeout finishes with TIMEOUT, which triggers ANR
    /// reporting via the host collaborator."
    async fn on_hard_timeout(self: &Arc<Self>, key: &ProcessQueueKey, broadcast_id: BroadcastId, receiver_index: usize, gen: u64) {
        let (fire, pid) = {
            let mut state = self.state.lock().await;
            let current_gen = state.timeout_generation.get(&(broadcast_id, receiver_index)).copied().unwrap_or(0);
            let is_active = state
                .queues
                .get(key)
                .map(|q| q.active == Some(ReceiverRef { broadcast_id, receiver_index }))
                .unwrap_or(false);
            if current_gen != gen || !is_active {
                (false, None)
            } else {
                let pid = state.queues.get(key).and_then(|q| q.app.as_ref()).map(|a| a.pid);
                if let Some(record) = state.records.get_mut(&broadcast_id) {
                    record.anr_count += 1;
                    record.set_delivery_state(receiver_index, DeliveryState::Timeout);
                }
                if let Some(queue) = state.queues.get_mut(key) {
                    queue.active = None;
                }
                (true, pid)
            }
        };
        if fire {
            if let Some(pid) = pid {
                if self.ports.process_lifecycle.is_process_alive(pid).await.unwrap_or(false) {
                    let _ = self.ports.process_lifecycle.app_not_responding(pid, "broadcast receiver timeout").await;
                }
            }
            self.ports.observability.on_anr(broadcast_id, &key.process_name).await;
            self.ports
                .observability
                .on_receiver_terminal(broadcast_id, &key.process_name, "timeout")
                .await;
            self.maybe_fire_final_result(broadcast_id).await;
            self.request_update();
        }
    }

    /// `finishReceiverLocked` — a receiver completed normally (possibly
    /// with a result triple and abort flag for ordered broadcasts).
    pub async fn finish(
        self: &Arc<Self>,
        key: &ProcessQueueKey,
        broadcast_id: BroadcastId,
        receiver_index: usize,
        result: crate::ports::ReceiverResult,
    ) {
        let active_match = {
            let mut state = self.state.lock().await;
            let is_active = state
                .queues
                .get(key)
                .map(|q| q.active == Some(ReceiverRef { broadcast_id, receiver_index }))
                .unwrap_or(false);
            if !is_active {
                return;
            }
            state.timeout_generation.remove(&(broadcast_id, receiver_index));

            let mut should_abort = false;
            if let Some(record) = state.records.get_mut(&broadcast_id) {
                record.result_code = result.result_code;
                record.result_data = result.result_data.clone();
                record.result_extras = result.result_extras.clone();
                record.result_abort = result.result_abort;
                record.set_delivery_state(receiver_index, DeliveryState::Delivered);
                if record.ordered && result.result_abort {
                    record.abort_remaining();
                    should_abort = true;
                }
            }
            if let Some(queue) = state.queues.get_mut(key) {
                queue.active = None;
                if queue.should_retire_from_running_set(self.config.max_running_active_broadcasts) {
                    queue.note_idle();
                    state.running_set.retire(key);
                }
            }
            should_abort
        };

        self.ports
            .observability
            .on_receiver_terminal(broadcast_id, &key.process_name, "delivered")
            .await;
        let _ = self.ports.history.record_delivery(crate::ports::HistoryEntry {
            broadcast_id,
            process_name: key.process_name.clone(),
            action: String::new(),
            state: "delivered".to_string(),
            duration: Duration::default(),
        }).await;

        let _ = active_match;
        self.maybe_fire_final_result(broadcast_id).await;
        self.request_update();
    }

    /// `setDeliveryState` as a public surface — used by callers that skip a
    /// receiver administratively (e.g. disabled-package cleanup) outside
    /// the normal dispatch path.
    pub async fn set_delivery_state(self: &Arc<Self>, broadcast_id: BroadcastId, receiver_index: usize, state: DeliveryState) -> Result<()> {
        {
            let mut guard = self.state.lock().await;
            let record = guard.records.get_mut(&broadcast_id).ok_or(DispatchError::UnknownRecord(broadcast_id))?;
            record.set_delivery_state(receiver_index, state);
        }
        self.maybe_fire_final_result(broadcast_id).await;
        Ok(())
    }

    /// Remove every pending and active reference to a disabled package's
    /// receivers, skipping them without dispatch.
    pub async fn cleanup_disabled_package(self: &Arc<Self>, uid: Uid, process_name: &str) {
        let key = ProcessQueueKey {
            uid,
            process_name: process_name.to_string(),
        };
        let affected: Vec<(BroadcastId, usize)> = {
            let mut state = self.state.lock().await;
            let mut affected = Vec::new();
            if let Some(queue) = state.queues.get_mut(&key) {
                for item in queue.pending.remove_broadcast_all() {
                    affected.push((item.broadcast_id, item.receiver_index));
                }
                if let Some(active) = queue.active.take() {
                    affected.push((active.broadcast_id, active.receiver_index));
                }
                state.running_set.retire(&key);
            }
            affected
        };
        for (broadcast_id, receiver_index) in affected {
            {
                let mut state = self.state.lock().await;
                if let Some(record) = state.records.get_mut(&broadcast_id) {
                    record.set_delivery_state(receiver_index, DeliveryState::skipped("package disabled"));
                }
            }
            self.maybe_fire_final_result(broadcast_id).await;
        }
        self.request_update();
    }

    async fn maybe_fire_final_result(&self, broadcast_id: BroadcastId) {
        let mut state = self.state.lock().await;
        state.terminal_sequence += 1;
        let record = match state.records.get_mut(&broadcast_id) {
            Some(record) => record,
            None => return,
        };
        if !record.is_fully_terminal() || record.final_result_fired {
            return;
        }
        record.final_result_fired = true;
        let callback = record.final_result_callback.clone();
        let final_result = record.final_result();
        drop(state);
        if let Some(callback) = callback {
            callback(&final_result);
        }
    }

    /// Expose a read-only snapshot hook for tests and the health checker
    /// without leaking the lock guard type across the crate boundary.
    pub async fn inspect<R: Send + 'static>(&self, f: impl FnOnce(&DispatcherState) -> R + Send + 'static) -> R {
        let state = self.state.lock().await;
        f(&state)
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }
}
