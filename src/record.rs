//! `BroadcastRecord` — an immutable-per-enqueue bundle describing one
//! broadcast plus a parallel mutable array of per-receiver delivery state.
//!
//! Grounded on `ob-workflow::task_queue` (status enums + parallel row/event
//! structs) and `sem_os_core::ports` (newtype ids resolved through a central
//! store rather than embedded pointers).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier for a broadcast record, stable for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BroadcastId(pub Uuid);

impl BroadcastId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BroadcastId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BroadcastId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// OS user id. Kept distinct from `pid` (process id) throughout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Uid(pub u32);

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Extras bag carried on an intent. Deliberately untyped (callers attach
/// whatever the receiving component expects) — mirrors `serde_json::Value`
/// use throughout the teacher pack for opaque payloads.
pub type Extras = BTreeMap<String, serde_json::Value>;

/// The intent payload of a broadcast: an action string plus extras.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub action: String,
    pub extras: Extras,
    /// `RECEIVER_FOREGROUND` — selects the foreground timeout band.
    pub foreground: bool,
}

impl Intent {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            extras: Extras::new(),
            foreground: false,
        }
    }

    pub fn filter_equals(&self, other: &Intent) -> bool {
        self.action == other.action
    }
}

/// Caller identity captured at enqueue time.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub pid: u32,
    pub uid: Uid,
    pub package: String,
    pub feature: Option<String>,
    pub instant_app: bool,
    pub user_id: u32,
}

/// A runtime-registered receiver, bound to a specific pid.
#[derive(Debug, Clone)]
pub struct RegisteredReceiver {
    pub pid: u32,
    pub uid: Uid,
    pub receiver_id: String,
    pub priority: i32,
}

/// Target component info for a manifest-declared receiver.
#[derive(Debug, Clone)]
pub struct ActivityInfo {
    pub component: String,
    pub process_name: String,
    pub application_uid: Uid,
    /// Package declares this process a singleton — rewritten to the primary
    /// user's uid by `apply_singleton_policy`.
    pub singleton: bool,
}

/// A manifest-declared receiver.
#[derive(Debug, Clone)]
pub struct ManifestReceiver {
    pub activity_info: ActivityInfo,
    pub priority: i32,
}

/// Closed sum type over the two receiver kinds (spec.md §9 REDESIGN note:
/// replaces runtime type-testing with a match).
#[derive(Debug, Clone)]
pub enum Receiver {
    Registered(RegisteredReceiver),
    Manifest(ManifestReceiver),
}

impl Receiver {
    pub fn process_name(&self) -> &str {
        match self {
            Receiver::Registered(r) => &r.receiver_id,
            Receiver::Manifest(m) => &m.activity_info.process_name,
        }
    }

    pub fn uid(&self) -> Uid {
        match self {
            Receiver::Registered(r) => r.uid,
            Receiver::Manifest(m) => m.activity_info.application_uid,
        }
    }

    pub fn priority(&self) -> i32 {
        match self {
            Receiver::Registered(r) => r.priority,
            Receiver::Manifest(m) => m.priority,
        }
    }

    pub fn is_registered(&self) -> bool {
        matches!(self, Receiver::Registered(_))
    }

    /// Registered receivers are bound to a specific pid; true if that pid no
    /// longer matches the live process.
    pub fn pid_mismatch(&self, live_pid: u32) -> bool {
        match self {
            Receiver::Registered(r) => r.pid != live_pid,
            Receiver::Manifest(_) => false,
        }
    }
}

/// Per-receiver delivery state (spec.md §3). A terminal state is never
/// overwritten — enforced by `BroadcastRecord::set_delivery_state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    Pending,
    Scheduled,
    Delivered,
    Skipped { reason: String },
    Timeout,
    Failure { reason: String },
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryState::Delivered
                | DeliveryState::Skipped { .. }
                | DeliveryState::Timeout
                | DeliveryState::Failure { .. }
        )
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        DeliveryState::Skipped {
            reason: reason.into(),
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        DeliveryState::Failure {
            reason: reason.into(),
        }
    }
}

/// Delivery-group policy (spec.md §4.5).
#[derive(Clone)]
pub enum DeliveryGroupPolicy {
    All,
    MostRecent,
    Merged(ExtrasMerger),
}

impl fmt::Debug for DeliveryGroupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryGroupPolicy::All => write!(f, "All"),
            DeliveryGroupPolicy::MostRecent => write!(f, "MostRecent"),
            DeliveryGroupPolicy::Merged(_) => write!(f, "Merged(..)"),
        }
    }
}

/// Pure callable that folds an older broadcast's extras into a newer one's
/// intent (spec.md §9: "model as small, pure callable values captured in the
/// record; no global registry").
pub type ExtrasMerger = Arc<dyn Fn(&Extras, &mut Extras) + Send + Sync>;

/// Pure callable used to detect delivery-group membership between two
/// records (same caller uid/user + matching signature).
pub type DeliveryGroupMatcher = Arc<dyn Fn(&BroadcastRecord, &BroadcastRecord) -> bool + Send + Sync>;

/// Pure per-receiver extras filter: `(uid, extras) -> extras | None` skips
/// the receiver when it returns `None`.
pub type ExtrasFilter = Arc<dyn Fn(Uid, &Extras) -> Option<Extras> + Send + Sync>;

/// Final-result callback, invoked exactly once when every receiver reaches a
/// terminal state.
pub type FinalResultCallback = Arc<dyn Fn(&FinalResult) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct FinalResult {
    pub broadcast_id: BroadcastId,
    pub result_code: i32,
    pub result_data: Option<String>,
    pub result_extras: Extras,
    pub result_abort: bool,
}

/// `RESULT_CANCELED` — used when replace-pending / delivery-group policy
/// cancels an earlier broadcast.
pub const RESULT_CANCELED: i32 = 0;

/// Options bag (spec.md §3, §4.5). `None` fields take the no-op default.
#[derive(Clone, Default)]
pub struct BroadcastOptions {
    pub delivery_group_policy: Option<DeliveryGroupPolicy>,
    pub delivery_group_matcher: Option<DeliveryGroupMatcher>,
    pub replace_pending: bool,
    /// Cancel all prior broadcasts from the same caller whose intent matches.
    pub remove_matching_filter: Option<Intent>,
    pub temporary_allowlist_duration: Option<Duration>,
    pub lane_override: Option<crate::process_queue::PriorityLane>,
}

impl fmt::Debug for BroadcastOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastOptions")
            .field("delivery_group_policy", &self.delivery_group_policy)
            .field("replace_pending", &self.replace_pending)
            .field(
                "remove_matching_filter",
                &self.remove_matching_filter.is_some(),
            )
            .finish()
    }
}

/// Deferral policy for `LOCKED_BOOT_COMPLETED` / `BOOT_COMPLETED` receivers
/// (spec.md §4.1 `split_deferred_boot_completed`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDeferralPolicy {
    All,
    BackgroundRestrictedOnly,
    TargetTOnly,
    BackgroundRestrictedOrTargetT,
}

/// Immutable-per-enqueue bundle plus its parallel mutable per-receiver state
/// (spec.md §3).
pub struct BroadcastRecord {
    pub id: BroadcastId,
    pub intent: Intent,
    pub caller: CallerIdentity,
    pub ordered: bool,
    pub sticky: bool,
    pub initial_sticky: bool,
    pub alarm: bool,
    pub push: bool,
    /// Derived: true iff receivers span more than one priority band.
    pub prioritized: bool,
    pub required_permissions: Vec<String>,
    pub excluded_permissions: Vec<String>,
    pub required_packages: Vec<String>,
    pub excluded_packages: Vec<String>,
    pub app_op: Option<String>,
    pub options: Option<BroadcastOptions>,
    pub receivers: Vec<Receiver>,
    pub final_result_callback: Option<FinalResultCallback>,
    pub timeout_exempt: bool,
    pub allow_background_activity_starts: Option<String>,
    pub extras_filter: Option<ExtrasFilter>,

    // Mutable parallel arrays, length == receivers.len().
    pub delivery_state: Vec<DeliveryState>,
    pub scheduled_time: Vec<Option<Instant>>,
    pub terminal_time: Vec<Option<Instant>>,

    // Mutable scalars.
    pub enqueue_time: Instant,
    pub enqueue_clock_time: chrono::DateTime<chrono::Utc>,
    pub dispatch_time: Option<Instant>,
    pub finish_time: Option<Instant>,
    pub result_code: i32,
    pub result_data: Option<String>,
    pub result_extras: Extras,
    pub result_abort: bool,
    pub terminal_count: usize,
    pub anr_count: u32,
    pub next_receiver: usize,
    /// Set once the final-result callback has fired, to enforce "exactly once".
    pub final_result_fired: bool,
}

pub struct BroadcastRecordBuilder {
    intent: Intent,
    caller: CallerIdentity,
    ordered: bool,
    sticky: bool,
    initial_sticky: bool,
    alarm: bool,
    push: bool,
    required_permissions: Vec<String>,
    excluded_permissions: Vec<String>,
    required_packages: Vec<String>,
    excluded_packages: Vec<String>,
    app_op: Option<String>,
    options: Option<BroadcastOptions>,
    receivers: Vec<Receiver>,
    final_result_callback: Option<FinalResultCallback>,
    timeout_exempt: bool,
    allow_background_activity_starts: Option<String>,
    extras_filter: Option<ExtrasFilter>,
}

impl BroadcastRecordBuilder {
    pub fn new(intent: Intent, caller: CallerIdentity) -> Self {
        Self {
            intent,
            caller,
            ordered: false,
            sticky: false,
            initial_sticky: false,
            alarm: false,
            push: false,
            required_permissions: Vec::new(),
            excluded_permissions: Vec::new(),
            required_packages: Vec::new(),
            excluded_packages: Vec::new(),
            app_op: None,
            options: None,
            receivers: Vec::new(),
            final_result_callback: None,
            timeout_exempt: false,
            allow_background_activity_starts: None,
            extras_filter: None,
        }
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    pub fn receivers(mut self, receivers: Vec<Receiver>) -> Self {
        self.receivers = receivers;
        self
    }

    pub fn options(mut self, options: BroadcastOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn final_result_callback(mut self, cb: FinalResultCallback) -> Self {
        self.final_result_callback = Some(cb);
        self
    }

    pub fn extras_filter(mut self, filter: ExtrasFilter) -> Self {
        self.extras_filter = Some(filter);
        self
    }

    pub fn timeout_exempt(mut self, v: bool) -> Self {
        self.timeout_exempt = v;
        self
    }

    pub fn allow_background_activity_starts(mut self, token: impl Into<String>) -> Self {
        self.allow_background_activity_starts = Some(token.into());
        self
    }

    pub fn build(self) -> BroadcastRecord {
        let n = self.receivers.len();
        let prioritized = self
            .receivers
            .iter()
            .map(Receiver::priority)
            .collect::<std::collections::HashSet<_>>()
            .len()
            > 1;
        let now = Instant::now();
        BroadcastRecord {
            id: BroadcastId::new(),
            intent: self.intent,
            caller: self.caller,
            ordered: self.ordered,
            sticky: self.sticky,
            initial_sticky: self.initial_sticky,
            alarm: self.alarm,
            push: self.push,
            prioritized,
            required_permissions: self.required_permissions,
            excluded_permissions: self.excluded_permissions,
            required_packages: self.required_packages,
            excluded_packages: self.excluded_packages,
            app_op: self.app_op,
            options: self.options,
            receivers: self.receivers,
            final_result_callback: self.final_result_callback,
            timeout_exempt: self.timeout_exempt,
            allow_background_activity_starts: self.allow_background_activity_starts,
            extras_filter: self.extras_filter,
            delivery_state: vec![DeliveryState::Pending; n],
            scheduled_time: vec![None; n],
            terminal_time: vec![None; n],
            enqueue_time: now,
            enqueue_clock_time: chrono::Utc::now(),
            dispatch_time: None,
            finish_time: None,
            result_code: 0,
            result_data: None,
            result_extras: Extras::new(),
            result_abort: false,
            terminal_count: 0,
            anr_count: 0,
            next_receiver: 0,
            final_result_fired: false,
        }
    }
}

impl BroadcastRecord {
    /// `setDeliveryState(i, newState)` — write iff current is non-terminal;
    /// stamps `scheduled_time`/`terminal_time` as appropriate. Returns
    /// whether this transition just made the receiver terminal (so callers
    /// can increment `terminal_count` and fire side effects exactly once).
    pub fn set_delivery_state(&mut self, i: usize, new_state: DeliveryState) -> bool {
        if self.delivery_state[i].is_terminal() {
            return false; // terminal states are final — silently dropped.
        }
        let now = Instant::now();
        if matches!(new_state, DeliveryState::Scheduled) {
            self.scheduled_time[i] = Some(now);
        }
        let became_terminal = new_state.is_terminal();
        if became_terminal {
            self.terminal_time[i] = Some(now);
        }
        self.delivery_state[i] = new_state;
        if became_terminal {
            self.terminal_count += 1;
        }
        became_terminal
    }

    pub fn is_fully_terminal(&self) -> bool {
        self.terminal_count == self.receivers.len()
    }

    /// `getReceiverIntent` — apply the extras filter (if configured) and
    /// return `None` to signal "skip this receiver", otherwise the intent
    /// with extras possibly replaced.
    pub fn receiver_intent(&self, receiver: &Receiver) -> Option<Intent> {
        let mut intent = self.intent.clone();
        if let Some(filter) = &self.extras_filter {
            match filter(receiver.uid(), &intent.extras) {
                Some(extras) => intent.extras = extras,
                None => return None,
            }
        }
        if let Receiver::Manifest(m) = receiver {
            intent.action = format!("{}@{}", intent.action, m.activity_info.component);
        }
        Some(intent)
    }

    /// A receiver `i` is blocked iff some earlier `j < i` has non-terminal
    /// state (ordered/prioritized back-pressure, spec.md §4.5).
    pub fn is_blocked(&self, i: usize) -> bool {
        if !self.ordered && !self.prioritized {
            return false;
        }
        self.delivery_state[..i].iter().any(|s| !s.is_terminal())
    }

    /// `applySingletonPolicy` — rewrite manifest receivers whose hosting
    /// process is a declared singleton to the primary-user uid.
    pub fn apply_singleton_policy(&mut self, primary_user_uid_of: impl Fn(Uid) -> Uid) {
        for receiver in &mut self.receivers {
            if let Receiver::Manifest(m) = receiver {
                if m.activity_info.singleton {
                    m.activity_info.application_uid =
                        primary_user_uid_of(m.activity_info.application_uid);
                }
            }
        }
    }

    /// Ordered-abort fallout (spec.md §4.5): mark every receiver past
    /// `terminal_count` SKIPPED("resultAbort"). Caller still finishes the
    /// active receiver as DELIVERED afterward.
    pub fn abort_remaining(&mut self) {
        let start = self.terminal_count;
        for i in start..self.delivery_state.len() {
            if !self.delivery_state[i].is_terminal() {
                self.set_delivery_state(i, DeliveryState::skipped("resultAbort"));
            }
        }
    }

    pub fn final_result(&self) -> FinalResult {
        FinalResult {
            broadcast_id: self.id,
            result_code: self.result_code,
            result_data: self.result_data.clone(),
            result_extras: self.result_extras.clone(),
            result_abort: self.result_abort,
        }
    }

    /// `splitDeferredBootCompleted` — partition receivers by uid according
    /// to `policy`, removing deferred receivers from `self` and returning a
    /// uid -> sub-record map. Sub-records inherit enqueue timestamps but no
    /// final-result callback.
    pub fn split_deferred_boot_completed(
        &mut self,
        policy: BootDeferralPolicy,
        is_background_restricted: impl Fn(Uid) -> bool,
        is_target_t: impl Fn(Uid) -> bool,
    ) -> BTreeMap<u32, BroadcastRecord> {
        let should_defer = |uid: Uid| match policy {
            BootDeferralPolicy::All => true,
            BootDeferralPolicy::BackgroundRestrictedOnly => is_background_restricted(uid),
            BootDeferralPolicy::TargetTOnly => is_target_t(uid),
            BootDeferralPolicy::BackgroundRestrictedOrTargetT => {
                is_background_restricted(uid) || is_target_t(uid)
            }
        };

        let mut kept_receivers = Vec::new();
        let mut kept_state = Vec::new();
        let mut kept_scheduled = Vec::new();
        let mut kept_terminal = Vec::new();
        let mut deferred: BTreeMap<u32, Vec<(Receiver, DeliveryState)>> = BTreeMap::new();

        for (i, receiver) in self.receivers.drain(..).enumerate() {
            if should_defer(receiver.uid()) {
                deferred
                    .entry(receiver.uid().0)
                    .or_default()
                    .push((receiver, self.delivery_state[i].clone()));
            } else {
                kept_receivers.push(receiver);
                kept_state.push(self.delivery_state[i].clone());
                kept_scheduled.push(self.scheduled_time[i]);
                kept_terminal.push(self.terminal_time[i]);
            }
        }

        self.receivers = kept_receivers;
        self.delivery_state = kept_state;
        self.scheduled_time = kept_scheduled;
        self.terminal_time = kept_terminal;
        self.terminal_count = self.delivery_state.iter().filter(|s| s.is_terminal()).count();

        let mut out = BTreeMap::new();
        for (uid, items) in deferred {
            let n = items.len();
            let (receivers, state): (Vec<_>, Vec<_>) = items.into_iter().unzip();
            let sub = BroadcastRecord {
                id: BroadcastId::new(),
                intent: self.intent.clone(),
                caller: CallerIdentity {
                    pid: self.caller.pid,
                    uid: self.caller.uid,
                    package: self.caller.package.clone(),
                    feature: self.caller.feature.clone(),
                    instant_app: self.caller.instant_app,
                    user_id: self.caller.user_id,
                },
                ordered: self.ordered,
                sticky: self.sticky,
                initial_sticky: self.initial_sticky,
                alarm: self.alarm,
                push: self.push,
                prioritized: self.prioritized,
                required_permissions: self.required_permissions.clone(),
                excluded_permissions: self.excluded_permissions.clone(),
                required_packages: self.required_packages.clone(),
                excluded_packages: self.excluded_packages.clone(),
                app_op: self.app_op.clone(),
                options: None,
                receivers,
                final_result_callback: None,
                timeout_exempt: self.timeout_exempt,
                allow_background_activity_starts: None,
                extras_filter: self.extras_filter.clone(),
                delivery_state: state,
                scheduled_time: vec![None; n],
                terminal_time: vec![None; n],
                enqueue_time: self.enqueue_time,
                enqueue_clock_time: self.enqueue_clock_time,
                dispatch_time: None,
                finish_time: None,
                result_code: 0,
                result_data: None,
                result_extras: Extras::new(),
                result_abort: false,
                terminal_count: 0,
                anr_count: 0,
                next_receiver: 0,
                final_result_fired: false,
            };
            out.insert(uid, sub);
        }
        out
    }
}

impl fmt::Debug for BroadcastRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastRecord")
            .field("id", &self.id)
            .field("action", &self.intent.action)
            .field("ordered", &self.ordered)
            .field("receivers", &self.receivers.len())
            .field("terminal_count", &self.terminal_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caller() -> CallerIdentity {
        CallerIdentity {
            pid: 100,
            uid: Uid(1000),
            package: "com.example.caller".into(),
            feature: None,
            instant_app: false,
            user_id: 0,
        }
    }

    fn manifest_receiver(process: &str, priority: i32) -> Receiver {
        Receiver::Manifest(ManifestReceiver {
            activity_info: ActivityInfo {
                component: format!("{process}/.Receiver"),
                process_name: process.to_string(),
                application_uid: Uid(2000),
                singleton: false,
            },
            priority,
        })
    }

    #[test]
    fn terminal_state_is_never_overwritten() {
        let mut record = BroadcastRecordBuilder::new(Intent::new("X"), caller())
            .receivers(vec![manifest_receiver("proc.a", 0)])
            .build();

        assert!(record.set_delivery_state(0, DeliveryState::Delivered));
        assert!(!record.set_delivery_state(0, DeliveryState::skipped("late")));
        assert_eq!(record.delivery_state[0], DeliveryState::Delivered);
        assert_eq!(record.terminal_count, 1);
    }

    #[test]
    fn terminal_count_tracks_every_terminal_transition() {
        let mut record = BroadcastRecordBuilder::new(Intent::new("X"), caller())
            .receivers(vec![
                manifest_receiver("proc.a", 0),
                manifest_receiver("proc.b", 0),
            ])
            .build();

        assert!(!record.is_fully_terminal());
        record.set_delivery_state(0, DeliveryState::Delivered);
        assert!(!record.is_fully_terminal());
        record.set_delivery_state(1, DeliveryState::skipped("policy"));
        assert!(record.is_fully_terminal());
        assert_eq!(record.terminal_count, 2);
    }

    #[test]
    fn ordered_blocking_follows_earlier_non_terminal_receivers() {
        let record = BroadcastRecordBuilder::new(Intent::new("X"), caller())
            .ordered(true)
            .receivers(vec![
                manifest_receiver("proc.a", 0),
                manifest_receiver("proc.b", 0),
            ])
            .build();

        assert!(!record.is_blocked(0));
        assert!(record.is_blocked(1));
    }

    #[test]
    fn unordered_unprioritized_receivers_are_never_blocked() {
        let record = BroadcastRecordBuilder::new(Intent::new("X"), caller())
            .receivers(vec![
                manifest_receiver("proc.a", 0),
                manifest_receiver("proc.b", 0),
            ])
            .build();

        assert!(!record.is_blocked(1));
    }

    #[test]
    fn prioritized_is_derived_from_receiver_priority_spread() {
        let record = BroadcastRecordBuilder::new(Intent::new("X"), caller())
            .receivers(vec![manifest_receiver("proc.a", 0), manifest_receiver("proc.b", 1)])
            .build();
        assert!(record.prioritized);

        let record = BroadcastRecordBuilder::new(Intent::new("X"), caller())
            .receivers(vec![manifest_receiver("proc.a", 0), manifest_receiver("proc.b", 0)])
            .build();
        assert!(!record.prioritized);
    }

    #[test]
    fn extras_filter_returning_none_skips_the_receiver() {
        let filter: ExtrasFilter = Arc::new(|uid, _extras| if uid == Uid(2000) { None } else { Some(Extras::new()) });
        let record = BroadcastRecordBuilder::new(Intent::new("X"), caller())
            .receivers(vec![manifest_receiver("proc.a", 0)])
            .extras_filter(filter)
            .build();

        assert!(record
            .receiver_intent(&record.receivers[0])
            .is_none());
    }

    #[test]
    fn abort_remaining_skips_everything_past_terminal_count() {
        let mut record = BroadcastRecordBuilder::new(Intent::new("X"), caller())
            .ordered(true)
            .receivers(vec![
                manifest_receiver("proc.a", 0),
                manifest_receiver("proc.b", 0),
                manifest_receiver("proc.c", 0),
            ])
            .build();
        record.set_delivery_state(0, DeliveryState::Delivered);
        record.abort_remaining();

        assert_eq!(record.delivery_state[1], DeliveryState::skipped("resultAbort"));
        assert_eq!(record.delivery_state[2], DeliveryState::skipped("resultAbort"));
        assert!(record.is_fully_terminal());
    }

    #[test]
    fn split_deferred_boot_completed_partitions_by_uid() {
        let deferred_uid = Uid(3000);
        let mut deferred_receiver = manifest_receiver("proc.deferred", 0);
        if let Receiver::Manifest(m) = &mut deferred_receiver {
            m.activity_info.application_uid = deferred_uid;
        }

        let mut record = BroadcastRecordBuilder::new(Intent::new("android.intent.action.BOOT_COMPLETED"), caller())
            .receivers(vec![manifest_receiver("proc.kept", 0), deferred_receiver])
            .build();

        let split = record.split_deferred_boot_completed(
            BootDeferralPolicy::BackgroundRestrictedOnly,
            |uid| uid == deferred_uid,
            |_| false,
        );

        assert_eq!(record.receivers.len(), 1);
        assert_eq!(record.receivers[0].process_name(), "proc.kept");
        assert_eq!(split.len(), 1);
        let sub = &split[&deferred_uid.0];
        assert_eq!(sub.receivers.len(), 1);
        assert_eq!(sub.receivers[0].process_name(), "proc.deferred");
    }
}
