//! Collaborator ports: the handful of external systems the dispatcher must
//! call out to (process lifecycle, IPC delivery, skip policy, history,
//! observability), each modeled as an `#[async_trait]` trait with a
//! production stub and an in-memory `#[cfg(test)]` fake.
//!
//! Grounded directly on `ob-workflow::blob_store::BlobStore`'s
//! trait+impl+fake layout and `sem_os_core::ports`'s trait-per-collaborator
//! split.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::record::{BroadcastId, Intent, Uid};

/// Starts, queries, and tears down application processes. Covers spec.md's
/// `startProcess`, OOM/LRU adjustment hints, ANR reporting, and temp
/// allowlisting — one trait, since all of them act on the same process
/// handle (capability-table entry in SPEC_FULL.md).
#[async_trait]
pub trait ProcessLifecycle: Send + Sync {
    /// Request a cold start for `process_name` under `uid`. Returns the new
    /// pid once the process has attached, or an error if the start was
    /// refused (e.g. quota, disabled package).
    async fn start_process(&self, uid: Uid, process_name: &str, reason: &str) -> anyhow::Result<u32>;

    /// True if the process is still alive and unchanged since attach.
    async fn is_process_alive(&self, pid: u32) -> anyhow::Result<bool>;

    /// Cumulative time the process has spent runnable-but-not-scheduled
    /// (`app.cpuDelayTime`). The soft-timeout handler diffs two samples of
    /// this counter to grant CPU-starved receivers extra time before the
    /// hard timeout fires.
    async fn cpu_delay_time(&self, pid: u32) -> anyhow::Result<Duration>;

    /// Adjust the process's OOM-kill priority while it is actively
    /// delivering a broadcast.
    async fn set_process_important(&self, pid: u32, important: bool) -> anyhow::Result<()>;

    /// Report an App Not Responding condition for the given process.
    async fn app_not_responding(&self, pid: u32, reason: &str) -> anyhow::Result<()>;

    /// Grant `uid` a temporary power/background-start allowlist entry.
    async fn temp_allowlist_uid(&self, uid: Uid, duration: Duration, reason: &str) -> anyhow::Result<()>;
}

/// Delivers a receiver call into an attached process and awaits its result.
#[async_trait]
pub trait IpcChannel: Send + Sync {
    /// Deliver `intent` to `receiver_id` hosted in `pid`. Returns the
    /// receiver's result triple once it finishes (or calls `goAsync` and
    /// later completes — the port hides that distinction from the caller).
    async fn schedule_receiver(
        &self,
        pid: u32,
        receiver_id: &str,
        intent: &Intent,
        ordered: bool,
    ) -> anyhow::Result<ReceiverResult>;
}

#[derive(Debug, Clone, Default)]
pub struct ReceiverResult {
    pub result_code: i32,
    pub result_data: Option<String>,
    pub result_extras: crate::record::Extras,
    pub result_abort: bool,
}

/// Decides whether a given receiver should be skipped before it is ever
/// scheduled (background restrictions, permission denial, disabled
/// package, etc). Kept separate from `ProcessLifecycle` since it is a pure
/// policy query with no side effects.
#[async_trait]
pub trait SkipPolicy: Send + Sync {
    async fn should_skip(&self, uid: Uid, process_name: &str, intent: &Intent) -> anyhow::Result<Option<String>>;
}

/// Durable log of delivered/skipped/timed-out broadcasts, queried by
/// `dumpsys`-style tooling. Append-only from the dispatcher's perspective.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn record_delivery(&self, entry: HistoryEntry) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub broadcast_id: BroadcastId,
    pub process_name: String,
    pub action: String,
    pub state: String,
    pub duration: Duration,
}

/// Structured event sink for scheduling decisions, independent of
/// `tracing` so tests can assert on emitted events without a subscriber.
#[async_trait]
pub trait Observability: Send + Sync {
    async fn on_broadcast_enqueued(&self, broadcast_id: BroadcastId, receiver_count: usize);
    async fn on_receiver_scheduled(&self, broadcast_id: BroadcastId, process_name: &str);
    async fn on_receiver_terminal(&self, broadcast_id: BroadcastId, process_name: &str, state: &str);
    async fn on_anr(&self, broadcast_id: BroadcastId, process_name: &str);
}

/// Default `SkipPolicy` that never skips — the no-op identity policy a
/// caller composes with its own rules.
pub struct NeverSkip;

#[async_trait]
impl SkipPolicy for NeverSkip {
    async fn should_skip(&self, _uid: Uid, _process_name: &str, _intent: &Intent) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

/// Default `HistoryStore` that discards everything — used when a caller
/// has no durable history backend configured.
pub struct NullHistory;

#[async_trait]
impl HistoryStore for NullHistory {
    async fn record_delivery(&self, _entry: HistoryEntry) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Default `Observability` sink that forwards every event to `tracing`.
pub struct TracingObservability;

#[async_trait]
impl Observability for TracingObservability {
    async fn on_broadcast_enqueued(&self, broadcast_id: BroadcastId, receiver_count: usize) {
        tracing::info!(%broadcast_id, receiver_count, "broadcast enqueued");
    }

    async fn on_receiver_scheduled(&self, broadcast_id: BroadcastId, process_name: &str) {
        tracing::debug!(%broadcast_id, process_name, "receiver scheduled");
    }

    async fn on_receiver_terminal(&self, broadcast_id: BroadcastId, process_name: &str, state: &str) {
        tracing::debug!(%broadcast_id, process_name, state, "receiver terminal");
    }

    async fn on_anr(&self, broadcast_id: BroadcastId, process_name: &str) {
        tracing::warn!(%broadcast_id, process_name, "receiver ANR");
    }
}

/// Bundle of collaborators the dispatcher depends on, passed in at
/// construction. Mirrors `ob-workflow`'s practice of wiring concrete
/// `Arc<dyn Trait>` collaborators into the engine rather than threading
/// five separate constructor parameters.
#[derive(Clone)]
pub struct Ports {
    pub process_lifecycle: Arc<dyn ProcessLifecycle>,
    pub ipc: Arc<dyn IpcChannel>,
    pub skip_policy: Arc<dyn SkipPolicy>,
    pub history: Arc<dyn HistoryStore>,
    pub observability: Arc<dyn Observability>,
}

/// In-memory fakes for every port trait. Always available to the crate's
/// own unit tests; exposed to `tests/*.rs` integration tests too via the
/// `test-util` feature (`cargo test --features test-util`), since those
/// compile as a separate crate that `cfg(test)` alone would not reach.
#[cfg(any(test, feature = "test-util"))]
pub mod fakes {
    use super::*;
    use std::sync::Mutex;

    /// In-memory `ProcessLifecycle` fake: starts processes instantly,
    /// assigning sequential pids, and records every call for assertions.
    /// Grounded on `ob-workflow::blob_store`'s `InMemoryBlobStore`.
    pub struct FakeProcessLifecycle {
        next_pid: Mutex<u32>,
        pub started: Mutex<Vec<(Uid, String)>>,
        pub anrs: Mutex<Vec<(u32, String)>>,
        pub refuse_start: Mutex<bool>,
        pub alive: Mutex<bool>,
        /// `app.cpuDelayTime` grows linearly with wall-clock time at this
        /// fraction, so tests can simulate a CPU-starved receiver by setting
        /// a rate and letting real time (or, under `start_paused`, virtual
        /// time) elapse between the schedule-time baseline sample and the
        /// soft-timeout sample.
        pub cpu_delay_rate: Mutex<f64>,
        cpu_delay_started: Instant,
    }

    impl Default for FakeProcessLifecycle {
        fn default() -> Self {
            Self {
                next_pid: Mutex::new(1000),
                started: Mutex::new(Vec::new()),
                anrs: Mutex::new(Vec::new()),
                refuse_start: Mutex::new(false),
                alive: Mutex::new(true),
                cpu_delay_rate: Mutex::new(0.0),
                cpu_delay_started: Instant::now(),
            }
        }
    }

    #[async_trait]
    impl ProcessLifecycle for FakeProcessLifecycle {
        async fn start_process(&self, uid: Uid, process_name: &str, _reason: &str) -> anyhow::Result<u32> {
            if *self.refuse_start.lock().unwrap() {
                anyhow::bail!("process start refused");
            }
            self.started.lock().unwrap().push((uid, process_name.to_string()));
            let mut next = self.next_pid.lock().unwrap();
            let pid = *next;
            *next += 1;
            Ok(pid)
        }

        async fn is_process_alive(&self, _pid: u32) -> anyhow::Result<bool> {
            Ok(*self.alive.lock().unwrap())
        }

        async fn cpu_delay_time(&self, _pid: u32) -> anyhow::Result<Duration> {
            let rate = *self.cpu_delay_rate.lock().unwrap();
            Ok(Duration::from_secs_f64(self.cpu_delay_started.elapsed().as_secs_f64() * rate))
        }

        async fn set_process_important(&self, _pid: u32, _important: bool) -> anyhow::Result<()> {
            Ok(())
        }

        async fn app_not_responding(&self, pid: u32, reason: &str) -> anyhow::Result<()> {
            self.anrs.lock().unwrap().push((pid, reason.to_string()));
            Ok(())
        }

        async fn temp_allowlist_uid(&self, _uid: Uid, _duration: Duration, _reason: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// In-memory `IpcChannel` fake: delivers immediately with a
    /// caller-configured result, recording every delivery it saw. A result
    /// queued for a specific `receiver_id` via `results_for` takes priority
    /// over `default_result`, so tests can script abort/result sequences.
    pub struct FakeIpcChannel {
        pub deliveries: Mutex<Vec<(u32, String, String)>>,
        pub default_result: ReceiverResult,
        pub results_for: Mutex<std::collections::HashMap<String, ReceiverResult>>,
        /// Receiver ids that never return a result, to exercise the
        /// soft/hard timeout path instead of the normal finish path.
        pub hung: Mutex<std::collections::HashSet<String>>,
    }

    impl Default for FakeIpcChannel {
        fn default() -> Self {
            Self {
                deliveries: Mutex::new(Vec::new()),
                default_result: ReceiverResult::default(),
                results_for: Mutex::new(std::collections::HashMap::new()),
                hung: Mutex::new(std::collections::HashSet::new()),
            }
        }
    }

    impl FakeIpcChannel {
        pub fn set_result_for(&self, receiver_id: impl Into<String>, result: ReceiverResult) {
            self.results_for.lock().unwrap().insert(receiver_id.into(), result);
        }

        pub fn hang_forever(&self, receiver_id: impl Into<String>) {
            self.hung.lock().unwrap().insert(receiver_id.into());
        }
    }

    #[async_trait]
    impl IpcChannel for FakeIpcChannel {
        async fn schedule_receiver(
            &self,
            pid: u32,
            receiver_id: &str,
            intent: &Intent,
            _ordered: bool,
        ) -> anyhow::Result<ReceiverResult> {
            self.deliveries
                .lock()
                .unwrap()
                .push((pid, receiver_id.to_string(), intent.action.clone()));
            if self.hung.lock().unwrap().contains(receiver_id) {
                std::future::pending::<()>().await;
            }
            let result = self
                .results_for
                .lock()
                .unwrap()
                .get(receiver_id)
                .cloned()
                .unwrap_or_else(|| self.default_result.clone());
            Ok(result)
        }
    }

    pub struct FakeHistoryStore {
        pub entries: Mutex<Vec<HistoryEntry>>,
    }

    impl Default for FakeHistoryStore {
        fn default() -> Self {
            Self {
                entries: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl HistoryStore for FakeHistoryStore {
        async fn record_delivery(&self, entry: HistoryEntry) -> anyhow::Result<()> {
            self.entries.lock().unwrap().push(entry);
            Ok(())
        }
    }

    #[tokio::test]
    async fn fake_process_lifecycle_assigns_sequential_pids() {
        let lifecycle = FakeProcessLifecycle::default();
        let a = lifecycle.start_process(Uid(1), "proc.a", "cold start").await.unwrap();
        let b = lifecycle.start_process(Uid(1), "proc.b", "cold start").await.unwrap();
        assert_eq!(b, a + 1);
        assert_eq!(lifecycle.started.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn fake_process_lifecycle_honors_refuse_start() {
        let lifecycle = FakeProcessLifecycle::default();
        *lifecycle.refuse_start.lock().unwrap() = true;
        assert!(lifecycle.start_process(Uid(1), "proc.a", "cold start").await.is_err());
    }

    #[tokio::test]
    async fn fake_ipc_channel_records_every_delivery() {
        let ipc = FakeIpcChannel::default();
        let intent = Intent::new("android.intent.action.BOOT_COMPLETED");
        ipc.schedule_receiver(1000, "recv-1", &intent, false).await.unwrap();
        assert_eq!(ipc.deliveries.lock().unwrap().len(), 1);
    }
}
