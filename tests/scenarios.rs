//! End-to-end scenarios exercising the public dispatch API only (no access
//! to `Dispatcher`'s private scheduling internals), one `#[tokio::test]` per
//! scenario.
//!
//! Requires the `test-util` feature so the in-memory collaborator fakes
//! under `ports::fakes` are visible to this integration-test crate:
//! `cargo test --features test-util`.

#![cfg(feature = "test-util")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use broadcast_dispatcher::ports::fakes::{FakeHistoryStore, FakeIpcChannel, FakeProcessLifecycle};
use broadcast_dispatcher::{
    gates, ActivityInfo, BroadcastOptions, CallerIdentity, DeliveryGroupPolicy, DeliveryState, Dispatcher,
    DispatcherConfig, Extras, ExtrasMerger, FinalResult, Intent, ManifestReceiver, NeverSkip, Ports, ProcessLifecycle,
    Receiver, ReceiverResult, TracingObservability, Uid, RESULT_CANCELED,
};

fn caller(uid: u32) -> CallerIdentity {
    CallerIdentity {
        pid: 1,
        uid: Uid(uid),
        package: "com.example.caller".into(),
        feature: None,
        instant_app: false,
        user_id: 0,
    }
}

fn manifest(process: &str, uid: u32) -> Receiver {
    Receiver::Manifest(ManifestReceiver {
        activity_info: ActivityInfo {
            component: format!("{process}/.Receiver"),
            process_name: process.to_string(),
            application_uid: Uid(uid),
            singleton: false,
        },
        priority: 0,
    })
}

fn default_ports() -> Ports {
    Ports {
        process_lifecycle: Arc::new(FakeProcessLifecycle::default()),
        ipc: Arc::new(FakeIpcChannel::default()),
        skip_policy: Arc::new(NeverSkip),
        history: Arc::new(FakeHistoryStore::default()),
        observability: Arc::new(TracingObservability),
    }
}

/// Counts final-result callback invocations and records the last result seen.
#[derive(Default)]
struct ResultRecorder {
    count: AtomicUsize,
    last: Mutex<Option<FinalResult>>,
}

impl ResultRecorder {
    fn callback(self: &Arc<Self>) -> broadcast_dispatcher::FinalResultCallback {
        let recorder = Arc::clone(self);
        Arc::new(move |result: &FinalResult| {
            recorder.count.fetch_add(1, Ordering::SeqCst);
            *recorder.last.lock().unwrap() = Some(result.clone());
        })
    }

    fn fire_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

fn spawn(dispatcher: &Arc<Dispatcher>) {
    let runner = Arc::clone(dispatcher);
    tokio::spawn(async move { runner.run().await });
}

#[tokio::test]
async fn unordered_broadcast_to_two_cold_processes_both_deliver() {
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), default_ports());
    spawn(&dispatcher);

    let recorder = Arc::new(ResultRecorder::default());
    let id = dispatcher
        .enqueue_with_callback(
            Intent::new("com.example.PING"),
            caller(1000),
            vec![manifest("proc.a", 2001), manifest("proc.b", 2002)],
            false,
            None,
            Some(recorder.callback()),
        )
        .await
        .unwrap();

    gates::wait_for(&dispatcher, id, Duration::from_secs(2)).await.unwrap();

    let (states, terminal_count) = dispatcher
        .inspect(move |state| {
            let record = state.records.get(&id).unwrap();
            (record.delivery_state.clone(), record.terminal_count)
        })
        .await;

    assert_eq!(terminal_count, 2);
    for state in &states {
        assert!(matches!(state, DeliveryState::Delivered), "expected Delivered, got {state:?}");
    }
    assert_eq!(recorder.fire_count(), 1, "final-result callback must fire exactly once");
}

#[tokio::test]
async fn ordered_broadcast_abort_skips_later_receivers_and_fires_once() {
    let fake_ipc = Arc::new(FakeIpcChannel::default());
    fake_ipc.set_result_for(
        "proc.a/.Receiver",
        ReceiverResult {
            result_code: 1,
            result_data: None,
            result_extras: Extras::default(),
            result_abort: true,
        },
    );
    let ports = Ports {
        ipc: fake_ipc,
        ..default_ports()
    };
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), ports);
    spawn(&dispatcher);

    let recorder = Arc::new(ResultRecorder::default());
    let id = dispatcher
        .enqueue_with_callback(
            Intent::new("com.example.ORDERED"),
            caller(1000),
            vec![manifest("proc.a", 2001), manifest("proc.a", 2001), manifest("proc.a", 2001)],
            true,
            None,
            Some(recorder.callback()),
        )
        .await
        .unwrap();

    gates::wait_for(&dispatcher, id, Duration::from_secs(2)).await.unwrap();

    let (states, result_code, result_abort) = dispatcher
        .inspect(move |state| {
            let record = state.records.get(&id).unwrap();
            (record.delivery_state.clone(), record.result_code, record.result_abort)
        })
        .await;

    assert!(matches!(states[0], DeliveryState::Delivered));
    assert!(matches!(&states[1], DeliveryState::Skipped { ref reason } if reason == "resultAbort"));
    assert!(matches!(&states[2], DeliveryState::Skipped { ref reason } if reason == "resultAbort"));
    assert_eq!(result_code, 1);
    assert!(result_abort);
    assert_eq!(recorder.fire_count(), 1);
}

#[tokio::test]
async fn replace_pending_cancels_the_earlier_same_caller_broadcast() {
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), default_ports());

    let mut intent1 = Intent::new("com.example.REPLACE");
    intent1.extras.insert("k".into(), serde_json::json!(1));
    let options1 = BroadcastOptions {
        replace_pending: true,
        ..Default::default()
    };
    let id1 = dispatcher
        .enqueue(intent1, caller(1000), vec![manifest("proc.target", 2001)], false, Some(options1))
        .await
        .unwrap();

    let mut intent2 = Intent::new("com.example.REPLACE");
    intent2.extras.insert("k".into(), serde_json::json!(2));
    let options2 = BroadcastOptions {
        replace_pending: true,
        ..Default::default()
    };
    let id2 = dispatcher
        .enqueue(intent2, caller(1000), vec![manifest("proc.target", 2001)], false, Some(options2))
        .await
        .unwrap();

    // The message loop is not spawned until both enqueues have landed, so
    // the cancellation above could not have raced an in-flight dispatch.
    spawn(&dispatcher);

    gates::wait_for(&dispatcher, id2, Duration::from_secs(2)).await.unwrap();

    let (r1_state, r1_code, r2_state) = dispatcher
        .inspect(move |state| {
            let r1 = state.records.get(&id1).unwrap();
            let r2 = state.records.get(&id2).unwrap();
            (r1.delivery_state[0].clone(), r1.result_code, r2.delivery_state[0].clone())
        })
        .await;

    assert!(matches!(r1_state, DeliveryState::Skipped { .. }));
    assert_eq!(r1_code, RESULT_CANCELED);
    assert!(matches!(r2_state, DeliveryState::Delivered));
}

#[tokio::test]
async fn at_most_one_cold_start_is_ever_in_flight() {
    let lifecycle = Arc::new(FakeProcessLifecycle::default());
    let ports = Ports {
        process_lifecycle: Arc::clone(&lifecycle) as Arc<dyn ProcessLifecycle>,
        ..default_ports()
    };
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), ports);

    for (name, uid) in [("proc.a", 2001), ("proc.b", 2002), ("proc.c", 2003)] {
        dispatcher
            .enqueue(Intent::new("com.example.COLD"), caller(1000), vec![manifest(name, uid)], false, None)
            .await
            .unwrap();
    }

    spawn(&dispatcher);

    // Sample the invariant repeatedly while the three queues race to cold
    // start: at every sample, at most one queue may hold the slot.
    let mut observed_claimed = false;
    for _ in 0..200 {
        let (claimed, pending_flags) = dispatcher
            .inspect(|state| {
                let claimed = state.running_cold_start.is_some();
                let pending_flags = state.queues.values().filter(|q| q.pending_cold_start).count();
                (claimed, pending_flags)
            })
            .await;
        assert!(pending_flags <= 1, "at most one queue may await cold-start attach at a time");
        if claimed {
            observed_claimed = true;
        }
        if lifecycle.started.lock().unwrap().len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    assert!(observed_claimed, "expected to observe the cold-start slot claimed at least once");
    assert_eq!(lifecycle.started.lock().unwrap().len(), 3, "all three processes eventually cold start");
}

#[tokio::test(start_paused = true)]
async fn cpu_starved_receiver_gets_a_later_hard_timeout_than_an_immediate_one() {
    let lifecycle = Arc::new(FakeProcessLifecycle::default());
    // Simulate a process accruing CPU delay at 0.6x wall-clock while the
    // receiver runs — spec.md §8 scenario 5's boundary case.
    *lifecycle.cpu_delay_rate.lock().unwrap() = 0.6;

    let ipc = Arc::new(FakeIpcChannel::default());
    ipc.hang_forever("proc.a/.Receiver");

    let mut config = DispatcherConfig::default();
    config.timeout_background = Duration::from_millis(100);
    config.timeout_cap = Duration::from_millis(200);

    let ports = Ports {
        process_lifecycle: Arc::clone(&lifecycle) as Arc<dyn ProcessLifecycle>,
        ipc,
        ..default_ports()
    };
    let dispatcher = Dispatcher::new(config, ports);
    spawn(&dispatcher);

    let id = dispatcher
        .enqueue(Intent::new("com.example.SLOW"), caller(1000), vec![manifest("proc.a", 2001)], false, None)
        .await
        .unwrap();

    // Let the cold start, attach, and dispatch settle, then reach the soft
    // timeout (~100ms).
    tokio::time::advance(Duration::from_millis(110)).await;
    tokio::task::yield_now().await;

    let still_scheduled = dispatcher
        .inspect(move |state| matches!(state.records.get(&id).unwrap().delivery_state[0], DeliveryState::Scheduled))
        .await;
    assert!(still_scheduled, "soft timeout alone must not finish the receiver");
    assert!(lifecycle.anrs.lock().unwrap().is_empty(), "ANR reporting happens at the hard timeout, not the soft one");

    // The hard timeout was scheduled ~0.6*100ms = 60ms after the soft
    // timeout fired, not immediately and not at the old fixed soft+cap
    // (=300ms) this crate used before the CPU-starvation extension existed.
    tokio::time::advance(Duration::from_millis(80)).await;
    tokio::task::yield_now().await;

    let timed_out = dispatcher
        .inspect(move |state| matches!(state.records.get(&id).unwrap().delivery_state[0], DeliveryState::Timeout))
        .await;
    assert!(timed_out, "hard timeout should have fired once the CPU-starvation extension elapsed");
    assert_eq!(lifecycle.anrs.lock().unwrap().len(), 1, "hard timeout reports exactly one ANR");
}

#[tokio::test]
async fn merged_delivery_group_sums_extras_into_the_surviving_broadcast() {
    let dispatcher = Dispatcher::new(DispatcherConfig::default(), default_ports());

    let merger: ExtrasMerger = Arc::new(|older: &Extras, newer: &mut Extras| {
        let older_n = older.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
        let newer_n = newer.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
        newer.insert("n".into(), serde_json::json!(older_n + newer_n));
    });

    let mut intent1 = Intent::new("com.example.MERGE");
    intent1.extras.insert("n".into(), serde_json::json!(3));
    let options1 = BroadcastOptions {
        delivery_group_policy: Some(DeliveryGroupPolicy::Merged(Arc::clone(&merger))),
        ..Default::default()
    };
    let id1 = dispatcher
        .enqueue(intent1, caller(1000), vec![manifest("proc.target", 2001)], false, Some(options1))
        .await
        .unwrap();

    let mut intent2 = Intent::new("com.example.MERGE");
    intent2.extras.insert("n".into(), serde_json::json!(4));
    let options2 = BroadcastOptions {
        delivery_group_policy: Some(DeliveryGroupPolicy::Merged(merger)),
        ..Default::default()
    };
    let id2 = dispatcher
        .enqueue(intent2, caller(1000), vec![manifest("proc.target", 2001)], false, Some(options2))
        .await
        .unwrap();

    spawn(&dispatcher);
    gates::wait_for(&dispatcher, id2, Duration::from_secs(2)).await.unwrap();

    let (r1_state, r2_state, r2_extras) = dispatcher
        .inspect(move |state| {
            let r1 = state.records.get(&id1).unwrap();
            let r2 = state.records.get(&id2).unwrap();
            (r1.delivery_state[0].clone(), r2.delivery_state[0].clone(), r2.intent.extras.clone())
        })
        .await;

    assert!(matches!(r1_state, DeliveryState::Skipped { .. }));
    assert!(matches!(r2_state, DeliveryState::Delivered));
    assert_eq!(r2_extras.get("n").and_then(|v| v.as_i64()), Some(7));
}
