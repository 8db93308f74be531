//! Test and instrumentation gates (spec.md §4.6): ways for a caller to wait
//! until the dispatcher reaches a particular point, without polling.
//!
//! Grounded on `ob-workflow::listener`'s `wait_for_completion`-style helpers
//! that poll a shared state snapshot on an interval rather than exposing the
//! lock directly to callers.

use std::time::Duration;

use tokio::time::{interval, timeout};

use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, Result};
use crate::record::BroadcastId;

/// Poll until every process queue is idle (no active dispatch, no pending
/// receivers), or `deadline` elapses.
pub async fn wait_for_idle(dispatcher: &Dispatcher, deadline: Duration) -> Result<()> {
    timeout(deadline, async {
        let mut ticks = interval(Duration::from_millis(5));
        loop {
            if dispatcher.inspect(|state| state.is_idle()).await {
                return;
            }
            ticks.tick().await;
        }
    })
    .await
    .map_err(|_| DispatchError::Collaborator(anyhow::anyhow!("timed out waiting for dispatcher to go idle")))
}

/// Poll until `broadcast_id` is fully terminal (every receiver delivered,
/// skipped, timed out, or failed), or `deadline` elapses.
pub async fn wait_for(dispatcher: &Dispatcher, broadcast_id: BroadcastId, deadline: Duration) -> Result<()> {
    timeout(deadline, async {
        let mut ticks = interval(Duration::from_millis(5));
        loop {
            let done = dispatcher
                .inspect(move |state| {
                    state
                        .records
                        .get(&broadcast_id)
                        .map(|r| r.is_fully_terminal())
                        .unwrap_or(true)
                })
                .await;
            if done {
                return;
            }
            ticks.tick().await;
        }
    })
    .await
    .map_err(|_| DispatchError::Collaborator(anyhow::anyhow!("timed out waiting for broadcast {broadcast_id} to finish")))
}

/// True once the dispatcher's terminal-event counter has advanced past
/// `barrier` — used by tests to assert "at least N deliveries have
/// completed" without naming a specific broadcast.
pub async fn is_beyond_barrier(dispatcher: &Dispatcher, barrier: u64) -> bool {
    dispatcher.inspect(move |state| state.terminal_sequence >= barrier).await
}

/// Snapshot the current terminal-event counter, to later pass to
/// `is_beyond_barrier`.
pub async fn current_barrier(dispatcher: &Dispatcher) -> u64 {
    dispatcher.inspect(|state| state.terminal_sequence).await
}
