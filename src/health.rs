//! Periodic self-consistency audit (spec.md §4.7): catches runnable-list or
//! running-set bookkeeping bugs in production rather than trusting them
//! silently, the way `sem_os_server::dispatcher` runs a periodic queue-depth
//! sanity sweep.

use std::sync::Arc;
use std::time::Duration;

use crate::dispatcher::{Dispatcher, DispatcherState};
use crate::runnable_list;

#[derive(Debug, Default)]
pub struct HealthReport {
    pub queues_checked: usize,
    pub anomalies: Vec<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.anomalies.is_empty()
    }
}

fn audit(state: &DispatcherState) -> HealthReport {
    let mut report = HealthReport {
        queues_checked: state.queues.len(),
        anomalies: Vec::new(),
    };

    for (key, queue) in &state.queues {
        if queue.active.is_some() && !state.running_set.contains(key) {
            report.anomalies.push(format!("{key}: has an active receiver but is absent from the running set"));
        }
        if let Some(active) = queue.active {
            if !state.records.contains_key(&active.broadcast_id) {
                report.anomalies.push(format!("{key}: active receiver references a dropped broadcast record"));
            }
        }
        for pending in queue.pending.iter() {
            if !state.records.contains_key(&pending.broadcast_id) {
                report.anomalies.push(format!("{key}: pending receiver references a dropped broadcast record"));
            }
        }
    }

    let walked = runnable_list::iter_ordered(&state.runnable_list, &state.queues);
    let walked_count = walked.len();
    let flagged_count = state.queues.values().filter(|q| q.in_runnable_list).count();
    if walked_count != flagged_count {
        report.anomalies.push(format!(
            "runnable list walk visited {walked_count} queues but {flagged_count} are flagged in_runnable_list"
        ));
    }

    if state.running_set.len() > state.running_set.capacity() {
        report.anomalies.push(format!(
            "running set has {} members over its capacity of {}",
            state.running_set.len(),
            state.running_set.capacity()
        ));
    }

    let pending_cold_starts = state.queues.values().filter(|q| q.pending_cold_start).count();
    match &state.running_cold_start {
        Some(key) => {
            if pending_cold_starts != 1 || !state.queues.get(key).map(|q| q.pending_cold_start).unwrap_or(false) {
                report.anomalies.push(format!(
                    "running_cold_start={key} but {pending_cold_starts} queues are flagged pending_cold_start"
                ));
            }
        }
        None if pending_cold_starts > 0 => {
            report.anomalies.push(format!(
                "no running_cold_start slot claimed but {pending_cold_starts} queues are flagged pending_cold_start"
            ));
        }
        None => {}
    }

    report
}

/// Run one audit pass immediately, without waiting for the periodic loop.
pub async fn check_now(dispatcher: &Dispatcher) -> HealthReport {
    dispatcher.inspect(audit).await
}

/// Spawns the periodic audit loop; logs a warning every time an audit finds
/// anomalies. Intended to run for the lifetime of the process alongside
/// `Dispatcher::run`.
///
/// Per spec.md §4.7 / §7, a violation is logged once as a crash-style
/// diagnostic and then future audits stop — to avoid log-spam from a
/// persistently inconsistent state — without halting dispatch itself.
pub async fn run_periodic_audit(dispatcher: Arc<Dispatcher>, interval: Duration) {
    let mut ticks = tokio::time::interval(interval);
    loop {
        ticks.tick().await;
        let report = check_now(&dispatcher).await;
        if !report.is_healthy() {
            tracing::error!(
                anomalies = ?report.anomalies,
                queues_checked = report.queues_checked,
                "dispatcher health audit found anomalies; disabling future audits"
            );
            return;
        }
        tracing::debug!(queues_checked = report.queues_checked, "dispatcher health audit clean");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatcherConfig;
    use crate::ports::fakes::{FakeHistoryStore, FakeIpcChannel, FakeProcessLifecycle};
    use crate::ports::{NeverSkip, Ports, TracingObservability};
    use std::sync::Arc;

    fn test_ports() -> Ports {
        Ports {
            process_lifecycle: Arc::new(FakeProcessLifecycle::default()),
            ipc: Arc::new(FakeIpcChannel::default()),
            skip_policy: Arc::new(NeverSkip),
            history: Arc::new(FakeHistoryStore::default()),
            observability: Arc::new(TracingObservability),
        }
    }

    #[tokio::test]
    async fn empty_dispatcher_is_healthy() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default(), test_ports());
        let report = check_now(&dispatcher).await;
        assert!(report.is_healthy());
    }
}
