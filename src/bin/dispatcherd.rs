//! Standalone dispatcher host process. Wires `DispatcherConfig::from_env()`
//! plus logging-only stand-ins for the OS-level collaborators (no real
//! process manager or IPC transport ships with this crate) and runs the
//! message loop and health audit until shut down.
//!
//! Grounded on `sem_os_server::main`'s env-config + `tracing_subscriber`
//! init pattern.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use broadcast_dispatcher::{
    Dispatcher, DispatcherConfig, HistoryEntry, HistoryStore, IpcChannel, NeverSkip, Observability,
    Ports, ProcessLifecycle, ReceiverResult, TracingObservability, Uid,
};

struct LoggingProcessLifecycle;

#[async_trait]
impl ProcessLifecycle for LoggingProcessLifecycle {
    async fn start_process(&self, uid: Uid, process_name: &str, reason: &str) -> anyhow::Result<u32> {
        tracing::info!(%uid, process_name, reason, "would start process (no process manager wired)");
        anyhow::bail!("no ProcessLifecycle backend configured for dispatcherd")
    }

    async fn is_process_alive(&self, _pid: u32) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn cpu_delay_time(&self, _pid: u32) -> anyhow::Result<Duration> {
        Ok(Duration::ZERO)
    }

    async fn set_process_important(&self, _pid: u32, _important: bool) -> anyhow::Result<()> {
        Ok(())
    }

    async fn app_not_responding(&self, pid: u32, reason: &str) -> anyhow::Result<()> {
        tracing::warn!(pid, reason, "receiver ANR");
        Ok(())
    }

    async fn temp_allowlist_uid(&self, uid: Uid, duration: Duration, reason: &str) -> anyhow::Result<()> {
        tracing::info!(%uid, ?duration, reason, "temp allowlist requested");
        Ok(())
    }
}

struct LoggingIpcChannel;

#[async_trait]
impl IpcChannel for LoggingIpcChannel {
    async fn schedule_receiver(
        &self,
        pid: u32,
        receiver_id: &str,
        intent: &broadcast_dispatcher::Intent,
        ordered: bool,
    ) -> anyhow::Result<ReceiverResult> {
        tracing::info!(pid, receiver_id, action = %intent.action, ordered, "would schedule receiver (no IPC transport wired)");
        anyhow::bail!("no IpcChannel backend configured for dispatcherd")
    }
}

struct LoggingHistoryStore;

#[async_trait]
impl HistoryStore for LoggingHistoryStore {
    async fn record_delivery(&self, entry: HistoryEntry) -> anyhow::Result<()> {
        tracing::info!(
            broadcast_id = %entry.broadcast_id,
            process_name = entry.process_name,
            state = entry.state,
            "delivery history"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = DispatcherConfig::from_env();
    tracing::info!(?config, "starting broadcast dispatcher");

    let ports = Ports {
        process_lifecycle: Arc::new(LoggingProcessLifecycle),
        ipc: Arc::new(LoggingIpcChannel),
        skip_policy: Arc::new(NeverSkip),
        history: Arc::new(LoggingHistoryStore),
        observability: Arc::new(TracingObservability) as Arc<dyn Observability>,
    };

    let dispatcher = Dispatcher::new(config.clone(), ports);

    let health_check_interval = config.health_check_interval;
    let health_dispatcher = Arc::clone(&dispatcher);
    tokio::spawn(async move {
        broadcast_dispatcher::health::run_periodic_audit(health_dispatcher, health_check_interval).await;
    });

    tokio::select! {
        _ = dispatcher.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
        }
    }

    Ok(())
}
