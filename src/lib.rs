//! Per-process broadcast dispatcher: schedules intent-broadcast delivery
//! across a bounded number of concurrently-running application processes,
//! behind a single lock and a host message loop.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gates;
pub mod health;
pub mod ports;
pub mod process_queue;
pub mod record;
pub mod runnable_list;
pub mod running_set;

pub use config::DispatcherConfig;
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, Result};
pub use ports::{HistoryEntry, HistoryStore, IpcChannel, NeverSkip, NullHistory, Observability, Ports, ProcessLifecycle, ReceiverResult, SkipPolicy, TracingObservability};
pub use process_queue::{PriorityLane, ProcessQueueKey};
pub use record::{
    ActivityInfo, BootDeferralPolicy, BroadcastId, BroadcastOptions, BroadcastRecord, BroadcastRecordBuilder,
    CallerIdentity, DeliveryGroupMatcher, DeliveryGroupPolicy, DeliveryState, Extras, ExtrasFilter, ExtrasMerger,
    FinalResult, FinalResultCallback, Intent, ManifestReceiver, Receiver, RegisteredReceiver, Uid, RESULT_CANCELED,
};
