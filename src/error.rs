//! Crate-wide error type for boundary failures.
//!
//! Per-receiver outcomes (skipped/failed/timed out) are `DeliveryState`
//! values, not errors — see `record::DeliveryState`. `DispatchError` is
//! reserved for failures that cross an API boundary with no receiver to
//! attach a `DeliveryState` to.

use thiserror::Error;

use crate::process_queue::ProcessQueueKey;
use crate::record::BroadcastId;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown process queue: {0:?}")]
    UnknownQueue(ProcessQueueKey),

    #[error("broadcast record not found: {0:?}")]
    UnknownRecord(BroadcastId),

    #[error("process queue {0:?} has no active receiver")]
    NotActive(ProcessQueueKey),

    #[error("delivery-group policy MERGED requires an extras merger")]
    MissingMerger,

    #[error("collaborator error: {0}")]
    Collaborator(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
