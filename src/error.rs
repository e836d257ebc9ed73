// ABOUTME: Error taxonomy for the sync engine
// ABOUTME: Classifies connectivity, timeout, schema, partial-load and configuration failures

use std::time::Duration;
use thiserror::Error;

/// Failures the engine distinguishes between.
///
/// Adapters and the pipeline return `anyhow::Error`; these variants are wrapped
/// inside it and recovered with `downcast_ref::<SyncError>()` where the caller
/// needs to react differently (health flag, retry, status reporting).
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{component} is unreachable: {reason}")]
    Connectivity {
        component: &'static str,
        reason: String,
    },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("table {0} does not exist")]
    SchemaMissing(String),

    #[error("load stopped after {loaded} of {attempted} records, failed at {entity_id}: {reason}")]
    PartialLoad {
        loaded: usize,
        attempted: usize,
        entity_id: String,
        reason: String,
    },

    #[error("pipeline '{0}' is not registered")]
    UnknownPipeline(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SyncError {
    /// Transient failures are retried on the next tick without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Connectivity { .. } | SyncError::Timeout { .. } | SyncError::PartialLoad { .. }
        )
    }
}

/// Returns true when the error chain carries a transient `SyncError`.
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<SyncError>())
        .any(SyncError::is_transient)
}
