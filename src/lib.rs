// ABOUTME: Library root for warehouse-sync
// ABOUTME: Incremental change capture from control databases into a warehouse sink and event stream

pub mod cache;
pub mod config;
pub mod detector;
pub mod error;
/// In-memory adapters for tests. Not part of the supported API.
#[doc(hidden)]
pub mod memory;
pub mod offset;
pub mod orchestrator;
pub mod pipeline;
pub mod postgres;
pub mod record;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod utils;

pub use error::SyncError;
pub use record::{FieldValue, Record, RecordKey};
