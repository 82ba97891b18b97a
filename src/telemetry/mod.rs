//! Client-side telemetry: event model, sanitizers and the batching queue.

pub mod batcher;
pub mod event;

pub use batcher::{BatcherSettings, EventBatcher, HttpTransport, Transport, TransportError};
pub use event::{BatchMeta, LogBatch, LogEvent, LogType, Severity};
