//! Append-only run records.
//!
//! Two durable logs sit next to the state store:
//! - the event log (`events.jsonl`), one [`Event`](crate::core::Event) per line,
//!   written through an [`EventSink`]
//! - the error log (`errors.log`), one human-readable block per failed item

mod error_log;
mod sink;

pub use error_log::{ErrorLog, ERROR_LOG_LIMIT};
pub use sink::{CollectingEventSink, EventSink, JsonlEventSink, NoOpEventSink};
