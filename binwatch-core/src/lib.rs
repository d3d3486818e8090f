//! Core of the binwatch fill-level monitor: ingestion, per-bin state
//! machine, emptying command dispatch, and the event router tying them to a
//! store and a message bus.

/// Tunable thresholds, windows, and timeouts.
pub mod config;
/// Emptying command lifecycle.
pub mod dispatcher;
/// Pure per-bin state machine.
pub mod engine;
/// Validation and deduplication of sensor readings.
pub mod ingest;
/// In-memory store and bus used by tests and embedders.
pub mod memory;
/// Domain models and identifiers.
pub mod model;
/// Traits describing the storage and bus backends.
pub mod ports;
/// Bounded exponential backoff.
pub mod retry;
/// Per-bin serialization of all events.
pub mod router;
/// Topics and payloads on the message bus.
pub mod wire;
/// Per-bin worker tasks.
pub mod workers;

pub use config::*;
pub use dispatcher::*;
pub use engine::*;
pub use ingest::*;
pub use memory::*;
pub use model::*;
pub use ports::*;
pub use retry::*;
pub use router::*;
pub use wire::*;
pub use workers::*;
