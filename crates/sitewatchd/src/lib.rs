//! sitewatchd — PPE compliance monitoring daemon.
//!
//! Reads primary-detector frame records, runs each stream's frames
//! through its own decision pipeline on a dedicated worker thread, and
//! appends deduplicated violation events to the configured sink.

pub mod config;
pub mod coordinator;
pub mod ingest;
pub mod sink;
pub mod stream;
pub mod verifier;
