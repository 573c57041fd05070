//! # projectq
//!
//! Durable work item state machine with queue-driven execution.
//!
//! Submitted items are stored in Postgres and referenced by pgmq messages.
//! A worker pool receives deliveries, claims items with a conditional
//! update, runs the handler registered for the item's kind and records
//! COMPLETED or ERROR. Unacked deliveries are redelivered after their
//! visibility deadline, which is how a crashed worker's item is recovered.

pub mod broker;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod model;
pub mod retry;
pub mod store;
pub mod telemetry;
