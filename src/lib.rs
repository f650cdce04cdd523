//! # workdispatch
//!
//! Durable work item dispatch: callers submit activity requests as work
//! items, worker loops claim and run them, and results are routed back to
//! the submitter.
//!
//! Queue entries travel over a categorized transport (pgmq, or in memory);
//! full records live in an ETag-versioned key/value store. OpenTelemetry
//! covers tracing, metrics and logs.

pub mod activity;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod queue;
pub mod store;
pub mod telemetry;
pub mod transport;
