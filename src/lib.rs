//! ADSIM: real-time ad auction marketplace simulator
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod engine;
pub mod storage;
pub mod metrics;
pub mod seed;
pub mod api;
