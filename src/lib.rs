//! scriptbot — scripted crypto trading runtime.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod control;
pub mod exchanges;
pub mod logger;
pub mod runtime;
pub mod script;
pub mod storage;
pub mod types;
