//! Shared test utilities for transync integration tests.
//!
//! This module provides:
//! - `TestHarness` for isolated runs with a temp input directory and database
//! - Scripted adapters that inject parser, store, index and embedding faults

pub mod adapters;
pub mod harness;

pub use adapters::*;
pub use harness::TestHarness;
