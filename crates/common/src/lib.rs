//! Common utilities for the USB MITM relay
//!
//! This crate provides the plumbing shared between the model and relay
//! crates: error handling, logging setup, and the mock descriptor builders
//! the test suites are written against.

pub mod error;
pub mod logging;
pub mod test_utils;

pub use error::{Error, Result};
pub use logging::setup_logging;
