//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `nqueue` crate.
//!
//! - `error`: the crate-wide error types.
//! - `logging`: tracing subscriber setup for the binary and tests.
//! - `tasks`: cancellable background tasks (periodic and debounced).

pub mod error;
pub mod logging;
pub mod tasks;
