//! Shared test utilities for dplr-core.
//!
//! A scalar reference implementation of the recurrence and random input
//! generators sized for CPU tests.

mod inputs;
mod reference;

pub use inputs::{max_abs_diff, DplrInputs};
pub use reference::naive_dplr;
