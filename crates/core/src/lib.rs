//! Fused recurrent DPLR state scan (the RWKV-7 state update) on candle tensors.

pub mod config;
pub mod dplr;
pub mod error;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::{ScanConfig, TensorLayout};
pub use dplr::{
    dplr_step, fused_recurrent_dplr_delta_rule, fused_recurrent_rwkv7, DplrState,
    DplrStateManager, Segments, StateError,
};
pub use error::{DplrError, Result};
