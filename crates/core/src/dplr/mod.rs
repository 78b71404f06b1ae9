//! Diagonal-plus-low-rank (DPLR) recurrent state scan.
//!
//! The state update behind RWKV-7 time mixing: per head, a `K × V` state is
//! decayed per row, corrected by a rank-one term and written with a key/value
//! outer product at every timestep, then read out with the query.
//!
//! Entry points:
//! - [`fused_recurrent_dplr_delta_rule`]: generic naming (`q`, `gk`).
//! - [`fused_recurrent_rwkv7`]: RWKV-7 naming (`r`, `w`).
//! - [`DplrState::step`]: single-token decode against a carried state.

pub mod segments;
mod shapes;
pub mod state;

mod rwkv7;
mod scan;

pub use rwkv7::fused_recurrent_rwkv7;
pub use scan::{dplr_step, fused_recurrent_dplr_delta_rule};
pub use segments::Segments;
pub use state::{DplrState, DplrStateManager, StateError};
