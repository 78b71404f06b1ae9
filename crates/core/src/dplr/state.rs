//! Carried recurrent state for streaming inference.
//!
//! A scan call is stateless: it takes `initial_state` and hands back the
//! final state. Decoding a sequence token by token, or prefilling it in
//! chunks, means keeping that `[H, K, V]` state between calls. This module
//! holds it:
//!
//! - [`DplrState`]: one sequence's state plus a single-token [`DplrState::step`].
//! - [`DplrStateManager`]: states keyed by sequence id, with [`gather`] /
//!   [`scatter`] to feed a packed (`cu_seqlens`) scan and store its result.
//!
//! [`gather`]: DplrStateManager::gather
//! [`scatter`]: DplrStateManager::scatter

use std::collections::{HashMap, HashSet};

use candle_core::{DType, Device, Tensor};
use thiserror::Error;

use super::scan::dplr_step;
use super::shapes;
use crate::error::Result;

/// Recurrent state of one sequence, shape `[1, H, K, V]`.
#[derive(Debug, Clone)]
pub struct DplrState {
    pub tensor: Tensor,
}

impl DplrState {
    /// Create a zero-initialized state.
    pub fn zeros(
        num_heads: usize,
        key_dim: usize,
        value_dim: usize,
        dtype: DType,
        device: &Device,
    ) -> candle_core::Result<Self> {
        let tensor = Tensor::zeros((1, num_heads, key_dim, value_dim), dtype, device)?;
        Ok(Self { tensor })
    }

    /// Reset this state to zeros in-place.
    pub fn reset(&mut self) -> candle_core::Result<()> {
        self.tensor = self.tensor.zeros_like()?;
        Ok(())
    }

    /// Advance by a single token.
    ///
    /// `r, w, k, a, b` are `[H, K]` and `v` is `[H, V]`; returns `y [H, V]`.
    /// Uses the same per-timestep kernel as the scan, so stepping through a
    /// sequence reproduces a scan over it.
    #[allow(clippy::too_many_arguments)]
    pub fn step(
        &mut self,
        r: &Tensor,
        w: &Tensor,
        k: &Tensor,
        v: &Tensor,
        a: &Tensor,
        b: &Tensor,
        scale: f64,
    ) -> Result<Tensor> {
        let (_, num_heads, key_dim, value_dim) = self.tensor.dims4()?;
        shapes::validate_step(r, w, k, v, a, b, num_heads, key_dim, value_dim)?;

        let batched = |x: &Tensor| x.unsqueeze(0);
        let (y, next) = dplr_step(
            &self.tensor,
            &batched(r)?,
            &batched(k)?,
            &batched(v)?,
            &batched(a)?,
            &batched(b)?,
            &batched(w)?,
            scale,
        )?;
        self.tensor = next;
        Ok(y.squeeze(0)?)
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("sequence {0} not found in state manager")]
    SequenceNotFound(u64),
    #[error("sequence {0} already has allocated state")]
    SequenceAlreadyExists(u64),
    #[error("sequence {0} listed more than once")]
    DuplicateSequence(u64),
    #[error("state shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Manages recurrent states across sequences.
///
/// Each active sequence owns one [`DplrState`]. States are allocated when a
/// sequence begins and freed when it completes.
pub struct DplrStateManager {
    num_heads: usize,
    key_dim: usize,
    value_dim: usize,
    dtype: DType,
    device: Device,
    states: HashMap<u64, DplrState>,
}

impl DplrStateManager {
    /// Create a new state manager.
    ///
    /// # Arguments
    /// * `num_heads` - Heads per layer
    /// * `key_dim` - K, rows of each head's state
    /// * `value_dim` - V, columns of each head's state
    /// * `dtype` - Data type for state tensors
    /// * `device` - Device for state tensors
    pub fn new(
        num_heads: usize,
        key_dim: usize,
        value_dim: usize,
        dtype: DType,
        device: Device,
    ) -> Self {
        Self {
            num_heads,
            key_dim,
            value_dim,
            dtype,
            device,
            states: HashMap::new(),
        }
    }

    /// Allocate a zero state for a new sequence.
    pub fn allocate_state(
        &mut self,
        seq_id: u64,
    ) -> std::result::Result<&mut DplrState, StateError> {
        if self.states.contains_key(&seq_id) {
            return Err(StateError::SequenceAlreadyExists(seq_id));
        }
        let state = DplrState::zeros(
            self.num_heads,
            self.key_dim,
            self.value_dim,
            self.dtype,
            &self.device,
        )?;
        tracing::debug!(seq_id, "allocated recurrent state");
        Ok(self.states.entry(seq_id).or_insert(state))
    }

    /// Get mutable reference to the state of an existing sequence.
    pub fn get_state(&mut self, seq_id: u64) -> Option<&mut DplrState> {
        self.states.get_mut(&seq_id)
    }

    /// Free the state of a completed sequence.
    pub fn free_state(&mut self, seq_id: u64) {
        if self.states.remove(&seq_id).is_some() {
            tracing::debug!(seq_id, "freed recurrent state");
        }
    }

    /// Reset the state of a sequence to zeros.
    pub fn reset_state(&mut self, seq_id: u64) -> std::result::Result<(), StateError> {
        self.states
            .get_mut(&seq_id)
            .ok_or(StateError::SequenceNotFound(seq_id))?
            .reset()?;
        Ok(())
    }

    /// Number of sequences with allocated state.
    pub fn num_active_sequences(&self) -> usize {
        self.states.len()
    }

    /// Check if a sequence has allocated state.
    pub fn has_state(&self, seq_id: u64) -> bool {
        self.states.contains_key(&seq_id)
    }

    fn check_unique(seq_ids: &[u64]) -> std::result::Result<(), StateError> {
        let mut seen = HashSet::with_capacity(seq_ids.len());
        for &id in seq_ids {
            if !seen.insert(id) {
                return Err(StateError::DuplicateSequence(id));
            }
        }
        Ok(())
    }

    /// Stack the states of `seq_ids` into an `[N, H, K, V]` initial state,
    /// row `i` belonging to `seq_ids[i]`.
    pub fn gather(&self, seq_ids: &[u64]) -> std::result::Result<Tensor, StateError> {
        Self::check_unique(seq_ids)?;
        let rows = seq_ids
            .iter()
            .map(|id| {
                self.states
                    .get(id)
                    .map(|s| s.tensor.clone())
                    .ok_or(StateError::SequenceNotFound(*id))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if rows.is_empty() {
            return Ok(Tensor::zeros(
                (0, self.num_heads, self.key_dim, self.value_dim),
                self.dtype,
                &self.device,
            )?);
        }
        Ok(Tensor::cat(&rows, 0)?)
    }

    /// Store row `i` of `final_state [N, H, K, V]` as the state of
    /// `seq_ids[i]`.
    ///
    /// Nothing is written unless every id is known and the shape matches.
    pub fn scatter(
        &mut self,
        seq_ids: &[u64],
        final_state: &Tensor,
    ) -> std::result::Result<(), StateError> {
        let expected = vec![seq_ids.len(), self.num_heads, self.key_dim, self.value_dim];
        if final_state.dims() != expected.as_slice() {
            return Err(StateError::ShapeMismatch {
                expected,
                actual: final_state.dims().to_vec(),
            });
        }
        Self::check_unique(seq_ids)?;
        if let Some(&missing) = seq_ids.iter().find(|id| !self.states.contains_key(id)) {
            return Err(StateError::SequenceNotFound(missing));
        }

        for (row, id) in seq_ids.iter().enumerate() {
            let tensor = final_state.narrow(0, row, 1)?.copy()?;
            if let Some(state) = self.states.get_mut(id) {
                state.tensor = tensor;
            }
        }
        Ok(())
    }
}
