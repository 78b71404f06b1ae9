//! Fused recurrent scan for the diagonal-plus-low-rank (DPLR) delta rule.
//!
//! Every (batch, head) pair carries a `K × V` state matrix `S` that evolves as
//!
//! ```text
//!   sa_t = b_tᵀ · S_{t-1}                                  [V]
//!   S_t  = diag(exp(gk_t)) · S_{t-1} + a_t ⊗ sa_t + k_t ⊗ v_t
//!   y_t  = scale · (q_tᵀ · S_t)                             [V]
//! ```
//!
//! i.e. the transition applied to the state is `diag(exp(gk_t)) + a_t b_tᵀ`.
//! The low-rank term contracts `b_t` against the state *before* the decay is
//! applied, so each step first reads `S_{t-1}` completely and only then
//! builds `S_t`.
//!
//! ## Tensor layout
//!
//! | Symbol          | Shape (time-major)  | Notes                         |
//! |-----------------|---------------------|-------------------------------|
//! | `q`             | `[B, T, H, K]`      | query (`r` in RWKV-7)         |
//! | `k`             | `[B, T, H, K]`      |                               |
//! | `v`             | `[B, T, H, V]`      |                               |
//! | `a`, `b`        | `[B, T, H, K]`      | low-rank transition factors   |
//! | `gk`            | `[B, T, H, K]`      | log decay (`w` in RWKV-7)     |
//! | `initial_state` | `[B, H, K, V]`      | `[N, H, K, V]` with segments  |
//! | output          | `[B, T, H, V]`      |                               |
//!
//! With [`TensorLayout::HeadMajor`](crate::config::TensorLayout) the `T` and
//! `H` axes of the sequence tensors and the output are swapped.
//!
//! Instances are independent: within a timestep all (batch, head) pairs are
//! advanced with one set of vectorised tensor ops, and the time loop is the
//! only sequential part.

use candle_core::Tensor;
use tracing::{debug, trace};

use super::segments::Segments;
use super::shapes::{self, ScanDims};
use crate::config::ScanConfig;
use crate::error::Result;

/// Advance the state of every (batch, head) instance by one timestep.
///
/// # Arguments
/// * `state` - `[B, H, K, V]` previous state `S_{t-1}`
/// * `q`, `k`, `a`, `b`, `gk` - `[B, H, K]`
/// * `v` - `[B, H, V]`
/// * `scale` - output multiplier
///
/// # Returns
/// `(y_t [B, H, V], S_t [B, H, K, V])`
#[allow(clippy::too_many_arguments)]
pub fn dplr_step(
    state: &Tensor,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    a: &Tensor,
    b: &Tensor,
    gk: &Tensor,
    scale: f64,
) -> Result<(Tensor, Tensor)> {
    // ── Read S_{t-1} ─────────────────────────────────────────────────────────
    // sa[.., j] = Σ_i b[.., i] · S[.., i, j]
    let sa = state.broadcast_mul(&b.unsqueeze(3)?)?.sum(2)?; // [B, H, V]
    let decayed = state.broadcast_mul(&gk.exp()?.unsqueeze(3)?)?; // [B, H, K, V]

    // ── Build S_t ────────────────────────────────────────────────────────────
    let low_rank = a.unsqueeze(3)?.broadcast_mul(&sa.unsqueeze(2)?)?; // [B, H, K, V]
    let write = k.unsqueeze(3)?.broadcast_mul(&v.unsqueeze(2)?)?; // [B, H, K, V]
    let next = ((&decayed + &low_rank)? + &write)?;

    // ── Project: y = scale · qᵀ S_t ──────────────────────────────────────────
    let y = (next.broadcast_mul(&q.unsqueeze(3)?)?.sum(2)? * scale)?; // [B, H, V]

    Ok((y, next))
}

/// The six sequence streams in time-major layout.
#[derive(Debug, Clone)]
struct SequenceBatch {
    q: Tensor,
    k: Tensor,
    v: Tensor,
    a: Tensor,
    b: Tensor,
    gk: Tensor,
}

impl SequenceBatch {
    fn narrow_time(&self, start: usize, len: usize) -> Result<Self> {
        let cut = |t: &Tensor| t.narrow(1, start, len);
        Ok(Self {
            q: cut(&self.q)?,
            k: cut(&self.k)?,
            v: cut(&self.v)?,
            a: cut(&self.a)?,
            b: cut(&self.b)?,
            gk: cut(&self.gk)?,
        })
    }

    /// Sequential scan over the time axis starting from `h0 [B, H, K, V]`.
    ///
    /// Returns `(output [B, T, H, V], final_state [B, H, K, V])`.
    fn scan(&self, h0: Tensor, scale: f64) -> Result<(Tensor, Tensor)> {
        let (batch, seq_len, num_heads, value_dim) = self.v.dims4()?;
        if seq_len == 0 {
            let output = Tensor::zeros(
                (batch, 0, num_heads, value_dim),
                self.v.dtype(),
                self.v.device(),
            )?;
            return Ok((output, h0.copy()?));
        }

        let at = |x: &Tensor, t: usize| x.narrow(1, t, 1)?.squeeze(1);

        let mut h = h0;
        let mut outputs: Vec<Tensor> = Vec::with_capacity(seq_len);
        for t in 0..seq_len {
            let (y_t, next) = dplr_step(
                &h,
                &at(&self.q, t)?,
                &at(&self.k, t)?,
                &at(&self.v, t)?,
                &at(&self.a, t)?,
                &at(&self.b, t)?,
                &at(&self.gk, t)?,
                scale,
            )?;
            h = next;
            outputs.push(y_t.unsqueeze(1)?); // [B, 1, H, V]
        }

        let output = Tensor::cat(&outputs, 1)?; // [B, T, H, V]
        Ok((output, h))
    }
}

fn zero_state(instances: usize, dims: &ScanDims, like: &Tensor) -> Result<Tensor> {
    Ok(Tensor::zeros(
        (instances, dims.num_heads, dims.key_dim, dims.value_dim),
        like.dtype(),
        like.device(),
    )?)
}

/// Run every segment as its own recurrence instance and reassemble.
///
/// Segment `i` starts from `initial_state[i]` (or zeros) regardless of where
/// it sits in the packed axis. No state is passed between segments.
fn scan_segments(
    inputs: &SequenceBatch,
    segments: &Segments,
    initial_state: Option<&Tensor>,
    dims: &ScanDims,
    scale: f64,
) -> Result<(Tensor, Tensor)> {
    let mut outputs: Vec<Tensor> = Vec::with_capacity(segments.len());
    let mut finals: Vec<Tensor> = Vec::with_capacity(segments.len());

    for (idx, range) in segments.iter().enumerate() {
        let h0 = match initial_state {
            Some(s) => s.narrow(0, idx, 1)?,
            None => zero_state(1, dims, &inputs.v)?,
        };
        trace!(segment = idx, start = range.start, len = range.len(), "scanning segment");

        if range.is_empty() {
            finals.push(h0.copy()?);
            continue;
        }
        let (y, h) = inputs.narrow_time(range.start, range.len())?.scan(h0, scale)?;
        outputs.push(y);
        finals.push(h);
    }

    let output = if outputs.is_empty() {
        Tensor::zeros(
            (1, 0, dims.num_heads, dims.value_dim),
            inputs.v.dtype(),
            inputs.v.device(),
        )?
    } else {
        Tensor::cat(&outputs, 1)?
    };
    let final_state = if finals.is_empty() {
        zero_state(0, dims, &inputs.v)?
    } else {
        Tensor::cat(&finals, 0)?
    };
    Ok((output, final_state))
}

/// Fused recurrent DPLR delta rule.
///
/// Validates all shapes (and `cu_seqlens`, when given) before computing
/// anything, then runs the recurrence described in the module docs.
///
/// # Arguments
/// * `q`, `k`, `a`, `b`, `gk` - `[B, T, H, K]` (or `[B, H, T, K]` head-major)
/// * `v` - `[B, T, H, V]` (or `[B, H, T, V]`)
/// * `initial_state` - `[B, H, K, V]`, or `[N, H, K, V]` with `cu_seqlens`;
///   zeros when absent
/// * `cu_seqlens` - N+1 offsets into the packed time axis; requires `B == 1`
/// * `config` - scale, final-state flag and layout
///
/// # Returns
/// `(output, final_state)`; `final_state` is `None` unless
/// `config.output_final_state` is set.
#[allow(clippy::too_many_arguments)]
pub fn fused_recurrent_dplr_delta_rule(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    a: &Tensor,
    b: &Tensor,
    gk: &Tensor,
    initial_state: Option<&Tensor>,
    cu_seqlens: Option<&[usize]>,
    config: &ScanConfig,
) -> Result<(Tensor, Option<Tensor>)> {
    let layout = config.layout;
    let dims = shapes::validate_sequences(q, k, v, a, b, gk, layout)?;
    let segments = match cu_seqlens {
        Some(cu) => {
            shapes::validate_packed_batch(&dims, q)?;
            Some(Segments::from_cu_seqlens(cu, dims.seq_len)?)
        }
        None => None,
    };
    let instances = segments.as_ref().map_or(dims.batch, Segments::len);
    if let Some(state) = initial_state {
        shapes::validate_initial_state(state, instances, &dims)?;
    }
    let scale = config.resolve_scale(dims.key_dim);

    debug!(
        batch = dims.batch,
        seq_len = dims.seq_len,
        num_heads = dims.num_heads,
        key_dim = dims.key_dim,
        value_dim = dims.value_dim,
        segments = segments.as_ref().map(Segments::len),
        max_segment_len = segments.as_ref().map(Segments::max_len),
        layout = ?layout,
        scale,
        "dplr recurrent scan"
    );

    let inputs = SequenceBatch {
        q: shapes::to_time_major(q, layout)?,
        k: shapes::to_time_major(k, layout)?,
        v: shapes::to_time_major(v, layout)?,
        a: shapes::to_time_major(a, layout)?,
        b: shapes::to_time_major(b, layout)?,
        gk: shapes::to_time_major(gk, layout)?,
    };

    let (output, final_state) = match &segments {
        Some(segs) => scan_segments(&inputs, segs, initial_state, &dims, scale)?,
        None => {
            let h0 = match initial_state {
                Some(s) => s.clone(),
                None => zero_state(dims.batch, &dims, &inputs.v)?,
            };
            inputs.scan(h0, scale)?
        }
    };

    let output = shapes::from_time_major(output, layout)?;
    Ok((output, config.output_final_state.then_some(final_state)))
}
