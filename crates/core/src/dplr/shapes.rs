//! Up-front shape validation and layout canonicalisation.
//!
//! Every check here runs before the first timestep so that a bad call fails
//! without producing partial output.

use candle_core::Tensor;

use crate::config::TensorLayout;
use crate::error::{DplrError, Result};

/// Problem size of one scan call, in canonical (time-major) terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanDims {
    pub batch: usize,
    pub seq_len: usize,
    pub num_heads: usize,
    pub key_dim: usize,
    pub value_dim: usize,
}

/// `[B, T, H, D]` as stored under `layout`.
fn stored_order<T>(layout: TensorLayout, [b, t, h, d]: [T; 4]) -> [T; 4] {
    match layout {
        TensorLayout::TimeMajor => [b, t, h, d],
        TensorLayout::HeadMajor => [b, h, t, d],
    }
}

fn expected_str(layout: TensorLayout, dims: [String; 4]) -> String {
    let [a, b, c, d] = stored_order(layout, dims);
    format!("[{a}, {b}, {c}, {d}]")
}

/// Canonical `[B, T, H, D]` of a rank-4 sequence tensor.
fn sequence_dims(name: &'static str, t: &Tensor, layout: TensorLayout) -> Result<[usize; 4]> {
    let dims = t.dims();
    if dims.len() != 4 {
        let expected = expected_str(layout, ["B", "T", "H", "D"].map(String::from));
        return Err(DplrError::shape(name, expected, dims));
    }
    let stored = [dims[0], dims[1], dims[2], dims[3]];
    // The permutation is its own inverse.
    Ok(stored_order(layout, stored))
}

/// Check that `q, k, a, b, gk` agree on `[B, T, H, K]` and `v` on `[B, T, H]`.
///
/// All six must be floating point. `q` is the reference shape; mismatches
/// are reported against it.
#[allow(clippy::too_many_arguments)]
pub fn validate_sequences(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    a: &Tensor,
    b: &Tensor,
    gk: &Tensor,
    layout: TensorLayout,
) -> Result<ScanDims> {
    for (name, t) in [("q", q), ("k", k), ("v", v), ("a", a), ("b", b), ("gk", gk)] {
        if !t.dtype().is_float() {
            return Err(DplrError::unsupported_dtype(name, t.dtype()));
        }
    }

    let [batch, seq_len, num_heads, key_dim] = sequence_dims("q", q, layout)?;

    for (name, t) in [("k", k), ("a", a), ("b", b), ("gk", gk)] {
        let dims = sequence_dims(name, t, layout)?;
        if dims != [batch, seq_len, num_heads, key_dim] {
            let expected = expected_str(
                layout,
                [batch, seq_len, num_heads, key_dim].map(|d| d.to_string()),
            );
            return Err(DplrError::shape(name, expected, t.dims()));
        }
    }

    let [vb, vt, vh, value_dim] = sequence_dims("v", v, layout)?;
    if [vb, vt, vh] != [batch, seq_len, num_heads] {
        let expected = expected_str(
            layout,
            [
                batch.to_string(),
                seq_len.to_string(),
                num_heads.to_string(),
                "V".to_string(),
            ],
        );
        return Err(DplrError::shape("v", expected, v.dims()));
    }

    Ok(ScanDims {
        batch,
        seq_len,
        num_heads,
        key_dim,
        value_dim,
    })
}

/// Packed (varlen) calls carry every sequence in a single batch row.
pub fn validate_packed_batch(dims: &ScanDims, q: &Tensor) -> Result<()> {
    if dims.batch != 1 {
        return Err(DplrError::shape(
            "q",
            "batch size 1 when cu_seqlens is given",
            q.dims(),
        ));
    }
    Ok(())
}

/// Initial state must be `[instances, H, K, V]`.
pub fn validate_initial_state(state: &Tensor, instances: usize, dims: &ScanDims) -> Result<()> {
    let expected = [instances, dims.num_heads, dims.key_dim, dims.value_dim];
    if state.dims() != expected {
        return Err(DplrError::shape(
            "initial_state",
            format!("{expected:?}"),
            state.dims(),
        ));
    }
    Ok(())
}

/// Bring a sequence tensor to `[B, T, H, D]`.
pub fn to_time_major(t: &Tensor, layout: TensorLayout) -> Result<Tensor> {
    Ok(match layout {
        TensorLayout::TimeMajor => t.clone(),
        TensorLayout::HeadMajor => t.transpose(1, 2)?,
    })
}

/// Inverse of [`to_time_major`] for the scan output.
pub fn from_time_major(t: Tensor, layout: TensorLayout) -> Result<Tensor> {
    Ok(match layout {
        TensorLayout::TimeMajor => t,
        TensorLayout::HeadMajor => t.transpose(1, 2)?.contiguous()?,
    })
}

/// Single-token inputs: `r, w, k, a, b` are `[H, K]`, `v` is `[H, V]`.
#[allow(clippy::too_many_arguments)]
pub fn validate_step(
    r: &Tensor,
    w: &Tensor,
    k: &Tensor,
    v: &Tensor,
    a: &Tensor,
    b: &Tensor,
    num_heads: usize,
    key_dim: usize,
    value_dim: usize,
) -> Result<()> {
    let expected_k = [num_heads, key_dim];
    for (name, t) in [("r", r), ("w", w), ("k", k), ("a", a), ("b", b)] {
        if t.dims() != expected_k {
            return Err(DplrError::shape(name, format!("{expected_k:?}"), t.dims()));
        }
    }
    let expected_v = [num_heads, value_dim];
    if v.dims() != expected_v {
        return Err(DplrError::shape("v", format!("{expected_v:?}"), v.dims()));
    }
    Ok(())
}
