//! RWKV-7 naming for the DPLR scan.
//!
//! RWKV-7 time mixing is the DPLR delta rule with the receptance `r` as the
//! query and `w` as the log decay. In the model `a = -κ̂` and `b = κ̂ · α`
//! (normalised key times in-context learning rate), but the scan itself does
//! not depend on that parameterisation.

use candle_core::Tensor;

use super::scan::fused_recurrent_dplr_delta_rule;
use crate::config::ScanConfig;
use crate::error::{DplrError, Result};

/// Fused recurrent RWKV-7 state update.
///
/// # Arguments
/// * `r` - receptance `[B, T, H, K]`
/// * `w` - log decay `[B, T, H, K]`; the per-step decay is `exp(w)`
/// * `k` - key `[B, T, H, K]`
/// * `v` - value `[B, T, H, V]`
/// * `a`, `b` - low-rank transition factors `[B, T, H, K]`
/// * `initial_state` - `[B, H, K, V]`, or `[N, H, K, V]` with `cu_seqlens`
/// * `cu_seqlens` - N+1 packed-sequence offsets
/// * `config` - a `scale` of `None` means `1.0` here
///
/// Shapes follow `config.layout`; see [`fused_recurrent_dplr_delta_rule`].
#[allow(clippy::too_many_arguments)]
pub fn fused_recurrent_rwkv7(
    r: &Tensor,
    w: &Tensor,
    k: &Tensor,
    v: &Tensor,
    a: &Tensor,
    b: &Tensor,
    initial_state: Option<&Tensor>,
    cu_seqlens: Option<&[usize]>,
    config: &ScanConfig,
) -> Result<(Tensor, Option<Tensor>)> {
    let config = ScanConfig {
        scale: Some(config.scale.unwrap_or(1.0)),
        ..config.clone()
    };
    fused_recurrent_dplr_delta_rule(r, k, v, a, b, w, initial_state, cu_seqlens, &config)
        .map_err(rename_stream)
}

fn rwkv_name(name: &'static str) -> &'static str {
    match name {
        "q" => "r",
        "gk" => "w",
        other => other,
    }
}

/// Report input errors under the RWKV-7 stream names.
fn rename_stream(err: DplrError) -> DplrError {
    match err {
        DplrError::ShapeMismatch {
            name,
            expected,
            actual,
        } => DplrError::ShapeMismatch {
            name: rwkv_name(name),
            expected,
            actual,
        },
        DplrError::UnsupportedDType { name, dtype } => DplrError::UnsupportedDType {
            name: rwkv_name(name),
            dtype,
        },
        other => other,
    }
}
