use candle_core::{Result, Tensor};

fn flat(t: &Tensor) -> Result<Vec<f32>> {
    t.flatten_all()?.to_vec1::<f32>()
}

/// Nested-loop DPLR recurrence over plain `f32` buffers.
///
/// Deliberately unvectorised: one (batch, head) instance at a time, one
/// state element at a time. Inputs are time-major (`[B, T, H, K]`,
/// `v: [B, T, H, V]`), state is `[B, H, K, V]`.
///
/// Returns `(output [B, T, H, V], final_state [B, H, K, V])`.
#[allow(clippy::too_many_arguments)]
pub fn naive_dplr(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    a: &Tensor,
    b: &Tensor,
    gk: &Tensor,
    initial_state: Option<&Tensor>,
    scale: f32,
) -> Result<(Tensor, Tensor)> {
    let (batch, seq_len, num_heads, key_dim) = q.dims4()?;
    let value_dim = v.dim(3)?;
    let device = q.device();

    let (q, k, v, a, b, gk) = (flat(q)?, flat(k)?, flat(v)?, flat(a)?, flat(b)?, flat(gk)?);
    let mut state = match initial_state {
        Some(s) => flat(s)?,
        None => vec![0.0; batch * num_heads * key_dim * value_dim],
    };
    let mut out = vec![0.0f32; batch * seq_len * num_heads * value_dim];

    for bi in 0..batch {
        for hi in 0..num_heads {
            let offset = (bi * num_heads + hi) * key_dim * value_dim;
            let s = &mut state[offset..offset + key_dim * value_dim];

            for ti in 0..seq_len {
                let kb = ((bi * seq_len + ti) * num_heads + hi) * key_dim;
                let vb = ((bi * seq_len + ti) * num_heads + hi) * value_dim;

                let mut sa = vec![0.0f32; value_dim];
                for i in 0..key_dim {
                    for j in 0..value_dim {
                        sa[j] += b[kb + i] * s[i * value_dim + j];
                    }
                }

                for i in 0..key_dim {
                    let decay = gk[kb + i].exp();
                    for j in 0..value_dim {
                        let idx = i * value_dim + j;
                        s[idx] = s[idx] * decay + a[kb + i] * sa[j] + k[kb + i] * v[vb + j];
                    }
                }

                for j in 0..value_dim {
                    let mut acc = 0.0f32;
                    for i in 0..key_dim {
                        acc += q[kb + i] * s[i * value_dim + j];
                    }
                    out[vb + j] = acc * scale;
                }
            }
        }
    }

    Ok((
        Tensor::from_vec(out, (batch, seq_len, num_heads, value_dim), device)?,
        Tensor::from_vec(state, (batch, num_heads, key_dim, value_dim), device)?,
    ))
}
