use candle_core::{Device, Result, Tensor};

/// RWKV-7 named input streams, time-major.
#[derive(Debug, Clone)]
pub struct DplrInputs {
    pub r: Tensor,
    pub w: Tensor,
    pub k: Tensor,
    pub v: Tensor,
    pub a: Tensor,
    pub b: Tensor,
}

impl DplrInputs {
    /// Random inputs in a numerically tame range.
    ///
    /// `w` lies in `(-0.95, -0.05)` so every step decays; `a` and `b` are
    /// small so the rank-one term cannot blow the state up over short tests.
    pub fn random(
        batch: usize,
        seq_len: usize,
        num_heads: usize,
        key_dim: usize,
        value_dim: usize,
        device: &Device,
    ) -> Result<Self> {
        let kshape = (batch, seq_len, num_heads, key_dim);
        let vshape = (batch, seq_len, num_heads, value_dim);
        Ok(Self {
            r: Tensor::randn(0f32, 1.0, kshape, device)?,
            w: Tensor::rand(0f32, 1.0, kshape, device)?.affine(-0.9, -0.05)?,
            k: Tensor::randn(0f32, 0.5, kshape, device)?,
            v: Tensor::randn(0f32, 1.0, vshape, device)?,
            a: Tensor::randn(0f32, 0.2, kshape, device)?,
            b: Tensor::randn(0f32, 0.2, kshape, device)?,
        })
    }

    /// Random `[instances, H, K, V]` state.
    pub fn random_state(
        instances: usize,
        num_heads: usize,
        key_dim: usize,
        value_dim: usize,
        device: &Device,
    ) -> Result<Tensor> {
        Tensor::randn(0f32, 0.5, (instances, num_heads, key_dim, value_dim), device)
    }

    /// Slice `[start, start + len)` of the time axis.
    pub fn narrow_time(&self, start: usize, len: usize) -> Result<Self> {
        Ok(Self {
            r: self.r.narrow(1, start, len)?,
            w: self.w.narrow(1, start, len)?,
            k: self.k.narrow(1, start, len)?,
            v: self.v.narrow(1, start, len)?,
            a: self.a.narrow(1, start, len)?,
            b: self.b.narrow(1, start, len)?,
        })
    }

    /// Timestep `t` of batch row `row`, as `[H, K]` / `[H, V]` tensors.
    pub fn token(&self, row: usize, t: usize) -> Result<Self> {
        let pick = |x: &Tensor| x.get(row)?.get(t);
        Ok(Self {
            r: pick(&self.r)?,
            w: pick(&self.w)?,
            k: pick(&self.k)?,
            v: pick(&self.v)?,
            a: pick(&self.a)?,
            b: pick(&self.b)?,
        })
    }
}

/// Largest elementwise absolute difference between two `f32` tensors.
pub fn max_abs_diff(x: &Tensor, y: &Tensor) -> Result<f32> {
    (x - y)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
}
