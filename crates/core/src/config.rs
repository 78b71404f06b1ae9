use serde::Deserialize;

/// Memory layout of the sequence tensors.
///
/// Only affects how `[batch, time, head, dim]` is stored; both layouts produce
/// the same numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorLayout {
    /// `[B, T, H, D]`
    #[default]
    TimeMajor,
    /// `[B, H, T, D]`
    HeadMajor,
}

/// Options for a recurrent scan call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Output multiplier. `None` means `1 / sqrt(K)`.
    pub scale: Option<f64>,
    /// Return the state after the last timestep.
    pub output_final_state: bool,
    pub layout: TensorLayout,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scale: None,
            output_final_state: true,
            layout: TensorLayout::TimeMajor,
        }
    }
}

impl ScanConfig {
    /// Defaults used by RWKV-7 time mixing (unit output scale).
    pub fn rwkv7() -> Self {
        Self {
            scale: Some(1.0),
            ..Self::default()
        }
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = Some(scale);
        self
    }

    pub fn with_final_state(mut self, output_final_state: bool) -> Self {
        self.output_final_state = output_final_state;
        self
    }

    pub fn with_layout(mut self, layout: TensorLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Effective output scale for key dimension `key_dim`.
    pub fn resolve_scale(&self, key_dim: usize) -> f64 {
        self.scale
            .unwrap_or_else(|| 1.0 / (key_dim.max(1) as f64).sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RWKV7_LAYER_CONFIG: &str = r#"{
        "scale": 1.0,
        "output_final_state": false,
        "layout": "head_major"
    }"#;

    #[test]
    fn parse_full_scan_config() {
        let config: ScanConfig =
            serde_json::from_str(RWKV7_LAYER_CONFIG).expect("failed to parse config");

        assert_eq!(config.scale, Some(1.0));
        assert!(!config.output_final_state);
        assert_eq!(config.layout, TensorLayout::HeadMajor);
    }

    #[test]
    fn missing_fields_use_defaults() {
        let config: ScanConfig = serde_json::from_str("{}").expect("failed to parse config");
        assert_eq!(config, ScanConfig::default());
        assert!(config.output_final_state);
        assert_eq!(config.layout, TensorLayout::TimeMajor);
    }

    #[test]
    fn default_scale_is_inverse_sqrt_key_dim() {
        let config = ScanConfig::default();
        assert!((config.resolve_scale(64) - 0.125).abs() < 1e-12);
        assert!((config.resolve_scale(4) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn rwkv7_defaults() {
        let config = ScanConfig::rwkv7();
        assert_eq!(config.resolve_scale(64), 1.0);
        assert!(config.output_final_state);
    }

    #[test]
    fn builders_override_fields() {
        let config = ScanConfig::default()
            .with_scale(0.25)
            .with_final_state(false)
            .with_layout(TensorLayout::HeadMajor);
        assert_eq!(config.scale, Some(0.25));
        assert!(!config.output_final_state);
        assert_eq!(config.layout, TensorLayout::HeadMajor);
    }
}
