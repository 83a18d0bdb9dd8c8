use crate::Tensor;

/// Auxiliary settings for a quantize call.
///
/// `noop`, when present, is a single-element F32 tensor read by the kernel
/// at execution time: a value of exactly `1.0` makes the kernel return
/// without touching any output buffer.
#[derive(Debug, Clone, Default)]
pub struct QuantizationConfig {
    pub noop: Option<Tensor>,
    /// Round block scales down to powers of two.
    pub force_pow_2_scales: bool,
    /// Lower bound applied to block amax before computing a scale.
    pub amax_epsilon: f32,
}

impl QuantizationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_noop(mut self, noop: Tensor) -> Self {
        self.noop = Some(noop);
        self
    }

    pub fn with_force_pow_2_scales(mut self, enabled: bool) -> Self {
        self.force_pow_2_scales = enabled;
        self
    }

    pub fn with_amax_epsilon(mut self, epsilon: f32) -> Self {
        self.amax_epsilon = epsilon;
        self
    }
}
