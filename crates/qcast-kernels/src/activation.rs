//! Pointwise activations and their derivatives.
//!
//! Each activation is a zero-sized type implementing [`Activation`], so a
//! fused kernel instantiated with it inlines the math and pays nothing for
//! the activations it was not built with.

use std::fmt;

/// sqrt(2/pi)
const GELU_K0: f32 = 0.797_884_56;
const GELU_K1: f32 = 0.044_715;
const QGELU_ALPHA: f32 = 1.702;

/// Activation functions a kernel variant can fuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivationKind {
    /// GELU, tanh approximation.
    Gelu,
    Silu,
    Relu,
    /// QuickGELU: `x · σ(1.702x)`.
    QGelu,
    /// Squared ReLU.
    SRelu,
}

impl ActivationKind {
    pub const ALL: [ActivationKind; 5] = [
        ActivationKind::Gelu,
        ActivationKind::Silu,
        ActivationKind::Relu,
        ActivationKind::QGelu,
        ActivationKind::SRelu,
    ];

    /// Short lowercase name ("gelu", "srelu", ...).
    pub fn name(&self) -> &'static str {
        match self {
            ActivationKind::Gelu => "gelu",
            ActivationKind::Silu => "silu",
            ActivationKind::Relu => "relu",
            ActivationKind::QGelu => "qgelu",
            ActivationKind::SRelu => "srelu",
        }
    }

    pub fn forward(&self, x: f32) -> f32 {
        match self {
            ActivationKind::Gelu => Gelu::forward(x),
            ActivationKind::Silu => Silu::forward(x),
            ActivationKind::Relu => Relu::forward(x),
            ActivationKind::QGelu => QGelu::forward(x),
            ActivationKind::SRelu => SRelu::forward(x),
        }
    }

    pub fn derivative(&self, x: f32) -> f32 {
        match self {
            ActivationKind::Gelu => Gelu::derivative(x),
            ActivationKind::Silu => Silu::derivative(x),
            ActivationKind::Relu => Relu::derivative(x),
            ActivationKind::QGelu => QGelu::derivative(x),
            ActivationKind::SRelu => SRelu::derivative(x),
        }
    }
}

impl fmt::Display for ActivationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A pointwise activation baked into a kernel at compile time.
pub trait Activation: Send + Sync + 'static {
    /// `None` for [`Identity`].
    const KIND: Option<ActivationKind>;

    fn forward(x: f32) -> f32;

    fn derivative(x: f32) -> f32;
}

/// No activation.
pub struct Identity;
pub struct Gelu;
pub struct Silu;
pub struct Relu;
pub struct QGelu;
pub struct SRelu;

#[inline]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl Activation for Identity {
    const KIND: Option<ActivationKind> = None;

    #[inline]
    fn forward(x: f32) -> f32 {
        x
    }

    #[inline]
    fn derivative(_x: f32) -> f32 {
        1.0
    }
}

impl Activation for Gelu {
    const KIND: Option<ActivationKind> = Some(ActivationKind::Gelu);

    #[inline]
    fn forward(x: f32) -> f32 {
        x * (0.5 + 0.5 * (x * (GELU_K0 + GELU_K0 * GELU_K1 * x * x)).tanh())
    }

    #[inline]
    fn derivative(x: f32) -> f32 {
        let t = (GELU_K0 * x * (1.0 + GELU_K1 * x * x)).tanh();
        0.5 * x * ((1.0 - t * t) * (GELU_K0 + 3.0 * GELU_K0 * GELU_K1 * x * x)) + 0.5 * (1.0 + t)
    }
}

impl Activation for Silu {
    const KIND: Option<ActivationKind> = Some(ActivationKind::Silu);

    #[inline]
    fn forward(x: f32) -> f32 {
        x * sigmoid(x)
    }

    #[inline]
    fn derivative(x: f32) -> f32 {
        let s = sigmoid(x);
        s + x * s * (1.0 - s)
    }
}

impl Activation for Relu {
    const KIND: Option<ActivationKind> = Some(ActivationKind::Relu);

    #[inline]
    fn forward(x: f32) -> f32 {
        x.max(0.0)
    }

    #[inline]
    fn derivative(x: f32) -> f32 {
        if x > 0.0 {
            1.0
        } else {
            0.0
        }
    }
}

impl Activation for QGelu {
    const KIND: Option<ActivationKind> = Some(ActivationKind::QGelu);

    #[inline]
    fn forward(x: f32) -> f32 {
        x * sigmoid(QGELU_ALPHA * x)
    }

    #[inline]
    fn derivative(x: f32) -> f32 {
        let ax = QGELU_ALPHA * x;
        let s = sigmoid(ax);
        s + ax * s * (1.0 - s)
    }
}

impl Activation for SRelu {
    const KIND: Option<ActivationKind> = Some(ActivationKind::SRelu);

    #[inline]
    fn forward(x: f32) -> f32 {
        if x > 0.0 {
            x * x
        } else {
            0.0
        }
    }

    #[inline]
    fn derivative(x: f32) -> f32 {
        (2.0 * x).max(0.0)
    }
}
