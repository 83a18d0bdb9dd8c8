//! Fusion shapes and the closed set of kernel variants.
//!
//! A [`FusionShape`] is the request (three boolean axes plus an activation
//! selector); a [`KernelVariant`] is one of the instantiations that actually
//! exist. Resolving a shape to a variant is the only runtime decision; the
//! variant then hands out a monomorphized host entry point or the symbol of
//! its CUDA kernel.

use std::fmt;

use qcast_core::{QcastError, Result};

use crate::activation::{ActivationKind, Gelu, Identity, QGelu, Relu, SRelu, Silu};
use crate::quantize::{fused_cast, HostKernelFn};

/// Expand `$body` once per activation with `$A` bound to its type.
macro_rules! with_activation {
    ($kind:expr, $A:ident => $body:expr) => {
        match $kind {
            ActivationKind::Gelu => {
                type $A = Gelu;
                $body
            }
            ActivationKind::Silu => {
                type $A = Silu;
                $body
            }
            ActivationKind::Relu => {
                type $A = Relu;
                $body
            }
            ActivationKind::QGelu => {
                type $A = QGelu;
                $body
            }
            ActivationKind::SRelu => {
                type $A = SRelu;
                $body
            }
        }
    };
}

/// Requested combination of fused operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FusionShape {
    /// Accumulate a bias gradient.
    pub dbias: bool,
    /// Multiply by an activation derivative.
    pub dact: bool,
    /// Apply a forward activation.
    pub act: bool,
    pub activation: Option<ActivationKind>,
}

impl FusionShape {
    pub fn cast() -> Self {
        Self::default()
    }

    pub fn dbias() -> Self {
        Self {
            dbias: true,
            ..Self::default()
        }
    }

    pub fn dact(kind: ActivationKind) -> Self {
        Self {
            dact: true,
            activation: Some(kind),
            ..Self::default()
        }
    }

    pub fn dbias_dact(kind: ActivationKind) -> Self {
        Self {
            dbias: true,
            dact: true,
            activation: Some(kind),
            ..Self::default()
        }
    }

    pub fn act(kind: ActivationKind) -> Self {
        Self {
            act: true,
            activation: Some(kind),
            ..Self::default()
        }
    }
}

/// One instantiated fused kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelVariant {
    Cast,
    CastDbias,
    CastDact(ActivationKind),
    CastDbiasDact(ActivationKind),
    CastAct(ActivationKind),
}

impl KernelVariant {
    /// Every variant, 17 in total.
    pub fn all() -> Vec<KernelVariant> {
        let mut v = vec![KernelVariant::Cast, KernelVariant::CastDbias];
        for k in ActivationKind::ALL {
            v.push(KernelVariant::CastDact(k));
            v.push(KernelVariant::CastDbiasDact(k));
            v.push(KernelVariant::CastAct(k));
        }
        v
    }

    /// Resolve a fusion shape; combinations without an instantiation are
    /// rejected.
    pub fn select(shape: FusionShape) -> Result<Self> {
        const OP: &str = "select_variant";
        let FusionShape {
            dbias,
            dact,
            act,
            activation,
        } = shape;
        if (dact || act) != activation.is_some() {
            return Err(QcastError::invalid(
                OP,
                "an activation must be given exactly when dact or act fusion is enabled",
            ));
        }
        match (dbias, dact, act, activation) {
            (false, false, false, None) => Ok(KernelVariant::Cast),
            (true, false, false, None) => Ok(KernelVariant::CastDbias),
            (false, true, false, Some(k)) => Ok(KernelVariant::CastDact(k)),
            (true, true, false, Some(k)) => Ok(KernelVariant::CastDbiasDact(k)),
            (false, false, true, Some(k)) => Ok(KernelVariant::CastAct(k)),
            _ => Err(QcastError::invalid(
                OP,
                format!("no kernel fuses dbias={dbias} dact={dact} act={act}"),
            )),
        }
    }

    pub fn fusion_shape(&self) -> FusionShape {
        match *self {
            KernelVariant::Cast => FusionShape::cast(),
            KernelVariant::CastDbias => FusionShape::dbias(),
            KernelVariant::CastDact(k) => FusionShape::dact(k),
            KernelVariant::CastDbiasDact(k) => FusionShape::dbias_dact(k),
            KernelVariant::CastAct(k) => FusionShape::act(k),
        }
    }

    pub fn has_dbias(&self) -> bool {
        matches!(self, KernelVariant::CastDbias | KernelVariant::CastDbiasDact(_))
    }

    /// The derivative baked into the kernel; `Some` exactly for dact variants.
    pub fn activation_derivative(&self) -> Option<ActivationKind> {
        match *self {
            KernelVariant::CastDact(k) | KernelVariant::CastDbiasDact(k) => Some(k),
            _ => None,
        }
    }

    pub fn forward_activation(&self) -> Option<ActivationKind> {
        match *self {
            KernelVariant::CastAct(k) => Some(k),
            _ => None,
        }
    }

    /// Monomorphized host kernel for this variant.
    pub fn host_entry(&self) -> HostKernelFn {
        match *self {
            KernelVariant::Cast => fused_cast::<false, false, false, Identity> as HostKernelFn,
            KernelVariant::CastDbias => fused_cast::<true, false, false, Identity> as HostKernelFn,
            KernelVariant::CastDact(k) => {
                with_activation!(k, A => fused_cast::<false, true, false, A> as HostKernelFn)
            }
            KernelVariant::CastDbiasDact(k) => {
                with_activation!(k, A => fused_cast::<true, true, false, A> as HostKernelFn)
            }
            KernelVariant::CastAct(k) => {
                with_activation!(k, A => fused_cast::<false, false, true, A> as HostKernelFn)
            }
        }
    }

    /// Symbol of the matching CUDA kernel.
    pub fn cuda_entry(&self) -> &'static str {
        const DACT: [&str; 5] = [
            "qcast_cast_dgelu",
            "qcast_cast_dsilu",
            "qcast_cast_drelu",
            "qcast_cast_dqgelu",
            "qcast_cast_dsrelu",
        ];
        const DBIAS_DACT: [&str; 5] = [
            "qcast_cast_dbias_dgelu",
            "qcast_cast_dbias_dsilu",
            "qcast_cast_dbias_drelu",
            "qcast_cast_dbias_dqgelu",
            "qcast_cast_dbias_dsrelu",
        ];
        const ACT: [&str; 5] = [
            "qcast_cast_gelu",
            "qcast_cast_silu",
            "qcast_cast_relu",
            "qcast_cast_qgelu",
            "qcast_cast_srelu",
        ];
        match *self {
            KernelVariant::Cast => "qcast_cast",
            KernelVariant::CastDbias => "qcast_cast_dbias",
            KernelVariant::CastDact(k) => DACT[activation_index(k)],
            KernelVariant::CastDbiasDact(k) => DBIAS_DACT[activation_index(k)],
            KernelVariant::CastAct(k) => ACT[activation_index(k)],
        }
    }
}

fn activation_index(kind: ActivationKind) -> usize {
    match kind {
        ActivationKind::Gelu => 0,
        ActivationKind::Silu => 1,
        ActivationKind::Relu => 2,
        ActivationKind::QGelu => 3,
        ActivationKind::SRelu => 4,
    }
}

impl fmt::Display for KernelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cuda_entry().trim_start_matches("qcast_"))
    }
}
