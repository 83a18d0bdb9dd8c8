use std::fmt;

/// Where a tensor's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    /// Host memory driven by the emulated host runtime.
    #[default]
    Host,
    /// CUDA GPU with device ordinal
    Cuda(usize),
}

impl Device {
    /// Whether this is host memory.
    pub fn is_host(&self) -> bool {
        matches!(self, Device::Host)
    }

    /// Whether this is a CUDA device.
    pub fn is_cuda(&self) -> bool {
        matches!(self, Device::Cuda(_))
    }

    /// Get the CUDA device ordinal, if applicable.
    pub fn cuda_index(&self) -> Option<usize> {
        match self {
            Device::Cuda(idx) => Some(*idx),
            _ => None,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Host => write!(f, "host"),
            Device::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_properties() {
        assert!(Device::Host.is_host());
        assert!(!Device::Host.is_cuda());
        assert!(Device::Cuda(0).is_cuda());
        assert_eq!(Device::Cuda(1).cuda_index(), Some(1));
        assert_eq!(Device::Host.cuda_index(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Device::Host), "host");
        assert_eq!(format!("{}", Device::Cuda(0)), "cuda:0");
    }
}
