use std::fmt;

use crate::dtype::DType;
use crate::device::Device;
use crate::error::QcastError;
use crate::scaling::ScalingMode;
use crate::shape::Shape;
use crate::storage::Storage;
use crate::Result;

/// Handle to a device-resident buffer plus the metadata a cast needs.
///
/// A tensor never owns its bytes exclusively: cloning it clones the handle,
/// and kernels enqueued on a stream write through the same [`Storage`] the
/// caller keeps. Quantized tensors additionally carry their scaling
/// buffers:
///
/// - `scale` (F32, 1 element): the quantization scale, tensor mode only.
/// - `amax` (F32, 1 element): running absolute maximum, tensor mode only.
/// - `scale_inv`: dequantization factors laid out per [`ScalingMode`].
///
/// A quantized tensor may also carry a columnwise copy of its data with
/// its own `scale_inv` (see [`Tensor::with_columnwise`]). The copy is the
/// one a consumer reading along columns (a transposed GEMM operand) uses:
/// MXFP8 keeps the rowwise layout with 32×1 scaling blocks, every other
/// mode stores it transposed with transposed scales.
///
/// # Examples
///
/// ```
/// use qcast_core::{DType, ScalingMode, Tensor};
///
/// let x = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
/// assert_eq!(x.shape().flat_2d(), (2, 2));
///
/// let q = Tensor::quantized(&[2, 2], DType::Float8E4M3, ScalingMode::Tensor).unwrap();
/// assert_eq!(q.scale_value().unwrap(), 1.0);
/// ```
#[derive(Clone)]
pub struct Tensor {
    storage: Storage,
    shape: Shape,
    scaling_mode: ScalingMode,
    amax: Option<Storage>,
    scale: Option<Storage>,
    scale_inv: Option<Storage>,
    columnwise: Option<Storage>,
    columnwise_scale_inv: Option<Storage>,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Wrap existing storage; the shape must cover exactly its elements.
    pub fn from_storage(storage: Storage, shape: &[usize]) -> Result<Self> {
        let shape = Shape::new(shape);
        if shape.numel() != storage.numel() {
            return Err(QcastError::Storage(format!(
                "shape {} requires {} elements, storage holds {}",
                shape,
                shape.numel(),
                storage.numel()
            )));
        }
        Ok(Self {
            storage,
            shape,
            scaling_mode: ScalingMode::Tensor,
            amax: None,
            scale: None,
            scale_inv: None,
            columnwise: None,
            columnwise_scale_inv: None,
        })
    }

    /// Create an F32 tensor from data with the given shape.
    pub fn from_f32(data: &[f32], shape: &[usize]) -> Result<Self> {
        Self::from_f32_as(data, shape, DType::F32)
    }

    /// Create a tensor holding `data` rounded to `dtype`.
    pub fn from_f32_as(data: &[f32], shape: &[usize], dtype: DType) -> Result<Self> {
        let s = Shape::new(shape);
        if s.numel() != data.len() {
            return Err(QcastError::Storage(format!(
                "shape {} requires {} elements, got {}",
                s,
                s.numel(),
                data.len()
            )));
        }
        Self::from_storage(Storage::from_values(dtype, data), shape)
    }

    /// Create a tensor of zeros with the given shape and dtype.
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let shape = Shape::new(shape);
        Self {
            storage: Storage::zeros(dtype, shape.numel()),
            shape,
            scaling_mode: ScalingMode::Tensor,
            amax: None,
            scale: None,
            scale_inv: None,
            columnwise: None,
            columnwise_scale_inv: None,
        }
    }

    /// Create a single-element F32 tensor.
    pub fn scalar(value: f32) -> Self {
        Self {
            storage: Storage::from_f32(&[value]),
            shape: Shape::new(&[1]),
            scaling_mode: ScalingMode::Tensor,
            amax: None,
            scale: None,
            scale_inv: None,
            columnwise: None,
            columnwise_scale_inv: None,
        }
    }

    /// Allocate a zeroed quantized output with every scaling buffer its mode
    /// needs. Tensor mode starts with `scale = scale_inv = 1` and `amax = 0`.
    pub fn quantized(shape: &[usize], dtype: DType, mode: ScalingMode) -> Result<Self> {
        let mut t = Self::zeros(shape, dtype);
        t.scaling_mode = mode;
        let (rows, cols) = t.shape.flat_2d();
        match mode {
            ScalingMode::Tensor => {
                t.amax = Some(Storage::from_f32(&[0.0]));
                t.scale = Some(Storage::from_f32(&[1.0]));
                t.scale_inv = Some(Storage::from_f32(&[1.0]));
            }
            _ => {
                let (sr, sc) = mode.scale_inv_shape(rows, cols)?;
                t.scale_inv = Some(Storage::zeros(mode.scale_inv_dtype(), sr * sc));
            }
        }
        Ok(t)
    }

    /// Allocate the columnwise data and `scale_inv` buffers for the current
    /// scaling mode. Tensor mode starts its columnwise `scale_inv` at 1.
    pub fn with_columnwise(mut self) -> Result<Self> {
        if !self.dtype().is_fp8() {
            return Err(QcastError::invalid(
                "with_columnwise",
                format!("columnwise buffers need an fp8 tensor, got {}", self.dtype()),
            ));
        }
        let (rows, cols) = self.shape.flat_2d();
        let mode = self.scaling_mode;
        let (sr, sc) = mode.columnwise_scale_inv_shape(rows, cols)?;
        self.columnwise = Some(Storage::zeros(self.dtype(), self.numel()));
        self.columnwise_scale_inv = Some(match mode {
            ScalingMode::Tensor => Storage::from_f32(&[1.0]),
            _ => Storage::zeros(mode.scale_inv_dtype(), sr * sc),
        });
        Ok(self)
    }

    /// Attach existing columnwise data and `scale_inv` buffers.
    pub fn with_columnwise_buffers(mut self, data: Storage, scale_inv: Storage) -> Self {
        self.columnwise = Some(data);
        self.columnwise_scale_inv = Some(scale_inv);
        self
    }

    /// Set the scaling mode (buffers are attached separately).
    pub fn with_scaling_mode(mut self, mode: ScalingMode) -> Self {
        self.scaling_mode = mode;
        self
    }

    /// Attach an `amax` buffer.
    pub fn with_amax(mut self, amax: Storage) -> Self {
        self.amax = Some(amax);
        self
    }

    /// Attach a `scale` buffer.
    pub fn with_scale_buffer(mut self, scale: Storage) -> Self {
        self.scale = Some(scale);
        self
    }

    /// Attach a `scale_inv` buffer.
    pub fn with_scale_inv(mut self, scale_inv: Storage) -> Self {
        self.scale_inv = Some(scale_inv);
        self
    }

    /// Write `scale` into the tensor's scale buffer, allocating it if absent.
    pub fn with_scale(mut self, scale: f32) -> Result<Self> {
        match &self.scale {
            Some(buf) => buf.write_f32(&[scale])?,
            None => self.scale = Some(Storage::from_f32(&[scale])),
        }
        Ok(self)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Get the shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Get the dtype.
    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    /// Get the device.
    pub fn device(&self) -> Device {
        self.storage.device()
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn scaling_mode(&self) -> ScalingMode {
        self.scaling_mode
    }

    pub fn amax(&self) -> Option<&Storage> {
        self.amax.as_ref()
    }

    pub fn scale(&self) -> Option<&Storage> {
        self.scale.as_ref()
    }

    pub fn scale_inv(&self) -> Option<&Storage> {
        self.scale_inv.as_ref()
    }

    pub fn columnwise(&self) -> Option<&Storage> {
        self.columnwise.as_ref()
    }

    pub fn columnwise_scale_inv(&self) -> Option<&Storage> {
        self.columnwise_scale_inv.as_ref()
    }

    pub fn has_columnwise(&self) -> bool {
        self.columnwise.is_some()
    }

    /// `(rows, cols)` of the columnwise data buffer.
    pub fn columnwise_dims(&self) -> (usize, usize) {
        let (rows, cols) = self.shape.flat_2d();
        self.scaling_mode.columnwise_data_dims(rows, cols)
    }

    /// Whether two tensors alias the same data buffer.
    pub fn same_buffer(&self, other: &Tensor) -> bool {
        self.storage.same_buffer(&other.storage)
    }

    // =========================================================================
    // Host readback
    // =========================================================================

    /// Decode the raw data to f32 (no scale applied).
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        self.storage.to_f32_vec()
    }

    /// Raw bytes of the data buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.storage.to_bytes()
    }

    /// Current value of the `amax` buffer.
    pub fn amax_value(&self) -> Result<f32> {
        first_value(self.amax.as_ref(), "amax")
    }

    /// Current value of the `scale` buffer.
    pub fn scale_value(&self) -> Result<f32> {
        first_value(self.scale.as_ref(), "scale")
    }

    /// Decoded `scale_inv` factors (E8M0 codes become powers of two).
    pub fn scale_inv_values(&self) -> Result<Vec<f32>> {
        match &self.scale_inv {
            Some(s) => s.to_f32_vec(),
            None => Err(QcastError::Storage("tensor has no scale_inv buffer".into())),
        }
    }

    /// Raw bytes of the columnwise data buffer.
    pub fn columnwise_bytes(&self) -> Result<Vec<u8>> {
        match &self.columnwise {
            Some(s) => s.to_bytes(),
            None => Err(QcastError::Storage("tensor has no columnwise buffer".into())),
        }
    }

    /// Decoded columnwise `scale_inv` factors.
    pub fn columnwise_scale_inv_values(&self) -> Result<Vec<f32>> {
        match &self.columnwise_scale_inv {
            Some(s) => s.to_f32_vec(),
            None => Err(QcastError::Storage("tensor has no columnwise scale_inv buffer".into())),
        }
    }

    /// Copy the data and every scaling buffer to a GPU.
    #[cfg(feature = "cuda")]
    pub fn to_cuda(
        &self,
        stream: &std::sync::Arc<cudarc::driver::CudaStream>,
        ordinal: usize,
    ) -> Result<Self> {
        let copy = |s: &Option<Storage>| s.as_ref().map(|s| s.to_cuda(stream, ordinal)).transpose();
        Ok(Self {
            storage: self.storage.to_cuda(stream, ordinal)?,
            shape: self.shape.clone(),
            scaling_mode: self.scaling_mode,
            amax: copy(&self.amax)?,
            scale: copy(&self.scale)?,
            scale_inv: copy(&self.scale_inv)?,
            columnwise: copy(&self.columnwise)?,
            columnwise_scale_inv: copy(&self.columnwise_scale_inv)?,
        })
    }
}

fn first_value(buf: Option<&Storage>, what: &str) -> Result<f32> {
    let buf = buf.ok_or_else(|| QcastError::Storage(format!("tensor has no {what} buffer")))?;
    buf.to_f32_vec()?
        .first()
        .copied()
        .ok_or_else(|| QcastError::Storage(format!("{what} buffer is empty")))
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(shape={}, dtype={}, device={}, scaling={})",
            self.shape,
            self.dtype(),
            self.device(),
            self.scaling_mode
        )
    }
}
