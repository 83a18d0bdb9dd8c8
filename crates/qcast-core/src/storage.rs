use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{format, DType, Device, QcastError, Result};

#[cfg(feature = "cuda")]
use cudarc::driver::{CudaSlice, CudaStream};

/// Backing storage for tensor data.
///
/// Device kernels mutate buffers that the caller still holds handles to, so
/// the bytes sit behind a lock instead of being copy-on-write.
#[derive(Debug)]
pub enum StorageData {
    /// Host bytes, read and written by the host runtime's stream workers.
    Host(RwLock<Vec<u8>>),
    /// CUDA allocation plus the stream it was allocated on.
    #[cfg(feature = "cuda")]
    Cuda {
        buffer: parking_lot::Mutex<CudaSlice<u8>>,
        stream: Arc<CudaStream>,
        ordinal: usize,
    },
}

/// Shared, reference-counted device buffer.
///
/// Cloning a `Storage` clones the handle; both clones see the same bytes.
#[derive(Debug, Clone)]
pub struct Storage {
    data: Arc<StorageData>,
    dtype: DType,
    device: Device,
    /// Number of logical elements (not bytes).
    numel: usize,
}

impl Storage {
    /// Allocate zeroed host storage for `numel` elements of the given dtype.
    pub fn zeros(dtype: DType, numel: usize) -> Self {
        let nbytes = dtype.storage_bytes(numel);
        Self::host(dtype, numel, vec![0u8; nbytes])
    }

    /// Create host storage from raw bytes.
    pub fn from_bytes(dtype: DType, numel: usize, bytes: Vec<u8>) -> Result<Self> {
        let expected = dtype.storage_bytes(numel);
        if bytes.len() != expected {
            return Err(QcastError::Storage(format!(
                "expected {} bytes for {} elements of {}, got {}",
                expected,
                numel,
                dtype,
                bytes.len()
            )));
        }
        Ok(Self::host(dtype, numel, bytes))
    }

    /// Create host F32 storage from a slice of values.
    pub fn from_f32(data: &[f32]) -> Self {
        Self::host(DType::F32, data.len(), format::encode_slice(DType::F32, data))
    }

    /// Create host storage holding `data` encoded as `dtype`.
    pub fn from_values(dtype: DType, data: &[f32]) -> Self {
        Self::host(dtype, data.len(), format::encode_slice(dtype, data))
    }

    fn host(dtype: DType, numel: usize, bytes: Vec<u8>) -> Self {
        Self {
            data: Arc::new(StorageData::Host(RwLock::new(bytes))),
            dtype,
            device: Device::Host,
            numel,
        }
    }

    /// Get the dtype of this storage.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Get the device of this storage.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Number of logical elements.
    pub fn numel(&self) -> usize {
        self.numel
    }

    /// Size in bytes.
    pub fn nbytes(&self) -> usize {
        self.dtype.storage_bytes(self.numel)
    }

    /// Whether two handles refer to the same buffer.
    pub fn same_buffer(&self, other: &Storage) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Get the raw StorageData reference (for dispatch).
    pub fn data(&self) -> &StorageData {
        self.data.as_ref()
    }

    /// Shared lock on host bytes.
    pub fn host_read(&self) -> Result<RwLockReadGuard<'_, Vec<u8>>> {
        match self.data.as_ref() {
            StorageData::Host(bytes) => Ok(bytes.read()),
            #[cfg(feature = "cuda")]
            StorageData::Cuda { .. } => Err(self.not_host()),
        }
    }

    /// Exclusive lock on host bytes.
    pub fn host_write(&self) -> Result<RwLockWriteGuard<'_, Vec<u8>>> {
        match self.data.as_ref() {
            StorageData::Host(bytes) => Ok(bytes.write()),
            #[cfg(feature = "cuda")]
            StorageData::Cuda { .. } => Err(self.not_host()),
        }
    }

    #[cfg(feature = "cuda")]
    fn not_host(&self) -> QcastError {
        QcastError::Storage(format!(
            "buffer lives on {}; copy it to the host first",
            self.device
        ))
    }

    /// Copy the bytes out (D2H copy for device buffers).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self.data.as_ref() {
            StorageData::Host(bytes) => Ok(bytes.read().clone()),
            #[cfg(feature = "cuda")]
            StorageData::Cuda { buffer, stream, .. } => {
                let guard = buffer.lock();
                let host = stream
                    .clone_dtoh(&*guard)
                    .map_err(|e| QcastError::Storage(format!("D2H copy: {e}")))?;
                stream
                    .synchronize()
                    .map_err(|e| QcastError::Storage(format!("D2H sync: {e}")))?;
                Ok(host)
            }
        }
    }

    /// Decode every element to f32.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        Ok(format::decode_slice(self.dtype, &self.to_bytes()?))
    }

    /// Overwrite the whole buffer with `bytes`.
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.nbytes() {
            return Err(QcastError::Storage(format!(
                "write of {} bytes into a {}-byte {} buffer",
                bytes.len(),
                self.nbytes(),
                self.dtype
            )));
        }
        match self.data.as_ref() {
            StorageData::Host(host) => {
                host.write().copy_from_slice(bytes);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            StorageData::Cuda { buffer, stream, .. } => {
                let mut guard = buffer.lock();
                stream
                    .memcpy_htod(&bytes.to_vec(), &mut *guard)
                    .map_err(|e| QcastError::Storage(format!("H2D copy: {e}")))
            }
        }
    }

    /// Overwrite the buffer with `values` encoded in this storage's dtype.
    pub fn write_f32(&self, values: &[f32]) -> Result<()> {
        if values.len() != self.numel {
            return Err(QcastError::Storage(format!(
                "write of {} values into a {}-element buffer",
                values.len(),
                self.numel
            )));
        }
        self.write_bytes(&format::encode_slice(self.dtype, values))
    }

    /// Create GPU storage from this buffer's bytes (H2D copy).
    #[cfg(feature = "cuda")]
    pub fn to_cuda(&self, stream: &Arc<CudaStream>, ordinal: usize) -> Result<Self> {
        let host = self.to_bytes()?;
        let buffer = stream
            .clone_htod(&host)
            .map_err(|e| QcastError::Storage(format!("H2D copy: {e}")))?;
        Ok(Self::from_cuda(Arc::clone(stream), buffer, ordinal, self.dtype, self.numel))
    }

    /// Copy GPU storage back to a host buffer.
    #[cfg(feature = "cuda")]
    pub fn to_host(&self) -> Result<Self> {
        Ok(Self::host(self.dtype, self.numel, self.to_bytes()?))
    }

    /// Create GPU storage with zeroed memory.
    #[cfg(feature = "cuda")]
    pub fn cuda_zeros(
        stream: &Arc<CudaStream>,
        ordinal: usize,
        dtype: DType,
        numel: usize,
    ) -> Result<Self> {
        let buffer = stream
            .alloc_zeros::<u8>(dtype.storage_bytes(numel).max(1))
            .map_err(|e| QcastError::Storage(format!("CUDA alloc_zeros: {e}")))?;
        Ok(Self::from_cuda(Arc::clone(stream), buffer, ordinal, dtype, numel))
    }

    /// Wrap an existing CUDA allocation.
    #[cfg(feature = "cuda")]
    pub fn from_cuda(
        stream: Arc<CudaStream>,
        buffer: CudaSlice<u8>,
        ordinal: usize,
        dtype: DType,
        numel: usize,
    ) -> Self {
        Self {
            data: Arc::new(StorageData::Cuda {
                buffer: parking_lot::Mutex::new(buffer),
                stream,
                ordinal,
            }),
            dtype,
            device: Device::Cuda(ordinal),
            numel,
        }
    }

    /// The CUDA allocation, if this storage lives on a GPU.
    #[cfg(feature = "cuda")]
    pub fn cuda_buffer(&self) -> Option<&parking_lot::Mutex<CudaSlice<u8>>> {
        match self.data.as_ref() {
            StorageData::Cuda { buffer, .. } => Some(buffer),
            _ => None,
        }
    }
}
