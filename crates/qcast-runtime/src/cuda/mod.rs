//! CUDA device runtime.
//!
//! Streams and events are cudarc handles; kernels are compiled from
//! `kernels/cast.cu` with NVRTC on first launch. Only tensor scaling with
//! f32/f16/bf16 and E4M3/E5M2 operands runs here.

pub mod context;
pub mod launch;
pub mod ops;

use std::sync::Arc;

use cudarc::driver::{sys, CudaContext, CudaEvent, CudaStream};
use parking_lot::Mutex;
use tracing::{debug, info};

use qcast_core::{DType, Device, ScalingMode, Storage, Tensor};
use qcast_kernels::CHUNK_ROWS;

use crate::config::RuntimeConfig;
use crate::device::{DeviceProperties, KernelTuning};
use crate::error::RuntimeError;
use crate::runtime::{DeviceRuntime, KernelLaunch};

/// Largest grid y-extent, bounding the rows one cast can cover.
const MAX_GRID_Y: usize = 65_535;

#[derive(Debug, Clone)]
pub struct CudaProperties {
    num_devices: usize,
    ordinal: usize,
    sm_arch: u32,
    sm_count: usize,
    priority_range: (i32, i32),
    multicast: bool,
}

impl CudaProperties {
    fn query(ctx: &CudaContext, ordinal: usize) -> Result<Self, RuntimeError> {
        use sys::CUdevice_attribute_enum as Attr;
        let major = context::attribute(ctx, Attr::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)?;
        let minor = context::attribute(ctx, Attr::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)?;
        let sm_count = context::attribute(ctx, Attr::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)?;
        let multicast = context::attribute(ctx, Attr::CU_DEVICE_ATTRIBUTE_MULTICAST_SUPPORTED)?;
        Ok(Self {
            num_devices: context::device_count(),
            ordinal,
            sm_arch: (major * 10 + minor).max(0) as u32,
            sm_count: sm_count.max(1) as usize,
            priority_range: context::stream_priority_range(ctx)?,
            multicast: multicast != 0,
        })
    }
}

impl DeviceProperties for CudaProperties {
    fn num_devices(&self) -> usize {
        self.num_devices
    }

    fn current_device(&self) -> usize {
        self.ordinal
    }

    fn sm_arch(&self) -> u32 {
        self.sm_arch
    }

    fn sm_count(&self) -> usize {
        self.sm_count
    }

    fn stream_priority_range(&self) -> (i32, i32) {
        self.priority_range
    }

    fn supports_multicast(&self) -> bool {
        self.multicast
    }
}

pub struct CudaRuntime {
    ctx: Arc<CudaContext>,
    ordinal: usize,
    props: CudaProperties,
    tuning: KernelTuning,
    default_stream: Arc<CudaStream>,
    /// Serializes enqueues so the per-buffer locks of one launch never
    /// interleave with another's.
    launch_lock: Mutex<()>,
}

impl CudaRuntime {
    pub fn new(ordinal: usize) -> Result<Self, RuntimeError> {
        let ctx = context::get_context(ordinal)?;
        let props = CudaProperties::query(&ctx, ordinal)?;
        let tuning = KernelTuning::for_device(&props);
        let default_stream = ctx.default_stream();
        info!(
            ordinal,
            sm_arch = props.sm_arch,
            sm_count = props.sm_count,
            priority_range = ?props.priority_range,
            multicast = props.multicast,
            "cuda runtime created"
        );
        Ok(Self {
            ctx,
            ordinal,
            props,
            tuning,
            default_stream,
            launch_lock: Mutex::new(()),
        })
    }

    pub fn with_config(config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        Self::new(config.device_ordinal)
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn context(&self) -> &Arc<CudaContext> {
        &self.ctx
    }

    /// Copy a host tensor (and its scaling buffers) to this device.
    pub fn upload(&self, t: &Tensor) -> qcast_core::Result<Tensor> {
        t.to_cuda(&self.default_stream, self.ordinal)
    }

    /// Zeroed device buffer.
    pub fn zeros(&self, dtype: DType, numel: usize) -> qcast_core::Result<Storage> {
        Storage::cuda_zeros(&self.default_stream, self.ordinal, dtype, numel)
    }
}

fn driver(op: &'static str) -> impl Fn(cudarc::driver::DriverError) -> RuntimeError {
    move |e| RuntimeError::Driver {
        op,
        msg: e.to_string(),
    }
}

fn distinct_buffers(buffers: &[&Storage]) -> bool {
    buffers
        .iter()
        .enumerate()
        .all(|(i, a)| buffers[i + 1..].iter().all(|b| !a.same_buffer(b)))
}

impl DeviceRuntime for CudaRuntime {
    type Stream = Arc<CudaStream>;
    type Event = Arc<CudaEvent>;

    fn name(&self) -> &'static str {
        "cuda"
    }

    fn device(&self) -> Device {
        Device::Cuda(self.ordinal)
    }

    fn properties(&self) -> &dyn DeviceProperties {
        &self.props
    }

    fn default_stream(&self) -> Arc<CudaStream> {
        Arc::clone(&self.default_stream)
    }

    /// cudarc's stream constructor takes no priority, so every stream runs
    /// at the default priority (0) whatever `priority` asks for.
    fn create_stream(&self, priority: Option<i32>) -> Result<Arc<CudaStream>, RuntimeError> {
        let stream = self.ctx.new_stream().map_err(driver("cuStreamCreate"))?;
        match priority {
            Some(p) if p != 0 => debug!(
                ordinal = self.ordinal,
                requested = p,
                range = ?self.props.priority_range,
                "stream created at default priority"
            ),
            _ => debug!(ordinal = self.ordinal, "stream created"),
        }
        Ok(stream)
    }

    fn create_event(&self) -> Result<Arc<CudaEvent>, RuntimeError> {
        let event = self.ctx.new_event(None).map_err(driver("cuEventCreate"))?;
        Ok(Arc::new(event))
    }

    fn record_event(&self, event: &Arc<CudaEvent>, stream: &Arc<CudaStream>) -> Result<(), RuntimeError> {
        event.record(stream).map_err(driver("cuEventRecord"))
    }

    fn stream_wait_event(&self, stream: &Arc<CudaStream>, event: &Arc<CudaEvent>) -> Result<(), RuntimeError> {
        stream.wait(event).map_err(driver("cuStreamWaitEvent"))
    }

    fn synchronize(&self, stream: &Arc<CudaStream>) -> Result<(), RuntimeError> {
        stream.synchronize().map_err(driver("cuStreamSynchronize"))
    }

    /// Streams are released when the last handle drops.
    fn destroy_stream(&self, stream: &Arc<CudaStream>) -> Result<(), RuntimeError> {
        self.synchronize(stream)
    }

    fn destroy_event(&self, _event: &Arc<CudaEvent>) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn supports(&self, launch: &KernelLaunch) -> Result<(), String> {
        let cuda_dtype = |d: DType| {
            matches!(
                d,
                DType::F32 | DType::F16 | DType::BF16 | DType::Float8E4M3 | DType::Float8E5M2
            )
        };
        match launch {
            KernelLaunch::Cast(c) => {
                if c.output.dtype().is_fp8() && c.output.scaling_mode() != ScalingMode::Tensor {
                    return Err(format!("{} scaling is host-only", c.output.scaling_mode()));
                }
                if c.output.has_columnwise() {
                    return Err("columnwise output is host-only".to_string());
                }
                if !cuda_dtype(c.input.dtype()) || !cuda_dtype(c.output.dtype()) {
                    return Err(format!("{} -> {} is host-only", c.input.dtype(), c.output.dtype()));
                }
                let (rows, _) = c.input.shape().flat_2d();
                if rows.div_ceil(CHUNK_ROWS) > MAX_GRID_Y {
                    return Err(format!("{rows} rows exceed one launch"));
                }
                let mut buffers = vec![c.input.storage(), c.output.storage()];
                buffers.extend(c.act_input.as_ref().map(Tensor::storage));
                buffers.extend(c.output.amax());
                buffers.extend(c.output.scale());
                buffers.extend(c.output.scale_inv());
                buffers.extend(c.noop.as_ref().map(Tensor::storage));
                if let Some(d) = &c.dbias {
                    buffers.push(d.dbias.storage());
                    buffers.push(d.workspace.storage());
                }
                if !distinct_buffers(&buffers) {
                    return Err("every operand needs its own buffer".into());
                }
                Ok(())
            }
            KernelLaunch::Dequantize(d) => {
                if d.columnwise {
                    return Err("columnwise dequantize is host-only".to_string());
                }
                if d.input.scaling_mode() != ScalingMode::Tensor {
                    return Err(format!("{} scaling is host-only", d.input.scaling_mode()));
                }
                if !cuda_dtype(d.input.dtype()) || !cuda_dtype(d.output.dtype()) {
                    return Err(format!("{} -> {} is host-only", d.input.dtype(), d.output.dtype()));
                }
                Ok(())
            }
        }
    }

    fn launch(&self, stream: &Arc<CudaStream>, launch: KernelLaunch) -> Result<(), RuntimeError> {
        let _guard = self.launch_lock.lock();
        match &launch {
            KernelLaunch::Cast(c) => ops::launch_cast(&self.ctx, stream, self.ordinal, self.tuning, c),
            KernelLaunch::Dequantize(d) => {
                ops::launch_dequantize(&self.ctx, stream, self.ordinal, self.tuning, d)
            }
        }
    }
}
