//! Quantization dispatch engine.
//!
//! Every entry point validates its operands completely before anything is
//! enqueued, resolves the requested fusion shape to a kernel variant and
//! launches it on the caller's stream. `multi_tensor_quantize` fans the
//! per-tensor casts out over the compute stream pool instead.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use qcast_core::{DType, QcastError, QuantizationConfig, Result, Tensor};
use qcast_kernels::{workspace_shape, ActivationKind, FusionShape, KernelVariant};

use crate::config::RuntimeConfig;
use crate::device::{DeviceInfo, KernelTuning};
use crate::host::HostRuntime;
use crate::pool::StreamPool;
use crate::runtime::{CastLaunch, DbiasTarget, DequantizeLaunch, DeviceRuntime, KernelLaunch};

/// Routes quantize/dequantize requests to fused kernels on a runtime.
pub struct Engine<R: DeviceRuntime> {
    runtime: Arc<R>,
    config: RuntimeConfig,
    tuning: KernelTuning,
    /// Created on the first multi-tensor call.
    pool: Mutex<Option<Arc<StreamPool<R>>>>,
}

impl Engine<HostRuntime> {
    /// Engine over a fresh host runtime.
    pub fn host(config: RuntimeConfig) -> Result<Self> {
        let runtime = HostRuntime::with_config(&config).map_err(|e| e.into_qcast("engine_create"))?;
        Self::new(Arc::new(runtime), config)
    }
}

impl<R: DeviceRuntime> Engine<R> {
    pub fn new(runtime: Arc<R>, config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let tuning = KernelTuning::for_device(runtime.properties());
        info!(
            runtime = runtime.name(),
            device = %runtime.device(),
            num_compute_streams = config.num_compute_streams,
            ?tuning,
            "quantization engine created"
        );
        Ok(Self {
            runtime,
            config,
            tuning,
            pool: Mutex::new(None),
        })
    }

    pub fn runtime(&self) -> &Arc<R> {
        &self.runtime
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn tuning(&self) -> KernelTuning {
        self.tuning
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo::query(self.runtime.name(), self.runtime.properties())
    }

    pub fn num_compute_streams(&self) -> usize {
        self.config.num_compute_streams
    }

    /// The compute stream pool, created on first use.
    pub fn compute_stream_pool(&self) -> Result<Arc<StreamPool<R>>> {
        let mut slot = self.pool.lock();
        if let Some(pool) = slot.as_ref() {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(StreamPool::new(
            Arc::clone(&self.runtime),
            self.config.num_compute_streams,
            self.config.use_high_priority_streams,
        )?);
        *slot = Some(Arc::clone(&pool));
        Ok(pool)
    }

    /// Tear the pool down. A later multi-tensor call creates a new one.
    pub fn shutdown(&self) -> Result<()> {
        let pool = self.pool.lock().take();
        match pool {
            Some(pool) => pool.shutdown(),
            None => Ok(()),
        }
    }

    /// F32 workspace shape `quantize_dbias*` needs for `input`.
    pub fn dbias_workspace(&self, input: &Tensor) -> (usize, usize) {
        let (rows, cols) = input.shape().flat_2d();
        workspace_shape(rows, cols)
    }

    // =========================================================================
    // Operations
    // =========================================================================

    pub fn quantize(&self, input: &Tensor, output: &Tensor, stream: &R::Stream) -> Result<()> {
        let cfg = QuantizationConfig::default();
        self.cast("quantize", FusionShape::cast(), input, None, output, None, &cfg, stream)
    }

    pub fn quantize_with_config(
        &self,
        input: &Tensor,
        output: &Tensor,
        config: &QuantizationConfig,
        stream: &R::Stream,
    ) -> Result<()> {
        self.cast("quantize_v2", FusionShape::cast(), input, None, output, None, config, stream)
    }

    pub fn quantize_noop(
        &self,
        input: &Tensor,
        output: &Tensor,
        noop: &Tensor,
        stream: &R::Stream,
    ) -> Result<()> {
        let cfg = QuantizationConfig::new().with_noop(noop.clone());
        self.cast("quantize_noop", FusionShape::cast(), input, None, output, None, &cfg, stream)
    }

    pub fn quantize_dbias(
        &self,
        input: &Tensor,
        output: &Tensor,
        dbias: &Tensor,
        workspace: &Tensor,
        stream: &R::Stream,
    ) -> Result<()> {
        let cfg = QuantizationConfig::default();
        self.cast(
            "quantize_dbias",
            FusionShape::dbias(),
            input,
            None,
            output,
            Some((dbias, workspace)),
            &cfg,
            stream,
        )
    }

    /// `output = quantize(input · act'(act_input))`, `dbias = colsum` of the
    /// same product.
    #[allow(clippy::too_many_arguments)]
    pub fn quantize_dbias_dactivation(
        &self,
        kind: ActivationKind,
        input: &Tensor,
        act_input: &Tensor,
        output: &Tensor,
        dbias: &Tensor,
        workspace: &Tensor,
        stream: &R::Stream,
    ) -> Result<()> {
        let cfg = QuantizationConfig::default();
        self.cast(
            dbias_dact_op(kind),
            FusionShape::dbias_dact(kind),
            input,
            Some(act_input),
            output,
            Some((dbias, workspace)),
            &cfg,
            stream,
        )
    }

    /// `output = quantize(act(input))`.
    pub fn activation_quantize(
        &self,
        kind: ActivationKind,
        input: &Tensor,
        output: &Tensor,
        stream: &R::Stream,
    ) -> Result<()> {
        let cfg = QuantizationConfig::default();
        self.cast("activation_quantize", FusionShape::act(kind), input, None, output, None, &cfg, stream)
    }

    /// `output = quantize(grad · act'(act_input))`.
    pub fn dactivation_quantize(
        &self,
        kind: ActivationKind,
        grad: &Tensor,
        act_input: &Tensor,
        output: &Tensor,
        stream: &R::Stream,
    ) -> Result<()> {
        let cfg = QuantizationConfig::default();
        self.cast(
            "dactivation_quantize",
            FusionShape::dact(kind),
            grad,
            Some(act_input),
            output,
            None,
            &cfg,
            stream,
        )
    }

    pub fn dequantize(&self, input: &Tensor, output: &Tensor, stream: &R::Stream) -> Result<()> {
        self.dequantize_copy("dequantize", false, input, output, stream)
    }

    /// Dequantize `input`'s columnwise copy. `output` has the input's shape
    /// whatever layout the copy is stored in.
    pub fn dequantize_columnwise(&self, input: &Tensor, output: &Tensor, stream: &R::Stream) -> Result<()> {
        self.dequantize_copy("dequantize_columnwise", true, input, output, stream)
    }

    fn dequantize_copy(
        &self,
        op: &'static str,
        columnwise: bool,
        input: &Tensor,
        output: &Tensor,
        stream: &R::Stream,
    ) -> Result<()> {
        self.validate_dequantize(op, columnwise, input, output)?;
        let launch = KernelLaunch::Dequantize(DequantizeLaunch {
            input: input.clone(),
            output: output.clone(),
            columnwise,
        });
        self.check_supported(op, &launch)?;
        debug!(op, input = %input.dtype(), output = %output.dtype(), mode = %input.scaling_mode(), "dispatch");
        self.runtime
            .launch(stream, launch)
            .map_err(|e| e.into_qcast(op))
    }

    /// Quantize `inputs[i]` into `outputs[i]` for every `i`, spread over the
    /// compute stream pool and joined back to `stream`.
    pub fn multi_tensor_quantize(
        &self,
        inputs: &[Tensor],
        outputs: &[Tensor],
        config: &QuantizationConfig,
        stream: &R::Stream,
    ) -> Result<()> {
        const OP: &str = "multi_tensor_quantize";
        if inputs.len() != outputs.len() {
            return Err(QcastError::invalid(
                OP,
                format!("{} inputs but {} outputs", inputs.len(), outputs.len()),
            ));
        }
        let launches = inputs
            .iter()
            .zip(outputs)
            .map(|(i, o)| self.prepare_cast(OP, FusionShape::cast(), i, None, o, None, config))
            .collect::<Result<Vec<_>>>()?;
        if launches.is_empty() {
            return Ok(());
        }

        let pool = self.compute_stream_pool()?;
        let mut launches = launches.into_iter();
        pool.fan_out(OP, stream, inputs.len(), |_, pool_stream| match launches.next() {
            Some(launch) => self
                .runtime
                .launch(pool_stream, launch)
                .map_err(|e| e.into_qcast(OP)),
            None => Err(QcastError::invalid(OP, "fan-out requested more launches than prepared")),
        })
    }

    // =========================================================================
    // Validation
    // =========================================================================

    #[allow(clippy::too_many_arguments)]
    fn cast(
        &self,
        op: &'static str,
        shape: FusionShape,
        input: &Tensor,
        act_input: Option<&Tensor>,
        output: &Tensor,
        dbias: Option<(&Tensor, &Tensor)>,
        config: &QuantizationConfig,
        stream: &R::Stream,
    ) -> Result<()> {
        let launch = self.prepare_cast(op, shape, input, act_input, output, dbias, config)?;
        self.runtime
            .launch(stream, launch)
            .map_err(|e| e.into_qcast(op))
    }

    #[allow(clippy::too_many_arguments)]
    fn prepare_cast(
        &self,
        op: &'static str,
        shape: FusionShape,
        input: &Tensor,
        act_input: Option<&Tensor>,
        output: &Tensor,
        dbias: Option<(&Tensor, &Tensor)>,
        config: &QuantizationConfig,
    ) -> Result<KernelLaunch> {
        let variant = KernelVariant::select(shape).map_err(|e| QcastError::invalid(op, e.to_string()))?;
        if variant.activation_derivative().is_some() != act_input.is_some() {
            return Err(QcastError::invalid(
                op,
                "activation input must be given exactly for activation-derivative fusion",
            ));
        }
        if variant.has_dbias() != dbias.is_some() {
            return Err(QcastError::invalid(op, "dbias outputs do not match the fusion shape"));
        }

        self.validate_cast_operands(op, input, act_input, output)?;
        if let Some((dbias, workspace)) = dbias {
            self.validate_dbias(op, input, dbias, workspace)?;
        }
        if let Some(noop) = &config.noop {
            self.check_device(op, "noop", noop)?;
            if noop.dtype() != DType::F32 || noop.numel() < 1 {
                return Err(QcastError::invalid(
                    op,
                    format!("noop must be a non-empty f32 tensor, got {noop:?}"),
                ));
            }
        }

        let launch = KernelLaunch::Cast(CastLaunch {
            variant,
            input: input.clone(),
            act_input: act_input.cloned(),
            output: output.clone(),
            dbias: dbias.map(|(d, w)| DbiasTarget {
                dbias: d.clone(),
                workspace: w.clone(),
            }),
            noop: config.noop.clone(),
            force_pow_2_scales: config.force_pow_2_scales,
            amax_epsilon: config.amax_epsilon,
        });
        self.check_supported(op, &launch)?;
        debug!(
            op,
            %variant,
            shape = %input.shape(),
            input = %input.dtype(),
            output = %output.dtype(),
            mode = %output.scaling_mode(),
            noop = config.noop.is_some(),
            "dispatch"
        );
        Ok(launch)
    }

    fn check_supported(&self, op: &'static str, launch: &KernelLaunch) -> Result<()> {
        self.runtime
            .supports(launch)
            .map_err(|msg| QcastError::invalid(op, format!("{} runtime: {msg}", self.runtime.name())))
    }

    fn check_device(&self, op: &'static str, what: &str, t: &Tensor) -> Result<()> {
        if t.device() != self.runtime.device() {
            return Err(QcastError::invalid(
                op,
                format!("{what} lives on {}, runtime drives {}", t.device(), self.runtime.device()),
            ));
        }
        Ok(())
    }

    fn check_same_shape(op: &'static str, expected: &Tensor, actual: &Tensor) -> Result<()> {
        if expected.shape() != actual.shape() {
            return Err(QcastError::ShapeMismatch {
                op,
                expected: expected.shape().dims().to_vec(),
                actual: actual.shape().dims().to_vec(),
            });
        }
        Ok(())
    }

    fn validate_cast_operands(
        &self,
        op: &'static str,
        input: &Tensor,
        act_input: Option<&Tensor>,
        output: &Tensor,
    ) -> Result<()> {
        let (in_dt, out_dt) = (input.dtype(), output.dtype());
        if !in_dt.is_high_precision() || !(out_dt.is_fp8() || out_dt.is_high_precision()) {
            return Err(QcastError::UnsupportedDType {
                op,
                input: in_dt,
                output: out_dt,
            });
        }
        self.check_device(op, "input", input)?;
        self.check_device(op, "output", output)?;
        Self::check_same_shape(op, input, output)?;
        if input.same_buffer(output) {
            return Err(QcastError::invalid(op, "input and output share a buffer"));
        }
        if let Some(act) = act_input {
            self.check_device(op, "activation input", act)?;
            Self::check_same_shape(op, input, act)?;
            if act.dtype() != in_dt {
                return Err(QcastError::invalid(
                    op,
                    format!("activation input is {}, gradient is {in_dt}", act.dtype()),
                ));
            }
            if act.same_buffer(output) {
                return Err(QcastError::invalid(op, "activation input and output share a buffer"));
            }
        }
        if out_dt.is_fp8() {
            self.validate_scaling(op, output)?;
        } else if output.has_columnwise() || output.columnwise_scale_inv().is_some() {
            return Err(QcastError::invalid(op, format!("{out_dt} output cannot carry a columnwise copy")));
        }
        if output.columnwise().is_some_and(|c| c.same_buffer(input.storage())) {
            return Err(QcastError::invalid(op, "input and columnwise output share a buffer"));
        }
        Ok(())
    }

    /// Scaling buffers a quantized tensor must carry for its mode, plus the
    /// columnwise pair when either half of it is attached.
    fn validate_scaling(&self, op: &'static str, t: &Tensor) -> Result<()> {
        let (rows, cols) = t.shape().flat_2d();
        let mode = t.scaling_mode();
        let (sr, sc) = mode
            .scale_inv_shape(rows, cols)
            .map_err(|e| QcastError::invalid(op, e.to_string()))?;
        let mut required = vec![("scale_inv", t.scale_inv(), mode.scale_inv_dtype(), sr * sc)];
        if !mode.is_block() {
            required.push(("scale", t.scale(), DType::F32, 1));
            required.push(("amax", t.amax(), DType::F32, 1));
        }
        if t.has_columnwise() || t.columnwise_scale_inv().is_some() {
            let (csr, csc) = mode
                .columnwise_scale_inv_shape(rows, cols)
                .map_err(|e| QcastError::invalid(op, e.to_string()))?;
            required.push(("columnwise", t.columnwise(), t.dtype(), t.numel()));
            required.push((
                "columnwise scale_inv",
                t.columnwise_scale_inv(),
                mode.scale_inv_dtype(),
                csr * csc,
            ));
            if t.columnwise().is_some_and(|c| c.same_buffer(t.storage())) {
                return Err(QcastError::invalid(op, "columnwise copy aliases the rowwise data"));
            }
        }
        for (name, buf, dtype, numel) in required {
            let buf = buf.ok_or_else(|| {
                QcastError::invalid(op, format!("{mode}-scaled tensor is missing its {name} buffer"))
            })?;
            if buf.dtype() != dtype || buf.numel() != numel {
                return Err(QcastError::invalid(
                    op,
                    format!(
                        "{name} must hold {numel} {dtype} elements, got {} {}",
                        buf.numel(),
                        buf.dtype()
                    ),
                ));
            }
            if buf.device() != self.runtime.device() {
                return Err(QcastError::invalid(op, format!("{name} lives on {}", buf.device())));
            }
        }
        Ok(())
    }

    fn validate_dbias(&self, op: &'static str, input: &Tensor, dbias: &Tensor, workspace: &Tensor) -> Result<()> {
        let (rows, cols) = input.shape().flat_2d();
        self.check_device(op, "dbias", dbias)?;
        self.check_device(op, "workspace", workspace)?;
        if !dbias.dtype().is_high_precision() {
            return Err(QcastError::invalid(op, format!("dbias must be high precision, got {}", dbias.dtype())));
        }
        if dbias.numel() != cols {
            return Err(QcastError::ShapeMismatch {
                op,
                expected: vec![cols],
                actual: dbias.shape().dims().to_vec(),
            });
        }
        let (wr, wc) = workspace_shape(rows, cols);
        if workspace.dtype() != DType::F32 || workspace.numel() < wr * wc {
            return Err(QcastError::MissingWorkspace {
                op,
                required: wr * wc,
                provided: if workspace.dtype() == DType::F32 { workspace.numel() } else { 0 },
            });
        }
        if dbias.same_buffer(input) || workspace.same_buffer(input) || dbias.same_buffer(workspace) {
            return Err(QcastError::invalid(op, "dbias, workspace and input must be distinct buffers"));
        }
        Ok(())
    }

    fn validate_dequantize(&self, op: &'static str, columnwise: bool, input: &Tensor, output: &Tensor) -> Result<()> {
        let (in_dt, out_dt) = (input.dtype(), output.dtype());
        if !in_dt.is_fp8() || !out_dt.is_high_precision() {
            return Err(QcastError::UnsupportedDType {
                op,
                input: in_dt,
                output: out_dt,
            });
        }
        self.check_device(op, "input", input)?;
        self.check_device(op, "output", output)?;
        Self::check_same_shape(op, input, output)?;
        let (rows, cols) = input.shape().flat_2d();
        let mode = input.scaling_mode();
        let (shape, scale_inv) = if columnwise {
            match input.columnwise() {
                Some(c) if c.dtype() == in_dt && c.numel() == input.numel() => {}
                Some(c) => {
                    return Err(QcastError::invalid(
                        op,
                        format!("columnwise copy holds {} {}, tensor is {} {in_dt}", c.numel(), c.dtype(), input.numel()),
                    ))
                }
                None => return Err(QcastError::invalid(op, "quantized input has no columnwise copy")),
            }
            (mode.columnwise_scale_inv_shape(rows, cols), input.columnwise_scale_inv())
        } else {
            (mode.scale_inv_shape(rows, cols), input.scale_inv())
        };
        let (sr, sc) = shape.map_err(|e| QcastError::invalid(op, e.to_string()))?;
        let name = if columnwise { "columnwise scale_inv" } else { "scale_inv" };
        match scale_inv {
            Some(s) if s.dtype() == mode.scale_inv_dtype() && s.numel() == sr * sc => Ok(()),
            Some(s) => Err(QcastError::invalid(
                op,
                format!("{name} must hold {} {} elements, got {} {}", sr * sc, mode.scale_inv_dtype(), s.numel(), s.dtype()),
            )),
            None => Err(QcastError::invalid(op, format!("quantized input is missing its {name} buffer"))),
        }
    }
}

fn dbias_dact_op(kind: ActivationKind) -> &'static str {
    match kind {
        ActivationKind::Gelu => "quantize_dbias_dgelu",
        ActivationKind::Silu => "quantize_dbias_dsilu",
        ActivationKind::Relu => "quantize_dbias_drelu",
        ActivationKind::QGelu => "quantize_dbias_dqgelu",
        ActivationKind::SRelu => "quantize_dbias_dsrelu",
    }
}

impl<R: DeviceRuntime> Drop for Engine<R> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(runtime = self.runtime.name(), error = %e, "engine shutdown on drop failed");
        }
    }
}
