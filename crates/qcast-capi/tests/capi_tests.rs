//! End-to-end tests driving the engine through the C ABI only.

use std::ffi::CStr;

use qcast_capi::config::*;
use qcast_capi::device::*;
use qcast_capi::ops::*;
use qcast_capi::stream::*;
use qcast_capi::tensor::*;
use qcast_capi::{qcast_last_error, QcastStatus, QcastTensor};
use qcast_core::{DType, ScalingMode};
use qcast_kernels::ActivationKind;

fn create(shape: &[usize], dtype: DType, mode: ScalingMode) -> QcastTensor {
    let mut h = 0;
    let st = unsafe { qcast_tensor_create(shape.as_ptr(), shape.len(), dtype.code(), mode.code(), &mut h) };
    assert_eq!(st, QcastStatus::Ok);
    h
}

fn input(data: &[f32], shape: &[usize], dtype: DType) -> QcastTensor {
    let h = create(shape, dtype, ScalingMode::Tensor);
    assert_eq!(unsafe { qcast_tensor_write(h, data.as_ptr(), data.len()) }, QcastStatus::Ok);
    h
}

fn read(h: QcastTensor) -> Vec<f32> {
    let mut n = 0;
    assert_eq!(unsafe { qcast_tensor_numel(h, &mut n) }, QcastStatus::Ok);
    let mut out = vec![0.0f32; n];
    assert_eq!(unsafe { qcast_tensor_read(h, out.as_mut_ptr(), n) }, QcastStatus::Ok);
    out
}

fn amax(h: QcastTensor) -> f32 {
    let mut v = 0.0;
    assert_eq!(unsafe { qcast_tensor_amax(h, &mut v) }, QcastStatus::Ok);
    v
}

fn last_error() -> String {
    let ptr = qcast_last_error();
    assert!(!ptr.is_null());
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

fn sync() {
    assert_eq!(qcast_stream_synchronize(qcast_stream_default()), QcastStatus::Ok);
}

fn ramp(n: usize) -> Vec<f32> {
    (0..n).map(|i| ((i * 37 % 101) as f32 - 50.0) / 9.0).collect()
}

#[test]
fn test_quantize_small_grid() {
    let x = input(&[1.0, 2.0, 3.0, 4.0], &[2, 2], DType::BF16);
    let q = create(&[2, 2], DType::Float8E4M3, ScalingMode::Tensor);
    assert_eq!(qcast_quantize(x, q, qcast_stream_default()), QcastStatus::Ok);
    sync();

    assert_eq!(read(q), vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(amax(q), 4.0);
    let mut scale_inv = [0.0f32; 1];
    assert_eq!(unsafe { qcast_tensor_scale_inv(q, scale_inv.as_mut_ptr(), 1) }, QcastStatus::Ok);
    assert_eq!(scale_inv, [1.0]);

    qcast_tensor_destroy(x);
    qcast_tensor_destroy(q);
}

#[test]
fn test_wrong_handle_kind() {
    let x = input(&[1.0; 4], &[4], DType::F32);
    let q = create(&[4], DType::Float8E4M3, ScalingMode::Tensor);
    // a stream handle where a tensor is expected
    assert_eq!(qcast_quantize(qcast_stream_default(), q, qcast_stream_default()), QcastStatus::InvalidHandle);
    // a tensor handle where a stream is expected
    assert_eq!(qcast_quantize(x, q, x), QcastStatus::InvalidHandle);
    assert!(last_error().contains("stream"));

    qcast_tensor_destroy(x);
    assert_eq!(qcast_quantize(x, q, qcast_stream_default()), QcastStatus::InvalidHandle);
    qcast_tensor_destroy(q);
}

#[test]
fn test_invalid_argument_names_the_operation() {
    let x = input(&ramp(6), &[2, 3], DType::F32);
    let q = create(&[3, 2], DType::Float8E4M3, ScalingMode::Tensor);
    assert_eq!(qcast_quantize(x, q, qcast_stream_default()), QcastStatus::InvalidArgument);
    let msg = last_error();
    assert!(msg.contains("quantize"), "{msg}");

    // a later success does not clear the message
    let ok = create(&[2, 3], DType::Float8E4M3, ScalingMode::Tensor);
    assert_eq!(qcast_quantize(x, ok, qcast_stream_default()), QcastStatus::Ok);
    assert_eq!(last_error(), msg);
    sync();

    for h in [x, q, ok] {
        qcast_tensor_destroy(h);
    }
}

#[test]
fn test_noop_flag_skips_the_write() {
    let x = input(&[5.0, -6.0], &[2], DType::F32);
    let q = create(&[2], DType::Float8E4M3, ScalingMode::Tensor);
    let noop = input(&[1.0], &[1], DType::F32);
    assert_eq!(qcast_quantize_noop(x, q, noop, qcast_stream_default()), QcastStatus::Ok);
    sync();
    assert_eq!(read(q), vec![0.0, 0.0]);
    assert_eq!(amax(q), 0.0);

    assert_eq!(unsafe { qcast_tensor_write(noop, [0.0f32].as_ptr(), 1) }, QcastStatus::Ok);
    assert_eq!(qcast_quantize_noop(x, q, noop, qcast_stream_default()), QcastStatus::Ok);
    sync();
    assert_eq!(read(q), vec![5.0, -6.0]);

    for h in [x, q, noop] {
        qcast_tensor_destroy(h);
    }
}

#[test]
fn test_quantize_v2_with_config_noop() {
    let x = input(&[1.5, 2.5], &[2], DType::F32);
    let q = create(&[2], DType::Float8E5M2, ScalingMode::Tensor);
    let noop = input(&[1.0], &[1], DType::F32);
    let mut cfg = 0;
    assert_eq!(unsafe { qcast_quantization_config_create(&mut cfg) }, QcastStatus::Ok);
    assert_eq!(qcast_quantization_config_set_noop(cfg, noop), QcastStatus::Ok);
    assert_eq!(qcast_quantize_v2(x, q, cfg, qcast_stream_default()), QcastStatus::Ok);
    sync();
    assert_eq!(read(q), vec![0.0, 0.0]);

    // config 0 means defaults
    assert_eq!(qcast_quantize_v2(x, q, 0, qcast_stream_default()), QcastStatus::Ok);
    sync();
    assert_eq!(read(q), vec![1.5, 2.5]);

    qcast_quantization_config_destroy(cfg);
    for h in [x, q, noop] {
        qcast_tensor_destroy(h);
    }
}

#[test]
fn test_dbias_dgelu_through_c_abi() {
    let (rows, cols) = (300, 8);
    let grad = ramp(rows * cols);
    let act: Vec<f32> = grad.iter().map(|v| v * -0.3).collect();
    let g = input(&grad, &[rows, cols], DType::F32);
    let a = input(&act, &[rows, cols], DType::F32);
    let q = create(&[rows, cols], DType::Float8E4M3, ScalingMode::Tensor);
    let dbias = create(&[cols], DType::F32, ScalingMode::Tensor);

    let (mut wr, mut wc) = (0, 0);
    assert_eq!(unsafe { qcast_dbias_workspace_shape(g, &mut wr, &mut wc) }, QcastStatus::Ok);
    assert_eq!((wr, wc), (rows.div_ceil(128), cols));

    // too small a workspace is rejected before anything runs
    let small = create(&[1, cols], DType::F32, ScalingMode::Tensor);
    assert_eq!(
        qcast_quantize_dbias_dgelu(g, a, q, dbias, small, qcast_stream_default()),
        QcastStatus::InvalidArgument
    );

    let workspace = create(&[wr, wc], DType::F32, ScalingMode::Tensor);
    assert_eq!(
        qcast_quantize_dbias_dgelu(g, a, q, dbias, workspace, qcast_stream_default()),
        QcastStatus::Ok
    );
    sync();

    let mut expected = vec![0.0f64; cols];
    for (i, (g, a)) in grad.iter().zip(&act).enumerate() {
        expected[i % cols] += (g * ActivationKind::Gelu.derivative(*a)) as f64;
    }
    for (got, want) in read(dbias).iter().zip(&expected) {
        assert!((*got as f64 - want).abs() < 1e-3 * (1.0 + want.abs()), "{got} vs {want}");
    }

    for h in [g, a, q, dbias, small, workspace] {
        qcast_tensor_destroy(h);
    }
}

#[test]
fn test_dequantize() {
    let x = input(&[0.5, -1.0, 2.0, 8.0], &[4], DType::F32);
    let q = create(&[4], DType::Float8E4M3, ScalingMode::Tensor);
    assert_eq!(qcast_tensor_set_scale(q, 4.0), QcastStatus::Ok);
    assert_eq!(qcast_quantize(x, q, qcast_stream_default()), QcastStatus::Ok);
    let y = create(&[4], DType::F32, ScalingMode::Tensor);
    assert_eq!(qcast_dequantize(q, y, qcast_stream_default()), QcastStatus::Ok);
    sync();
    assert_eq!(read(q), vec![2.0, -4.0, 8.0, 32.0]);
    assert_eq!(read(y), vec![0.5, -1.0, 2.0, 8.0]);

    // dequantize wants an FP8 input
    assert_eq!(qcast_dequantize(x, y, qcast_stream_default()), QcastStatus::InvalidArgument);

    for h in [x, q, y] {
        qcast_tensor_destroy(h);
    }
}

#[test]
fn test_columnwise_copy_through_c_abi() {
    let data = ramp(64 * 32);
    let x = input(&data, &[64, 32], DType::F32);
    let q = create(&[64, 32], DType::Float8E4M3, ScalingMode::Mxfp8);
    let y = create(&[64, 32], DType::F32, ScalingMode::Tensor);
    assert_eq!(qcast_dequantize_columnwise(q, y, qcast_stream_default()), QcastStatus::InvalidArgument);
    assert!(last_error().contains("columnwise"));

    assert_eq!(qcast_tensor_enable_columnwise(q), QcastStatus::Ok);
    assert_eq!(qcast_quantize(x, q, qcast_stream_default()), QcastStatus::Ok);
    assert_eq!(qcast_dequantize_columnwise(q, y, qcast_stream_default()), QcastStatus::Ok);
    sync();

    let mut factors = vec![0.0f32; 2 * 32];
    let st = unsafe { qcast_tensor_columnwise_scale_inv(q, factors.as_mut_ptr(), factors.len()) };
    assert_eq!(st, QcastStatus::Ok);
    assert!(factors.iter().all(|f| f.log2().fract() == 0.0));
    for (got, want) in read(y).iter().zip(&data) {
        assert!((got - want).abs() <= want.abs() / 8.0 + 1e-6, "{got} vs {want}");
    }

    // high-precision tensors cannot carry an fp8 copy
    assert_eq!(qcast_tensor_enable_columnwise(x), QcastStatus::InvalidArgument);
    for h in [x, q, y] {
        qcast_tensor_destroy(h);
    }
}

#[test]
fn test_multi_tensor_quantize_on_created_stream() {
    let mut s = 0;
    assert_eq!(unsafe { qcast_stream_create(0, &mut s) }, QcastStatus::Ok);

    let n = 7;
    let inputs: Vec<QcastTensor> = (0..n)
        .map(|i| input(&ramp(32 * (i + 1)), &[i + 1, 32], DType::BF16))
        .collect();
    let outputs: Vec<QcastTensor> = (0..n)
        .map(|i| create(&[i + 1, 32], DType::Float8E4M3, ScalingMode::Mxfp8))
        .collect();
    let st = unsafe { qcast_multi_tensor_quantize(inputs.as_ptr(), outputs.as_ptr(), 0, n, s) };
    assert_eq!(st, QcastStatus::Ok);
    assert_eq!(qcast_stream_synchronize(s), QcastStatus::Ok);

    for (i, (&x, &q)) in inputs.iter().zip(&outputs).enumerate() {
        let single = create(&[i + 1, 32], DType::Float8E4M3, ScalingMode::Mxfp8);
        assert_eq!(qcast_quantize(x, single, s), QcastStatus::Ok);
        assert_eq!(qcast_stream_synchronize(s), QcastStatus::Ok);
        assert_eq!(read(q), read(single), "tensor {i}");
        qcast_tensor_destroy(single);
    }

    // n == 0 accepts null arrays
    let st = unsafe { qcast_multi_tensor_quantize(std::ptr::null(), std::ptr::null(), 0, 0, s) };
    assert_eq!(st, QcastStatus::Ok);

    // one bad pair rejects the whole batch
    let bad = create(&[3, 3], DType::Float8E4M3, ScalingMode::Tensor);
    let mut bad_outputs = outputs.clone();
    bad_outputs[n - 1] = bad;
    let st = unsafe { qcast_multi_tensor_quantize(inputs.as_ptr(), bad_outputs.as_ptr(), 0, n, s) };
    assert_eq!(st, QcastStatus::InvalidArgument);
    assert!(last_error().contains("multi_tensor_quantize"));

    for h in inputs.into_iter().chain(outputs).chain([bad]) {
        qcast_tensor_destroy(h);
    }
    assert_eq!(qcast_stream_destroy(s), QcastStatus::Ok);
}

#[test]
fn test_capability_queries() {
    let mut n = 0;
    assert_eq!(unsafe { qcast_num_devices(&mut n) }, QcastStatus::Ok);
    assert_eq!(n, 1);
    let mut dev = 9;
    assert_eq!(unsafe { qcast_current_device(&mut dev) }, QcastStatus::Ok);
    assert_eq!(dev, 0);
    let mut arch = 0;
    assert_eq!(unsafe { qcast_sm_arch(&mut arch) }, QcastStatus::Ok);
    assert!(arch > 0);
    let mut sms = 0;
    assert_eq!(unsafe { qcast_sm_count(&mut sms) }, QcastStatus::Ok);
    assert!(sms >= 1);
    let (mut least, mut greatest) = (1, 1);
    assert_eq!(unsafe { qcast_stream_priority_range(&mut least, &mut greatest) }, QcastStatus::Ok);
    assert!(greatest <= least);
    let mut multicast = true;
    assert_eq!(unsafe { qcast_supports_multicast(&mut multicast) }, QcastStatus::Ok);
    assert!(!multicast);
    let mut pool = 0;
    assert_eq!(unsafe { qcast_num_compute_streams(&mut pool) }, QcastStatus::Ok);
    assert!(pool >= 1);

    assert_eq!(unsafe { qcast_sm_count(std::ptr::null_mut()) }, QcastStatus::InvalidArgument);
}
