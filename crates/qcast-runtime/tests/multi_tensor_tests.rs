//! Multi-tensor fan-out, stream ordering and failure propagation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use qcast_core::{DType, QuantizationConfig, ScalingMode, Tensor};
use qcast_kernels::KernelVariant;
use qcast_runtime::{
    CastLaunch, DeviceRuntime, Engine, HostEngine, KernelLaunch, RuntimeConfig, RuntimeError,
};

fn engine(pool_size: usize) -> HostEngine {
    let config = RuntimeConfig {
        num_compute_streams: pool_size,
        ..RuntimeConfig::default()
    };
    Engine::host(config).unwrap()
}

fn random_tensors(seed: u64, n: usize) -> Vec<Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            let rows = 1 + i % 5;
            let cols = 32 * (1 + i % 3);
            let data: Vec<f32> = (0..rows * cols).map(|_| rng.gen_range(-20.0f32..20.0)).collect();
            Tensor::from_f32(&data, &[rows, cols]).unwrap()
        })
        .collect()
}

fn outputs_for(inputs: &[Tensor], mode: ScalingMode) -> Vec<Tensor> {
    inputs
        .iter()
        .map(|x| {
            Tensor::quantized(x.shape().dims(), DType::Float8E4M3, mode)
                .unwrap()
                .with_scale(2.0)
                .unwrap()
        })
        .collect()
}

fn snapshot(t: &Tensor) -> (Vec<u8>, Vec<f32>) {
    (t.to_bytes().unwrap(), t.scale_inv_values().unwrap())
}

#[test]
fn test_multi_tensor_matches_single_tensor_quantize() {
    let eng = engine(4);
    let stream = eng.runtime().default_stream();
    let cfg = QuantizationConfig::default();

    for mode in [ScalingMode::Tensor, ScalingMode::Mxfp8] {
        for n in 0..=12 {
            let inputs = random_tensors(n as u64, n);
            let batched = outputs_for(&inputs, mode);
            let single = outputs_for(&inputs, mode);

            eng.multi_tensor_quantize(&inputs, &batched, &cfg, &stream).unwrap();
            for (x, q) in inputs.iter().zip(&single) {
                eng.quantize(x, q, &stream).unwrap();
            }
            eng.runtime().synchronize(&stream).unwrap();

            for (i, (b, s)) in batched.iter().zip(&single).enumerate() {
                assert_eq!(snapshot(b), snapshot(s), "{mode} n={n} tensor {i}");
                if mode == ScalingMode::Tensor {
                    assert_eq!(b.amax_value().unwrap(), s.amax_value().unwrap());
                }
            }
        }
    }
}

#[test]
fn test_pool_is_created_lazily() {
    let eng = engine(3);
    let stream = eng.runtime().default_stream();
    eng.multi_tensor_quantize(&[], &[], &QuantizationConfig::default(), &stream)
        .unwrap();
    let pool = eng.compute_stream_pool().unwrap();
    assert_eq!(pool.size(), 3);
    assert!(Arc::ptr_eq(&pool, &eng.compute_stream_pool().unwrap()));
}

#[test]
fn test_caller_observes_all_outputs_after_fan_out() {
    let eng = engine(4);
    let rt = Arc::clone(eng.runtime());
    let caller = rt.create_stream(None).unwrap();

    // stall the caller so the fan-out has to wait for it
    let gate = Arc::new(AtomicUsize::new(0));
    let g = Arc::clone(&gate);
    rt.launch_host_fn(&caller, move || {
        thread::sleep(Duration::from_millis(20));
        g.store(1, Ordering::SeqCst);
    })
    .unwrap();

    let inputs = random_tensors(99, 10);
    let outputs = outputs_for(&inputs, ScalingMode::Tensor);
    eng.multi_tensor_quantize(&inputs, &outputs, &QuantizationConfig::default(), &caller)
        .unwrap();

    let observed = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let (obs, outs) = (Arc::clone(&observed), outputs.clone());
    rt.launch_host_fn(&caller, move || {
        let amaxes: Vec<f32> = outs.iter().map(|q| q.amax_value().unwrap()).collect();
        *obs.lock() = amaxes;
    })
    .unwrap();
    rt.synchronize(&caller).unwrap();

    assert_eq!(gate.load(Ordering::SeqCst), 1);
    let observed = observed.lock();
    assert_eq!(observed.len(), 10);
    for (x, amax) in inputs.iter().zip(observed.iter()) {
        let expected = x.to_f32_vec().unwrap().iter().fold(0.0f32, |m, v| m.max(v.abs()));
        assert_eq!(*amax, expected);
    }
}

#[test]
fn test_concurrent_callers_each_join_their_own_work() {
    let eng = engine(1);
    let rt = Arc::clone(eng.runtime());
    let caller_a = rt.create_stream(None).unwrap();
    let caller_b = rt.create_stream(None).unwrap();
    let cfg = QuantizationConfig::default();

    rt.launch_host_fn(&caller_a, || thread::sleep(Duration::from_millis(200)))
        .unwrap();
    let inputs_a = random_tensors(11, 4);
    let outputs_a = outputs_for(&inputs_a, ScalingMode::Tensor);
    eng.multi_tensor_quantize(&inputs_a, &outputs_a, &cfg, &caller_a).unwrap();
    let observed = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let (obs, outs) = (Arc::clone(&observed), outputs_a.clone());
    rt.launch_host_fn(&caller_a, move || {
        *obs.lock() = outs.iter().map(|q| q.amax_value().unwrap()).collect::<Vec<f32>>();
    })
    .unwrap();

    // B reuses the single pool entry while A is still stalled
    let inputs_b = random_tensors(12, 3);
    let outputs_b = outputs_for(&inputs_b, ScalingMode::Mxfp8);
    eng.multi_tensor_quantize(&inputs_b, &outputs_b, &cfg, &caller_b).unwrap();

    rt.synchronize(&caller_a).unwrap();
    let observed = observed.lock().clone();
    assert_eq!(observed.len(), 4);
    for (x, amax) in inputs_a.iter().zip(&observed) {
        let expected = x.to_f32_vec().unwrap().iter().fold(0.0f32, |m, v| m.max(v.abs()));
        assert_eq!(*amax, expected);
    }

    rt.synchronize(&caller_b).unwrap();
    let single = outputs_for(&inputs_b, ScalingMode::Mxfp8);
    for (x, q) in inputs_b.iter().zip(&single) {
        eng.quantize(x, q, &caller_b).unwrap();
    }
    rt.synchronize(&caller_b).unwrap();
    for (b, s) in outputs_b.iter().zip(&single) {
        assert_eq!(snapshot(b), snapshot(s));
    }
}

#[test]
fn test_multi_tensor_validates_every_pair_first() {
    let eng = engine(2);
    let stream = eng.runtime().create_stream(None).unwrap();
    let inputs = random_tensors(1, 3);
    let mut outputs = outputs_for(&inputs, ScalingMode::Tensor);
    let err = eng
        .multi_tensor_quantize(&inputs, &outputs[..2], &QuantizationConfig::default(), &stream)
        .unwrap_err();
    assert!(err.is_invalid_argument());

    outputs[2] = Tensor::quantized(&[7, 7], DType::Float8E4M3, ScalingMode::Tensor).unwrap();
    let err = eng
        .multi_tensor_quantize(&inputs, &outputs, &QuantizationConfig::default(), &stream)
        .unwrap_err();
    assert!(err.is_invalid_argument());
    assert!(err.to_string().contains("multi_tensor_quantize"));

    eng.runtime().synchronize(&stream).unwrap();
    assert!(outputs[0].to_bytes().unwrap().iter().all(|&b| b == 0));
}

#[test]
fn test_multi_tensor_after_shutdown_recreates_pool() {
    let eng = engine(2);
    let stream = eng.runtime().default_stream();
    let first = eng.compute_stream_pool().unwrap();
    eng.shutdown().unwrap();
    eng.shutdown().unwrap();
    assert!(first.is_shut_down());

    let inputs = random_tensors(4, 3);
    let outputs = outputs_for(&inputs, ScalingMode::Tensor);
    eng.multi_tensor_quantize(&inputs, &outputs, &QuantizationConfig::default(), &stream)
        .unwrap();
    eng.runtime().synchronize(&stream).unwrap();
    assert!(!eng.compute_stream_pool().unwrap().is_shut_down());
}

#[test]
fn test_dropping_engine_shuts_pool_down() {
    let eng = engine(2);
    let stream = eng.runtime().default_stream();
    let inputs = random_tensors(5, 3);
    let outputs = outputs_for(&inputs, ScalingMode::Tensor);
    eng.multi_tensor_quantize(&inputs, &outputs, &QuantizationConfig::default(), &stream)
        .unwrap();
    let pool = eng.compute_stream_pool().unwrap();
    drop(eng);
    // drop drains the pool streams before tearing them down
    assert!(pool.is_shut_down());
    for (x, q) in inputs.iter().zip(&outputs) {
        let amax = x.to_f32_vec().unwrap().iter().fold(0.0f32, |m, v| m.max(v.abs()));
        assert_eq!(q.amax_value().unwrap(), amax);
    }
}

#[test]
fn test_poisoned_stream_reports_failing_kernel() {
    let eng = engine(2);
    let rt = eng.runtime();
    let stream = rt.create_stream(None).unwrap();

    // bypasses validation: the output buffer is too small for the input
    let x = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[4]).unwrap();
    let small = Tensor::quantized(&[2], DType::Float8E4M3, ScalingMode::Tensor).unwrap();
    rt.launch(
        &stream,
        KernelLaunch::Cast(CastLaunch {
            variant: KernelVariant::Cast,
            input: x.clone(),
            act_input: None,
            output: small,
            dbias: None,
            noop: None,
            force_pow_2_scales: false,
            amax_epsilon: 0.0,
        }),
    )
    .unwrap();

    match rt.synchronize(&stream) {
        Err(RuntimeError::Poisoned { op, .. }) => assert_eq!(op, "cast"),
        other => panic!("expected a poisoned stream, got {other:?}"),
    }

    let q = Tensor::quantized(&[4], DType::Float8E4M3, ScalingMode::Tensor).unwrap();
    let err = eng.quantize(&x, &q, &stream).unwrap_err();
    assert!(err.is_runtime());
    let msg = err.to_string();
    assert!(msg.contains("quantize"), "{msg}");
    assert!(msg.contains("cast"), "{msg}");
}
