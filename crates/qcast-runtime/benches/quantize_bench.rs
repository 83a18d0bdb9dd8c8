//! Benchmark: multi-tensor quantize on one stream vs fanned out over the
//! compute stream pool (host runtime).

use std::time::Instant;

use qcast_core::{DType, QuantizationConfig, ScalingMode, Tensor};
use qcast_runtime::{DeviceRuntime, Engine, HostEngine, RuntimeConfig};

fn make_batch(n: usize, rows: usize, cols: usize) -> (Vec<Tensor>, Vec<Tensor>) {
    let inputs: Vec<Tensor> = (0..n)
        .map(|t| {
            let data: Vec<f32> = (0..rows * cols)
                .map(|i| ((i * 7 + t * 13 + 3) % 29) as f32 * 0.25 - 3.5)
                .collect();
            Tensor::from_f32(&data, &[rows, cols]).unwrap()
        })
        .collect();
    let outputs = (0..n)
        .map(|_| Tensor::quantized(&[rows, cols], DType::Float8E4M3, ScalingMode::Tensor).unwrap())
        .collect();
    (inputs, outputs)
}

fn bench_single_stream(eng: &HostEngine, inputs: &[Tensor], outputs: &[Tensor], iters: usize) -> f64 {
    let stream = eng.runtime().default_stream();
    let start = Instant::now();
    for _ in 0..iters {
        for (x, q) in inputs.iter().zip(outputs) {
            eng.quantize(x, q, &stream).unwrap();
        }
        eng.runtime().synchronize(&stream).unwrap();
    }
    start.elapsed().as_secs_f64() / iters as f64
}

fn bench_pooled(eng: &HostEngine, inputs: &[Tensor], outputs: &[Tensor], iters: usize) -> f64 {
    let stream = eng.runtime().default_stream();
    let cfg = QuantizationConfig::default();
    let start = Instant::now();
    for _ in 0..iters {
        eng.multi_tensor_quantize(inputs, outputs, &cfg, &stream).unwrap();
        eng.runtime().synchronize(&stream).unwrap();
    }
    start.elapsed().as_secs_f64() / iters as f64
}

fn main() {
    let eng = Engine::host(RuntimeConfig::default()).unwrap();
    println!("=== qcast Multi-Tensor Quantize Benchmark ===");
    println!("compute streams: {}\n", eng.num_compute_streams());

    let cases: &[(usize, usize, usize)] = &[(4, 256, 256), (16, 256, 256), (16, 1024, 512), (64, 128, 128)];

    println!(
        "{:<16} {:>14} {:>14} {:>10}",
        "Batch", "Single (ms)", "Pooled (ms)", "Speedup"
    );
    println!("{}", "-".repeat(58));

    for &(n, rows, cols) in cases {
        let (inputs, outputs) = make_batch(n, rows, cols);
        let iters = if rows * cols * n <= 1 << 20 { 20 } else { 5 };

        let single = bench_single_stream(&eng, &inputs, &outputs, iters);
        let pooled = bench_pooled(&eng, &inputs, &outputs, iters);

        println!(
            "{:<16} {:>12.3}ms {:>12.3}ms {:>9.2}x",
            format!("{}x{}x{}", n, rows, cols),
            single * 1000.0,
            pooled * 1000.0,
            single / pooled,
        );
    }
}
