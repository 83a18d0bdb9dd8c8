use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use qcast_core::{DType, QcastError, QuantizationConfig, Result, ScalingMode, Tensor};
use qcast_kernels::KernelVariant;
use qcast_runtime::{DeviceRuntime, Engine, HostEngine, RuntimeConfig};

const BANNER: &str = r#"
   ____   ____    _    ____ _____
  / __ \ / ___|  / \  / ___|_   _|
 | |  | | |     / _ \ \___ \ | |
 | |__| | |___ / ___ \ ___) || |
  \___\_\\____/_/   \_\____/ |_|"#;

#[derive(Parser)]
#[command(
    name = "qcast",
    about = "qcast FP8 quantization engine CLI",
    long_about = "Fused FP8 quantize / dequantize kernels with a multi-stream dispatch engine.\n\nRuns on the host runtime; build with --features cuda for NVIDIA GPUs.",
    version
)]
struct Cli {
    /// JSON runtime config (QCAST_* environment variables still apply)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the compute stream pool size
    #[arg(long, global = true)]
    streams: Option<usize>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show device capabilities, runtime config and kernel variants
    Info {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Quantize random data, dequantize it, and check the error bound
    Roundtrip {
        #[arg(long, value_enum, default_value = "e4m3")]
        dtype: Fp8Format,
        #[arg(long, value_enum, default_value = "tensor")]
        mode: Mode,
        #[arg(long, default_value = "256")]
        rows: usize,
        #[arg(long, default_value = "512")]
        cols: usize,
        #[arg(long, default_value = "0")]
        seed: u64,
    },
    /// Multi-tensor quantize on one stream vs the compute stream pool
    Bench {
        /// Number of tensors per batch
        #[arg(long, default_value = "16")]
        tensors: usize,
        /// Tensor shapes to benchmark, `rows`x`cols` (comma-separated)
        #[arg(long, default_value = "128x128,256x256,1024x512")]
        shapes: String,
        #[arg(long, default_value = "10")]
        iters: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Fp8Format {
    E4m3,
    E5m2,
}

impl From<Fp8Format> for DType {
    fn from(f: Fp8Format) -> Self {
        match f {
            Fp8Format::E4m3 => DType::Float8E4M3,
            Fp8Format::E5m2 => DType::Float8E5M2,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Tensor,
    Mxfp8,
    Block1d,
    Block2d,
}

impl From<Mode> for ScalingMode {
    fn from(m: Mode) -> Self {
        match m {
            Mode::Tensor => ScalingMode::Tensor,
            Mode::Mxfp8 => ScalingMode::Mxfp8,
            Mode::Block1d => ScalingMode::Block1D,
            Mode::Block2d => ScalingMode::Block2D,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = load_config(&cli).and_then(|config| {
        let engine = Engine::host(config)?;
        match cli.command {
            Commands::Info { json } => cmd_info(&engine, json),
            Commands::Roundtrip { dtype, mode, rows, cols, seed } => {
                cmd_roundtrip(&engine, dtype.into(), mode.into(), rows, cols, seed)
            }
            Commands::Bench { tensors, shapes, iters } => cmd_bench(&engine, tensors, &shapes, iters),
        }
    });

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<RuntimeConfig> {
    let mut config = match &cli.config {
        Some(path) => RuntimeConfig::from_json_file(path)?.with_env_overrides()?,
        None => RuntimeConfig::from_env()?,
    };
    if let Some(n) = cli.streams {
        config.num_compute_streams = n;
    }
    config.validate()?;
    debug!(?config, "runtime config");
    Ok(config)
}

fn cmd_info(engine: &HostEngine, json: bool) -> Result<bool> {
    let info = engine.device_info();
    if json {
        let doc = serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "device": info,
            "config": engine.config(),
            "tuning": engine.tuning(),
        });
        let text = serde_json::to_string_pretty(&doc)
            .map_err(|e| QcastError::invalid("info", e.to_string()))?;
        println!("{text}");
        return Ok(true);
    }

    println!("{}", BANNER);
    println!("  v{}  FP8 quantization engine\n", env!("CARGO_PKG_VERSION"));

    println!("Device ({})", info.runtime);
    println!("  Devices:          {}", info.num_devices);
    println!("  Current:          {}", info.current_device);
    println!("  Compute cap:      sm_{}", info.sm_arch);
    println!("  SMs:              {}", info.sm_count);
    println!(
        "  Stream priority:  {} (least) .. {} (greatest)",
        info.stream_priority_range.0, info.stream_priority_range.1
    );
    println!("  Multicast:        {}", if info.supports_multicast { "[x]" } else { "[ ]" });

    println!("\nRuntime");
    println!("  Compute streams:  {}", engine.num_compute_streams());
    println!("  High priority:    {}", engine.config().use_high_priority_streams);
    println!("  Threads/block:    {}", engine.tuning().threads_per_block);

    println!("\nFormats");
    for dtype in [DType::Float8E4M3, DType::Float8E5M2] {
        println!(
            "  {:<8} max {:>8}  eps {}",
            dtype.to_string(),
            dtype.max_finite().unwrap_or(0.0),
            dtype.epsilon().unwrap_or(0.0)
        );
    }
    println!("  scaling: tensor, mxfp8, block1d, block2d");

    let variants = KernelVariant::all();
    println!("\nKernel variants ({})", variants.len());
    for v in variants {
        println!("  {v}");
    }
    Ok(true)
}

fn cmd_roundtrip(
    engine: &HostEngine,
    dtype: DType,
    mode: ScalingMode,
    rows: usize,
    cols: usize,
    seed: u64,
) -> Result<bool> {
    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<f32> = (0..rows * cols)
        .map(|_| rng.gen_range(-1.0f32..1.0) * 10f32.powi(rng.gen_range(-2..3)))
        .collect();
    let amax = data.iter().fold(0.0f32, |m, v| m.max(v.abs()));
    let fp8_max = dtype.max_finite().unwrap_or(1.0);
    let eps = dtype.epsilon().unwrap_or(1.0);

    let x = Tensor::from_f32(&data, &[rows, cols])?;
    let mut q = Tensor::quantized(&[rows, cols], dtype, mode)?;
    if mode == ScalingMode::Tensor && amax > 0.0 {
        q = q.with_scale(fp8_max / amax)?;
    }
    let y = Tensor::zeros(&[rows, cols], DType::F32);

    let rt = engine.runtime();
    let stream = rt.default_stream();
    let start = Instant::now();
    engine.quantize_with_config(&x, &q, &QuantizationConfig::default(), &stream)?;
    engine.dequantize(&q, &y, &stream)?;
    rt.synchronize(&stream).map_err(|e| e.into_qcast("roundtrip"))?;
    let elapsed = start.elapsed();

    // values far below amax fall into the subnormal range of their block
    let floor = amax / 64.0;
    let back = y.to_f32_vec()?;
    let mut worst = 0.0f32;
    let mut checked = 0usize;
    for (a, b) in data.iter().zip(&back) {
        if a.abs() >= floor {
            worst = worst.max((a - b).abs() / a.abs());
            checked += 1;
        }
    }
    let bound = eps / 2.0;
    let pass = worst <= bound;

    println!("=== qcast Round Trip ===");
    println!("  {rows}x{cols} f32 -> {dtype} ({mode}) -> f32");
    println!("  amax:              {amax}");
    println!("  checked values:    {checked} / {}", data.len());
    println!("  max rel error:     {worst:.6}");
    println!("  bound (eps/2):     {bound:.6}");
    println!("  time:              {:.3}ms", elapsed.as_secs_f64() * 1000.0);
    println!("  result:            {}", if pass { "PASS" } else { "FAIL" });
    Ok(pass)
}

fn parse_shapes(s: &str) -> Result<Vec<(usize, usize)>> {
    s.split(',')
        .map(|part| {
            let part = part.trim();
            part.split_once('x')
                .and_then(|(r, c)| Some((r.trim().parse().ok()?, c.trim().parse().ok()?)))
                .ok_or_else(|| QcastError::invalid("bench", format!("bad shape {part:?}, expected RxC")))
        })
        .collect()
}

fn cmd_bench(engine: &HostEngine, tensors: usize, shapes: &str, iters: usize) -> Result<bool> {
    let shapes = parse_shapes(shapes)?;
    let iters = iters.max(1);
    let rt = engine.runtime();
    let stream = rt.default_stream();
    let cfg = QuantizationConfig::default();

    println!("=== qcast Multi-Tensor Quantize Benchmark ===");
    println!("tensors per batch: {tensors}, compute streams: {}\n", engine.num_compute_streams());
    println!(
        "{:<14} {:>14} {:>14} {:>10}",
        "Shape", "Single (ms)", "Pooled (ms)", "Speedup"
    );
    println!("{}", "-".repeat(56));

    for (rows, cols) in shapes {
        let inputs = (0..tensors)
            .map(|t| {
                let data: Vec<f32> = (0..rows * cols)
                    .map(|i| ((i * 7 + t * 13 + 3) % 29) as f32 * 0.25 - 3.5)
                    .collect();
                Tensor::from_f32(&data, &[rows, cols])
            })
            .collect::<Result<Vec<_>>>()?;
        let outputs = (0..tensors)
            .map(|_| Tensor::quantized(&[rows, cols], DType::Float8E4M3, ScalingMode::Tensor))
            .collect::<Result<Vec<_>>>()?;

        let start = Instant::now();
        for _ in 0..iters {
            for (x, q) in inputs.iter().zip(&outputs) {
                engine.quantize(x, q, &stream)?;
            }
            rt.synchronize(&stream).map_err(|e| e.into_qcast("bench"))?;
        }
        let single = start.elapsed().as_secs_f64() / iters as f64;

        let start = Instant::now();
        for _ in 0..iters {
            engine.multi_tensor_quantize(&inputs, &outputs, &cfg, &stream)?;
            rt.synchronize(&stream).map_err(|e| e.into_qcast("bench"))?;
        }
        let pooled = start.elapsed().as_secs_f64() / iters as f64;

        println!(
            "{:<14} {:>12.3}ms {:>12.3}ms {:>9.2}x",
            format!("{}x{}", rows, cols),
            single * 1000.0,
            pooled * 1000.0,
            single / pooled,
        );
    }
    engine.shutdown()?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shapes() {
        assert_eq!(parse_shapes("2x3, 16x32").unwrap(), vec![(2, 3), (16, 32)]);
        assert!(parse_shapes("2x").is_err());
        assert!(parse_shapes("abc").is_err());
    }

    #[test]
    fn test_roundtrip_passes() {
        let engine = Engine::host(RuntimeConfig::default()).unwrap();
        for dtype in [DType::Float8E4M3, DType::Float8E5M2] {
            for mode in [ScalingMode::Tensor, ScalingMode::Mxfp8] {
                assert!(cmd_roundtrip(&engine, dtype, mode, 8, 64, 7).unwrap());
            }
        }
    }
}
