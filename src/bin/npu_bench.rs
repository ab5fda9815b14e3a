//! NPU benchmark
//!
//! Locates the Teflon delegate, loads the classifier and times a short run
//! of inferences on random input.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use npu_infer::engine::{LibraryResolver, ModelRuntime, Tensor, TfLiteBackend};
use npu_infer::Error;

const DEFAULT_MODEL: &str = "mobilenet_v1_1.0_224_quant.tflite";
const DEFAULT_ITERATIONS: usize = 10;

/// Average latency that passes
const TARGET_MS: f64 = 50.0;
/// Average latency within the expected range for the RK3588
const EXCELLENT_MS: f64 = 21.0;

#[derive(Debug, Clone, Copy, PartialEq)]
struct BenchStats {
    avg_ms: f64,
    min_ms: f64,
    max_ms: f64,
}

impl BenchStats {
    fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let sum: f64 = samples.iter().sum();
        Some(Self {
            avg_ms: sum / samples.len() as f64,
            min_ms: samples.iter().copied().fold(f64::INFINITY, f64::min),
            max_ms: samples.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }

    fn meets_target(&self) -> bool {
        self.avg_ms < TARGET_MS
    }

    fn is_excellent(&self) -> bool {
        self.avg_ms <= EXCELLENT_MS
    }
}

/// Input generator, reproducible when `NPU_BENCH_SEED` is set
fn input_rng() -> StdRng {
    match std::env::var("NPU_BENCH_SEED").ok().and_then(|v| v.parse().ok()) {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

fn iterations() -> usize {
    std::env::var("NPU_BENCH_ITERATIONS")
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_ITERATIONS)
}

fn resolve_delegate() -> Result<PathBuf> {
    if let Ok(pinned) = std::env::var("TEFLON_LIBRARY") {
        return Ok(PathBuf::from(pinned));
    }

    match LibraryResolver::diagnostics_default().resolve() {
        Ok(path) => Ok(path),
        Err(Error::LibraryNotFound { tried }) => {
            error!("Could not find libteflon.so");
            error!("Mesa with Teflon support may not be installed");
            error!("Tried:");
            for location in &tried {
                error!("  {}", location);
            }
            bail!("delegate library not found")
        }
        Err(e) => Err(e.into()),
    }
}

fn main() -> Result<()> {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let delegate = resolve_delegate()?;
    info!("Using Teflon delegate: {}", delegate.display());

    let model_path = std::env::var("MODEL_PATH").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
    let runtime_library =
        std::env::var("TFLITE_LIBRARY").unwrap_or_else(|_| "libtensorflowlite_c.so".to_string());

    let mut runtime = ModelRuntime::new(TfLiteBackend::new(runtime_library));
    runtime.load(Path::new(&model_path), Some(&delegate))?;
    info!("Teflon delegate loaded, model tensors allocated");

    let (input_spec, output_spec) = match (runtime.input_spec(), runtime.output_spec()) {
        (Some(input), Some(output)) => (input.clone(), output.clone()),
        _ => return Err(Error::NotLoaded.into()),
    };
    info!("Input shape: {:?}", input_spec.shape);
    info!("Input dtype: {}", input_spec.element_type);
    info!("Output shape: {:?}", output_spec.shape);

    let mut input = Tensor::zeros(&input_spec);
    input_rng().fill(input.as_bytes_mut());

    info!("Warming up...");
    runtime.invoke(&input)?;
    info!("Warm-up complete");

    let count = iterations();
    info!("Running {} inference iterations...", count);
    let mut samples = Vec::with_capacity(count);
    let mut output = None;
    for i in 0..count {
        let start = Instant::now();
        output = Some(runtime.invoke(&input)?);
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        info!("  Iteration {}: {:.2}ms", i + 1, elapsed_ms);
        samples.push(elapsed_ms);
    }

    let Some(stats) = BenchStats::from_samples(&samples) else {
        bail!("no iterations ran");
    };
    info!("Average inference time: {:.2}ms", stats.avg_ms);
    info!("Min inference time: {:.2}ms", stats.min_ms);
    info!("Max inference time: {:.2}ms", stats.max_ms);
    if let Some(output) = &output {
        info!("Output shape: {:?}", output.shape());
    }

    if stats.meets_target() {
        info!("SUCCESS: Performance meets target (<{}ms)", TARGET_MS);
        if stats.is_excellent() {
            info!("EXCELLENT: Performance within expected range (<={}ms)", EXCELLENT_MS);
        }
    } else {
        warn!(
            "Performance slower than target (avg: {:.2}ms, target: <{}ms)",
            stats.avg_ms, TARGET_MS
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_from_samples() {
        let stats = BenchStats::from_samples(&[18.0, 22.0, 20.0]).unwrap();
        assert!((stats.avg_ms - 20.0).abs() < 1e-9);
        assert_eq!(stats.min_ms, 18.0);
        assert_eq!(stats.max_ms, 22.0);
        assert!(stats.meets_target());
        assert!(stats.is_excellent());
    }

    #[test]
    fn test_thresholds() {
        let ok = BenchStats::from_samples(&[30.0, 40.0]).unwrap();
        assert!(ok.meets_target());
        assert!(!ok.is_excellent());

        let slow = BenchStats::from_samples(&[50.0]).unwrap();
        assert!(!slow.meets_target());

        let edge = BenchStats::from_samples(&[21.0]).unwrap();
        assert!(edge.is_excellent());
    }

    #[test]
    fn test_empty_samples() {
        assert!(BenchStats::from_samples(&[]).is_none());
    }

    #[test]
    fn test_seeded_input_is_reproducible() {
        let fill = |seed: u64| {
            let mut buf = [0u8; 256];
            StdRng::seed_from_u64(seed).fill(&mut buf[..]);
            buf
        };
        assert_eq!(fill(7), fill(7));
        assert_ne!(fill(7), fill(8));

        let distinct: std::collections::BTreeSet<u8> = fill(7).iter().copied().collect();
        assert!(distinct.len() > 64);
    }
}
