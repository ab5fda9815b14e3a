//! Inference Engine
//!
//! Serializes every forward pass through one mutex and keeps the metrics
//! in step with successful invocations.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::metrics::MetricsRegistry;
use super::runtime::{InterpreterBackend, ModelRuntime};
use super::tensor::{Tensor, TensorSpec};

/// Output of one forward pass
#[derive(Debug, Clone)]
pub struct InferenceResult {
    pub output: Tensor,
    pub elapsed_ms: f64,
}

/// Specs published after a successful load
#[derive(Debug, Clone)]
pub struct ModelSpecs {
    pub input: TensorSpec,
    pub output: TensorSpec,
}

/// Thread-safe front of a single `ModelRuntime`
pub struct InferenceEngine<B: InterpreterBackend> {
    runtime: Mutex<ModelRuntime<B>>,
    loaded: AtomicBool,
    specs: RwLock<Option<ModelSpecs>>,
    metrics: Arc<MetricsRegistry>,
}

impl<B: InterpreterBackend> InferenceEngine<B> {
    pub fn new(backend: B, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            runtime: Mutex::new(ModelRuntime::new(backend)),
            loaded: AtomicBool::new(false),
            specs: RwLock::new(None),
            metrics,
        }
    }

    /// Load the model and publish its specs
    pub fn load(&self, model_path: &Path, library_path: Option<&Path>) -> Result<ModelSpecs> {
        let mut runtime = self.runtime.lock();
        runtime.load(model_path, library_path)?;

        let specs = match (runtime.input_spec(), runtime.output_spec()) {
            (Some(input), Some(output)) => ModelSpecs {
                input: input.clone(),
                output: output.clone(),
            },
            _ => return Err(Error::NotLoaded),
        };

        *self.specs.write() = Some(specs.clone());
        self.loaded.store(true, Ordering::Release);
        Ok(specs)
    }

    /// Whether a model is loaded; never waits on an in-flight inference
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub fn specs(&self) -> Option<ModelSpecs> {
        self.specs.read().clone()
    }

    pub fn input_spec(&self) -> Option<TensorSpec> {
        self.specs.read().as_ref().map(|s| s.input.clone())
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Run one inference under exclusive access to the runtime
    ///
    /// Blocks the calling thread; async callers should go through
    /// `spawn_blocking`.
    pub fn run(&self, input: &Tensor) -> Result<InferenceResult> {
        let mut runtime = self.runtime.lock();

        let start = Instant::now();
        let result = runtime.invoke(input);
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(output) => {
                self.metrics.record(elapsed_ms);
                drop(runtime);
                debug!("Inference completed in {:.2}ms", elapsed_ms);
                Ok(InferenceResult { output, elapsed_ms })
            }
            Err(e) => {
                drop(runtime);
                warn!("Inference failed after {:.2}ms: {}", elapsed_ms, e);
                Err(e)
            }
        }
    }
}
