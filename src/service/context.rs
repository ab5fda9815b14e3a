//! Runtime Context - process-wide inference state
//!
//! Owns the engine, its metrics and the delegate path chosen at startup.
//! Built once in `main` and shared with the HTTP handlers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info};

use crate::config::{Config, LabelsConfig};
use crate::engine::inference::ModelSpecs;
use crate::engine::preprocess;
use crate::engine::{InferenceEngine, InterpreterBackend, LibraryResolver, MetricsRegistry};
use crate::error::{Error, Result};
use crate::utils::math::{round_to, top_k, TOP_K};

use super::types::*;

pub struct RuntimeContext<B: InterpreterBackend> {
    engine: Arc<InferenceEngine<B>>,
    metrics: Arc<MetricsRegistry>,
    library_path: Option<PathBuf>,
    labels: LabelsConfig,
}

impl<B: InterpreterBackend> RuntimeContext<B> {
    /// Create an unloaded context
    pub fn new(backend: B, labels: LabelsConfig, library_path: Option<PathBuf>) -> Self {
        let metrics = Arc::new(MetricsRegistry::new());
        Self {
            engine: Arc::new(InferenceEngine::new(backend, metrics.clone())),
            metrics,
            library_path,
            labels,
        }
    }

    /// Resolve the delegate and load the model
    ///
    /// Failures are logged and leave the context in degraded mode.
    pub fn initialize(backend: B, config: &Config) -> Self {
        let library_path = match LibraryResolver::from_config(&config.delegate).resolve() {
            Ok(path) => Some(path),
            Err(e) => {
                error!("Could not find libteflon.so: {}", e);
                None
            }
        };

        let context = Self::new(backend, config.labels.clone(), library_path);
        match context.load_model(&config.model.path) {
            Ok(_) => info!("Server ready"),
            Err(e) => error!("Failed to load model, server running in degraded state: {}", e),
        }
        context
    }

    pub fn load_model(&self, model_path: &Path) -> Result<ModelSpecs> {
        self.engine.load(model_path, self.library_path.as_deref())
    }

    pub fn is_loaded(&self) -> bool {
        self.engine.is_loaded()
    }

    pub fn library_path(&self) -> Option<&Path> {
        self.library_path.as_deref()
    }

    pub fn labels(&self) -> &LabelsConfig {
        &self.labels
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Preprocess, run and rank one encoded image
    pub async fn classify(&self, image_data: Vec<u8>) -> Result<ClassifyResult> {
        let input_spec = self.engine.input_spec().ok_or(Error::NotLoaded)?;

        // Decode/resize runs outside the runtime lock
        let input = tokio::task::spawn_blocking(move || preprocess::prepare(&image_data, &input_spec))
            .await
            .map_err(|e| Error::Invoke(format!("preprocessing task failed: {}", e)))??;

        let engine = self.engine.clone();
        let result = tokio::task::spawn_blocking(move || engine.run(&input))
            .await
            .map_err(|e| Error::Invoke(format!("inference task failed: {}", e)))??;

        let scores = result.output.to_f32_vec();
        let predictions = top_k(&scores, TOP_K)
            .into_iter()
            .map(|(class_id, score)| Prediction { class_id, score })
            .collect();

        info!("Inference completed in {:.2}ms", result.elapsed_ms);

        Ok(ClassifyResult {
            predictions,
            inference_time_ms: round_to(result.elapsed_ms, 2),
            shape: result.output.shape().to_vec(),
        })
    }

    pub fn health(&self) -> HealthResult {
        HealthResult {
            healthy: self.is_loaded(),
            inference_count: self.metrics.snapshot().count,
        }
    }

    pub fn status(&self) -> ServiceStatus {
        let snap = self.metrics.snapshot();
        ServiceStatus {
            model_loaded: self.is_loaded(),
            total_inferences: snap.count,
            avg_inference_time_ms: round_to(snap.avg_ms(), 2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockBackend;
    use crate::utils::image::encode_jpeg;
    use image::{DynamicImage, Rgb, RgbImage};

    fn jpeg() -> Vec<u8> {
        encode_jpeg(&DynamicImage::ImageRgb8(RgbImage::from_pixel(224, 224, Rgb([30, 60, 90]))), 90).unwrap()
    }

    #[tokio::test]
    async fn test_classify_before_load() {
        let ctx = RuntimeContext::new(MockBackend::mobilenet(), LabelsConfig::default(), None);
        assert!(matches!(ctx.classify(jpeg()).await, Err(Error::NotLoaded)));
        assert!(!ctx.health().healthy);
    }

    #[tokio::test]
    async fn test_classify_ranks_top_five() {
        let model = tempfile::NamedTempFile::new().unwrap();
        let ctx = RuntimeContext::new(
            MockBackend::mobilenet(),
            LabelsConfig::default(),
            Some(PathBuf::from("/mock/libteflon.so")),
        );
        ctx.load_model(model.path()).unwrap();

        let result = ctx.classify(jpeg()).await.unwrap();
        assert_eq!(result.shape, vec![1, 1001]);
        let ids: Vec<usize> = result.predictions.iter().map(|p| p.class_id).collect();
        assert_eq!(ids, vec![500, 7, 3, 900, 0]);
        assert_eq!(result.predictions[0].score, 255.0);
        assert!(result.inference_time_ms >= 0.0);

        let status = ctx.status();
        assert!(status.model_loaded);
        assert_eq!(status.total_inferences, 1);
    }

    #[tokio::test]
    async fn test_decode_failure_does_not_count() {
        let model = tempfile::NamedTempFile::new().unwrap();
        let ctx = RuntimeContext::new(
            MockBackend::mobilenet(),
            LabelsConfig::default(),
            Some(PathBuf::from("/mock/libteflon.so")),
        );
        ctx.load_model(model.path()).unwrap();

        assert!(matches!(ctx.classify(b"garbage".to_vec()).await, Err(Error::Decode(_))));
        assert_eq!(ctx.health().inference_count, 0);
    }

    #[test]
    fn test_initialize_degrades_without_delegate() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.delegate.mount_points = vec![dir.path().join("libteflon.so")];
        config.delegate.search_patterns = vec![format!("{}/*/libteflon.so", dir.path().display())];

        let ctx = RuntimeContext::initialize(MockBackend::mobilenet(), &config);
        assert!(ctx.library_path().is_none());
        assert!(!ctx.is_loaded());
        assert_eq!(ctx.status().avg_inference_time_ms, 0.0);
    }

    #[test]
    fn test_initialize_loads_with_discovered_delegate() {
        let dir = tempfile::tempdir().unwrap();
        let lib = dir.path().join("libteflon.so");
        std::fs::write(&lib, b"").unwrap();
        let model = dir.path().join("model.tflite");
        std::fs::write(&model, b"TFL3").unwrap();

        let mut config = Config::default();
        config.delegate.mount_points = vec![lib.clone()];
        config.model.path = model;

        let ctx = RuntimeContext::initialize(MockBackend::mobilenet(), &config);
        assert_eq!(ctx.library_path(), Some(lib.as_path()));
        assert!(ctx.is_loaded());
    }
}
