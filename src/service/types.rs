//! Service layer types

use serde::Serialize;

/// One ranked class
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    pub class_id: usize,
    pub score: f32,
}

/// Classification of one image
#[derive(Debug, Clone, Serialize)]
pub struct ClassifyResult {
    pub predictions: Vec<Prediction>,
    pub inference_time_ms: f64,
    pub shape: Vec<usize>,
}

/// Liveness as seen by `/health`
#[derive(Debug, Clone, Copy, Serialize)]
pub struct HealthResult {
    pub healthy: bool,
    pub inference_count: u64,
}

/// Summary reported by the index endpoint
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ServiceStatus {
    pub model_loaded: bool,
    pub total_inferences: u64,
    pub avg_inference_time_ms: f64,
}
