//! REST API request/response data transfer objects

use serde::Serialize;
use std::collections::BTreeMap;

use crate::service::{ClassifyResult, Prediction, ServiceStatus};

/// Infer response
#[derive(Debug, Serialize)]
pub struct InferResponse {
    pub success: bool,
    pub predictions: Vec<PredictionDto>,
    pub inference_time_ms: f64,
    pub shape: Vec<usize>,
}

#[derive(Debug, Serialize)]
pub struct PredictionDto {
    pub class_id: usize,
    pub score: f32,
}

impl From<Prediction> for PredictionDto {
    fn from(p: Prediction) -> Self {
        Self {
            class_id: p.class_id,
            score: p.score,
        }
    }
}

impl From<ClassifyResult> for InferResponse {
    fn from(result: ClassifyResult) -> Self {
        Self {
            success: true,
            predictions: result.predictions.into_iter().map(Into::into).collect(),
            inference_time_ms: result.inference_time_ms,
            shape: result.shape,
        }
    }
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub model_loaded: bool,
    pub inference_count: u64,
}

/// Index (API documentation) response
#[derive(Debug, Serialize)]
pub struct IndexResponse {
    pub service: String,
    pub hardware: String,
    pub model: String,
    pub endpoints: BTreeMap<&'static str, &'static str>,
    pub status: StatusDto,
}

#[derive(Debug, Serialize)]
pub struct StatusDto {
    pub model_loaded: bool,
    pub total_inferences: u64,
    pub avg_inference_time_ms: f64,
}

impl From<ServiceStatus> for StatusDto {
    fn from(s: ServiceStatus) -> Self {
        Self {
            model_loaded: s.model_loaded,
            total_inferences: s.total_inferences,
            avg_inference_time_ms: s.avg_inference_time_ms,
        }
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: &str) -> Self {
        Self {
            error: error.to_string(),
        }
    }
}
