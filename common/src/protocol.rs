//! JSON types exchanged over HTTP.

use serde::{Deserialize, Serialize};

/// Classification response: `[label, score]` pairs sorted by descending score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub predictions: Vec<(String, f32)>,
}

/// Structured error body returned for every failed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable kind (e.g. `decode_error`).
    pub error: String,
    pub message: String,
}

/// Acknowledgement for a curated sample submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionResponse {
    pub response: String,
}

/// Health-check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    /// Name of the loaded classifier.
    pub model: String,
    pub labels: usize,
}
