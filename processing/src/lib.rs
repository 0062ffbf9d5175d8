//! Whisp processing – feature extraction, spectrogram rendering,
//! inference and ranking for uploaded sound clips.

pub mod analysis;
pub mod manifest;
pub mod mel;
pub mod model;
pub mod ranking;
pub mod spectrogram;
pub mod staging;

pub use analysis::Pipeline;
pub use model::Classifier;
pub use ranking::PredictionResult;
