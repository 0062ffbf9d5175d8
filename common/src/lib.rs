//! Types and helpers shared by the Whisp processing library, the HTTP
//! server and the batch CLI.

pub mod audio;
pub mod config;
pub mod error;
pub mod labels;
pub mod protocol;

pub use audio::{Signal, TARGET_SAMPLE_RATE};
pub use error::{PipelineError, PipelineResult};
pub use labels::LabelSet;
