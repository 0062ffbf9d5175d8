//! Full classification pipeline – from uploaded bytes to ranked predictions.
//!
//! The stages run strictly in sequence and the first failure aborts the
//! rest:
//!
//! ```text
//! bytes ─load─▶ Signal ─extract─▶ SpectrogramMatrix ─render─▶ SpectrogramImage
//!       ─classify─▶ scores ─rank─▶ PredictionResult
//! ```

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use whisp_common::{audio, LabelSet, PipelineResult, Signal};

use crate::mel::Extractor;
use crate::model::Classifier;
use crate::ranking::{self, PredictionResult};
use crate::spectrogram::{self, RenderParams, SpectrogramImage};
use crate::staging::StagingArea;

/// Process-wide pipeline state: the shared classifier plus immutable
/// extraction and rendering settings.  Cheap to share behind an `Arc`.
pub struct Pipeline {
    extractor: Extractor,
    render: RenderParams,
    classifier: Arc<dyn Classifier>,
    staging: Option<StagingArea>,
}

impl Pipeline {
    pub fn new(classifier: Arc<dyn Classifier>) -> Self {
        Self {
            extractor: Extractor::new(),
            render: RenderParams::default(),
            classifier,
            staging: None,
        }
    }

    /// Stage uploads through files in `staging` instead of decoding in memory.
    pub fn with_staging(mut self, staging: StagingArea) -> Self {
        self.staging = Some(staging);
        self
    }

    pub fn with_render_params(mut self, render: RenderParams) -> Self {
        self.render = render;
        self
    }

    pub fn labels(&self) -> &LabelSet {
        self.classifier.labels()
    }

    pub fn classifier_name(&self) -> &str {
        self.classifier.name()
    }

    /// Stage 1: decode the upload.
    pub fn load(&self, bytes: &[u8]) -> PipelineResult<Signal> {
        match &self.staging {
            None => audio::load(bytes),
            Some(area) => {
                let staged = area.stage(bytes)?;
                audio::load_path(staged.path())
            }
        }
    }

    /// Stages 1–3: decode, extract and render.
    pub fn spectrogram(&self, bytes: &[u8]) -> PipelineResult<SpectrogramImage> {
        let signal = self.load(bytes)?;
        let matrix = self.extractor.extract(&signal)?;
        spectrogram::render(&matrix, &self.render)
    }

    /// Run every stage and rank the classifier's scores.
    pub fn classify(&self, bytes: &[u8]) -> PipelineResult<PredictionResult> {
        let started = Instant::now();

        let signal = self.load(bytes)?;
        debug!(
            "Decoded {} bytes into {:.2}s of audio",
            bytes.len(),
            signal.duration()
        );
        let matrix = self.extractor.extract(&signal)?;
        let image = spectrogram::render(&matrix, &self.render)?;
        let scores = self.classifier.classify(&image)?;
        let result = ranking::rank(&scores, self.classifier.labels())?;

        if let Some((label, score)) = result.top() {
            info!(
                "Classified {:.2}s clip as {label} ({score:.4}) in {} ms",
                signal.duration(),
                started.elapsed().as_millis()
            );
        }
        Ok(result)
    }
}
