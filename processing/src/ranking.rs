//! Pairing classifier scores with labels and ordering them.

use whisp_common::protocol::PredictionResponse;
use whisp_common::{LabelSet, PipelineError, PipelineResult};

/// One prediction: (label, score).
pub type Prediction = (String, f32);

/// Every label with its score, highest score first.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionResult {
    predictions: Vec<Prediction>,
}

impl PredictionResult {
    /// The highest-scoring prediction.
    pub fn top(&self) -> Option<&Prediction> {
        self.predictions.first()
    }

    pub fn len(&self) -> usize {
        self.predictions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predictions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Prediction> {
        self.predictions.iter()
    }

    pub fn as_slice(&self) -> &[Prediction] {
        &self.predictions
    }

    pub fn into_response(self) -> PredictionResponse {
        PredictionResponse {
            predictions: self.predictions,
        }
    }
}

/// Zip `scores` with `labels` and sort by descending score.
///
/// The sort is stable: equal scores keep their label-set order.  A length
/// mismatch is a wiring bug and yields [`PipelineError::Invariant`].
pub fn rank(scores: &[f32], labels: &LabelSet) -> PipelineResult<PredictionResult> {
    if scores.len() != labels.len() {
        return Err(PipelineError::Invariant(format!(
            "classifier produced {} scores for {} labels",
            scores.len(),
            labels.len()
        )));
    }

    let mut predictions: Vec<Prediction> = labels
        .iter()
        .zip(scores.iter())
        .map(|(label, &score)| (label.to_string(), score))
        .collect();

    predictions.sort_by(|a, b| b.1.total_cmp(&a.1));
    Ok(PredictionResult { predictions })
}
