//! Classifier capability and its tract-based ONNX / TFLite backend.
//!
//! The pipeline only depends on [`Classifier`]; the concrete backend is
//! chosen by the model manifest.  When a manifest specifies an `onnx_file`
//! **and** that file exists on disk, the model is loaded via `tract-onnx`,
//! otherwise via `tract-tflite`.
//!
//! Every backend is checked at load time: its input must match the
//! manifest's `[input]` shape and it must emit exactly one score per label.

use std::fs;
use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};
use image::imageops::{self, FilterType};
use tract_onnx::prelude::InferenceModelExt as _;
use tract_tflite::prelude::*;
use tracing::{debug, info, warn};

use whisp_common::{LabelSet, PipelineError, PipelineResult};

use crate::manifest::{self, InputSection, ResolvedManifest, TensorLayout};
use crate::spectrogram::SpectrogramImage;

// ── constants ────────────────────────────────────────────────────────────

/// FlatBuffer file identifier of the TFLite schema, at bytes 4..8.
const TFLITE_SCHEMA_ID: &[u8; 4] = b"TFL3";

/// Allowed distance of a score vector's sum from 1.
const SUM_TOLERANCE: f32 = 1e-4;

// ── capability ───────────────────────────────────────────────────────────

/// A pretrained image classifier over a fixed label set.
///
/// Implementations are loaded once and then only read, so they must be
/// shareable across request threads.
pub trait Classifier: Send + Sync {
    /// Human-readable model name.
    fn name(&self) -> &str;

    /// Labels in the order of the scores returned by [`Classifier::classify`].
    fn labels(&self) -> &LabelSet;

    /// Score `image`: one non-negative value per label, summing to 1.
    fn classify(&self, image: &SpectrogramImage) -> PipelineResult<Vec<f32>>;
}

// ── tract backend ────────────────────────────────────────────────────────

/// A loaded tract model ready for inference.
pub struct TractClassifier {
    runner: TypedRunnableModel<TypedModel>,
    labels: LabelSet,
    name: String,
    input: InputSection,
    apply_softmax: bool,
}

/// Load the classifier described by `model_dir/manifest.toml`.
pub fn load_classifier(model_dir: &Path) -> Result<TractClassifier> {
    let resolved = manifest::load_manifest(model_dir)?;
    load_model(&resolved)
}

/// Load a model from a resolved manifest.
///
/// Prefers ONNX when `onnx_file` is configured **and** the file exists;
/// otherwise falls back to TFLite.
pub fn load_model(resolved: &ResolvedManifest) -> Result<TractClassifier> {
    let input = resolved.manifest.input.clone();

    let onnx = resolved.onnx_path().filter(|p| p.exists());
    let runner = match (onnx, resolved.tflite_path()) {
        (Some(onnx_path), _) => {
            info!("Loading ONNX classifier from {}", onnx_path.display());
            load_onnx_runner(&onnx_path, &input)?
        }
        (None, Some(tflite_path)) => {
            if let Some(missing) = resolved.onnx_path() {
                info!(
                    "ONNX file configured but missing ({}), falling back to TFLite",
                    missing.display()
                );
            }
            load_tflite_runner(&tflite_path)?
        }
        (None, None) => bail!(
            "Model file not found in {} (onnx_file={:?}, no tflite_file)",
            resolved.base_dir.display(),
            resolved.manifest.model.onnx_file,
        ),
    };

    let labels = resolved.load_labels()?;
    let classifier = TractClassifier::from_runner(
        runner,
        labels,
        resolved.name(),
        input,
        resolved.manifest.model.apply_softmax,
    )
    .with_context(|| format!("Model {} does not fit its manifest", resolved.name()))?;

    info!(
        "Classifier ready: {} ({} labels, input {:?})",
        classifier.name,
        classifier.labels.len(),
        classifier.input.shape()
    );
    Ok(classifier)
}

/// Cheap header check of a TFLite FlatBuffer before tract parses it.
///
/// tract reports a truncated or foreign file as an opaque parse error (or
/// panics), so the identifier and root table offset are checked first.
fn check_tflite_header(path: &Path) -> Result<()> {
    let len = fs::metadata(path)
        .with_context(|| format!("TFLite file not found: {}", path.display()))?
        .len();

    let mut header = [0u8; 8];
    fs::File::open(path)
        .and_then(|mut f| f.read_exact(&mut header))
        .with_context(|| format!("TFLite file too short ({len} bytes): {}", path.display()))?;

    if header[4..8] != *TFLITE_SCHEMA_ID {
        bail!(
            "{} is not a TFLite model (identifier {:?}, expected TFL3)",
            path.display(),
            String::from_utf8_lossy(&header[4..8]),
        );
    }

    let root = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if u64::from(root) >= len {
        bail!(
            "TFLite root table at {root} lies past the end of {} ({len} bytes)",
            path.display(),
        );
    }
    Ok(())
}

/// Load and optimise a TFLite model file.
fn load_tflite_runner(path: &Path) -> Result<TypedRunnableModel<TypedModel>> {
    check_tflite_header(path)?;
    info!("Loading TFLite model from {}", path.display());

    tract_tflite::tflite()
        .model_for_path(path)
        .with_context(|| format!("Cannot load TFLite model: {}", path.display()))?
        .into_optimized()
        .context("TFLite model optimisation failed")?
        .into_runnable()
        .context("Cannot make TFLite model runnable")
}

/// Load and optimise an ONNX model file, pinning its input to the
/// manifest's image tensor shape.
fn load_onnx_runner(path: &Path, input: &InputSection) -> Result<TypedRunnableModel<TypedModel>> {
    tract_onnx::onnx()
        .model_for_path(path)
        .with_context(|| format!("Cannot load ONNX model: {}", path.display()))?
        .with_input_fact(0, f32::fact(input.shape()).into())
        .context("Cannot set ONNX input shape")?
        .into_optimized()
        .context("ONNX model optimisation failed")?
        .into_runnable()
        .context("Cannot make ONNX model runnable")
}

impl TractClassifier {
    /// Wrap a runnable model, checking it against the manifest.
    ///
    /// Fails when the model's input shape differs from `input.shape()` or
    /// when its output does not hold exactly one score per label.
    pub fn from_runner(
        runner: TypedRunnableModel<TypedModel>,
        labels: LabelSet,
        name: &str,
        input: InputSection,
        apply_softmax: bool,
    ) -> Result<Self> {
        let model = runner.model();

        let input_fact = model.input_fact(0).context("Model has no input")?;
        match input_fact.shape.as_concrete() {
            Some(dims) if dims != input.shape() => bail!(
                "model input is {dims:?} but [input] describes {:?} ({:?} layout)",
                input.shape(),
                input.layout
            ),
            Some(_) => {}
            None => warn!("Model {name} has a symbolic input shape {:?}", input_fact.shape),
        }

        let output_fact = model.output_fact(0).context("Model has no output")?;
        match output_fact.shape.as_concrete() {
            Some(dims) => {
                let n_scores: usize = dims.iter().product();
                if n_scores != labels.len() {
                    bail!(
                        "model emits {n_scores} scores (output {dims:?}) but {} labels are configured",
                        labels.len()
                    );
                }
            }
            None => warn!(
                "Model {name} has a symbolic output shape {:?}; score count is checked per request",
                output_fact.shape
            ),
        }

        Ok(Self {
            runner,
            labels,
            name: name.to_string(),
            input,
            apply_softmax,
        })
    }

    pub fn input(&self) -> &InputSection {
        &self.input
    }
}

impl Classifier for TractClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn labels(&self) -> &LabelSet {
        &self.labels
    }

    fn classify(&self, image: &SpectrogramImage) -> PipelineResult<Vec<f32>> {
        let input = to_input_tensor(image, &self.input)?;
        let result = self
            .runner
            .run(tvec![input.into()])
            .map_err(|e| PipelineError::Inference(format!("model rejected input: {e:#}")))?;

        let output = result[0]
            .to_array_view::<f32>()
            .map_err(|e| PipelineError::Inference(format!("cannot read output tensor: {e:#}")))?;
        let raw: Vec<f32> = output.iter().copied().collect();

        let scores = if self.apply_softmax {
            softmax(&raw)
        } else {
            raw
        };
        check_scores(&scores)?;
        Ok(scores)
    }
}

/// Scores must be finite, non-negative and sum to 1.
fn check_scores(scores: &[f32]) -> PipelineResult<()> {
    if scores.iter().any(|s| !s.is_finite() || *s < 0.0) {
        return Err(PipelineError::Inference(
            "model produced non-finite or negative scores".into(),
        ));
    }
    let sum: f32 = scores.iter().sum();
    if (sum - 1.0).abs() > SUM_TOLERANCE {
        return Err(PipelineError::Inference(format!(
            "model scores sum to {sum}, not 1; set apply_softmax if the model emits logits"
        )));
    }
    Ok(())
}

/// Resize `image` to the model input size and lay it out as a normalised
/// `f32` tensor in the manifest's axis order.
pub fn to_input_tensor(image: &SpectrogramImage, spec: &InputSection) -> PipelineResult<Tensor> {
    let (w, h) = (spec.width, spec.height);
    if w == 0 || h == 0 {
        return Err(PipelineError::Inference(format!(
            "model input size {w}×{h} is degenerate"
        )));
    }
    let resized = imageops::resize(image.as_rgb(), w, h, FilterType::Triangle);
    debug!(
        "Resized {}×{} spectrogram to {w}×{h} model input",
        image.width(),
        image.height()
    );

    let plane = (w * h) as usize;
    let mut data = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in resized.enumerate_pixels() {
        let offset = (y * w + x) as usize;
        for c in 0..3 {
            let v = (pixel.0[c] as f32 / 255.0 - spec.mean[c]) / spec.std[c];
            let idx = match spec.layout {
                TensorLayout::Nchw => c * plane + offset,
                TensorLayout::Nhwc => offset * 3 + c,
            };
            data[idx] = v;
        }
    }

    Tensor::from_shape(&spec.shape(), &data)
        .map_err(|e| PipelineError::Inference(format!("cannot shape input tensor: {e}")))
}

// ── softmax ──────────────────────────────────────────────────────────────

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|&e| e / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mel::SpectrogramMatrix;
    use crate::spectrogram::{render, RenderParams};

    fn solid_image(value: f32) -> SpectrogramImage {
        let m = SpectrogramMatrix::from_vec(vec![value; 4], 2, 2).unwrap();
        render(&m, &RenderParams { width: 32, height: 24 }).unwrap()
    }

    fn tiny_input(layout: TensorLayout) -> InputSection {
        InputSection {
            width: 2,
            height: 2,
            layout,
            mean: [0.0; 3],
            std: [1.0; 3],
        }
    }

    fn numbered_labels(n: usize) -> LabelSet {
        LabelSet::new((0..n).map(|i| format!("class_{i}")).collect()).unwrap()
    }

    /// A model that returns its input image unchanged, so it emits one
    /// "score" per tensor element.
    fn identity_runner(shape: [usize; 4]) -> TypedRunnableModel<TypedModel> {
        let mut model = TypedModel::default();
        let source = model.add_source("image", f32::fact(shape)).unwrap();
        model.set_output_outlets(&[source]).unwrap();
        model.into_runnable().unwrap()
    }

    #[test]
    fn test_softmax() {
        let logits = vec![1.0, 2.0, 3.0];
        let probs = softmax(&logits);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(probs[2] > probs[1]);
        assert!(probs[1] > probs[0]);
    }

    #[test]
    fn test_softmax_large_logits_stay_finite() {
        let probs = softmax(&[1000.0, 1000.0, -1000.0]);
        assert!(probs.iter().all(|p| p.is_finite()));
        assert!((probs[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_input_tensor_nchw() {
        // A constant matrix renders as the first jet colour (0, 0, 128).
        let img = solid_image(-5.0);
        let spec = InputSection {
            width: 8,
            height: 6,
            layout: TensorLayout::Nchw,
            mean: [0.0, 0.0, 0.5],
            std: [1.0, 1.0, 0.5],
        };
        let tensor = to_input_tensor(&img, &spec).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 6, 8]);
        let view = tensor.to_array_view::<f32>().unwrap();
        let blue = (128.0 / 255.0 - 0.5) / 0.5;
        assert!(view.iter().take(2 * 48).all(|&v| v.abs() < 1e-6));
        assert!(view.iter().skip(2 * 48).all(|&v| (v - blue).abs() < 1e-5));
    }

    #[test]
    fn test_input_tensor_nhwc_interleaves_channels() {
        let img = solid_image(-5.0);
        let spec = InputSection {
            width: 4,
            height: 3,
            ..tiny_input(TensorLayout::Nhwc)
        };
        let tensor = to_input_tensor(&img, &spec).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 4, 3]);
        let values: Vec<f32> = tensor.to_array_view::<f32>().unwrap().iter().copied().collect();
        let blue = 128.0 / 255.0;
        for px in values.chunks(3) {
            assert!(px[0].abs() < 1e-6 && px[1].abs() < 1e-6, "got {px:?}");
            assert!((px[2] - blue).abs() < 1e-5, "got {px:?}");
        }
    }

    #[test]
    fn test_input_tensor_rejects_degenerate_size() {
        let img = solid_image(0.0);
        let spec = InputSection {
            width: 0,
            ..InputSection::default()
        };
        assert!(matches!(
            to_input_tensor(&img, &spec).unwrap_err(),
            PipelineError::Inference(_)
        ));
    }

    // ── load-time shape checks ───────────────────────────────────────

    #[test]
    fn test_output_count_must_match_label_count() {
        let err = TractClassifier::from_runner(
            identity_runner([1, 3, 2, 2]),
            LabelSet::esc50(),
            "identity",
            tiny_input(TensorLayout::Nchw),
            true,
        )
        .err()
        .expect("12 outputs cannot score 50 labels");
        let msg = format!("{err:#}");
        assert!(msg.contains("12 scores") && msg.contains("50 labels"), "got: {msg}");

        assert!(TractClassifier::from_runner(
            identity_runner([1, 3, 2, 2]),
            numbered_labels(12),
            "identity",
            tiny_input(TensorLayout::Nchw),
            true,
        )
        .is_ok());
    }

    #[test]
    fn test_input_shape_must_match_layout() {
        let err = TractClassifier::from_runner(
            identity_runner([1, 2, 2, 3]),
            numbered_labels(12),
            "nhwc-model",
            tiny_input(TensorLayout::Nchw),
            true,
        )
        .err()
        .expect("NHWC model with NCHW manifest");
        assert!(format!("{err:#}").contains("model input is"), "got: {err:#}");

        let ok = TractClassifier::from_runner(
            identity_runner([1, 2, 2, 3]),
            numbered_labels(12),
            "nhwc-model",
            tiny_input(TensorLayout::Nhwc),
            true,
        );
        assert!(ok.is_ok());
    }

    // ── score contract ───────────────────────────────────────────────

    #[test]
    fn test_unnormalised_scores_are_rejected() {
        let classifier = TractClassifier::from_runner(
            identity_runner([1, 3, 2, 2]),
            numbered_labels(12),
            "raw",
            tiny_input(TensorLayout::Nchw),
            false,
        )
        .unwrap();
        // four blue pixels of 128/255 each sum to about 2
        let err = classifier.classify(&solid_image(0.0)).unwrap_err();
        match err {
            PipelineError::Inference(msg) => assert!(msg.contains("sum to"), "got: {msg}"),
            other => panic!("expected Inference, got {other:?}"),
        }
    }

    #[test]
    fn test_softmaxed_scores_pass() {
        let classifier = TractClassifier::from_runner(
            identity_runner([1, 3, 2, 2]),
            numbered_labels(12),
            "logits",
            tiny_input(TensorLayout::Nchw),
            true,
        )
        .unwrap();
        let scores = classifier.classify(&solid_image(0.0)).unwrap();
        assert_eq!(scores.len(), 12);
        let sum: f32 = scores.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4, "scores sum to {sum}");
    }

    #[test]
    fn test_check_scores() {
        assert!(check_scores(&[0.25, 0.75]).is_ok());
        assert!(check_scores(&[0.5, 0.49995]).is_ok());
        assert!(check_scores(&[0.9, 0.9]).is_err());
        assert!(check_scores(&[1.5, -0.5]).is_err());
        assert!(check_scores(&[f32::NAN, 1.0]).is_err());
    }

    // ── TFLite header ────────────────────────────────────────────────

    fn tflite_bytes(root: u32, id: &[u8; 4], len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        data[0..4].copy_from_slice(&root.to_le_bytes());
        data[4..8].copy_from_slice(id);
        data
    }

    #[test]
    fn test_tflite_header_accepts_flatbuffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("esc50.tflite");
        fs::write(&path, tflite_bytes(24, b"TFL3", 256)).unwrap();
        assert!(check_tflite_header(&path).is_ok());
    }

    #[test]
    fn test_tflite_header_rejects_bad_files() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("missing.tflite");
        assert!(format!("{:#}", check_tflite_header(&missing).unwrap_err()).contains("not found"));

        let short = dir.path().join("short.tflite");
        fs::write(&short, b"TFL").unwrap();
        assert!(format!("{:#}", check_tflite_header(&short).unwrap_err()).contains("too short"));

        let onnx = dir.path().join("export.onnx.tflite");
        fs::write(&onnx, tflite_bytes(24, b"\x08\x07\x12\x07", 256)).unwrap();
        assert!(format!("{:#}", check_tflite_header(&onnx).unwrap_err())
            .contains("not a TFLite model"));

        let truncated = dir.path().join("truncated.tflite");
        fs::write(&truncated, tflite_bytes(4096, b"TFL3", 256)).unwrap();
        assert!(format!("{:#}", check_tflite_header(&truncated).unwrap_err())
            .contains("past the end"));
    }

    #[test]
    fn test_load_without_any_model_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("manifest.toml"),
            "[model]\nname = \"ghost\"\nonnx_file = \"missing.onnx\"\n",
        )
        .unwrap();
        let err = load_classifier(dir.path()).err().expect("load should fail");
        assert!(format!("{err:#}").contains("not found"), "got: {err:#}");
    }

    /// Smoke-test a real exported classifier.
    ///
    /// Only runs when a model directory exists at the expected path.
    #[test]
    fn test_load_exported_classifier() {
        let model_dir = Path::new("/tmp/whisp_esc50");
        if !model_dir.join("manifest.toml").exists() {
            eprintln!("Skipping model test: {model_dir:?} not found");
            return;
        }
        let classifier = load_classifier(model_dir).expect("Failed to load model");
        let scores = classifier.classify(&solid_image(0.0)).expect("inference failed");
        assert_eq!(scores.len(), classifier.labels().len());
        let sum: f32 = scores.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4, "scores sum to {sum}");
    }
}
