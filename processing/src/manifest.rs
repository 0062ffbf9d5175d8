//! Model manifest – describes a classifier artifact and its input contract.
//!
//! The model directory holds a `manifest.toml`:
//!
//! ```toml
//! [model]
//! name = "ESC-50 ResNet34"
//! onnx_file = "export.onnx"      # preferred when present
//! tflite_file = "export.tflite"  # fallback
//! labels_file = "labels.txt"     # optional, defaults to the ESC-50 set
//! apply_softmax = true           # the model emits raw logits
//!
//! [input]
//! width = 224
//! height = 224
//! layout = "nchw"                # "nhwc" for most TFLite exports
//! mean = [0.485, 0.456, 0.406]
//! std = [0.229, 0.224, 0.225]
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::info;

use whisp_common::LabelSet;

/// Top-level manifest structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub model: ModelSection,
    #[serde(default)]
    pub input: InputSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelSection {
    pub name: String,
    #[serde(default)]
    pub onnx_file: Option<String>,
    #[serde(default)]
    pub tflite_file: Option<String>,
    /// One label per line.  When absent the built-in ESC-50 set is used.
    #[serde(default)]
    pub labels_file: Option<String>,
    /// Whether to apply softmax to raw logits.
    #[serde(default)]
    pub apply_softmax: bool,
}

/// Axis order of the image tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// `[1, 3, height, width]`, the PyTorch/ONNX convention.
    #[default]
    Nchw,
    /// `[1, height, width, 3]`, the TensorFlow/TFLite convention.
    Nhwc,
}

/// Shape and normalisation of the image tensor fed to the model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InputSection {
    #[serde(default = "default_side")]
    pub width: u32,
    #[serde(default = "default_side")]
    pub height: u32,
    #[serde(default)]
    pub layout: TensorLayout,
    /// Per-channel (R, G, B) mean subtracted after scaling to `[0, 1]`.
    #[serde(default = "imagenet_mean")]
    pub mean: [f32; 3],
    /// Per-channel standard deviation divided out after the mean.
    #[serde(default = "imagenet_std")]
    pub std: [f32; 3],
}

impl Default for InputSection {
    fn default() -> Self {
        Self {
            width: default_side(),
            height: default_side(),
            layout: TensorLayout::default(),
            mean: imagenet_mean(),
            std: imagenet_std(),
        }
    }
}

impl InputSection {
    /// Full input tensor shape, batch of one.
    pub fn shape(&self) -> [usize; 4] {
        let (w, h) = (self.width as usize, self.height as usize);
        match self.layout {
            TensorLayout::Nchw => [1, 3, h, w],
            TensorLayout::Nhwc => [1, h, w, 3],
        }
    }
}

fn default_side() -> u32 {
    224
}
fn imagenet_mean() -> [f32; 3] {
    [0.485, 0.456, 0.406]
}
fn imagenet_std() -> [f32; 3] {
    [0.229, 0.224, 0.225]
}

/// A resolved manifest with absolute paths.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    pub manifest: Manifest,
    /// Directory containing the manifest and model files.
    pub base_dir: PathBuf,
}

impl ResolvedManifest {
    pub fn name(&self) -> &str {
        &self.manifest.model.name
    }

    pub fn onnx_path(&self) -> Option<PathBuf> {
        self.manifest
            .model
            .onnx_file
            .as_ref()
            .map(|f| self.base_dir.join(f))
    }

    pub fn tflite_path(&self) -> Option<PathBuf> {
        self.manifest
            .model
            .tflite_file
            .as_ref()
            .map(|f| self.base_dir.join(f))
    }

    pub fn labels_path(&self) -> Option<PathBuf> {
        self.manifest
            .model
            .labels_file
            .as_ref()
            .map(|f| self.base_dir.join(f))
    }

    /// The label set this model scores, in output order.
    pub fn load_labels(&self) -> Result<LabelSet> {
        match self.labels_path() {
            Some(path) => LabelSet::from_file(&path),
            None => Ok(LabelSet::esc50()),
        }
    }
}

/// Load the manifest in `dir`.
pub fn load_manifest(dir: &Path) -> Result<ResolvedManifest> {
    let manifest_path = dir.join("manifest.toml");
    let text = std::fs::read_to_string(&manifest_path)
        .with_context(|| format!("Cannot read {}", manifest_path.display()))?;
    let manifest = parse_manifest(&text)
        .with_context(|| format!("Invalid manifest: {}", manifest_path.display()))?;
    info!(
        "Loaded model manifest: {} (input {}×{}, softmax={})",
        manifest.model.name,
        manifest.input.width,
        manifest.input.height,
        manifest.model.apply_softmax,
    );
    Ok(ResolvedManifest {
        manifest,
        base_dir: dir.to_path_buf(),
    })
}

fn parse_manifest(text: &str) -> Result<Manifest> {
    let manifest: Manifest = toml::from_str(text)?;
    if manifest.model.onnx_file.is_none() && manifest.model.tflite_file.is_none() {
        bail!("[model] needs an onnx_file or a tflite_file");
    }
    let input = &manifest.input;
    if input.width == 0 || input.height == 0 {
        bail!("[input] size must be non-zero, got {}×{}", input.width, input.height);
    }
    if input.std.iter().any(|&s| s <= 0.0 || !s.is_finite()) {
        bail!("[input] std entries must be positive, got {:?}", input.std);
    }
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest() {
        let toml = r#"
[model]
name = "ESC-50 ResNet34"
onnx_file = "export.onnx"
apply_softmax = true

[input]
width = 256
height = 192
layout = "nhwc"
mean = [0.5, 0.5, 0.5]
std = [0.25, 0.25, 0.25]
"#;
        let m = parse_manifest(toml).unwrap();
        assert_eq!(m.model.name, "ESC-50 ResNet34");
        assert!(m.model.apply_softmax);
        assert_eq!((m.input.width, m.input.height), (256, 192));
        assert_eq!(m.input.layout, TensorLayout::Nhwc);
        assert_eq!(m.input.shape(), [1, 192, 256, 3]);
        assert_eq!(m.input.std, [0.25; 3]);
    }

    #[test]
    fn test_minimal_manifest_uses_defaults() {
        let toml = r#"
[model]
name = "ESC-50"
tflite_file = "model.tflite"
"#;
        let m = parse_manifest(toml).unwrap();
        assert!(!m.model.apply_softmax);
        assert!(m.model.labels_file.is_none());
        assert_eq!(m.input, InputSection::default());
        assert_eq!(m.input.shape(), [1, 3, 224, 224]);
    }

    #[test]
    fn test_manifest_without_model_file_rejected() {
        let toml = r#"
[model]
name = "nothing"
"#;
        assert!(parse_manifest(toml).is_err());
    }

    #[test]
    fn test_unknown_layout_rejected() {
        let toml = r#"
[model]
name = "bad"
onnx_file = "m.onnx"

[input]
layout = "chwn"
"#;
        assert!(parse_manifest(toml).is_err());
    }

    #[test]
    fn test_manifest_with_zero_std_rejected() {
        let toml = r#"
[model]
name = "bad"
onnx_file = "m.onnx"

[input]
std = [0.2, 0.0, 0.2]
"#;
        assert!(parse_manifest(toml).is_err());
    }

    #[test]
    fn test_resolved_paths_and_default_labels() {
        let m = parse_manifest(
            r#"
[model]
name = "x"
onnx_file = "export.onnx"
"#,
        )
        .unwrap();
        let resolved = ResolvedManifest {
            manifest: m,
            base_dir: PathBuf::from("/models/esc50"),
        };
        assert_eq!(resolved.onnx_path(), Some(PathBuf::from("/models/esc50/export.onnx")));
        assert_eq!(resolved.tflite_path(), None);
        assert_eq!(resolved.load_labels().unwrap().len(), 50);
    }

    #[test]
    fn test_load_manifest_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("manifest.toml"),
            "[model]\nname = \"disk\"\nonnx_file = \"a.onnx\"\nlabels_file = \"labels.txt\"\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("labels.txt"), "dog\ncat\n").unwrap();
        let resolved = load_manifest(dir.path()).unwrap();
        assert_eq!(resolved.name(), "disk");
        assert_eq!(resolved.load_labels().unwrap().len(), 2);
    }
}
