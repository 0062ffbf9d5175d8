//! Spectrogram rendering: log-power matrix → full-bleed colour raster.
//!
//! The classifier was trained on images with no axes, ticks or margins,
//! where the matrix fills the whole canvas (lowest mel band at the bottom)
//! and values are coloured through the 256-entry "jet" lookup table after
//! linear normalisation from the matrix minimum to its maximum.

use std::io::Cursor;
use std::sync::OnceLock;

use image::{ImageBuffer, ImageFormat, Rgb, RgbImage};
use tracing::debug;

use whisp_common::{PipelineError, PipelineResult};

use crate::mel::SpectrogramMatrix;

/// Parameters for spectrogram rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderParams {
    pub width: u32,
    pub height: u32,
}

impl Default for RenderParams {
    /// 6.4 × 4.8 inches at 100 dpi.
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

/// A rendered spectrogram, ready for the classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrogramImage {
    image: RgbImage,
}

impl SpectrogramImage {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.image
    }

    /// Raw interleaved RGB bytes, row-major from the top-left pixel.
    pub fn as_bytes(&self) -> &[u8] {
        self.image.as_raw()
    }

    /// Encode as PNG (lossless, so repeated encodes are byte-identical).
    pub fn to_png(&self) -> PipelineResult<Vec<u8>> {
        let mut out = Cursor::new(Vec::new());
        self.image
            .write_to(&mut out, ImageFormat::Png)
            .map_err(|e| PipelineError::Render(format!("PNG encoding failed: {e}")))?;
        Ok(out.into_inner())
    }
}

/// Rasterise a spectrogram matrix.
///
/// Each pixel takes the value of the matrix cell under its centre.  Fails
/// with [`PipelineError::Render`] on an empty matrix or a zero-sized canvas.
pub fn render(matrix: &SpectrogramMatrix, params: &RenderParams) -> PipelineResult<SpectrogramImage> {
    let (n_mels, n_frames) = (matrix.n_mels(), matrix.n_frames());
    if n_mels == 0 || n_frames == 0 {
        return Err(PipelineError::Render(format!(
            "empty spectrogram ({n_mels} bands × {n_frames} frames)"
        )));
    }
    if params.width == 0 || params.height == 0 {
        return Err(PipelineError::Render(format!(
            "degenerate canvas {}×{}",
            params.width, params.height
        )));
    }
    let (vmin, vmax) = matrix
        .range()
        .ok_or_else(|| PipelineError::Render("empty spectrogram".into()))?;

    debug!(
        "Rendering {n_mels}×{n_frames} spectrogram to {}×{} (range {vmin:.1}..{vmax:.1} dB)",
        params.width, params.height
    );

    let (img_w, img_h) = (params.width, params.height);

    // Column → frame and row → band lookups are shared by every pixel.
    let frame_of: Vec<usize> = (0..img_w)
        .map(|x| cell_index(x, img_w, n_frames))
        .collect();
    let band_of: Vec<usize> = (0..img_h)
        .map(|y| cell_index(img_h - 1 - y, img_h, n_mels))
        .collect();

    let span = vmax as f64 - vmin as f64;
    let mut img = ImageBuffer::<Rgb<u8>, _>::new(img_w, img_h);
    for (x, y, pixel) in img.enumerate_pixels_mut() {
        let val = matrix.get(band_of[y as usize], frame_of[x as usize]);
        let norm = if span > 0.0 {
            ((val as f64 - vmin as f64) / span) as f32
        } else {
            0.0
        };
        *pixel = colormap(norm);
    }

    Ok(SpectrogramImage { image: img })
}

/// Index of the cell whose extent covers the centre of pixel `px`.
fn cell_index(px: u32, pixels: u32, cells: usize) -> usize {
    let pos = (px as f64 + 0.5) / pixels as f64 * cells as f64;
    (pos as usize).min(cells - 1)
}

// ── colour map ───────────────────────────────────────────────────────────

const LUT_SIZE: usize = 256;

type Segments = &'static [(f32, f32)];

/// Piecewise-linear control points `(x, y)` of the jet colour map.
const JET_RED: Segments = &[(0.0, 0.0), (0.35, 0.0), (0.66, 1.0), (0.89, 1.0), (1.0, 0.5)];
const JET_GREEN: Segments = &[
    (0.0, 0.0),
    (0.125, 0.0),
    (0.375, 1.0),
    (0.64, 1.0),
    (0.91, 0.0),
    (1.0, 0.0),
];
const JET_BLUE: Segments = &[(0.0, 0.5), (0.11, 1.0), (0.34, 1.0), (0.65, 0.0), (1.0, 0.0)];

fn jet_lut() -> &'static [Rgb<u8>; LUT_SIZE] {
    static LUT: OnceLock<[Rgb<u8>; LUT_SIZE]> = OnceLock::new();
    LUT.get_or_init(|| {
        let mut lut = [Rgb([0, 0, 0]); LUT_SIZE];
        for (i, entry) in lut.iter_mut().enumerate() {
            let x = i as f32 / (LUT_SIZE - 1) as f32;
            *entry = Rgb([
                to_u8(interpolate(JET_RED, x)),
                to_u8(interpolate(JET_GREEN, x)),
                to_u8(interpolate(JET_BLUE, x)),
            ]);
        }
        lut
    })
}

fn interpolate(segments: Segments, x: f32) -> f32 {
    for pair in segments.windows(2) {
        let ((x0, y0), (x1, y1)) = (pair[0], pair[1]);
        if x <= x1 {
            return y0 + (y1 - y0) * (x - x0) / (x1 - x0);
        }
    }
    segments.last().map(|&(_, y)| y).unwrap_or(0.0)
}

fn to_u8(c: f32) -> u8 {
    (c.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Map a normalised value in `[0, 1]` to a jet colour.
///
/// Values are quantised to 256 levels; `1.0` maps to the last entry and
/// out-of-range values are clamped.
pub fn colormap(val: f32) -> Rgb<u8> {
    let idx = if val.is_nan() {
        0
    } else {
        ((val * LUT_SIZE as f32) as isize).clamp(0, LUT_SIZE as isize - 1) as usize
    };
    jet_lut()[idx]
}
