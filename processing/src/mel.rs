//! Log-power mel spectrogram extraction.
//!
//! The classifier was trained on spectrograms computed with the following
//! fixed parameters, which therefore cannot be tuned without retraining:
//!
//! | param | value |
//! |---|---|
//! | pre-emphasis coefficient | 0.97 |
//! | FFT size (`n_fft`) | 2048 |
//! | hop length | 512 |
//! | mel bands | 96 |
//! | frequency range | 0 – sr/2 |
//! | window | periodic Hann, frames centred with reflect padding |
//! | mel scale | Slaney, area-normalised filters |
//! | power | 2 (squared magnitude) |
//! | dB reference | max of the matrix, `amin = 1e-10`, `top_db = 80` |
//!
//! The output is a [`SpectrogramMatrix`] of shape `[96, 1 + len / 512]`
//! stored row-major, row 0 being the lowest mel band.

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use tracing::debug;

use whisp_common::{PipelineError, PipelineResult, Signal, TARGET_SAMPLE_RATE};

// ── constants ────────────────────────────────────────────────────────────

pub const PRE_EMPHASIS: f32 = 0.97;
pub const N_FFT: usize = 2048;
pub const HOP_LENGTH: usize = 512;
pub const N_MELS: usize = 96;
/// Power floor applied before taking the logarithm.
pub const AMIN: f32 = 1e-10;
/// Dynamic range kept below the per-clip maximum (dB).
pub const TOP_DB: f32 = 80.0;

// ── types ────────────────────────────────────────────────────────────────

/// Parameters for one mel-spectrogram computation.
#[derive(Debug, Clone)]
pub struct MelSpecParams {
    /// FFT window / frame length in samples.
    pub frame_length: usize,
    /// Hop size between successive frames.
    pub frame_step: usize,
    /// Number of mel-frequency bins.
    pub n_mels: usize,
    /// Lower edge of the mel filterbank (Hz).
    pub fmin: f32,
    /// Upper edge of the mel filterbank (Hz).
    pub fmax: f32,
    /// Audio sample rate (Hz).
    pub sample_rate: u32,
}

/// The parameters the ESC-50 classifier was trained with.
pub fn esc50_mel_params() -> MelSpecParams {
    MelSpecParams {
        frame_length: N_FFT,
        frame_step: HOP_LENGTH,
        n_mels: N_MELS,
        fmin: 0.0,
        fmax: TARGET_SAMPLE_RATE as f32 / 2.0,
        sample_rate: TARGET_SAMPLE_RATE,
    }
}

/// A 2-D matrix of log-power values, `n_mels` rows × `n_frames` columns.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrogramMatrix {
    data: Vec<f32>,
    n_mels: usize,
    n_frames: usize,
}

impl SpectrogramMatrix {
    /// Wrap a row-major buffer. Returns `None` if the length does not match.
    pub fn from_vec(data: Vec<f32>, n_mels: usize, n_frames: usize) -> Option<Self> {
        (data.len() == n_mels * n_frames).then_some(Self {
            data,
            n_mels,
            n_frames,
        })
    }

    pub fn n_mels(&self) -> usize {
        self.n_mels
    }

    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Value at mel band `mel` and time frame `frame`.
    pub fn get(&self, mel: usize, frame: usize) -> f32 {
        self.data[mel * self.n_frames + frame]
    }

    /// All frames of one mel band.
    pub fn band(&self, mel: usize) -> &[f32] {
        &self.data[mel * self.n_frames..(mel + 1) * self.n_frames]
    }

    pub fn values(&self) -> &[f32] {
        &self.data
    }

    /// `(min, max)` over all cells, or `None` for an empty matrix.
    pub fn range(&self) -> Option<(f32, f32)> {
        if self.data.is_empty() {
            return None;
        }
        Some(self.data.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(mn, mx), &v| {
            (mn.min(v), mx.max(v))
        }))
    }
}

/// Pre-computed state for a [`MelSpecParams`] configuration.
pub struct MelSpecLayer {
    params: MelSpecParams,
    /// Mel filterbank matrix, shape `[n_mels, n_fft_bins]` stored in
    /// row-major order.
    mel_filterbank: Vec<f32>,
    /// Number of FFT bins = frame_length / 2 + 1.
    n_fft_bins: usize,
    /// Periodic Hann window of length `frame_length`.
    hann: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
}

// ── construction ─────────────────────────────────────────────────────────

impl MelSpecLayer {
    /// Build a new layer, pre-computing the Hann window, FFT plan and mel
    /// filterbank.
    pub fn new(params: MelSpecParams) -> Self {
        let n_fft_bins = params.frame_length / 2 + 1;
        let mel_filterbank = slaney_mel_filterbank(
            params.n_mels,
            params.frame_length,
            params.sample_rate as f32,
            params.fmin,
            params.fmax,
        );
        let hann = hann_window(params.frame_length);
        let fft = FftPlanner::<f32>::new().plan_fft_forward(params.frame_length);
        Self {
            params,
            mel_filterbank,
            n_fft_bins,
            hann,
            fft,
        }
    }

    pub fn params(&self) -> &MelSpecParams {
        &self.params
    }

    /// Compute the mel power spectrogram of `audio`.
    ///
    /// `audio` must hold at least `frame_length` samples.  Returns a flat
    /// buffer of shape `[n_mels, n_frames]` in row-major order plus the
    /// `(n_mels, n_frames)` dimensions.
    pub fn compute(&self, audio: &[f32]) -> (Vec<f32>, usize, usize) {
        let p = &self.params;
        let n_bins = self.n_fft_bins;

        // ── 1. centre frames: reflect-pad by half a window ───────────
        let padded = reflect_pad(audio, p.frame_length / 2);
        let n_frames = (padded.len() - p.frame_length) / p.frame_step + 1;

        // ── 2. STFT power spectrum + mel projection ──────────────────
        let n_mels = p.n_mels;
        let mut mel = vec![0.0f32; n_mels * n_frames];
        let mut power = vec![0.0f32; n_bins];
        let mut buf = vec![Complex::new(0.0f32, 0.0); p.frame_length];

        for frame_idx in 0..n_frames {
            let start = frame_idx * p.frame_step;
            for (i, (&s, &w)) in padded[start..start + p.frame_length]
                .iter()
                .zip(self.hann.iter())
                .enumerate()
            {
                buf[i] = Complex::new(s * w, 0.0);
            }
            self.fft.process(&mut buf);
            for (bin, c) in buf.iter().take(n_bins).enumerate() {
                power[bin] = c.norm_sqr();
            }

            // [n_mels, n_bins] × [n_bins] → column `frame_idx`
            for m in 0..n_mels {
                let filter = &self.mel_filterbank[m * n_bins..(m + 1) * n_bins];
                let acc: f32 = filter.iter().zip(power.iter()).map(|(w, p)| w * p).sum();
                mel[m * n_frames + frame_idx] = acc;
            }
        }

        (mel, n_mels, n_frames)
    }
}

/// Spectrogram extractor: pre-emphasis → mel power spectrogram → dB.
///
/// Holds the pre-computed filterbank and FFT plan; cheap to share between
/// threads.
pub struct Extractor {
    layer: MelSpecLayer,
}

impl Extractor {
    pub fn new() -> Self {
        Self {
            layer: MelSpecLayer::new(esc50_mel_params()),
        }
    }

    /// Turn a signal into a log-power mel spectrogram.
    ///
    /// Fails with [`PipelineError::Feature`] if the signal is shorter than
    /// one FFT window or was not sampled at the expected rate.
    pub fn extract(&self, signal: &Signal) -> PipelineResult<SpectrogramMatrix> {
        let p = self.layer.params();
        if signal.sample_rate() != p.sample_rate {
            return Err(PipelineError::Feature(format!(
                "signal sampled at {} Hz, expected {} Hz",
                signal.sample_rate(),
                p.sample_rate
            )));
        }
        if signal.len() < p.frame_length {
            return Err(PipelineError::Feature(format!(
                "signal has {} samples, at least {} ({:.0} ms) are required",
                signal.len(),
                p.frame_length,
                p.frame_length as f64 * 1000.0 / p.sample_rate as f64
            )));
        }

        let emphasized = pre_emphasis(signal.samples());
        let (mut power, n_mels, n_frames) = self.layer.compute(&emphasized);
        power_to_db(&mut power);
        debug!("Extracted mel spectrogram: {n_mels} bands × {n_frames} frames");

        SpectrogramMatrix::from_vec(power, n_mels, n_frames)
            .ok_or_else(|| PipelineError::Invariant("mel buffer size mismatch".into()))
    }
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract with a freshly built [`Extractor`].
pub fn extract(signal: &Signal) -> PipelineResult<SpectrogramMatrix> {
    Extractor::new().extract(signal)
}

// ── signal helpers ───────────────────────────────────────────────────────

/// First-order high-pass: `y[0]' = y[0]`, `y[i]' = y[i] - 0.97 * y[i-1]`.
pub fn pre_emphasis(samples: &[f32]) -> Vec<f32> {
    let mut out = Vec::with_capacity(samples.len());
    if let Some(&first) = samples.first() {
        out.push(first);
        out.extend(samples.windows(2).map(|w| w[1] - PRE_EMPHASIS * w[0]));
    }
    out
}

/// Convert power values to dB in place, referenced to the maximum value.
///
/// `10 * log10(max(p, amin) / max(ref, amin))`, then floored at
/// `max_db - TOP_DB`.  Every output is finite.
pub fn power_to_db(power: &mut [f32]) {
    let reference = power.iter().cloned().fold(0.0f32, f32::max);
    let ref_db = 10.0 * reference.max(AMIN).log10();

    let mut max_db = f32::NEG_INFINITY;
    for v in power.iter_mut() {
        *v = 10.0 * v.max(AMIN).log10() - ref_db;
        max_db = max_db.max(*v);
    }

    let floor = max_db - TOP_DB;
    for v in power.iter_mut() {
        *v = v.max(floor);
    }
}

/// Pad both ends by `pad` samples, mirroring around the edge samples
/// (the edge sample itself is not repeated).
fn reflect_pad(audio: &[f32], pad: usize) -> Vec<f32> {
    let n = audio.len();
    let mut out = Vec::with_capacity(n + 2 * pad);
    if n < 2 {
        out.resize(pad, audio.first().copied().unwrap_or(0.0));
        out.extend_from_slice(audio);
        out.resize(n + 2 * pad, audio.last().copied().unwrap_or(0.0));
        return out;
    }
    let period = 2 * (n - 1);
    let reflect = |i: isize| -> f32 {
        let mut k = i.rem_euclid(period as isize) as usize;
        if k >= n {
            k = period - k;
        }
        audio[k]
    };
    out.extend((0..pad).map(|i| reflect(i as isize - pad as isize)));
    out.extend_from_slice(audio);
    out.extend((0..pad).map(|i| reflect((n + i) as isize)));
    out
}

/// Periodic Hann window of length `n`:
///   `w[i] = 0.5 - 0.5 * cos(2π * i / n)`
fn hann_window(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| {
            let x = std::f32::consts::PI * 2.0 * i as f32 / n as f32;
            0.5 * (1.0 - x.cos())
        })
        .collect()
}

// ── Slaney mel scale ─────────────────────────────────────────────────────

const F_SP: f64 = 200.0 / 3.0;
const MIN_LOG_HZ: f64 = 1000.0;
const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;

fn log_step() -> f64 {
    6.4f64.ln() / 27.0
}

/// Hz → mel on the Slaney scale: linear below 1 kHz, logarithmic above.
pub fn hz_to_mel(hz: f64) -> f64 {
    if hz >= MIN_LOG_HZ {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / log_step()
    } else {
        hz / F_SP
    }
}

/// Inverse of [`hz_to_mel`].
pub fn mel_to_hz(mel: f64) -> f64 {
    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * (log_step() * (mel - MIN_LOG_MEL)).exp()
    } else {
        F_SP * mel
    }
}

/// Centre frequencies (Hz) of the `n_mels + 2` filter edges.
pub fn mel_band_edges(n_mels: usize, fmin: f32, fmax: f32) -> Vec<f64> {
    let mel_min = hz_to_mel(fmin as f64);
    let mel_max = hz_to_mel(fmax as f64);
    let n_edges = n_mels + 2;
    (0..n_edges)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f64 / (n_edges - 1) as f64))
        .collect()
}

/// Triangular mel filters with Slaney area normalisation.
///
/// Returns a `[n_mels, n_fft / 2 + 1]` row-major matrix.  Each filter rises
/// from edge `m` to edge `m + 1` and falls to edge `m + 2`, scaled by
/// `2 / (f[m + 2] - f[m])` so all filters have equal area.
fn slaney_mel_filterbank(
    n_mels: usize,
    n_fft: usize,
    sample_rate: f32,
    fmin: f32,
    fmax: f32,
) -> Vec<f32> {
    let n_bins = n_fft / 2 + 1;
    let fft_freqs: Vec<f64> = (0..n_bins)
        .map(|k| k as f64 * sample_rate as f64 / n_fft as f64)
        .collect();
    let edges = mel_band_edges(n_mels, fmin, fmax);

    let mut weights = vec![0.0f32; n_mels * n_bins];
    for m in 0..n_mels {
        let (lower, center, upper) = (edges[m], edges[m + 1], edges[m + 2]);
        let enorm = 2.0 / (upper - lower);
        for (b, &f) in fft_freqs.iter().enumerate() {
            let rising = (f - lower) / (center - lower);
            let falling = (upper - f) / (upper - center);
            let w = rising.min(falling).max(0.0);
            weights[m * n_bins + b] = (w * enorm) as f32;
        }
    }
    weights
}

// ── tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, n: usize) -> Signal {
        let sr = TARGET_SAMPLE_RATE as f32;
        let samples = (0..n)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / sr).sin())
            .collect();
        Signal::new(samples, TARGET_SAMPLE_RATE)
    }

    #[test]
    fn test_pre_emphasis_constant_signal() {
        let c = 0.8f32;
        let out = pre_emphasis(&[c; 6]);
        assert_eq!(out.len(), 6);
        assert_eq!(out[0], c);
        for &v in &out[1..] {
            assert!((v - 0.03 * c).abs() < 1e-6, "got {v}");
        }
    }

    #[test]
    fn test_pre_emphasis_empty_and_single() {
        assert!(pre_emphasis(&[]).is_empty());
        assert_eq!(pre_emphasis(&[0.25]), vec![0.25]);
    }

    #[test]
    fn test_hann_window_periodic() {
        let w = hann_window(4);
        assert!((w[0] - 0.0).abs() < 1e-6);
        assert!((w[1] - 0.5).abs() < 1e-6);
        assert!((w[2] - 1.0).abs() < 1e-6);
        assert!((w[3] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_reflect_pad() {
        let x = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(
            reflect_pad(&x, 2),
            vec![3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0, 2.0]
        );
        // padding wider than the signal keeps bouncing off the edges
        assert_eq!(
            reflect_pad(&[1.0, 2.0], 3),
            vec![2.0, 1.0, 2.0, 1.0, 2.0, 1.0, 2.0, 1.0]
        );
    }

    #[test]
    fn test_slaney_scale() {
        assert!((hz_to_mel(1000.0) - 15.0).abs() < 1e-9);
        assert!((hz_to_mel(500.0) - 7.5).abs() < 1e-9);
        for hz in [0.0, 200.0, 999.0, 1000.0, 4000.0, 11025.0] {
            assert!((mel_to_hz(hz_to_mel(hz)) - hz).abs() < 1e-6, "hz = {hz}");
        }
    }

    #[test]
    fn test_mel_filterbank_shape() {
        let fb = slaney_mel_filterbank(96, 2048, 22050.0, 0.0, 11025.0);
        assert_eq!(fb.len(), 96 * 1025);
        assert!(fb.iter().all(|&w| w >= 0.0 && w.is_finite()));
        // every band must see at least one FFT bin
        for m in 0..96 {
            let row = &fb[m * 1025..(m + 1) * 1025];
            assert!(row.iter().any(|&w| w > 0.0), "band {m} is empty");
        }
    }

    #[test]
    fn test_minimum_length_boundary() {
        let extractor = Extractor::new();

        let ok = extractor.extract(&sine(440.0, N_FFT)).unwrap();
        assert_eq!(ok.n_mels(), N_MELS);
        assert_eq!(ok.n_frames(), 1 + N_FFT / HOP_LENGTH);

        let err = extractor.extract(&sine(440.0, N_FFT - 1)).unwrap_err();
        assert!(matches!(err, PipelineError::Feature(_)), "got {err:?}");
    }

    #[test]
    fn test_wrong_sample_rate_rejected() {
        let signal = Signal::new(vec![0.0; 48_000], 48_000);
        assert!(matches!(
            extract(&signal).unwrap_err(),
            PipelineError::Feature(_)
        ));
    }

    #[test]
    fn test_db_range() {
        let matrix = extract(&sine(440.0, 22_050)).unwrap();
        assert_eq!(matrix.n_frames(), 1 + 22_050 / HOP_LENGTH);
        assert!(matrix.values().iter().all(|v| v.is_finite()));
        let (min, max) = matrix.range().unwrap();
        assert!(max.abs() < 1e-6, "max should be the 0 dB reference, got {max}");
        assert!(min >= -TOP_DB - 1e-4, "min below top_db floor: {min}");
    }

    #[test]
    fn test_silence_is_finite() {
        let matrix = extract(&Signal::new(vec![0.0; 4096], TARGET_SAMPLE_RATE)).unwrap();
        assert!(matrix.values().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_sine_energy_lands_in_matching_band() {
        let matrix = extract(&sine(440.0, 22_050)).unwrap();
        let mid = matrix.n_frames() / 2;
        let loudest = (0..matrix.n_mels())
            .max_by(|&a, &b| matrix.get(a, mid).total_cmp(&matrix.get(b, mid)))
            .unwrap();
        let edges = mel_band_edges(N_MELS, 0.0, 11_025.0);
        let centre = edges[loudest + 1];
        assert!(
            (380.0..500.0).contains(&centre),
            "loudest band {loudest} centred at {centre:.1} Hz"
        );
    }

    #[test]
    fn test_power_to_db_reference_is_max() {
        let mut p = vec![1.0, 0.1, 0.01, 0.0];
        power_to_db(&mut p);
        assert!((p[0] - 0.0).abs() < 1e-5);
        assert!((p[1] + 10.0).abs() < 1e-4);
        assert!((p[2] + 20.0).abs() < 1e-4);
        // zero power is clamped to the top_db floor
        assert!((p[3] + TOP_DB).abs() < 1e-4);
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let signal = sine(1000.0, 8192);
        assert_eq!(extract(&signal).unwrap(), extract(&signal).unwrap());
    }
}
