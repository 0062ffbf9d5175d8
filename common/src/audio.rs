//! Waveform loading: WAV decoding, mono conversion and rubato-based
//! resampling to the classifier's fixed sample rate.

use std::io::{Cursor, Read};
use std::path::Path;

use rubato::{FftFixedIn, Resampler};
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};

/// Sample rate every [`Signal`] is delivered at (Hz).
pub const TARGET_SAMPLE_RATE: u32 = 22_050;

/// Mono `f32` samples at a fixed sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl Signal {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Decode an in-memory WAV buffer into a mono signal at [`TARGET_SAMPLE_RATE`].
pub fn load(bytes: &[u8]) -> PipelineResult<Signal> {
    if bytes.is_empty() {
        return Err(PipelineError::Decode("empty upload".into()));
    }
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| PipelineError::Decode(format!("not a WAV container: {e}")))?;
    decode(reader, TARGET_SAMPLE_RATE)
}

/// Decode a WAV file on disk. Used when uploads are staged through a file.
pub fn load_path(path: &Path) -> PipelineResult<Signal> {
    let reader = hound::WavReader::open(path).map_err(|e| {
        PipelineError::Decode(format!("cannot open {}: {e}", path.display()))
    })?;
    decode(reader, TARGET_SAMPLE_RATE)
}

fn decode<R: Read>(reader: hound::WavReader<R>, target_sr: u32) -> PipelineResult<Signal> {
    let spec = reader.spec();
    let native_sr = spec.sample_rate;
    let n_channels = spec.channels as usize;
    if n_channels == 0 || native_sr == 0 {
        return Err(PipelineError::Decode(format!(
            "invalid stream: {n_channels} channel(s) at {native_sr} Hz"
        )));
    }

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let scale = (1u64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
        }
        hound::SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<_, _>>(),
    }
    .map_err(|e| PipelineError::Decode(format!("corrupt sample data: {e}")))?;

    // Convert to mono
    let mono: Vec<f32> = if n_channels == 1 {
        samples
    } else {
        samples
            .chunks(n_channels)
            .map(|frame| frame.iter().sum::<f32>() / n_channels as f32)
            .collect()
    };
    if mono.is_empty() {
        return Err(PipelineError::Decode("audio stream has no samples".into()));
    }
    debug!("Read {} mono samples at {} Hz", mono.len(), native_sr);

    let resampled = if native_sr == target_sr {
        mono
    } else {
        resample(&mono, native_sr, target_sr)
            .map_err(|e| PipelineError::Decode(format!("resampling failed: {e}")))?
    };
    debug!(
        "Signal ready: {} samples at {} Hz",
        resampled.len(),
        target_sr
    );
    Ok(Signal::new(resampled, target_sr))
}

/// Resample a mono signal from `sr_in` to `sr_out` using rubato's
/// synchronous FFT resampler.
///
/// The resampler's output delay is trimmed and the result is cut to
/// `ceil(len * sr_out / sr_in)` samples so that durations are preserved.
fn resample(input: &[f32], sr_in: u32, sr_out: u32) -> anyhow::Result<Vec<f32>> {
    use anyhow::Context;

    debug!("Resampling {} → {} Hz", sr_in, sr_out);

    let input_f64: Vec<f64> = input.iter().map(|&s| s as f64).collect();
    let expected_len =
        ((input.len() as u64 * sr_out as u64 + sr_in as u64 - 1) / sr_in as u64) as usize;

    let chunk_size = 1024;
    let sub_chunks = 2;
    let mut resampler =
        FftFixedIn::<f64>::new(sr_in as usize, sr_out as usize, chunk_size, sub_chunks, 1)
            .context("Failed to create resampler")?;
    let delay = resampler.output_delay();

    let mut output: Vec<f64> = Vec::with_capacity(expected_len + delay + chunk_size);

    let frames_needed = resampler.input_frames_next();
    let mut pos = 0;
    while pos + frames_needed <= input_f64.len() {
        let chunk = &input_f64[pos..pos + frames_needed];
        let result = resampler
            .process(&[chunk], None)
            .context("Resampler error")?;
        output.extend_from_slice(&result[0]);
        pos += frames_needed;
    }

    if pos < input_f64.len() {
        let remaining = &input_f64[pos..];
        let result = resampler
            .process_partial(Some(&[remaining]), None)
            .context("Resampler partial error")?;
        output.extend_from_slice(&result[0]);
    }

    // Flush the delay line until the tail of the signal has come out.
    while output.len() < expected_len + delay {
        let result = resampler
            .process_partial::<&[f64]>(None, None)
            .context("Resampler flush error")?;
        if result[0].is_empty() {
            break;
        }
        output.extend_from_slice(&result[0]);
    }

    Ok(output
        .into_iter()
        .skip(delay)
        .take(expected_len)
        .map(|s| s as f32)
        .collect())
}
