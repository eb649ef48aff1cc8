//! Convolution kernel: uniform partitioned overlap-add via FFT.
//!
//! The impulse response is cut into partitions of one block each and kept in
//! the frequency domain. Every incoming block is transformed once, pushed
//! into a frequency-domain delay line and multiplied against all partitions,
//! so the output carries no latency beyond the block itself.

use std::sync::Arc;

use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

use crate::graph::AudioBuffer;

const GAIN_CALIBRATION: f32 = 0.00125;
const GAIN_CALIBRATION_SAMPLE_RATE: f64 = 44100.0;
const MIN_POWER: f32 = 0.000125;

/// Scale applied to an impulse response when normalization is on.
///
/// Follows the WebAudio ConvolverNode rule so that synthesized and recorded
/// responses land at comparable loudness.
pub fn normalization_scale(buffer: &AudioBuffer) -> f32 {
    let channels = buffer.number_of_channels();
    let length = buffer.length();
    let power: f32 = (0..channels)
        .map(|c| buffer.channel_data(c).iter().map(|s| s * s).sum::<f32>())
        .sum();
    let mut power = (power / (channels * length) as f32).sqrt();
    if !power.is_finite() || power < MIN_POWER {
        power = MIN_POWER;
    }

    let mut scale = GAIN_CALIBRATION / power;
    scale *= (GAIN_CALIBRATION_SAMPLE_RATE / buffer.sample_rate()) as f32;
    scale
}

/// Frequency-domain state for one channel of the impulse response.
struct ChannelKernel {
    partitions: Vec<Vec<Complex32>>,
    /// Spectra of past input blocks, newest at `head`.
    history: Vec<Vec<Complex32>>,
    head: usize,
    overlap: Vec<f32>,
}

impl ChannelKernel {
    fn new(ir: &[f32], scale: f32, block: usize, fft: &Arc<dyn Fft<f32>>) -> Self {
        let size = block * 2;
        let partitions: Vec<Vec<Complex32>> = ir
            .chunks(block)
            .map(|chunk| {
                let mut spectrum = vec![Complex32::new(0.0, 0.0); size];
                for (slot, &s) in spectrum.iter_mut().zip(chunk) {
                    slot.re = s * scale;
                }
                fft.process(&mut spectrum);
                spectrum
            })
            .collect();
        let history = vec![vec![Complex32::new(0.0, 0.0); size]; partitions.len()];

        ChannelKernel {
            partitions,
            history,
            head: 0,
            overlap: vec![0.0; block],
        }
    }
}

/// Stereo partitioned convolver operating on fixed-size blocks.
pub struct Convolver {
    block: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    channels: Vec<ChannelKernel>,
    scratch: Vec<Complex32>,
    accum: Vec<Complex32>,
}

impl std::fmt::Debug for Convolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Convolver")
            .field("block", &self.block)
            .field("channels", &self.channels.len())
            .field(
                "partitions",
                &self.channels.first().map_or(0, |c| c.partitions.len()),
            )
            .finish()
    }
}

impl Convolver {
    /// Prepare `ir` for convolution in blocks of `block` frames.
    ///
    /// A mono response is applied to both channels; a response with more
    /// than two channels uses its first two.
    pub fn new(ir: &AudioBuffer, block: usize, normalize: bool) -> Self {
        let size = block * 2;
        let mut planner = FftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(size);
        let inverse = planner.plan_fft_inverse(size);

        let scale = if normalize { normalization_scale(ir) } else { 1.0 };
        let right = if ir.number_of_channels() > 1 { 1 } else { 0 };
        let channels = [0, right]
            .iter()
            .map(|&c| ChannelKernel::new(ir.channel_data(c), scale, block, &forward))
            .collect();

        Convolver {
            block,
            forward,
            inverse,
            channels,
            scratch: vec![Complex32::new(0.0, 0.0); size],
            accum: vec![Complex32::new(0.0, 0.0); size],
        }
    }

    /// Convolve one block per channel in place. Slices must be `block` long.
    pub fn process_block(&mut self, left: &mut [f32], right: &mut [f32]) {
        for (index, samples) in [left, right].into_iter().enumerate() {
            self.process_channel(index, samples);
        }
    }

    fn process_channel(&mut self, index: usize, samples: &mut [f32]) {
        let block = self.block;
        let size = block * 2;
        let kernel = &mut self.channels[index];
        let count = kernel.partitions.len();

        for (i, slot) in self.scratch.iter_mut().enumerate() {
            *slot = Complex32::new(if i < block { samples[i] } else { 0.0 }, 0.0);
        }
        self.forward.process(&mut self.scratch);

        kernel.head = (kernel.head + count - 1) % count;
        kernel.history[kernel.head].copy_from_slice(&self.scratch);

        self.accum.fill(Complex32::new(0.0, 0.0));
        for (k, partition) in kernel.partitions.iter().enumerate() {
            let past = &kernel.history[(kernel.head + k) % count];
            for ((acc, x), h) in self.accum.iter_mut().zip(past).zip(partition) {
                *acc += x * h;
            }
        }
        self.inverse.process(&mut self.accum);

        let norm = 1.0 / size as f32;
        for i in 0..block {
            samples[i] = self.accum[i].re * norm + kernel.overlap[i];
            kernel.overlap[i] = self.accum[i + block].re * norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct(signal: &[f32], ir: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0; signal.len()];
        for (n, slot) in out.iter_mut().enumerate() {
            for (k, &h) in ir.iter().enumerate().take(n + 1) {
                *slot += h * signal[n - k];
            }
        }
        out
    }

    #[test]
    fn matches_direct_convolution() {
        let ir: Vec<f32> = (0..300).map(|i| ((i * 7 % 13) as f32 - 6.0) / 10.0).collect();
        let signal: Vec<f32> = (0..512).map(|i| ((i * 5 % 11) as f32 - 5.0) / 8.0).collect();
        let buffer = AudioBuffer::from_channels(vec![ir.clone()], 44100.0).unwrap();

        let mut conv = Convolver::new(&buffer, 128, false);
        let mut got = Vec::new();
        for chunk in signal.chunks(128) {
            let mut l = chunk.to_vec();
            let mut r = chunk.to_vec();
            conv.process_block(&mut l, &mut r);
            got.extend_from_slice(&l);
        }

        let expected = direct(&signal, &ir);
        for (i, (a, b)) in got.iter().zip(&expected).enumerate() {
            assert!((a - b).abs() < 1e-3, "sample {i}: {a} vs {b}");
        }
    }

    #[test]
    fn stereo_ir_keeps_channels_apart() {
        let left = vec![1.0, 0.0, 0.0, 0.0];
        let right = vec![0.0, 0.5, 0.0, 0.0];
        let buffer = AudioBuffer::from_channels(vec![left, right], 44100.0).unwrap();

        let mut conv = Convolver::new(&buffer, 4, false);
        let mut l = vec![1.0, 0.0, 0.0, 0.0];
        let mut r = vec![1.0, 0.0, 0.0, 0.0];
        conv.process_block(&mut l, &mut r);

        assert!((l[0] - 1.0).abs() < 1e-5);
        assert!(r[0].abs() < 1e-5);
        assert!((r[1] - 0.5).abs() < 1e-5);
    }

    #[test]
    fn normalization_has_floor() {
        let silent = AudioBuffer::new(2, 100, 44100.0).unwrap();
        let scale = normalization_scale(&silent);
        assert!((scale - GAIN_CALIBRATION / MIN_POWER).abs() < 1e-3);
    }
}
