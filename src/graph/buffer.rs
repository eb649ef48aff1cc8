//! Multichannel sample buffers and the free functions that operate on them.

use crate::error::ConfigError;

/// A block of planar `f32` audio at a fixed sample rate.
///
/// Buffers are filled once and then shared read-only (usually behind an
/// `Arc`) by every node that plays or convolves them.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    channels: Vec<Vec<f32>>,
    sample_rate: f64,
}

impl AudioBuffer {
    /// Allocate a silent buffer of `length` frames per channel.
    pub fn new(channels: usize, length: usize, sample_rate: f64) -> Result<Self, ConfigError> {
        if channels == 0 {
            return Err(ConfigError::InvalidChannelCount(channels));
        }
        if length == 0 {
            return Err(ConfigError::ZeroLength);
        }
        check_sample_rate(sample_rate)?;
        Ok(AudioBuffer {
            channels: vec![vec![0.0; length]; channels],
            sample_rate,
        })
    }

    /// Wrap already-decoded planar data. All channels must have equal length.
    pub fn from_channels(channels: Vec<Vec<f32>>, sample_rate: f64) -> Result<Self, ConfigError> {
        check_sample_rate(sample_rate)?;
        let length = channels.first().map_or(0, Vec::len);
        if channels.is_empty() || channels.iter().any(|c| c.len() != length) {
            return Err(ConfigError::InvalidChannelCount(channels.len()));
        }
        if length == 0 {
            return Err(ConfigError::ZeroLength);
        }
        Ok(AudioBuffer { channels, sample_rate })
    }

    pub fn number_of_channels(&self) -> usize {
        self.channels.len()
    }

    /// Frames per channel.
    pub fn length(&self) -> usize {
        self.channels[0].len()
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        self.length() as f64 / self.sample_rate
    }

    pub fn channel_data(&self, channel: usize) -> &[f32] {
        &self.channels[channel]
    }

    pub fn channel_data_mut(&mut self, channel: usize) -> &mut [f32] {
        &mut self.channels[channel]
    }

    /// Read one frame as a stereo pair. Mono buffers feed both sides.
    #[inline]
    pub(crate) fn frame(&self, index: usize) -> (f32, f32) {
        let left = self.channels[0][index];
        let right = self.channels.get(1).map_or(left, |c| c[index]);
        (left, right)
    }
}

fn check_sample_rate(sample_rate: f64) -> Result<(), ConfigError> {
    if sample_rate.is_finite() && sample_rate > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidSampleRate(sample_rate))
    }
}

/// Number of whole frames covering `seconds` at `sample_rate`.
///
/// Rounds to the nearest frame so products such as `2.0 * 44100.0` are
/// exact even when the float multiplication lands a hair below.
pub fn frames_for(seconds: f64, sample_rate: f64) -> usize {
    (seconds * sample_rate).round().max(0.0) as usize
}

/// Copy `source` into `channel` of `buffer`, truncating to the buffer length.
pub fn copy_to_channel(buffer: &mut AudioBuffer, source: &[f32], channel: usize) {
    let dest = buffer.channel_data_mut(channel);
    let n = dest.len().min(source.len());
    dest[..n].copy_from_slice(&source[..n]);
}

/// Copy `channel` of `buffer` into `dest`, truncating to whichever is shorter.
pub fn copy_from_channel(buffer: &AudioBuffer, dest: &mut [f32], channel: usize) {
    let source = buffer.channel_data(channel);
    let n = dest.len().min(source.len());
    dest[..n].copy_from_slice(&source[..n]);
}

/// Read a sample with linear interpolation at a fractional position.
fn read_interpolated(data: &[f32], position: f64) -> f32 {
    if data.is_empty() || position < 0.0 {
        return 0.0;
    }

    let idx = position as usize;
    if idx >= data.len() - 1 {
        return data.get(idx).copied().unwrap_or(0.0);
    }

    let frac = (position - idx as f64) as f32;
    data[idx] * (1.0 - frac) + data[idx + 1] * frac
}

/// Convert `buffer` to `target_rate` using linear interpolation.
///
/// Returns a clone when the rates already match.
pub fn resample_linear(buffer: &AudioBuffer, target_rate: f64) -> Result<AudioBuffer, ConfigError> {
    check_sample_rate(target_rate)?;
    if (buffer.sample_rate - target_rate).abs() < f64::EPSILON {
        return Ok(buffer.clone());
    }

    let ratio = buffer.sample_rate / target_rate;
    let length = frames_for(buffer.duration(), target_rate).max(1);
    let channels = buffer
        .channels
        .iter()
        .map(|data| {
            (0..length)
                .map(|i| read_interpolated(data, i as f64 * ratio))
                .collect()
        })
        .collect();

    AudioBuffer::from_channels(channels, target_rate)
}
