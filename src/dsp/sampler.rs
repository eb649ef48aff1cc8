//! Sample playback: load a recorded sound once, fire one-shot players on demand.

use std::io::Cursor;
use std::sync::Arc;

use tracing::{debug, info};

use super::Connect;
use crate::error::{GraphError, LoadError};
use crate::graph::{resample_linear, AudioBuffer, AudioBufferSourceNode, AudioContext, AudioNode, GainNode};

/// Fixed output level of every sample unit.
pub const SAMPLE_OUTPUT_GAIN: f32 = 0.1;

/// Decode WAV or MP3 bytes into a buffer at the file's own rate.
///
/// `path` only labels errors. WAV is recognized by its RIFF header; anything
/// else is handed to the MP3 decoder when the `mp3` feature is on.
pub fn decode(path: &str, bytes: &[u8]) -> Result<AudioBuffer, LoadError> {
    if bytes.starts_with(b"RIFF") {
        return decode_wav(path, bytes);
    }
    #[cfg(feature = "mp3")]
    return decode_mp3(path, bytes);
    #[cfg(not(feature = "mp3"))]
    Err(LoadError::UnsupportedFormat { path: path.to_string() })
}

fn decode_wav(path: &str, bytes: &[u8]) -> Result<AudioBuffer, LoadError> {
    let decode_error = |e: hound::Error| LoadError::Decode {
        path: path.to_string(),
        reason: e.to_string(),
    };
    let reader = hound::WavReader::new(Cursor::new(bytes)).map_err(decode_error)?;
    let spec = reader.spec();
    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<_, _>>(),
        hound::SampleFormat::Int => {
            let scale = 2.0f32.powi(spec.bits_per_sample as i32 - 1);
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
        }
    }
    .map_err(decode_error)?;
    deinterleave(path, &interleaved, spec.channels as usize, spec.sample_rate as f64)
}

#[cfg(feature = "mp3")]
fn decode_mp3(path: &str, bytes: &[u8]) -> Result<AudioBuffer, LoadError> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(bytes));
    let mut interleaved = Vec::new();
    let mut channels = 0;
    let mut sample_rate = 0;
    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                channels = frame.channels;
                sample_rate = frame.sample_rate;
                interleaved.extend(frame.data.iter().map(|&s| s as f32 / 32768.0));
            }
            Err(minimp3::Error::Eof) => break,
            Err(minimp3::Error::SkippedData) => continue,
            Err(e) => {
                return Err(LoadError::Decode {
                    path: path.to_string(),
                    reason: format!("{e:?}"),
                });
            }
        }
    }
    if interleaved.is_empty() || channels == 0 || sample_rate <= 0 {
        return Err(LoadError::UnsupportedFormat { path: path.to_string() });
    }
    deinterleave(path, &interleaved, channels, sample_rate as f64)
}

fn deinterleave(path: &str, interleaved: &[f32], channels: usize, sample_rate: f64) -> Result<AudioBuffer, LoadError> {
    if channels == 0 || interleaved.len() < channels {
        return Err(LoadError::Empty { path: path.to_string() });
    }
    let mut data = vec![Vec::with_capacity(interleaved.len() / channels); channels];
    for frame in interleaved.chunks_exact(channels) {
        for (channel, &s) in data.iter_mut().zip(frame) {
            channel.push(s);
        }
    }
    AudioBuffer::from_channels(data, sample_rate).map_err(|e| LoadError::Decode {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(feature = "native")]
async fn fetch(path: &str) -> Result<Vec<u8>, LoadError> {
    #[cfg(feature = "http")]
    if path.starts_with("http://") || path.starts_with("https://") {
        let http_error = |source| LoadError::Http {
            path: path.to_string(),
            source,
        };
        let response = reqwest::get(path).await.and_then(|r| r.error_for_status()).map_err(http_error)?;
        return Ok(response.bytes().await.map_err(http_error)?.to_vec());
    }
    tokio::fs::read(path).await.map_err(|source| LoadError::Io {
        path: path.to_string(),
        source,
    })
}

/// A loaded sample and the gain stage its players feed.
#[derive(Debug)]
pub struct SampleUnit {
    context: AudioContext,
    output: GainNode,
    sample_buffer: Option<Arc<AudioBuffer>>,
    loaded: bool,
}

impl SampleUnit {
    pub fn new(context: &AudioContext) -> Self {
        let output = context.create_gain();
        output.gain().set_value_at_time(SAMPLE_OUTPUT_GAIN, 0.0);
        SampleUnit {
            context: context.clone(),
            output,
            sample_buffer: None,
            loaded: false,
        }
    }

    /// Read a file (or, with the `http` feature, a URL) and decode it.
    ///
    /// The unit reports unloaded from the moment the load starts, and stays
    /// that way if it fails.
    #[cfg(feature = "native")]
    pub async fn load(&mut self, path: &str) -> Result<&mut Self, LoadError> {
        self.loaded = false;
        let bytes = fetch(path).await?;
        self.load_bytes(path, &bytes)
    }

    /// Decode in-memory WAV or MP3 data, resampled to the context rate.
    ///
    /// A failed decode leaves the unit unloaded.
    pub fn load_bytes(&mut self, path: &str, bytes: &[u8]) -> Result<&mut Self, LoadError> {
        self.loaded = false;
        let decoded = decode(path, bytes)?;
        let buffer = if decoded.sample_rate() == self.context.sample_rate() {
            decoded
        } else {
            resample_linear(&decoded, self.context.sample_rate()).map_err(|e| LoadError::Decode {
                path: path.to_string(),
                reason: e.to_string(),
            })?
        };
        info!(
            path,
            frames = buffer.length(),
            channels = buffer.number_of_channels(),
            "sample loaded"
        );
        self.sample_buffer = Some(Arc::new(buffer));
        self.loaded = true;
        Ok(self)
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn sample_buffer(&self) -> Option<&Arc<AudioBuffer>> {
        self.sample_buffer.as_ref()
    }

    /// Start a one-shot player now. Returns `None` when nothing is loaded.
    pub fn play(&self) -> Option<AudioBufferSourceNode> {
        let Some(buffer) = self.sample_buffer.as_ref().filter(|_| self.loaded) else {
            debug!("play ignored: no sample loaded");
            return None;
        };
        let player = self.context.create_buffer_source();
        player.set_buffer(Arc::clone(buffer));
        player.connect(&self.output).ok()?;
        player.start(self.context.current_time());
        Some(player)
    }

    pub fn output(&self) -> &GainNode {
        &self.output
    }

    pub fn connect(&self, destination: &AudioNode) -> Result<(), GraphError> {
        self.output.connect(destination)
    }
}

impl Drop for SampleUnit {
    fn drop(&mut self) {
        self.output.remove();
    }
}

impl Connect for SampleUnit {
    fn connect(&mut self, destination: &AudioNode) -> Result<(), GraphError> {
        SampleUnit::connect(self, destination)
    }
}
