//! Isolated non-realtime rendering.

#[cfg(feature = "native")]
use std::future::Future;
use std::ops::Deref;
#[cfg(feature = "native")]
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(feature = "native")]
use std::sync::Arc;
#[cfg(feature = "native")]
use std::task::{Context, Poll};

#[cfg(feature = "native")]
use tokio::sync::oneshot;
use tracing::debug;

use super::{AudioBuffer, AudioContext, RENDER_QUANTUM};
use crate::error::{ConfigError, RenderError};

/// A context that renders a fixed number of frames as fast as possible.
///
/// It has its own clock starting at zero and shares nothing with any live
/// context. Build the graph through the dereferenced [`AudioContext`], then
/// render with [`render_blocking`](Self::render_blocking) or, with the
/// `native` feature, `start_rendering`.
#[derive(Debug)]
pub struct OfflineAudioContext {
    context: AudioContext,
    target: AudioBuffer,
}

impl Deref for OfflineAudioContext {
    type Target = AudioContext;

    fn deref(&self) -> &AudioContext {
        &self.context
    }
}

impl OfflineAudioContext {
    /// `channels` must be 1 or 2.
    pub fn new(channels: usize, length: usize, sample_rate: f64) -> Result<Self, ConfigError> {
        if !(1..=2).contains(&channels) {
            return Err(ConfigError::InvalidChannelCount(channels));
        }
        let context = AudioContext::new(sample_rate)?;
        let target = AudioBuffer::new(channels, length, sample_rate)?;
        Ok(OfflineAudioContext { context, target })
    }

    /// Frames that will be rendered.
    pub fn length(&self) -> usize {
        self.target.length()
    }

    pub fn number_of_channels(&self) -> usize {
        self.target.number_of_channels()
    }

    /// Render on the calling thread.
    pub fn render_blocking(self) -> Result<AudioBuffer, RenderError> {
        render(self.context, self.target, &AtomicBool::new(false))
    }

    /// Render in the background, returning a future that yields the buffer.
    #[cfg(feature = "native")]
    ///
    /// Uses the ambient tokio runtime's blocking pool when there is one and a
    /// dedicated thread otherwise. Dropping the returned job cancels the
    /// render at the next quantum boundary.
    pub fn start_rendering(self) -> RenderJob {
        let (sender, receiver) = oneshot::channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        let OfflineAudioContext { context, target } = self;

        let task = move || {
            let result = render(context, target, &flag);
            if sender.send(result).is_err() {
                debug!("offline render finished with no observer");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let _ = handle.spawn_blocking(task);
            }
            Err(_) => {
                let _ = std::thread::spawn(task);
            }
        }

        RenderJob { receiver, cancel }
    }
}

fn render(context: AudioContext, mut target: AudioBuffer, cancel: &AtomicBool) -> Result<AudioBuffer, RenderError> {
    let length = target.length();
    let channels = target.number_of_channels();
    debug!(frames = length, channels, sample_rate = context.sample_rate(), "offline render started");

    let mut written = 0;
    while written < length {
        if cancel.load(Ordering::Relaxed) {
            debug!(written, "offline render cancelled");
            return Err(RenderError::Cancelled);
        }
        let block = context.render_quantum();
        let n = (length - written).min(RENDER_QUANTUM);
        if channels == 1 {
            let out = &mut target.channel_data_mut(0)[written..written + n];
            for (i, s) in out.iter_mut().enumerate() {
                *s = 0.5 * (block[0][i] + block[1][i]);
            }
        } else {
            for (c, samples) in block.iter().enumerate() {
                target.channel_data_mut(c)[written..written + n].copy_from_slice(&samples[..n]);
            }
        }
        written += n;
    }

    debug!(frames = length, "offline render complete");
    Ok(target)
}

/// Completion handle of a background offline render.
#[cfg(feature = "native")]
#[derive(Debug)]
pub struct RenderJob {
    receiver: oneshot::Receiver<Result<AudioBuffer, RenderError>>,
    cancel: Arc<AtomicBool>,
}

#[cfg(feature = "native")]
impl RenderJob {
    /// Ask the render to stop; the job then resolves to `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

#[cfg(feature = "native")]
impl Future for RenderJob {
    type Output = Result<AudioBuffer, RenderError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RenderError::Aborted)))
    }
}

#[cfg(feature = "native")]
impl Drop for RenderJob {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::dsp::oscillator::Waveform;

    #[test]
    fn rejects_bad_shapes() {
        assert!(OfflineAudioContext::new(3, 100, 44100.0).is_err());
        assert!(OfflineAudioContext::new(2, 0, 44100.0).is_err());
        assert!(OfflineAudioContext::new(2, 100, -1.0).is_err());
    }

    #[test]
    fn renders_exact_length() {
        let offline = OfflineAudioContext::new(2, 1000, 8000.0).unwrap();
        let osc = offline.create_oscillator(Waveform::Sine);
        osc.connect(&offline.destination()).unwrap();
        osc.start(0.0);

        let buffer = offline.render_blocking().unwrap();
        assert_eq!(buffer.length(), 1000);
        assert_eq!(buffer.number_of_channels(), 2);
        assert!(buffer.channel_data(1).iter().any(|s| s.abs() > 0.5));
    }

    #[test]
    fn mono_target_downmixes() {
        let offline = OfflineAudioContext::new(1, 128, 8000.0).unwrap();
        let src = offline.create_buffer_source();
        let stereo = AudioBuffer::from_channels(vec![vec![1.0; 128], vec![0.0; 128]], 8000.0).unwrap();
        src.set_buffer(Arc::new(stereo));
        src.connect(&offline.destination()).unwrap();
        src.start(0.0);

        let buffer = offline.render_blocking().unwrap();
        assert!((buffer.channel_data(0)[5] - 0.5).abs() < 1e-6);
    }

    #[cfg(feature = "native")]
    #[tokio::test]
    async fn background_render_resolves() {
        let offline = OfflineAudioContext::new(2, 4410, 44100.0).unwrap();
        let osc = offline.create_oscillator(Waveform::Triangle);
        osc.connect(&offline.destination()).unwrap();
        osc.start(0.0);

        let buffer = offline.start_rendering().await.unwrap();
        assert_eq!(buffer.length(), 4410);
    }

    #[cfg(feature = "native")]
    #[test]
    fn render_without_runtime_uses_thread() {
        let offline = OfflineAudioContext::new(2, 256, 8000.0).unwrap();
        let job = offline.start_rendering();
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let buffer = runtime.block_on(job).unwrap();
        assert_eq!(buffer.length(), 256);
    }

    #[cfg(feature = "native")]
    #[test]
    fn cancelled_render_reports_cancel() {
        let offline = OfflineAudioContext::new(2, 8000 * 60, 8000.0).unwrap();
        let job = offline.start_rendering();
        job.cancel();
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        assert!(matches!(runtime.block_on(job), Err(RenderError::Cancelled)));
    }
}
