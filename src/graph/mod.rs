//! Audio graph backend.
//!
//! A small block-based signal graph in the shape of the WebAudio API: gain,
//! oscillator, biquad, delay, convolver and buffer-source nodes, automatable
//! parameters with sample-accurate scheduling, a host-driven live context and
//! an isolated offline context that renders into a buffer.

mod buffer;
mod context;
mod node;
mod offline;
mod param;

pub use buffer::{copy_from_channel, copy_to_channel, frames_for, resample_linear, AudioBuffer};
pub use context::AudioContext;
pub use node::{
    AudioBufferSourceNode, AudioNode, AudioParam, BiquadFilterNode, ConvolverNode, DelayNode,
    GainNode, OscillatorNode, PreparedResponse,
};
pub use offline::OfflineAudioContext;
#[cfg(feature = "native")]
pub use offline::RenderJob;

/// Frames processed per scheduling step.
pub const RENDER_QUANTUM: usize = 128;

pub(crate) type Block = [[f32; RENDER_QUANTUM]; 2];
