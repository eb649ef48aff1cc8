pub mod dsp;
pub mod error;
pub mod graph;

pub use crate::dsp::effect::{EffectNode, FilterEffect};
pub use crate::dsp::envelope::{Envelope, EnvelopeConfig, Phase};
pub use crate::dsp::filter::FilterType;
pub use crate::dsp::oscillator::Waveform;
pub use crate::dsp::reverb::{ReverbConfig, ReverbProcessor, ReverbState};
pub use crate::dsp::sampler::SampleUnit;
pub use crate::dsp::voice::{Voice, VoiceConfig};
pub use crate::dsp::{Connect, Gate, NoteEvent, Trigger};
pub use crate::error::Error;
pub use crate::graph::{AudioBuffer, AudioContext, AudioNode, OfflineAudioContext};

use wasm_bindgen::prelude::*;

/// The crate version, read from Cargo.toml at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// WASM-exposed: return the tonegraph version string.
#[wasm_bindgen]
pub fn core_version() -> String {
    VERSION.to_string()
}

/// WASM-exposed: synthesize a reverb impulse response.
///
/// `config` is a `{ reverbTime, seed? }` object. Returns interleaved stereo
/// f32 samples at `sample_rate`, ready to load into a host convolver.
#[wasm_bindgen]
pub fn render_reverb_impulse(config: JsValue, sample_rate: f64) -> std::result::Result<Vec<f32>, JsValue> {
    let config: ReverbConfig =
        serde_wasm_bindgen::from_value(config).map_err(|e| JsValue::from_str(&format!("{e}")))?;
    let ir = dsp::reverb::synthesize_impulse_response(sample_rate, &config)
        .map_err(|e| JsValue::from_str(&format!("{e}")))?;
    Ok(interleave(&ir))
}

/// WASM-exposed: the default reverb settings as a plain object.
#[wasm_bindgen]
pub fn default_reverb_config() -> std::result::Result<JsValue, JsValue> {
    serde_wasm_bindgen::to_value(&ReverbConfig::default()).map_err(|e| JsValue::from_str(&format!("{e}")))
}

fn interleave(buffer: &AudioBuffer) -> Vec<f32> {
    let channels = buffer.number_of_channels();
    let mut out = Vec::with_capacity(buffer.length() * channels);
    for i in 0..buffer.length() {
        for c in 0..channels {
            out.push(buffer.channel_data(c)[i]);
        }
    }
    out
}
