//! Voice: a single note source (oscillator or looped noise) gated by an envelope.

use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::envelope::{Envelope, EnvelopeConfig};
use super::oscillator::Waveform;
use super::{Connect, Gate, Trigger};
use crate::error::{ConfigError, Error, GraphError};
use crate::graph::{frames_for, AudioBuffer, AudioBufferSourceNode, AudioContext, AudioNode, GainNode, OscillatorNode};

/// Output gain of a voice built with defaults.
pub const DEFAULT_GAIN: f32 = 0.1;
/// Default noise buffer length in seconds.
pub const DEFAULT_NOISE_LENGTH: f64 = 2.0;
/// End of the noise loop region in seconds.
const NOISE_LOOP_END: f64 = 2.0;
/// Partials stop this many release time constants after `off`.
const RELEASE_TAIL: f64 = 4.0;

/// Voice settings, readable from JSON with every field optional.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub waveform: Waveform,
    pub gain: f32,
    /// Detune in cents.
    pub detune: f64,
    pub envelope: EnvelopeConfig,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        VoiceConfig {
            waveform: Waveform::default(),
            gain: DEFAULT_GAIN,
            detune: 0.0,
            envelope: EnvelopeConfig::default(),
        }
    }
}

/// What drives a voice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Excitation {
    Oscillator(Waveform),
    /// Looped white noise of `length` seconds.
    Noise { length: f64, seed: Option<u64> },
}

#[derive(Debug)]
enum Partial {
    Oscillator(OscillatorNode),
    Noise(AudioBufferSourceNode),
}

impl Partial {
    fn node(&self) -> &AudioNode {
        match self {
            Partial::Oscillator(osc) => &**osc,
            Partial::Noise(src) => &**src,
        }
    }

    fn stop(&self, when: f64) {
        match self {
            Partial::Oscillator(osc) => osc.stop(when),
            Partial::Noise(src) => src.stop(when),
        }
    }

    fn clear_stop(&self) {
        match self {
            Partial::Oscillator(osc) => osc.clear_stop(),
            Partial::Noise(src) => src.clear_stop(),
        }
    }

    fn stop_time(&self) -> Option<f64> {
        match self {
            Partial::Oscillator(osc) => osc.stop_time(),
            Partial::Noise(src) => src.stop_time(),
        }
    }

    fn has_ended(&self) -> bool {
        match self {
            Partial::Oscillator(osc) => osc.has_ended(),
            Partial::Noise(src) => src.has_ended(),
        }
    }
}

/// Stereo white noise with samples uniform in [-1, 1).
pub fn white_noise(length: f64, sample_rate: f64, seed: Option<u64>) -> Result<AudioBuffer, ConfigError> {
    if !(length.is_finite() && length > 0.0) {
        return Err(ConfigError::NonPositiveDuration { name: "noise length", value: length });
    }
    let mut rng = match seed {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => unseeded_rng(),
    };
    let mut buffer = AudioBuffer::new(2, frames_for(length, sample_rate).max(1), sample_rate)?;
    for c in 0..2 {
        for s in buffer.channel_data_mut(c) {
            *s = rng.random_range(-1.0f32..1.0);
        }
    }
    Ok(buffer)
}

#[cfg(feature = "native")]
fn unseeded_rng() -> SmallRng {
    SmallRng::from_rng(&mut rand::rng())
}

/// Without an OS entropy source every call still gets its own stream.
#[cfg(not(feature = "native"))]
fn unseeded_rng() -> SmallRng {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT_SEED: AtomicU64 = AtomicU64::new(0x9e37_79b9_7f4a_7c15);
    SmallRng::seed_from_u64(NEXT_SEED.fetch_add(1, Ordering::Relaxed))
}

/// A note source shaped by an [`Envelope`], feeding one output gain.
///
/// The excitation runs continuously once started; silence comes from the
/// envelope alone. After `off` the partials are stopped four release time
/// constants later, and the next `on` brings them back.
#[derive(Debug)]
pub struct Voice {
    context: AudioContext,
    excitation: Excitation,
    noise: Option<Arc<AudioBuffer>>,
    value: Option<i32>,
    frequency: f64,
    detune: f64,
    envelope: Envelope,
    output: GainNode,
    partials: Vec<Partial>,
}

impl Voice {
    /// An oscillator voice.
    pub fn new(context: &AudioContext, waveform: Waveform, gain: f32) -> Result<Self, Error> {
        Voice::build(context, Excitation::Oscillator(waveform), gain, Envelope::new(context))
    }

    /// A noise voice with a two second loop.
    pub fn noise(context: &AudioContext, gain: f32) -> Result<Self, Error> {
        let excitation = Excitation::Noise { length: DEFAULT_NOISE_LENGTH, seed: None };
        Voice::build(context, excitation, gain, Envelope::new(context))
    }

    pub fn with_config(context: &AudioContext, config: &VoiceConfig) -> Result<Self, Error> {
        let envelope = Envelope::with_config(context, config.envelope)?;
        let mut voice = Voice::build(context, Excitation::Oscillator(config.waveform), config.gain, envelope)?;
        voice.detune = config.detune;
        Ok(voice)
    }

    fn build(context: &AudioContext, excitation: Excitation, gain: f32, envelope: Envelope) -> Result<Self, Error> {
        let output = context.create_gain();
        output.gain().set_value_at_time(gain, 0.0);
        let voice = Voice {
            context: context.clone(),
            excitation,
            noise: None,
            value: None,
            frequency: 440.0,
            detune: 0.0,
            envelope,
            output,
            partials: Vec::new(),
        };
        voice.envelope.connect(&voice.output)?;
        Ok(voice)
    }

    /// Seed the noise generator so renders are reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        if let Excitation::Noise { seed: slot, .. } = &mut self.excitation {
            *slot = Some(seed);
            self.noise = None;
        }
        self
    }

    pub fn excitation(&self) -> Excitation {
        self.excitation
    }

    /// Create and start the partials now.
    pub fn init(&mut self) -> Result<(), Error> {
        self.init_at(self.context.current_time())
    }

    /// Create and start the partials at `time`. Does nothing while live partials exist.
    pub fn init_at(&mut self, time: f64) -> Result<(), Error> {
        self.partials.retain(|p| !p.has_ended());
        if !self.partials.is_empty() {
            return Ok(());
        }

        let partial = match self.excitation {
            Excitation::Oscillator(waveform) => {
                let osc = self.context.create_oscillator(waveform);
                osc.frequency().set_value_at_time(self.frequency as f32, time);
                osc.detune().set_value_at_time(self.detune as f32, time);
                osc.start(time);
                Partial::Oscillator(osc)
            }
            Excitation::Noise { length, seed } => {
                let buffer = match &self.noise {
                    Some(buffer) => Arc::clone(buffer),
                    None => {
                        let buffer = Arc::new(white_noise(length, self.context.sample_rate(), seed)?);
                        self.noise = Some(Arc::clone(&buffer));
                        buffer
                    }
                };
                let src = self.context.create_buffer_source();
                src.set_buffer(buffer);
                src.set_loop(true);
                src.set_loop_bounds(0.0, NOISE_LOOP_END);
                src.start(time);
                Partial::Noise(src)
            }
        };
        self.partials.push(partial);
        if let Some(partial) = self.partials.last() {
            partial.node().connect(self.envelope.output())?;
        }
        debug!(time, excitation = ?self.excitation, "voice partials started");
        Ok(())
    }

    /// Start a note now.
    pub fn on(&mut self, trigger: impl Into<Trigger>) {
        self.on_at(self.context.current_time(), trigger);
    }

    /// Start a note at `time`, reviving stopped partials and cancelling a pending stop.
    pub fn on_at(&mut self, time: f64, trigger: impl Into<Trigger>) {
        let trigger = trigger.into();
        if let Some(frequency) = trigger.frequency() {
            self.frequency = frequency;
        }
        if trigger.value().is_some() {
            self.value = trigger.value();
        }

        // Partials whose stop time has passed are dead; a pending stop is dropped.
        let now = self.context.current_time();
        self.partials.retain(|p| !p.has_ended() && p.stop_time().is_none_or(|s| s > now));
        for partial in &self.partials {
            partial.clear_stop();
        }
        if let Err(err) = self.init_at(time) {
            debug!(%err, "voice could not create partials");
        }

        if trigger.frequency().is_some() {
            for partial in &self.partials {
                if let Partial::Oscillator(osc) = partial {
                    osc.frequency().set_value_at_time(self.frequency as f32, time);
                }
            }
        }
        self.envelope.on_at(time, trigger.velocity());
    }

    /// Release now.
    pub fn off(&mut self) {
        self.off_at(self.context.current_time());
    }

    /// Release at `time` and schedule the partials to stop once the tail has died.
    pub fn off_at(&mut self, time: f64) {
        self.envelope.off_at(time);
        let stop = time + self.envelope.release() * RELEASE_TAIL;
        for partial in &self.partials {
            partial.stop(stop);
        }
    }

    /// Identity of the last note that carried one.
    pub fn value(&self) -> Option<i32> {
        self.value
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn detune(&self) -> f64 {
        self.detune
    }

    /// Detune in cents, applied to running oscillators immediately.
    pub fn set_detune(&mut self, cents: f64) {
        self.detune = cents;
        for partial in &self.partials {
            if let Partial::Oscillator(osc) = partial {
                osc.detune().set_value_at_time(cents as f32, self.context.current_time());
            }
        }
    }

    /// Scheduled stop time of the partials, if any.
    pub fn stop_time(&self) -> Option<f64> {
        self.partials.iter().find_map(Partial::stop_time)
    }

    /// Whether any partial is still sounding or scheduled to.
    pub fn is_active(&self) -> bool {
        self.partials.iter().any(|p| !p.has_ended())
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn output(&self) -> &GainNode {
        &self.output
    }

    pub fn connect(&self, destination: &AudioNode) -> Result<(), GraphError> {
        self.output.connect(destination)
    }

    pub fn attack(&self) -> f64 {
        self.envelope.attack()
    }

    pub fn set_attack(&mut self, seconds: f64) -> Result<(), ConfigError> {
        self.envelope.set_attack(seconds)
    }

    pub fn decay(&self) -> f64 {
        self.envelope.decay()
    }

    pub fn set_decay(&mut self, seconds: f64) -> Result<(), ConfigError> {
        self.envelope.set_decay(seconds)
    }

    pub fn sustain(&self) -> f64 {
        self.envelope.sustain()
    }

    pub fn set_sustain(&mut self, level: f64) -> Result<(), ConfigError> {
        self.envelope.set_sustain(level)
    }

    pub fn release(&self) -> f64 {
        self.envelope.release()
    }

    pub fn set_release(&mut self, seconds: f64) -> Result<(), ConfigError> {
        self.envelope.set_release(seconds)
    }

    /// Noise buffer length in seconds.
    pub fn length(&self) -> Result<f64, ConfigError> {
        match self.excitation {
            Excitation::Noise { length, .. } => Ok(length),
            Excitation::Oscillator(_) => Err(ConfigError::NotANoiseVoice),
        }
    }

    /// Takes effect the next time partials are created.
    pub fn set_length(&mut self, seconds: f64) -> Result<(), ConfigError> {
        match &mut self.excitation {
            Excitation::Noise { length, .. } => {
                if !(seconds.is_finite() && seconds > 0.0) {
                    return Err(ConfigError::NonPositiveDuration { name: "noise length", value: seconds });
                }
                *length = seconds;
                self.noise = None;
                Ok(())
            }
            Excitation::Oscillator(_) => Err(ConfigError::NotANoiseVoice),
        }
    }
}

impl Drop for Voice {
    fn drop(&mut self) {
        for partial in &self.partials {
            partial.node().remove();
        }
        self.output.remove();
    }
}

impl Gate for Voice {
    fn on(&mut self, trigger: Trigger) {
        Voice::on(self, trigger);
    }

    fn off(&mut self) {
        Voice::off(self);
    }
}

impl Connect for Voice {
    fn connect(&mut self, destination: &AudioNode) -> Result<(), GraphError> {
        Voice::connect(self, destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::NoteEvent;
    use crate::graph::OfflineAudioContext;

    fn note(frequency: f64, velocity: f64) -> NoteEvent {
        NoteEvent { value: Some(69), frequency, velocity }
    }

    fn peak(buffer: &AudioBuffer, from: f64, to: f64) -> f32 {
        let sr = buffer.sample_rate();
        let (a, b) = (frames_for(from, sr), frames_for(to, sr).min(buffer.length()));
        buffer.channel_data(0)[a..b].iter().fold(0.0f32, |m, s| m.max(s.abs()))
    }

    #[test]
    fn defaults() {
        let ctx = AudioContext::new(44100.0).unwrap();
        let voice = Voice::new(&ctx, Waveform::default(), DEFAULT_GAIN).unwrap();
        assert_eq!(voice.excitation(), Excitation::Oscillator(Waveform::Sawtooth));
        assert!((voice.output().gain().value() - 0.1).abs() < 1e-6);
        assert!(!voice.is_active());
        assert!(matches!(voice.length(), Err(ConfigError::NotANoiseVoice)));
    }

    #[test]
    fn off_schedules_stop_after_four_releases() {
        let ctx = AudioContext::new(44100.0).unwrap();
        let mut voice = Voice::new(&ctx, Waveform::Sine, 0.5).unwrap();
        voice.set_release(0.3).unwrap();
        voice.init().unwrap();
        voice.on_at(0.0, note(440.0, 100.0));
        voice.off_at(0.5);
        let stop = voice.stop_time().unwrap();
        assert!((stop - 1.7).abs() < 1e-9, "stop at {stop}");
    }

    #[test]
    fn retrigger_before_stop_cancels_it() {
        let ctx = AudioContext::new(44100.0).unwrap();
        let mut voice = Voice::new(&ctx, Waveform::Sine, 0.5).unwrap();
        voice.on_at(0.0, note(440.0, 100.0));
        voice.off_at(0.1);
        assert!(voice.stop_time().is_some());
        voice.on_at(0.2, note(220.0, 100.0));
        assert_eq!(voice.stop_time(), None);
        assert_eq!(voice.frequency(), 220.0);
    }

    #[test]
    fn renders_note_and_releases_to_silence() {
        let offline = OfflineAudioContext::new(2, 44100, 44100.0).unwrap();
        let mut voice = Voice::new(&offline, Waveform::Square, 1.0).unwrap();
        voice.set_attack(0.005).unwrap();
        voice.set_decay(0.05).unwrap();
        voice.set_sustain(0.5).unwrap();
        voice.set_release(0.02).unwrap();
        voice.connect(&offline.destination()).unwrap();
        voice.on_at(0.0, note(440.0, 127.0));
        voice.off_at(0.4);

        let buffer = offline.render_blocking().unwrap();
        let sustained = peak(&buffer, 0.3, 0.4);
        assert!(sustained > 0.35 && sustained < 0.65, "sustain peak {sustained}");
        assert!(peak(&buffer, 0.6, 1.0) < 1e-3);
    }

    #[test]
    fn silent_before_first_trigger() {
        let offline = OfflineAudioContext::new(2, 4410, 44100.0).unwrap();
        let mut voice = Voice::new(&offline, Waveform::Square, 1.0).unwrap();
        voice.connect(&offline.destination()).unwrap();
        voice.init_at(0.0).unwrap();
        let buffer = offline.render_blocking().unwrap();
        assert_eq!(peak(&buffer, 0.0, 0.1), 0.0);
    }

    #[test]
    fn dropping_voice_frees_its_nodes() {
        let ctx = AudioContext::new(8000.0).unwrap();
        let before = ctx.node_count();
        {
            let mut voice = Voice::noise(&ctx, 1.0).unwrap().with_seed(1);
            voice.connect(&ctx.destination()).unwrap();
            voice.on_at(0.0, 100.0);
            ctx.render_quantum();
            assert_eq!(ctx.node_count(), before + 3);
        }
        assert_eq!(ctx.node_count(), before);
        assert_eq!(ctx.render_quantum()[0][0], 0.0);
    }

    #[test]
    fn detune_applies_from_current_time() {
        let ctx = AudioContext::new(8000.0).unwrap();
        let mut voice = Voice::new(&ctx, Waveform::Sine, 0.5).unwrap();
        voice.init_at(0.0).unwrap();
        for _ in 0..4 {
            ctx.render_quantum();
        }
        let now = ctx.current_time();
        voice.set_detune(50.0);
        let Partial::Oscillator(osc) = &voice.partials[0] else {
            panic!("oscillator voice without an oscillator partial");
        };
        assert_eq!(osc.detune().value_at(now / 2.0), 0.0);
        assert_eq!(osc.detune().value_at(now), 50.0);
        assert_eq!(voice.detune(), 50.0);
    }

    #[test]
    fn noise_length_and_seed() {
        let ctx = AudioContext::new(8000.0).unwrap();
        let mut voice = Voice::noise(&ctx, 1.0).unwrap().with_seed(7);
        assert_eq!(voice.length().unwrap(), 2.0);
        assert!(voice.set_length(0.0).is_err());
        voice.set_length(0.5).unwrap();
        assert_eq!(voice.length().unwrap(), 0.5);

        let a = white_noise(0.5, 8000.0, Some(7)).unwrap();
        let b = white_noise(0.5, 8000.0, Some(7)).unwrap();
        assert_eq!(a.length(), 4000);
        assert_eq!(a.channel_data(1), b.channel_data(1));
        assert!(a.channel_data(0).iter().all(|s| (-1.0..1.0).contains(s)));
    }

    #[test]
    fn noise_voice_sounds_after_on() {
        let offline = OfflineAudioContext::new(2, 8000, 8000.0).unwrap();
        let mut voice = Voice::noise(&offline, 1.0).unwrap().with_seed(3);
        voice.connect(&offline.destination()).unwrap();
        voice.on_at(0.0, 127.0);
        let buffer = offline.render_blocking().unwrap();
        assert!(peak(&buffer, 0.1, 1.0) > 0.5);
    }

    #[test]
    fn config_from_json() {
        let config: VoiceConfig =
            serde_json::from_str(r#"{"waveform": "square", "envelope": {"release": 0.4}}"#).unwrap();
        let ctx = AudioContext::new(44100.0).unwrap();
        let voice = Voice::with_config(&ctx, &config).unwrap();
        assert_eq!(voice.excitation(), Excitation::Oscillator(Waveform::Square));
        assert_eq!(voice.release(), 0.4);
        assert!((voice.output().gain().value() - DEFAULT_GAIN).abs() < 1e-6);
    }
}
