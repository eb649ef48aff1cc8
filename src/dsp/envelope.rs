//! ADSR amplitude envelope driven by scheduled exponential approaches.
//!
//! The envelope owns one gain node and never touches samples itself: every
//! trigger is turned into absolute-time automation on that node's gain, so
//! the render thread only ever evaluates a schedule.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Trigger;
use crate::error::{ConfigError, GraphError};
use crate::graph::{AudioContext, AudioNode, GainNode};

/// Offset added to every duration used as a time constant.
pub const EPSILON: f64 = 0.00001;

/// Number of time constants after which a ramp counts as settled.
const SETTLE_TIME_CONSTANTS: f64 = 5.0;

/// Envelope timing and level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvelopeConfig {
    /// Attack time constant in seconds.
    pub attack: f64,
    /// Decay time constant in seconds.
    pub decay: f64,
    /// Target level reached after the decay, before velocity scaling.
    pub sustain: f64,
    /// Release time constant in seconds.
    pub release: f64,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        EnvelopeConfig {
            attack: 0.001,
            decay: 0.001,
            sustain: 1.0,
            release: 0.001,
        }
    }
}

impl EnvelopeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_duration("attack", self.attack)?;
        check_duration("decay", self.decay)?;
        check_level("sustain", self.sustain)?;
        check_duration("release", self.release)
    }
}

fn check_duration(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NonPositiveDuration { name, value })
    }
}

fn check_level(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidLevel { name, value })
    }
}

/// Envelope lifecycle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Attack,
    Decay,
    Sustain,
    Release,
}

/// Amplitude envelope owning a single gain stage.
///
/// The envelope is level-driven: `on` and `off` always start from whatever
/// level the gain actually has at the trigger time, so re-triggering at any
/// point is well-defined.
#[derive(Debug)]
pub struct Envelope {
    context: AudioContext,
    output: GainNode,
    config: EnvelopeConfig,
    velocity: f64,
    released_level: Option<f32>,
    on_time: Option<f64>,
    off_time: Option<f64>,
}

impl Envelope {
    /// A silent envelope with default timing.
    pub fn new(context: &AudioContext) -> Self {
        let output = context.create_gain();
        output.gain().set_value_at_time(0.0, 0.0);
        Envelope {
            context: context.clone(),
            output,
            config: EnvelopeConfig::default(),
            velocity: 0.0,
            released_level: None,
            on_time: None,
            off_time: None,
        }
    }

    pub fn with_config(context: &AudioContext, config: EnvelopeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut envelope = Envelope::new(context);
        envelope.config = config;
        Ok(envelope)
    }

    /// The gain stage; route the signal to be shaped into it.
    pub fn output(&self) -> &GainNode {
        &self.output
    }

    pub fn connect(&self, destination: &AudioNode) -> Result<(), GraphError> {
        self.output.connect(destination)
    }

    /// Trigger now with a MIDI-style velocity in 0..=127.
    pub fn on(&mut self, velocity: f64) {
        self.on_at(self.context.current_time(), velocity);
    }

    /// Trigger at absolute `time` on the owning context's clock.
    pub fn on_at(&mut self, time: f64, velocity: f64) {
        let EnvelopeConfig { attack, decay, sustain, .. } = self.config;
        self.velocity = (velocity / 127.0).clamp(0.0, 1.0);

        let gain = self.output.gain();
        let level = gain.value_at(time);
        gain.cancel_scheduled_values(time)
            .set_value_at_time(level, time)
            .set_target_at_time(1.0, time, attack + EPSILON)
            .set_target_at_time((sustain * self.velocity) as f32, time + attack, decay + EPSILON);

        debug!(time, velocity = self.velocity, from = level, "envelope on");
        self.on_time = Some(time);
        self.off_time = None;
        self.released_level = None;
    }

    /// Release now.
    pub fn off(&mut self) {
        self.off_at(self.context.current_time());
    }

    /// Release at absolute `time`, starting from the level the gain has then.
    pub fn off_at(&mut self, time: f64) {
        let gain = self.output.gain();
        let level = gain.value_at(time);
        gain.cancel_scheduled_values(time)
            .set_value_at_time(level, time)
            .set_target_at_time(0.0, time, self.config.release + EPSILON);

        debug!(time, from = level, "envelope off");
        self.released_level = Some(level);
        self.off_time = Some(time);
    }

    /// The instantaneous gain at the context's current time.
    pub fn level(&self) -> f32 {
        self.output.gain().value()
    }

    /// The level captured by the most recent release, if any.
    pub fn released_level(&self) -> Option<f32> {
        self.released_level
    }

    /// Trigger velocity normalized to [0, 1].
    pub fn velocity(&self) -> f64 {
        self.velocity
    }

    pub fn phase(&self) -> Phase {
        self.phase_at(self.context.current_time())
    }

    /// The phase the envelope is in at `time`, derived from its last triggers.
    pub fn phase_at(&self, time: f64) -> Phase {
        let EnvelopeConfig { attack, decay, release, .. } = self.config;
        if let Some(off) = self.off_time.filter(|&t| time >= t) {
            return if time - off < SETTLE_TIME_CONSTANTS * (release + EPSILON) {
                Phase::Release
            } else {
                Phase::Idle
            };
        }
        match self.on_time {
            Some(on) if time >= on => {
                let elapsed = time - on;
                if elapsed < attack {
                    Phase::Attack
                } else if elapsed < attack + SETTLE_TIME_CONSTANTS * (decay + EPSILON) {
                    Phase::Decay
                } else {
                    Phase::Sustain
                }
            }
            _ => Phase::Idle,
        }
    }

    pub fn config(&self) -> EnvelopeConfig {
        self.config
    }

    pub fn attack(&self) -> f64 {
        self.config.attack
    }

    pub fn set_attack(&mut self, seconds: f64) -> Result<(), ConfigError> {
        check_duration("attack", seconds)?;
        self.config.attack = seconds;
        Ok(())
    }

    pub fn decay(&self) -> f64 {
        self.config.decay
    }

    pub fn set_decay(&mut self, seconds: f64) -> Result<(), ConfigError> {
        check_duration("decay", seconds)?;
        self.config.decay = seconds;
        Ok(())
    }

    /// The sustain target level (not a duration).
    pub fn sustain(&self) -> f64 {
        self.config.sustain
    }

    pub fn set_sustain(&mut self, level: f64) -> Result<(), ConfigError> {
        check_level("sustain", level)?;
        self.config.sustain = level;
        Ok(())
    }

    pub fn release(&self) -> f64 {
        self.config.release
    }

    pub fn set_release(&mut self, seconds: f64) -> Result<(), ConfigError> {
        check_duration("release", seconds)?;
        self.config.release = seconds;
        Ok(())
    }
}

impl Drop for Envelope {
    fn drop(&mut self) {
        self.output.remove();
    }
}

impl super::Gate for Envelope {
    fn on(&mut self, trigger: Trigger) {
        Envelope::on(self, trigger.velocity());
    }

    fn off(&mut self) {
        Envelope::off(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(attack: f64, decay: f64, sustain: f64, release: f64) -> Envelope {
        let ctx = AudioContext::new(44100.0).unwrap();
        Envelope::with_config(&ctx, EnvelopeConfig { attack, decay, sustain, release }).unwrap()
    }

    #[test]
    fn drop_removes_gain_stage() {
        let ctx = AudioContext::new(8000.0).unwrap();
        let env = Envelope::new(&ctx);
        let stage = env.output().clone();
        assert_eq!(ctx.node_count(), 2);
        drop(env);
        assert_eq!(ctx.node_count(), 1);
        assert!(!stage.is_alive());
    }

    #[test]
    fn starts_idle_and_silent() {
        let env = envelope(0.01, 0.1, 0.5, 0.2);
        assert_eq!(env.phase(), Phase::Idle);
        assert_eq!(env.level(), 0.0);
    }

    #[test]
    fn rejects_non_positive_durations() {
        let ctx = AudioContext::new(44100.0).unwrap();
        let bad = EnvelopeConfig { attack: 0.0, ..EnvelopeConfig::default() };
        assert!(Envelope::with_config(&ctx, bad).is_err());

        let mut env = Envelope::new(&ctx);
        assert!(env.set_release(-1.0).is_err());
        assert!(env.set_decay(f64::NAN).is_err());
        assert!(env.set_sustain(-0.1).is_err());
        assert!(env.set_sustain(0.0).is_ok());
    }

    #[test]
    fn attack_rises_then_settles_at_scaled_sustain() {
        let mut env = envelope(0.01, 0.2, 0.5, 0.3);
        env.on_at(0.0, 100.0);
        let gain = env.output().gain();

        let early = gain.value_at(0.005);
        let at_peak = gain.value_at(0.01);
        assert!(early > 0.0 && early < at_peak, "{early} then {at_peak}");

        let settled = gain.value_at(0.01 + 5.0 * 0.2);
        let target = 0.5 * 100.0 / 127.0;
        assert!((settled as f64 - target).abs() < 0.01, "settled at {settled}, want {target}");
    }

    #[test]
    fn release_starts_from_actual_level() {
        let mut env = envelope(0.01, 0.2, 0.5, 0.3);
        env.on_at(0.0, 127.0);
        let before = env.output().gain().value_at(0.05);
        env.off_at(0.05);
        let gain = env.output().gain();

        assert_eq!(env.released_level(), Some(before));
        assert!((gain.value_at(0.05) - before).abs() < 1e-6);
        // One release time constant later the level has dropped by 1/e.
        let later = gain.value_at(0.05 + 0.3 + EPSILON);
        let expected = before * (-1.0f32).exp();
        assert!((later - expected).abs() < 1e-3, "{later} vs {expected}");
    }

    #[test]
    fn off_never_jumps_or_goes_negative() {
        let sample: f64 = 1.0 / 44100.0;
        for &t in &[0.0, 0.00005, 0.003, 0.02, 0.15, 1.0] {
            let mut env = envelope(0.005, 0.05, 0.6, 0.1);
            env.on_at(0.0, 90.0);
            let before = env.output().gain().value_at((t - sample).max(0.0));
            env.off_at(t);
            let gain = env.output().gain();
            let at = gain.value_at(t);
            let after = gain.value_at(t + sample);
            assert!(at >= 0.0 && after >= 0.0);
            assert!((at - before).abs() < 0.05, "jump at {t}: {before} -> {at}");
            assert!(after <= at + 1e-6);
        }
    }

    #[test]
    fn velocity_scales_monotonically() {
        let settled = |velocity: f64| {
            let mut env = envelope(0.01, 0.05, 0.8, 0.1);
            env.on_at(0.0, velocity);
            env.output().gain().value_at(2.0)
        };
        let mut previous = settled(0.0);
        for v in (8..=127).step_by(8) {
            let level = settled(v as f64);
            assert!(level >= previous, "velocity {v}: {level} < {previous}");
            previous = level;
        }
    }

    #[test]
    fn double_off_does_not_raise_level() {
        let mut env = envelope(0.01, 0.1, 0.7, 0.2);
        env.on_at(0.0, 127.0);
        env.off_at(0.5);
        let first = env.released_level().unwrap();
        env.off_at(0.6);
        let second = env.released_level().unwrap();
        assert!(second <= first);
        assert!(env.output().gain().value_at(0.6) <= first);
    }

    #[test]
    fn retrigger_continues_from_current_level() {
        let mut env = envelope(0.05, 0.1, 0.5, 0.5);
        env.on_at(0.0, 127.0);
        env.off_at(1.0);
        let mid_release = env.output().gain().value_at(1.1);
        env.on_at(1.1, 127.0);
        let resumed = env.output().gain().value_at(1.1);
        assert!((resumed - mid_release).abs() < 1e-6);
        assert!(env.output().gain().value_at(1.12) > resumed);
    }

    #[test]
    fn phases_follow_triggers() {
        let mut env = envelope(0.01, 0.02, 0.5, 0.05);
        env.on_at(0.0, 100.0);
        assert_eq!(env.phase_at(0.005), Phase::Attack);
        assert_eq!(env.phase_at(0.02), Phase::Decay);
        assert_eq!(env.phase_at(0.5), Phase::Sustain);
        env.off_at(1.0);
        assert_eq!(env.phase_at(0.5), Phase::Sustain);
        assert_eq!(env.phase_at(1.1), Phase::Release);
        assert_eq!(env.phase_at(2.0), Phase::Idle);
    }

    #[test]
    fn config_reads_partial_json() {
        let config: EnvelopeConfig = serde_json::from_str(r#"{"attack": 0.2, "sustain": 0.4}"#).unwrap();
        assert_eq!(config.attack, 0.2);
        assert_eq!(config.sustain, 0.4);
        assert_eq!(config.release, EnvelopeConfig::default().release);
    }
}
