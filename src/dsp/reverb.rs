//! Convolution reverb with a synthesized impulse response.
//!
//! The impulse response is rendered offline: seeded white noise through a
//! 500 Hz highpass and a 5 kHz lowpass, gated by a fast attack and a release
//! of one third of the reverb time. The live chain is
//!
//! ```text
//! input → wet → pre-delay (30 ms) → convolver → output
//!           └─→ tap0 (1 ms) → tap1 (16 ms) → gain 0.2 → output
//! ```
//!
//! The early reflections are audible as soon as the processor is wired; the
//! convolver stays silent until an impulse response is installed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::effect::FilterEffect;
use super::filter::FilterType;
use super::voice::Voice;
use super::NoteEvent;
use crate::error::{ConfigError, Error, GraphError, RenderError};
use crate::graph::{frames_for, AudioBuffer, AudioContext, AudioNode, ConvolverNode, DelayNode, GainNode, OfflineAudioContext};

/// Delay ahead of the convolver, in seconds.
pub const PRE_DELAY: f64 = 0.03;
/// Number of early-reflection taps.
pub const EARLY_REFLECTION_TAPS: usize = 2;
/// Level of the early-reflection path.
pub const EARLY_REFLECTION_GAIN: f32 = 0.2;

const FIRST_TAP: f64 = 0.001;

const TAIL_HIGHPASS: f64 = 500.0;
const TAIL_LOWPASS: f64 = 5000.0;
const TAIL_Q: f64 = 1.0;
const TAIL_ATTACK: f64 = 0.0001;
const TAIL_DECAY: f64 = 0.1;
const TAIL_GATE: f64 = 0.001;
const TAIL_NOTE: NoteEvent = NoteEvent {
    value: None,
    frequency: 500.0,
    velocity: 1.0,
};

/// Reverb settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReverbConfig {
    /// Length of the impulse response in seconds.
    pub reverb_time: f64,
    /// Noise seed; unseeded tails differ on every render.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for ReverbConfig {
    fn default() -> Self {
        ReverbConfig {
            reverb_time: 2.0,
            seed: None,
        }
    }
}

impl ReverbConfig {
    pub fn new(reverb_time: f64) -> Self {
        ReverbConfig {
            reverb_time,
            seed: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reverb_time.is_finite() && self.reverb_time > 0.0 {
            Ok(())
        } else {
            Err(ConfigError::NonPositiveReverbTime(self.reverb_time))
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: ReverbConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

/// The offline graph that renders a reverb tail, together with the
/// components feeding it.
///
/// The graph holds a noise voice released 1 ms into the render, so the whole
/// tail is the voice's exponential release. The components stay alive until
/// the render has finished.
#[derive(Debug)]
pub struct ImpulseResponseRender {
    offline: OfflineAudioContext,
    noise: Voice,
    filters: [FilterEffect; 2],
}

impl ImpulseResponseRender {
    pub fn new(sample_rate: f64, config: &ReverbConfig) -> Result<Self, Error> {
        config.validate()?;
        let offline = OfflineAudioContext::new(2, frames_for(config.reverb_time, sample_rate).max(1), sample_rate)?;

        let mut noise = Voice::noise(&offline, 1.0)?;
        if let Some(seed) = config.seed {
            noise = noise.with_seed(seed);
        }
        noise.set_attack(TAIL_ATTACK)?;
        noise.set_decay(TAIL_DECAY)?;
        noise.set_release(config.reverb_time / 3.0)?;

        let mut highpass = FilterEffect::new(&offline, FilterType::Highpass, TAIL_HIGHPASS, TAIL_Q)?;
        let mut lowpass = FilterEffect::new(&offline, FilterType::Lowpass, TAIL_LOWPASS, TAIL_Q)?;
        noise.init_at(0.0)?;
        noise.connect(highpass.input())?;
        highpass.connect(lowpass.input())?;
        lowpass.connect(&offline.destination())?;

        noise.on_at(0.0, TAIL_NOTE);
        noise.off_at(TAIL_GATE);
        Ok(ImpulseResponseRender {
            offline,
            noise,
            filters: [highpass, lowpass],
        })
    }

    pub fn context(&self) -> &OfflineAudioContext {
        &self.offline
    }

    pub fn noise(&self) -> &Voice {
        &self.noise
    }

    /// The highpass and lowpass stages, in signal order.
    pub fn filters(&self) -> &[FilterEffect; 2] {
        &self.filters
    }

    /// Render on the calling thread.
    pub fn render_blocking(self) -> Result<AudioBuffer, RenderError> {
        let ImpulseResponseRender { offline, noise, filters } = self;
        let rendered = offline.render_blocking();
        drop((noise, filters));
        rendered
    }

    /// Render in the background.
    #[cfg(feature = "native")]
    pub async fn render(self) -> Result<AudioBuffer, RenderError> {
        let ImpulseResponseRender { offline, noise, filters } = self;
        let rendered = offline.start_rendering().await;
        drop((noise, filters));
        rendered
    }
}

/// Render an impulse response on the calling thread.
pub fn synthesize_impulse_response(sample_rate: f64, config: &ReverbConfig) -> Result<AudioBuffer, Error> {
    Ok(ImpulseResponseRender::new(sample_rate, config)?.render_blocking()?)
}

/// Render an impulse response in the background.
#[cfg(feature = "native")]
pub async fn render_impulse_response(sample_rate: f64, config: &ReverbConfig) -> Result<AudioBuffer, Error> {
    Ok(ImpulseResponseRender::new(sample_rate, config)?.render().await?)
}

/// A chain of delay taps followed by one gain stage.
#[derive(Debug)]
pub struct MultitapDelayLine {
    taps: Vec<DelayNode>,
    gain: GainNode,
}

impl MultitapDelayLine {
    /// `count` taps, tap `i` delaying by `first + i * spacing`, each able to
    /// reach `max_delay`.
    pub fn new(
        context: &AudioContext,
        count: usize,
        first: f64,
        spacing: f64,
        max_delay: f64,
        level: f32,
    ) -> Result<Self, Error> {
        if count == 0 {
            return Err(ConfigError::InvalidParameter {
                name: "tap count",
                value: 0.0,
            }
            .into());
        }
        let gain = context.create_gain();
        gain.gain().set_value_at_time(level, 0.0);

        let mut line = MultitapDelayLine {
            taps: Vec::with_capacity(count),
            gain,
        };
        for i in 0..count {
            let tap = context.create_delay(max_delay)?;
            tap.delay_time().set_value_at_time((first + i as f64 * spacing) as f32, 0.0);
            line.taps.push(tap);
            if let [.., previous, tap] = line.taps.as_slice() {
                previous.connect(tap)?;
            }
        }
        if let Some(last) = line.taps.last() {
            last.connect(&line.gain)?;
        }
        Ok(line)
    }

    pub fn input(&self) -> &AudioNode {
        &self.taps[0]
    }

    pub fn taps(&self) -> &[DelayNode] {
        &self.taps
    }

    pub fn delay_times(&self) -> Vec<f64> {
        self.taps.iter().map(|t| t.delay_time().value() as f64).collect()
    }

    pub fn output(&self) -> &GainNode {
        &self.gain
    }

    pub fn connect(&self, destination: &AudioNode) -> Result<(), GraphError> {
        self.gain.connect(destination)
    }
}

impl Drop for MultitapDelayLine {
    fn drop(&mut self) {
        for tap in &self.taps {
            tap.remove();
        }
        self.gain.remove();
    }
}

/// Where a reverb is in its setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReverbState {
    /// Wired, but the convolver has no impulse response.
    Unconfigured,
    Rendering,
    Ready,
}

/// Convolution reverb between a caller-supplied input and output node.
#[derive(Debug)]
pub struct ReverbProcessor {
    context: AudioContext,
    config: ReverbConfig,
    wet: GainNode,
    pre_delay: DelayNode,
    convolver: ConvolverNode,
    early: MultitapDelayLine,
    state: ReverbState,
}

impl ReverbProcessor {
    /// Wire the reverb between `input` and `output`. No impulse response yet.
    ///
    /// The nodes the reverb creates are removed when it is dropped; `input`
    /// and `output` belong to the caller and are left in place.
    pub fn new(context: &AudioContext, input: &AudioNode, output: &AudioNode, config: ReverbConfig) -> Result<Self, Error> {
        config.validate()?;
        let max_delay = config.reverb_time.max(PRE_DELAY);
        let early = MultitapDelayLine::new(
            context,
            EARLY_REFLECTION_TAPS,
            FIRST_TAP,
            PRE_DELAY / EARLY_REFLECTION_TAPS as f64,
            max_delay,
            EARLY_REFLECTION_GAIN,
        )?;
        let pre_delay = context.create_delay(max_delay)?;
        pre_delay.delay_time().set_value_at_time(PRE_DELAY as f32, 0.0);

        let reverb = ReverbProcessor {
            context: context.clone(),
            config,
            wet: context.create_gain(),
            pre_delay,
            convolver: context.create_convolver(),
            early,
            state: ReverbState::Unconfigured,
        };
        input.connect(&reverb.wet)?;
        reverb.wet.connect(&reverb.pre_delay)?;
        reverb.pre_delay.connect(&reverb.convolver)?;
        reverb.convolver.connect(output)?;
        reverb.wet.connect(reverb.early.input())?;
        reverb.early.connect(output)?;
        Ok(reverb)
    }

    /// Wire and render in one step.
    #[cfg(feature = "native")]
    pub async fn setup(
        context: &AudioContext,
        input: &AudioNode,
        output: &AudioNode,
        config: ReverbConfig,
    ) -> Result<Self, Error> {
        let mut reverb = ReverbProcessor::new(context, input, output, config)?;
        reverb.render().await?;
        Ok(reverb)
    }

    /// Render the impulse response in the background and install it.
    ///
    /// On failure the previous impulse response, if any, stays in place.
    #[cfg(feature = "native")]
    pub async fn render(&mut self) -> Result<(), Error> {
        let previous = self.state;
        self.state = ReverbState::Rendering;
        let rendered = render_impulse_response(self.context.sample_rate(), &self.config).await;
        self.finish(previous, rendered)
    }

    /// Render the impulse response on the calling thread and install it.
    pub fn render_blocking(&mut self) -> Result<(), Error> {
        let previous = self.state;
        self.state = ReverbState::Rendering;
        let rendered = synthesize_impulse_response(self.context.sample_rate(), &self.config);
        self.finish(previous, rendered)
    }

    fn finish(&mut self, previous: ReverbState, rendered: Result<AudioBuffer, Error>) -> Result<(), Error> {
        match rendered {
            Ok(ir) => {
                self.install(ir);
                Ok(())
            }
            Err(err) => {
                warn!(%err, "reverb impulse render failed");
                self.state = previous;
                Err(err)
            }
        }
    }

    /// Install an impulse response. Its partitions are built before the
    /// running graph is touched.
    pub fn install(&mut self, impulse_response: AudioBuffer) {
        info!(
            frames = impulse_response.length(),
            reverb_time = self.config.reverb_time,
            "reverb impulse response installed"
        );
        self.convolver.set_buffer(Arc::new(impulse_response));
        self.state = ReverbState::Ready;
    }

    pub fn state(&self) -> ReverbState {
        self.state
    }

    pub fn config(&self) -> &ReverbConfig {
        &self.config
    }

    pub fn wet(&self) -> &GainNode {
        &self.wet
    }

    pub fn pre_delay(&self) -> &DelayNode {
        &self.pre_delay
    }

    pub fn convolver(&self) -> &ConvolverNode {
        &self.convolver
    }

    pub fn early_reflections(&self) -> &MultitapDelayLine {
        &self.early
    }
}

impl Drop for ReverbProcessor {
    fn drop(&mut self) {
        self.wet.remove();
        self.pre_delay.remove();
        self.convolver.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rms(samples: &[f32]) -> f32 {
        (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
    }

    /// A context with a one-sample impulse feeding `input`, and the reverb's
    /// output going straight to the destination.
    fn impulse_rig(sample_rate: f64) -> (AudioContext, GainNode) {
        let ctx = AudioContext::new(sample_rate).unwrap();
        let input = ctx.create_gain();
        let mut click = vec![0.0; 8];
        click[0] = 1.0;
        let src = ctx.create_buffer_source();
        src.set_buffer(Arc::new(AudioBuffer::from_channels(vec![click], sample_rate).unwrap()));
        src.connect(&input).unwrap();
        src.start(0.0);
        (ctx, input)
    }

    #[test]
    fn config_validation() {
        assert!(ReverbConfig::new(0.0).validate().is_err());
        assert!(ReverbConfig::new(-1.0).validate().is_err());
        assert!(ReverbConfig::new(f64::INFINITY).validate().is_err());
        assert!(ReverbConfig::new(0.5).validate().is_ok());

        let config = ReverbConfig::from_json(r#"{"reverbTime": 1.5, "seed": 9}"#).unwrap();
        assert_eq!(config, ReverbConfig { reverb_time: 1.5, seed: Some(9) });
        assert!(ReverbConfig::from_json(r#"{"reverbTime": 0}"#).is_err());
        assert!(ReverbConfig::from_json("not json").is_err());
    }

    #[test]
    fn taps_follow_pre_delay_spacing() {
        let ctx = AudioContext::new(44100.0).unwrap();
        let input = ctx.create_gain();
        let reverb = ReverbProcessor::new(&ctx, &input, &ctx.destination(), ReverbConfig::default()).unwrap();
        let times = reverb.early_reflections().delay_times();
        assert_eq!(times.len(), 2);
        assert!((times[0] - 0.001).abs() < 1e-6);
        assert!((times[1] - 0.016).abs() < 1e-6);
        assert!((reverb.pre_delay().delay_time().value() - 0.03).abs() < 1e-6);
        assert!((reverb.early_reflections().output().gain().value() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn early_reflections_sound_before_impulse_response() {
        let (ctx, input) = impulse_rig(8000.0);
        let reverb = ReverbProcessor::new(&ctx, &input, &ctx.destination(), ReverbConfig::new(0.5)).unwrap();
        assert_eq!(reverb.state(), ReverbState::Unconfigured);
        assert!(reverb.convolver().buffer().is_none());

        let mut out = Vec::new();
        for _ in 0..4 {
            out.extend_from_slice(&ctx.render_quantum()[0]);
        }
        // 1 ms + 16 ms at 8 kHz lands the click at frame 136.
        let (at, peak) = out
            .iter()
            .enumerate()
            .fold((0, 0.0f32), |(i, m), (j, s)| if s.abs() > m { (j, s.abs()) } else { (i, m) });
        assert!((peak - 0.2).abs() < 0.02, "peak {peak}");
        assert!((135..=137).contains(&at), "peak at {at}");
    }

    #[test]
    fn impulse_response_shape() {
        let config = ReverbConfig { reverb_time: 0.5, seed: Some(1) };
        let ir = synthesize_impulse_response(8000.0, &config).unwrap();
        assert_eq!(ir.length(), 4000);
        assert_eq!(ir.number_of_channels(), 2);

        let left = ir.channel_data(0);
        let head = rms(&left[..1000]);
        let tail = rms(&left[3000..]);
        assert!(head > 0.0);
        assert!(tail < head, "tail {tail} not below head {head}");
        assert!(left.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn seeded_renders_repeat() {
        let config = ReverbConfig { reverb_time: 0.25, seed: Some(42) };
        let a = synthesize_impulse_response(8000.0, &config).unwrap();
        let b = synthesize_impulse_response(8000.0, &config).unwrap();
        assert_eq!(a.channel_data(0), b.channel_data(0));
        assert_eq!(a.channel_data(1), b.channel_data(1));
    }

    #[test]
    fn tail_graph_lives_until_rendered() {
        let config = ReverbConfig { reverb_time: 0.25, seed: Some(3) };
        let tail = ImpulseResponseRender::new(8000.0, &config).unwrap();
        // destination, voice (envelope, output, noise source), two filter stages
        assert_eq!(tail.context().node_count(), 1 + 3 + 2 * 3);
        assert_eq!(tail.noise().release(), 0.25 / 3.0);
        assert_eq!(tail.filters()[0].filter_type(), Some(FilterType::Highpass));
        let ir = tail.render_blocking().unwrap();
        assert!(ir.channel_data(0).iter().any(|s| s.abs() > 1e-3));
    }

    #[test]
    fn dropping_reverb_frees_its_nodes() {
        let (ctx, input) = impulse_rig(8000.0);
        let before = ctx.node_count();
        let config = ReverbConfig { reverb_time: 0.25, seed: Some(2) };
        let mut reverb = ReverbProcessor::new(&ctx, &input, &ctx.destination(), config).unwrap();
        reverb.render_blocking().unwrap();
        assert_eq!(reverb.state(), ReverbState::Ready);
        assert_eq!(ctx.node_count(), before + 6);

        drop(reverb);
        assert_eq!(ctx.node_count(), before);
        assert!(input.is_alive());
        assert!(ctx.destination().is_alive());
        for _ in 0..4 {
            assert_eq!(ctx.render_quantum()[0].iter().fold(0.0f32, |m, s| m.max(s.abs())), 0.0);
        }
    }

    #[test]
    fn invalid_reverb_time_is_rejected_before_wiring() {
        let ctx = AudioContext::new(44100.0).unwrap();
        let input = ctx.create_gain();
        let before = ctx.node_count();
        let result = ReverbProcessor::new(&ctx, &input, &ctx.destination(), ReverbConfig::new(0.0));
        assert!(matches!(result, Err(Error::InvalidConfig(ConfigError::NonPositiveReverbTime(_)))));
        assert_eq!(ctx.node_count(), before);
    }

    #[cfg(feature = "native")]
    #[tokio::test]
    async fn setup_installs_two_second_response() {
        let ctx = AudioContext::new(44100.0).unwrap();
        let input = ctx.create_gain();
        let reverb = ReverbProcessor::setup(&ctx, &input, &ctx.destination(), ReverbConfig::new(2.0))
            .await
            .unwrap();
        assert_eq!(reverb.state(), ReverbState::Ready);
        let ir = reverb.convolver().buffer().unwrap();
        assert_eq!(ir.length(), 88200);
        assert_eq!(ir.number_of_channels(), 2);
    }

    #[cfg(feature = "native")]
    #[tokio::test]
    async fn wet_path_adds_tail_once_ready() {
        let (ctx, input) = impulse_rig(8000.0);
        let config = ReverbConfig { reverb_time: 0.25, seed: Some(5) };
        let mut reverb = ReverbProcessor::new(&ctx, &input, &ctx.destination(), config).unwrap();
        reverb.render().await.unwrap();

        let mut out = Vec::new();
        for _ in 0..16 {
            out.extend_from_slice(&ctx.render_quantum()[0]);
        }
        // Past the early reflections only the convolved tail remains.
        assert!(out[400..].iter().any(|s| s.abs() > 1e-4));
    }
}
