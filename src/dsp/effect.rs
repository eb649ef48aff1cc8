//! Insert effects: a fixed input → effect → output chain with re-targetable output.

use tracing::debug;

use super::filter::FilterType;
use super::Connect;
use crate::error::{ConfigError, Error, GraphError};
use crate::graph::{AudioContext, AudioNode, BiquadFilterNode, GainNode};

/// Default cutoff of [`FilterEffect::default_lowpass`].
pub const DEFAULT_CUTOFF: f64 = 1000.0;
/// Default resonance of [`FilterEffect::default_lowpass`].
pub const DEFAULT_RESONANCE: f64 = 0.9;

/// A processing stage with stable input and output points.
///
/// Upstream code connects into [`input`](Self::input) and never needs to
/// know what the stage does. The output is connected to at most one
/// destination at a time: connecting again moves it.
#[derive(Debug)]
pub struct EffectNode {
    name: &'static str,
    input: GainNode,
    effect: Option<AudioNode>,
    output: GainNode,
    destination: Option<AudioNode>,
}

impl EffectNode {
    /// A stage whose effect is a unity gain node.
    pub fn new(context: &AudioContext) -> Result<Self, Error> {
        let effect = context.create_gain();
        EffectNode::with_effect(context, "effect", &effect)
    }

    /// A stage with no effect node: input feeds output directly.
    pub fn passthrough(context: &AudioContext) -> Result<Self, Error> {
        let stage = EffectNode::bare(context, "passthrough");
        stage.input.connect(&stage.output)?;
        Ok(stage)
    }

    /// Wrap `effect` between a fresh input and output gain.
    ///
    /// The stage takes over `effect`: it is removed from the graph together
    /// with the stage.
    pub fn with_effect(context: &AudioContext, name: &'static str, effect: &AudioNode) -> Result<Self, Error> {
        let mut stage = EffectNode::bare(context, name);
        stage.input.connect(effect)?;
        effect.connect(&stage.output)?;
        stage.effect = Some(effect.clone());
        Ok(stage)
    }

    fn bare(context: &AudioContext, name: &'static str) -> Self {
        EffectNode {
            name,
            input: context.create_gain(),
            effect: None,
            output: context.create_gain(),
            destination: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn input(&self) -> &AudioNode {
        &self.input
    }

    pub fn output(&self) -> &AudioNode {
        &self.output
    }

    pub fn effect(&self) -> Option<&AudioNode> {
        self.effect.as_ref()
    }

    /// The node the output currently feeds.
    pub fn destination(&self) -> Option<&AudioNode> {
        self.destination.as_ref()
    }

    /// Route the output to `destination`, dropping the previous route.
    pub fn connect(&mut self, destination: &AudioNode) -> Result<(), GraphError> {
        self.output.connect(destination)?;
        if let Some(previous) = self.destination.take() {
            if previous != *destination {
                self.output.disconnect(&previous);
            }
        }
        debug!(effect = self.name, "output re-targeted");
        self.destination = Some(destination.clone());
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if let Some(previous) = self.destination.take() {
            self.output.disconnect(&previous);
        }
    }
}

impl Drop for EffectNode {
    fn drop(&mut self) {
        self.input.remove();
        if let Some(effect) = &self.effect {
            effect.remove();
        }
        self.output.remove();
    }
}

impl Connect for EffectNode {
    fn connect(&mut self, destination: &AudioNode) -> Result<(), GraphError> {
        EffectNode::connect(self, destination)
    }
}

/// An [`EffectNode`] whose effect is a single biquad filter.
#[derive(Debug)]
pub struct FilterEffect {
    context: AudioContext,
    stage: EffectNode,
    filter: BiquadFilterNode,
}

impl FilterEffect {
    /// `cutoff` in Hz; `resonance` is the filter's Q.
    pub fn new(context: &AudioContext, filter_type: FilterType, cutoff: f64, resonance: f64) -> Result<Self, Error> {
        check_cutoff(cutoff)?;
        check_resonance(resonance)?;
        let filter = context.create_biquad_filter(filter_type);
        filter.frequency().set_value_at_time(cutoff as f32, 0.0);
        filter.q().set_value_at_time(resonance as f32, 0.0);
        let stage = EffectNode::with_effect(context, "filter", &filter)?;
        Ok(FilterEffect {
            context: context.clone(),
            stage,
            filter,
        })
    }

    /// A lowpass at 1 kHz with Q 0.9.
    pub fn default_lowpass(context: &AudioContext) -> Result<Self, Error> {
        FilterEffect::new(context, FilterType::Lowpass, DEFAULT_CUTOFF, DEFAULT_RESONANCE)
    }

    pub fn input(&self) -> &AudioNode {
        self.stage.input()
    }

    pub fn output(&self) -> &AudioNode {
        self.stage.output()
    }

    pub fn filter(&self) -> &BiquadFilterNode {
        &self.filter
    }

    pub fn filter_type(&self) -> Option<FilterType> {
        self.filter.filter_type()
    }

    pub fn set_filter_type(&self, filter_type: FilterType) {
        self.filter.set_type(filter_type);
    }

    pub fn cutoff(&self) -> f64 {
        self.filter.frequency().value() as f64
    }

    /// Change the cutoff from the current time on.
    pub fn set_cutoff(&self, cutoff: f64) -> Result<(), ConfigError> {
        check_cutoff(cutoff)?;
        self.filter
            .frequency()
            .set_value_at_time(cutoff as f32, self.context.current_time());
        Ok(())
    }

    pub fn resonance(&self) -> f64 {
        self.filter.q().value() as f64
    }

    pub fn set_resonance(&self, resonance: f64) -> Result<(), ConfigError> {
        check_resonance(resonance)?;
        self.filter
            .q()
            .set_value_at_time(resonance as f32, self.context.current_time());
        Ok(())
    }

    pub fn connect(&mut self, destination: &AudioNode) -> Result<(), GraphError> {
        self.stage.connect(destination)
    }
}

impl Connect for FilterEffect {
    fn connect(&mut self, destination: &AudioNode) -> Result<(), GraphError> {
        self.stage.connect(destination)
    }
}

fn check_cutoff(cutoff: f64) -> Result<(), ConfigError> {
    if cutoff.is_finite() && cutoff > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidParameter { name: "cutoff", value: cutoff })
    }
}

fn check_resonance(resonance: f64) -> Result<(), ConfigError> {
    if resonance.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::InvalidParameter { name: "resonance", value: resonance })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::oscillator::Waveform;

    fn peak(ctx: &AudioContext, quanta: usize) -> f32 {
        let mut peak = 0.0f32;
        for _ in 0..quanta {
            let block = ctx.render_quantum();
            peak = block[0].iter().fold(peak, |p, s| p.max(s.abs()));
        }
        peak
    }

    #[test]
    fn passthrough_carries_signal() {
        let ctx = AudioContext::new(8000.0).unwrap();
        let osc = ctx.create_oscillator(Waveform::Square);
        let mut stage = EffectNode::new(&ctx).unwrap();
        osc.connect(stage.input()).unwrap();
        stage.connect(&ctx.destination()).unwrap();
        osc.start(0.0);
        assert!(peak(&ctx, 8) > 0.5);
    }

    #[test]
    fn passthrough_has_no_effect_node() {
        let ctx = AudioContext::new(8000.0).unwrap();
        let osc = ctx.create_oscillator(Waveform::Square);
        let mut stage = EffectNode::passthrough(&ctx).unwrap();
        assert!(stage.effect().is_none());
        assert_eq!(stage.name(), "passthrough");
        osc.connect(stage.input()).unwrap();
        stage.connect(&ctx.destination()).unwrap();
        osc.start(0.0);
        assert!(peak(&ctx, 8) > 0.5);
    }

    #[test]
    fn connect_moves_the_output() {
        let ctx = AudioContext::new(8000.0).unwrap();
        let osc = ctx.create_oscillator(Waveform::Square);
        let mut stage = EffectNode::new(&ctx).unwrap();
        let first = ctx.create_gain();
        let second = ctx.create_gain();
        first.connect(&ctx.destination()).unwrap();
        osc.connect(stage.input()).unwrap();
        osc.start(0.0);

        stage.connect(&first).unwrap();
        assert!(peak(&ctx, 4) > 0.5);

        // The second target is not routed to the destination, so moving the
        // output there must silence the render.
        stage.connect(&second).unwrap();
        assert_eq!(stage.destination(), Some(&*second));
        assert_eq!(peak(&ctx, 4), 0.0);
    }

    #[test]
    fn connecting_twice_to_same_target_keeps_route() {
        let ctx = AudioContext::new(8000.0).unwrap();
        let osc = ctx.create_oscillator(Waveform::Square);
        let mut stage = EffectNode::new(&ctx).unwrap();
        osc.connect(stage.input()).unwrap();
        osc.start(0.0);
        stage.connect(&ctx.destination()).unwrap();
        stage.connect(&ctx.destination()).unwrap();
        assert!(peak(&ctx, 4) > 0.5);
    }

    #[test]
    fn foreign_destination_is_rejected() {
        let ctx = AudioContext::new(8000.0).unwrap();
        let other = AudioContext::new(8000.0).unwrap();
        let mut stage = EffectNode::new(&ctx).unwrap();
        assert!(stage.connect(&other.destination()).is_err());
        assert!(stage.destination().is_none());
    }

    #[test]
    fn dropping_stages_frees_their_nodes() {
        let ctx = AudioContext::new(8000.0).unwrap();
        let before = ctx.node_count();
        let mut stage = EffectNode::new(&ctx).unwrap();
        stage.connect(&ctx.destination()).unwrap();
        let filter = FilterEffect::default_lowpass(&ctx).unwrap();
        assert_eq!(ctx.node_count(), before + 6);
        drop(stage);
        drop(filter);
        assert_eq!(ctx.node_count(), before);
        assert!(ctx.destination().is_alive());
    }

    #[test]
    fn foreign_effect_is_left_alone() {
        let ctx = AudioContext::new(8000.0).unwrap();
        let other = AudioContext::new(8000.0).unwrap();
        let foreign = other.create_gain();
        let before = ctx.node_count();
        assert!(EffectNode::with_effect(&ctx, "foreign", &foreign).is_err());
        assert_eq!(ctx.node_count(), before);
        assert!(foreign.is_alive());
    }

    #[test]
    fn cutoff_changes_from_current_time() {
        let ctx = AudioContext::new(8000.0).unwrap();
        let filter = FilterEffect::new(&ctx, FilterType::Lowpass, 800.0, 1.0).unwrap();
        for _ in 0..4 {
            ctx.render_quantum();
        }
        let now = ctx.current_time();
        filter.set_cutoff(1600.0).unwrap();
        filter.set_resonance(2.0).unwrap();
        let frequency = filter.filter().frequency();
        assert_eq!(frequency.value_at(now / 2.0), 800.0);
        assert_eq!(frequency.value_at(now), 1600.0);
        assert_eq!(filter.filter().q().value_at(now), 2.0);
    }

    #[test]
    fn filter_defaults() {
        let ctx = AudioContext::new(44100.0).unwrap();
        let filter = FilterEffect::default_lowpass(&ctx).unwrap();
        assert_eq!(filter.filter_type(), Some(FilterType::Lowpass));
        assert!((filter.cutoff() - 1000.0).abs() < 1e-3);
        assert!((filter.resonance() - 0.9).abs() < 1e-6);
    }

    #[test]
    fn filter_rejects_bad_parameters() {
        let ctx = AudioContext::new(44100.0).unwrap();
        assert!(FilterEffect::new(&ctx, FilterType::Highpass, 0.0, 1.0).is_err());
        assert!(FilterEffect::new(&ctx, FilterType::Highpass, 500.0, f64::NAN).is_err());
        let filter = FilterEffect::default_lowpass(&ctx).unwrap();
        assert!(filter.set_cutoff(-5.0).is_err());
        filter.set_cutoff(2500.0).unwrap();
        assert!((filter.cutoff() - 2500.0).abs() < 1e-3);
    }

    #[test]
    fn lowpass_attenuates_high_tone() {
        let ctx = AudioContext::new(44100.0).unwrap();
        let osc = ctx.create_oscillator(Waveform::Sine);
        osc.frequency().set_value_at_time(10000.0, 0.0);
        let mut filter = FilterEffect::new(&ctx, FilterType::Lowpass, 200.0, 0.0).unwrap();
        osc.connect(filter.input()).unwrap();
        filter.connect(&ctx.destination()).unwrap();
        osc.start(0.0);

        peak(&ctx, 8);
        assert!(peak(&ctx, 8) < 0.05);
    }
}
