//! Node processors and the typed handles the rest of the crate holds.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use tracing::warn;

use super::buffer::frames_for;
use super::context::{lock_graph, Graph};
use super::param::Timeline;
use super::{AudioBuffer, Block, RENDER_QUANTUM};
use crate::dsp::convolver::Convolver;
use crate::dsp::delay::DelayLine;
use crate::dsp::filter::{BiquadFilter, FilterType};
use crate::dsp::oscillator::{Oscillator, Waveform};
use crate::error::GraphError;

pub(crate) type NodeId = usize;

/// Which automatable parameter of a node an [`AudioParam`] addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParamKind {
    Gain,
    Frequency,
    Detune,
    Q,
    DelayTime,
}

#[derive(Debug)]
pub(crate) struct OscillatorState {
    kernel: Oscillator,
    frequency: Timeline,
    detune: Timeline,
    start: Option<f64>,
    stop: Option<f64>,
    ended: bool,
}

#[derive(Debug)]
pub(crate) struct BiquadState {
    filters: [BiquadFilter; 2],
    frequency: Timeline,
    q: Timeline,
    gain: Timeline,
}

#[derive(Debug)]
pub(crate) struct DelayState {
    line: DelayLine,
    delay_time: Timeline,
}

#[derive(Debug, Default)]
pub(crate) struct ConvolverState {
    buffer: Option<Arc<AudioBuffer>>,
    normalize: bool,
    kernel: Option<Convolver>,
}

#[derive(Debug, Default)]
pub(crate) struct SourceState {
    buffer: Option<Arc<AudioBuffer>>,
    looping: bool,
    loop_start: f64,
    loop_end: f64,
    start: Option<f64>,
    stop: Option<f64>,
    position: usize,
    ended: bool,
}

/// The per-node signal processing held inside the graph.
#[derive(Debug)]
pub(crate) enum Processor {
    Gain(Timeline),
    Oscillator(OscillatorState),
    Biquad(BiquadState),
    Delay(DelayState),
    Convolver(ConvolverState),
    BufferSource(SourceState),
    Destination,
}

impl Processor {
    pub(crate) fn oscillator(waveform: Waveform, sample_rate: f64) -> Self {
        Processor::Oscillator(OscillatorState {
            kernel: Oscillator::new(waveform, sample_rate),
            frequency: Timeline::new(440.0),
            detune: Timeline::new(0.0),
            start: None,
            stop: None,
            ended: false,
        })
    }

    pub(crate) fn biquad(filter_type: FilterType, sample_rate: f64) -> Self {
        let filter = BiquadFilter::new(filter_type, sample_rate);
        Processor::Biquad(BiquadState {
            frequency: Timeline::new(filter.frequency as f32),
            q: Timeline::new(filter.q as f32),
            gain: Timeline::new(0.0),
            filters: [filter.clone(), filter],
        })
    }

    pub(crate) fn delay(max_delay: f64, sample_rate: f64) -> Self {
        Processor::Delay(DelayState {
            line: DelayLine::new(sample_rate, max_delay),
            delay_time: Timeline::new(0.0),
        })
    }

    pub(crate) fn convolver() -> Self {
        Processor::Convolver(ConvolverState {
            normalize: true,
            ..ConvolverState::default()
        })
    }

    fn param_mut(&mut self, kind: ParamKind) -> Option<&mut Timeline> {
        match (self, kind) {
            (Processor::Gain(gain), ParamKind::Gain) => Some(gain),
            (Processor::Oscillator(o), ParamKind::Frequency) => Some(&mut o.frequency),
            (Processor::Oscillator(o), ParamKind::Detune) => Some(&mut o.detune),
            (Processor::Biquad(b), ParamKind::Frequency) => Some(&mut b.frequency),
            (Processor::Biquad(b), ParamKind::Q) => Some(&mut b.q),
            (Processor::Biquad(b), ParamKind::Gain) => Some(&mut b.gain),
            (Processor::Delay(d), ParamKind::DelayTime) => Some(&mut d.delay_time),
            _ => None,
        }
    }

    /// One-shot sources that have played out and can be dropped from the graph.
    pub(crate) fn is_finished(&self) -> bool {
        match self {
            Processor::Oscillator(o) => o.ended,
            Processor::BufferSource(s) => s.ended,
            _ => false,
        }
    }

    /// Render one quantum starting at `start_time`.
    pub(crate) fn process(&mut self, input: &Block, output: &mut Block, start_time: f64, sample_rate: f64) {
        let time_of = |i: usize| start_time + i as f64 / sample_rate;
        match self {
            Processor::Destination => *output = *input,
            Processor::Gain(gain) => {
                if gain.is_static() {
                    let g = gain.advance(start_time);
                    for c in 0..2 {
                        for i in 0..RENDER_QUANTUM {
                            output[c][i] = input[c][i] * g;
                        }
                    }
                } else {
                    let mut gains = [0.0; RENDER_QUANTUM];
                    gain.fill(start_time, sample_rate, &mut gains);
                    for (i, g) in gains.iter().enumerate() {
                        output[0][i] = input[0][i] * g;
                        output[1][i] = input[1][i] * g;
                    }
                }
            }
            Processor::Oscillator(o) => {
                for i in 0..RENDER_QUANTUM {
                    let t = time_of(i);
                    let frequency = o.frequency.advance(t) as f64;
                    let detune = o.detune.advance(t) as f64;
                    let running = !o.ended && o.start.is_some_and(|s| t >= s);
                    if running && o.stop.is_some_and(|s| t >= s) {
                        o.ended = true;
                    }
                    let s = if running && !o.ended {
                        o.kernel.next_sample(frequency, detune) as f32
                    } else {
                        0.0
                    };
                    output[0][i] = s;
                    output[1][i] = s;
                }
            }
            Processor::Biquad(b) => {
                let frequency = b.frequency.advance(start_time) as f64;
                let q = b.q.advance(start_time) as f64;
                let gain = b.gain.advance(start_time) as f64;
                for (c, filter) in b.filters.iter_mut().enumerate() {
                    filter.set_params(frequency, q, gain);
                    for i in 0..RENDER_QUANTUM {
                        output[c][i] = filter.process(input[c][i] as f64) as f32;
                    }
                }
            }
            Processor::Delay(d) => {
                let delay = d.delay_time.advance(start_time) as f64;
                for i in 0..RENDER_QUANTUM {
                    let (l, r) = d.line.process(input[0][i], input[1][i], delay);
                    output[0][i] = l;
                    output[1][i] = r;
                }
            }
            Processor::Convolver(c) => match c.kernel.as_mut() {
                Some(kernel) => {
                    *output = *input;
                    let [left, right] = output;
                    kernel.process_block(left, right);
                }
                None => *output = [[0.0; RENDER_QUANTUM]; 2],
            },
            Processor::BufferSource(s) => {
                for i in 0..RENDER_QUANTUM {
                    let (l, r) = s.next_frame(time_of(i), sample_rate);
                    output[0][i] = l;
                    output[1][i] = r;
                }
            }
        }
    }
}

impl SourceState {
    fn next_frame(&mut self, time: f64, sample_rate: f64) -> (f32, f32) {
        let Some(buffer) = self.buffer.as_ref() else {
            return (0.0, 0.0);
        };
        if self.ended || !self.start.is_some_and(|s| time >= s) {
            return (0.0, 0.0);
        }
        if self.stop.is_some_and(|s| time >= s) {
            self.ended = true;
            return (0.0, 0.0);
        }

        let len = buffer.length();
        if self.looping {
            let (loop_start, loop_end) = self.loop_frames(len, sample_rate);
            if self.position >= loop_end {
                self.position = loop_start + (self.position - loop_end) % (loop_end - loop_start);
            }
        } else if self.position >= len {
            self.ended = true;
            return (0.0, 0.0);
        }

        let frame = buffer.frame(self.position);
        self.position += 1;
        frame
    }

    /// Loop bounds in frames. An unset or out-of-range end means the buffer end.
    fn loop_frames(&self, len: usize, sample_rate: f64) -> (usize, usize) {
        let end = frames_for(self.loop_end, sample_rate);
        let end = if self.loop_end > 0.0 && end > 0 && end <= len { end } else { len };
        let start = frames_for(self.loop_start.max(0.0), sample_rate);
        let start = if start < end { start } else { 0 };
        (start, end)
    }
}

/// A reference to a node living in an audio context's graph.
///
/// Handles are cheap to clone. Operations on a node that has already been
/// removed (a one-shot source that finished, or a dropped component's
/// stage) are ignored, even after its slot has been given to a new node.
#[derive(Clone)]
pub struct AudioNode {
    pub(crate) id: NodeId,
    pub(crate) generation: u32,
    pub(crate) graph: Arc<Mutex<Graph>>,
}

impl fmt::Debug for AudioNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioNode")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish()
    }
}

impl PartialEq for AudioNode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.generation == other.generation && Arc::ptr_eq(&self.graph, &other.graph)
    }
}

impl AudioNode {
    /// Route this node's output into `destination`.
    pub fn connect(&self, destination: &AudioNode) -> Result<(), GraphError> {
        if !Arc::ptr_eq(&self.graph, &destination.graph) {
            warn!(source = self.id, destination = destination.id, "connect across contexts refused");
            return Err(GraphError::ForeignContext);
        }
        let mut graph = lock_graph(&self.graph);
        if graph.holds(self.id, self.generation) && graph.holds(destination.id, destination.generation) {
            graph.connect(self.id, destination.id);
        }
        Ok(())
    }

    /// Remove the connection to `destination`, if present.
    pub fn disconnect(&self, destination: &AudioNode) {
        if !Arc::ptr_eq(&self.graph, &destination.graph) {
            return;
        }
        let mut graph = lock_graph(&self.graph);
        if graph.holds(self.id, self.generation) && graph.holds(destination.id, destination.generation) {
            graph.disconnect(self.id, destination.id);
        }
    }

    /// Remove every outgoing connection.
    pub fn disconnect_all(&self) {
        let mut graph = lock_graph(&self.graph);
        if graph.holds(self.id, self.generation) {
            graph.disconnect_all(self.id);
        }
    }

    /// Whether the node is still part of the graph.
    pub fn is_alive(&self) -> bool {
        lock_graph(&self.graph).holds(self.id, self.generation)
    }

    /// Take the node out of the graph along with all of its connections.
    pub(crate) fn remove(&self) {
        let mut graph = lock_graph(&self.graph);
        if graph.holds(self.id, self.generation) {
            graph.remove(self.id);
        }
    }

    pub(crate) fn with_processor<R>(&self, f: impl FnOnce(&mut Processor) -> R) -> Option<R> {
        lock_graph(&self.graph).processor_mut(self.id, self.generation).map(f)
    }

    fn param(&self, kind: ParamKind) -> AudioParam {
        AudioParam {
            node: self.clone(),
            kind,
        }
    }
}

/// An automatable value of a node (gain, frequency, delay time, ...).
#[derive(Debug, Clone)]
pub struct AudioParam {
    node: AudioNode,
    kind: ParamKind,
}

impl AudioParam {
    fn with_timeline<R>(&self, f: impl FnOnce(&mut Timeline, f64) -> R) -> Option<R> {
        let mut graph = lock_graph(&self.node.graph);
        let now = graph.current_time();
        graph
            .processor_mut(self.node.id, self.node.generation)
            .and_then(|p| p.param_mut(self.kind))
            .map(|timeline| f(timeline, now))
    }

    /// Jump to `value` at absolute `time`.
    pub fn set_value_at_time(&self, value: f32, time: f64) -> &Self {
        self.with_timeline(|t, _| t.set_value_at_time(value, time));
        self
    }

    /// Approach `target` exponentially with `time_constant`, starting at `start`.
    pub fn set_target_at_time(&self, target: f32, start: f64, time_constant: f64) -> &Self {
        self.with_timeline(|t, _| t.set_target_at_time(target, start, time_constant));
        self
    }

    /// Drop all automation scheduled at or after `time`.
    pub fn cancel_scheduled_values(&self, time: f64) -> &Self {
        self.with_timeline(|t, _| t.cancel_scheduled_values(time));
        self
    }

    /// Set the value at the context's current time.
    pub fn set_value(&self, value: f32) -> &Self {
        self.with_timeline(|t, now| t.set_value_at_time(value, now));
        self
    }

    /// The instantaneous value at the context's current time.
    pub fn value(&self) -> f32 {
        self.with_timeline(|t, now| t.value_at(now)).unwrap_or(0.0)
    }

    /// The value the schedule yields at `time`.
    pub fn value_at(&self, time: f64) -> f32 {
        self.with_timeline(|t, _| t.value_at(time)).unwrap_or(0.0)
    }
}

macro_rules! node_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        pub struct $name {
            node: AudioNode,
        }

        impl $name {
            pub(crate) fn from_node(node: AudioNode) -> Self {
                $name { node }
            }
        }

        impl Deref for $name {
            type Target = AudioNode;

            fn deref(&self) -> &AudioNode {
                &self.node
            }
        }

        impl AsRef<AudioNode> for $name {
            fn as_ref(&self) -> &AudioNode {
                &self.node
            }
        }
    };
}

node_handle!(
    /// Multiplies its input by an automatable gain.
    GainNode
);
node_handle!(
    /// A continuously running periodic source.
    OscillatorNode
);
node_handle!(BiquadFilterNode);
node_handle!(DelayNode);
node_handle!(
    /// Convolves its input with an impulse response buffer.
    ConvolverNode
);
node_handle!(
    /// Plays a shared buffer once, or in a loop.
    AudioBufferSourceNode
);

impl GainNode {
    pub fn gain(&self) -> AudioParam {
        self.node.param(ParamKind::Gain)
    }
}

impl OscillatorNode {
    pub fn frequency(&self) -> AudioParam {
        self.node.param(ParamKind::Frequency)
    }

    /// Detune in cents.
    pub fn detune(&self) -> AudioParam {
        self.node.param(ParamKind::Detune)
    }

    pub fn set_waveform(&self, waveform: Waveform) {
        self.with_processor(|p| {
            if let Processor::Oscillator(o) = p {
                o.kernel.waveform = waveform;
            }
        });
    }

    pub fn start(&self, when: f64) {
        self.with_processor(|p| {
            if let Processor::Oscillator(o) = p {
                o.start = Some(when.max(0.0));
            }
        });
    }

    pub fn stop(&self, when: f64) {
        self.with_processor(|p| {
            if let Processor::Oscillator(o) = p {
                o.stop = Some(when.max(0.0));
            }
        });
    }

    /// Forget a pending `stop`; has no effect once the oscillator has ended.
    pub fn clear_stop(&self) {
        self.with_processor(|p| {
            if let Processor::Oscillator(o) = p {
                o.stop = None;
            }
        });
    }

    /// Scheduled stop time, if any.
    pub fn stop_time(&self) -> Option<f64> {
        self.with_processor(|p| match p {
            Processor::Oscillator(o) => o.stop,
            _ => None,
        })
        .flatten()
    }

    pub fn has_ended(&self) -> bool {
        self.with_processor(|p| p.is_finished()).unwrap_or(true)
    }
}

impl BiquadFilterNode {
    pub fn frequency(&self) -> AudioParam {
        self.node.param(ParamKind::Frequency)
    }

    pub fn q(&self) -> AudioParam {
        self.node.param(ParamKind::Q)
    }

    /// Peaking gain in dB.
    pub fn gain(&self) -> AudioParam {
        self.node.param(ParamKind::Gain)
    }

    pub fn set_type(&self, filter_type: FilterType) {
        self.with_processor(|p| {
            if let Processor::Biquad(b) = p {
                for filter in &mut b.filters {
                    filter.set_type(filter_type);
                }
            }
        });
    }

    pub fn filter_type(&self) -> Option<FilterType> {
        self.with_processor(|p| match p {
            Processor::Biquad(b) => Some(b.filters[0].filter_type),
            _ => None,
        })
        .flatten()
    }
}

impl DelayNode {
    pub fn delay_time(&self) -> AudioParam {
        self.node.param(ParamKind::DelayTime)
    }

    pub fn max_delay(&self) -> f64 {
        self.with_processor(|p| match p {
            Processor::Delay(d) => d.line.max_delay(),
            _ => 0.0,
        })
        .unwrap_or(0.0)
    }
}

/// An impulse response already partitioned for a convolver, ready to swap in.
#[derive(Debug)]
pub struct PreparedResponse {
    buffer: Arc<AudioBuffer>,
    kernel: Convolver,
}

impl PreparedResponse {
    pub fn buffer(&self) -> &Arc<AudioBuffer> {
        &self.buffer
    }
}

impl ConvolverNode {
    /// Install the impulse response. Partitioning happens before the graph is locked.
    pub fn set_buffer(&self, buffer: Arc<AudioBuffer>) {
        if let Some(prepared) = self.prepare(buffer) {
            self.install(prepared);
        }
    }

    /// Partition `buffer` with this node's normalization setting without
    /// touching the running graph. `None` once the node has been removed.
    pub fn prepare(&self, buffer: Arc<AudioBuffer>) -> Option<PreparedResponse> {
        let normalize = self
            .with_processor(|p| match p {
                Processor::Convolver(c) => Some(c.normalize),
                _ => None,
            })
            .flatten()?;
        let kernel = Convolver::new(&buffer, RENDER_QUANTUM, normalize);
        Some(PreparedResponse { buffer, kernel })
    }

    /// Swap a prepared response in. The replaced kernel is freed after the lock is released.
    pub fn install(&self, prepared: PreparedResponse) {
        let PreparedResponse { buffer, kernel } = prepared;
        let replaced = self
            .with_processor(|p| match p {
                Processor::Convolver(c) => {
                    c.buffer = Some(buffer);
                    c.kernel.replace(kernel)
                }
                _ => None,
            })
            .flatten();
        drop(replaced);
    }

    pub fn buffer(&self) -> Option<Arc<AudioBuffer>> {
        self.with_processor(|p| match p {
            Processor::Convolver(c) => c.buffer.clone(),
            _ => None,
        })
        .flatten()
    }

    /// Takes effect on the next `set_buffer`.
    pub fn set_normalize(&self, normalize: bool) {
        self.with_processor(|p| {
            if let Processor::Convolver(c) = p {
                c.normalize = normalize;
            }
        });
    }
}

impl AudioBufferSourceNode {
    pub fn set_buffer(&self, buffer: Arc<AudioBuffer>) {
        self.with_source(|s| s.buffer = Some(buffer));
    }

    pub fn set_loop(&self, looping: bool) {
        self.with_source(|s| s.looping = looping);
    }

    /// Loop region in seconds.
    pub fn set_loop_bounds(&self, start: f64, end: f64) {
        self.with_source(|s| {
            s.loop_start = start;
            s.loop_end = end;
        });
    }

    pub fn start(&self, when: f64) {
        self.with_source(|s| s.start = Some(when.max(0.0)));
    }

    pub fn stop(&self, when: f64) {
        self.with_source(|s| s.stop = Some(when.max(0.0)));
    }

    pub fn clear_stop(&self) {
        self.with_source(|s| s.stop = None);
    }

    pub fn stop_time(&self) -> Option<f64> {
        self.with_processor(|p| match p {
            Processor::BufferSource(s) => s.stop,
            _ => None,
        })
        .flatten()
    }

    pub fn buffer(&self) -> Option<Arc<AudioBuffer>> {
        self.with_processor(|p| match p {
            Processor::BufferSource(s) => s.buffer.clone(),
            _ => None,
        })
        .flatten()
    }

    pub fn has_ended(&self) -> bool {
        self.with_processor(|p| p.is_finished()).unwrap_or(true)
    }

    fn with_source(&self, f: impl FnOnce(&mut SourceState)) {
        self.with_processor(|p| {
            if let Processor::BufferSource(s) = p {
                f(s);
            }
        });
    }
}
