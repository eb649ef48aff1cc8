//! The audio context: node factory, clock and block scheduler.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::warn;

use super::node::{
    AudioBufferSourceNode, AudioNode, BiquadFilterNode, ConvolverNode, DelayNode, GainNode,
    NodeId, OscillatorNode, Processor,
};
use super::param::Timeline;
use super::{AudioBuffer, Block, RENDER_QUANTUM};
use crate::dsp::filter::FilterType;
use crate::dsp::oscillator::Waveform;
use crate::error::ConfigError;

const SILENCE: Block = [[0.0; RENDER_QUANTUM]; 2];

pub(crate) fn lock_graph(graph: &Mutex<Graph>) -> MutexGuard<'_, Graph> {
    graph.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Processing order plus the resolved inputs of every node.
#[derive(Debug)]
struct Schedule {
    order: Vec<NodeId>,
    inputs: Vec<Vec<NodeId>>,
}

/// The signal graph shared by a context and all of its node handles.
#[derive(Debug)]
pub(crate) struct Graph {
    sample_rate: f64,
    frames: u64,
    nodes: Vec<Option<Processor>>,
    generations: Vec<u32>,
    free: Vec<NodeId>,
    outputs: Vec<Block>,
    edges: Vec<(NodeId, NodeId)>,
    schedule: Option<Schedule>,
    destination: NodeId,
    cycle_warned: bool,
    pending: Block,
    pending_pos: usize,
}

impl Graph {
    fn new(sample_rate: f64) -> Self {
        Graph {
            sample_rate,
            frames: 0,
            nodes: vec![Some(Processor::Destination)],
            generations: vec![0],
            free: Vec::new(),
            outputs: vec![SILENCE],
            edges: Vec::new(),
            schedule: None,
            destination: 0,
            cycle_warned: false,
            pending: SILENCE,
            pending_pos: RENDER_QUANTUM,
        }
    }

    pub(crate) fn current_time(&self) -> f64 {
        self.frames as f64 / self.sample_rate
    }

    /// Place a processor in a free slot, returning its id and generation.
    fn add(&mut self, processor: Processor) -> (NodeId, u32) {
        let id = match self.free.pop() {
            Some(id) => {
                self.nodes[id] = Some(processor);
                self.outputs[id] = SILENCE;
                id
            }
            None => {
                self.nodes.push(Some(processor));
                self.outputs.push(SILENCE);
                self.generations.push(0);
                self.nodes.len() - 1
            }
        };
        self.schedule = None;
        (id, self.generations[id])
    }

    /// Whether `id` still holds the node that was created with `generation`.
    pub(crate) fn holds(&self, id: NodeId, generation: u32) -> bool {
        self.generations.get(id) == Some(&generation) && self.nodes[id].is_some()
    }

    pub(crate) fn processor_mut(&mut self, id: NodeId, generation: u32) -> Option<&mut Processor> {
        if !self.holds(id, generation) {
            return None;
        }
        self.nodes[id].as_mut()
    }

    pub(crate) fn connect(&mut self, source: NodeId, destination: NodeId) {
        if !self.edges.contains(&(source, destination)) {
            self.edges.push((source, destination));
            self.schedule = None;
        }
    }

    pub(crate) fn disconnect(&mut self, source: NodeId, destination: NodeId) {
        self.edges.retain(|&edge| edge != (source, destination));
        self.schedule = None;
    }

    pub(crate) fn disconnect_all(&mut self, source: NodeId) {
        self.edges.retain(|&(s, _)| s != source);
        self.schedule = None;
    }

    /// Drop a node and its connections. The slot is recycled under a new generation.
    pub(crate) fn remove(&mut self, id: NodeId) {
        if id == self.destination || self.nodes.get(id).is_none_or(Option::is_none) {
            return;
        }
        self.nodes[id] = None;
        self.outputs[id] = SILENCE;
        self.generations[id] = self.generations[id].wrapping_add(1);
        self.free.push(id);
        self.edges.retain(|&(s, d)| s != id && d != id);
        self.schedule = None;
    }

    /// Kahn's algorithm over live nodes. Nodes stuck on a cycle are left out.
    fn build_schedule(&mut self) -> Schedule {
        let count = self.nodes.len();
        let mut inputs = vec![Vec::new(); count];
        let mut indegree = vec![0usize; count];
        let mut outgoing = vec![Vec::new(); count];
        for &(s, d) in &self.edges {
            if self.nodes[s].is_some() && self.nodes[d].is_some() {
                inputs[d].push(s);
                outgoing[s].push(d);
                indegree[d] += 1;
            }
        }

        let mut ready: Vec<NodeId> = (0..count)
            .filter(|&id| self.nodes[id].is_some() && indegree[id] == 0)
            .collect();
        let mut order = Vec::with_capacity(count);
        while let Some(id) = ready.pop() {
            order.push(id);
            for &d in &outgoing[id] {
                indegree[d] -= 1;
                if indegree[d] == 0 {
                    ready.push(d);
                }
            }
        }

        let live = self.nodes.iter().filter(|n| n.is_some()).count();
        if order.len() < live && !self.cycle_warned {
            warn!(skipped = live - order.len(), "audio graph contains a cycle; nodes on it are muted");
            self.cycle_warned = true;
        }

        Schedule { order, inputs }
    }

    /// Render one quantum and advance the clock.
    pub(crate) fn render_quantum(&mut self) -> Block {
        let schedule = match self.schedule.take() {
            Some(schedule) => schedule,
            None => self.build_schedule(),
        };
        let start_time = self.current_time();
        let sample_rate = self.sample_rate;

        for &id in &schedule.order {
            let mut input = SILENCE;
            for &source in &schedule.inputs[id] {
                let from = &self.outputs[source];
                for c in 0..2 {
                    for i in 0..RENDER_QUANTUM {
                        input[c][i] += from[c][i];
                    }
                }
            }
            if let Some(processor) = self.nodes[id].as_mut() {
                processor.process(&input, &mut self.outputs[id], start_time, sample_rate);
            }
        }

        let block = self.outputs[self.destination];
        self.frames += RENDER_QUANTUM as u64;
        self.schedule = Some(schedule);

        let finished: Vec<NodeId> = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(id, n)| n.as_ref().filter(|p| p.is_finished()).map(|_| id))
            .collect();
        for id in finished {
            self.remove(id);
        }

        block
    }

    fn render_interleaved(&mut self, out: &mut [f32]) {
        for frame in out.chunks_mut(2) {
            if self.pending_pos >= RENDER_QUANTUM {
                self.pending = self.render_quantum();
                self.pending_pos = 0;
            }
            for (c, sample) in frame.iter_mut().enumerate() {
                *sample = self.pending[c][self.pending_pos];
            }
            self.pending_pos += 1;
        }
    }
}

/// A live audio context.
///
/// The context owns a clock measured in rendered frames. A host drives it
/// from its audio callback through [`AudioContext::render_interleaved`];
/// control code schedules parameter automation against
/// [`AudioContext::current_time`] rather than mutating the render state.
#[derive(Clone)]
pub struct AudioContext {
    graph: Arc<Mutex<Graph>>,
    sample_rate: f64,
}

impl fmt::Debug for AudioContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioContext")
            .field("sample_rate", &self.sample_rate)
            .field("current_time", &self.current_time())
            .finish()
    }
}

impl AudioContext {
    pub fn new(sample_rate: f64) -> Result<Self, ConfigError> {
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(ConfigError::InvalidSampleRate(sample_rate));
        }
        Ok(AudioContext {
            graph: Arc::new(Mutex::new(Graph::new(sample_rate))),
            sample_rate,
        })
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Seconds of audio rendered so far.
    pub fn current_time(&self) -> f64 {
        lock_graph(&self.graph).current_time()
    }

    /// The final node whose input is the context's output.
    pub fn destination(&self) -> AudioNode {
        let graph = lock_graph(&self.graph);
        let id = graph.destination;
        let generation = graph.generations[id];
        drop(graph);
        self.handle(id, generation)
    }

    fn handle(&self, id: NodeId, generation: u32) -> AudioNode {
        AudioNode {
            id,
            generation,
            graph: Arc::clone(&self.graph),
        }
    }

    fn add(&self, processor: Processor) -> AudioNode {
        let (id, generation) = lock_graph(&self.graph).add(processor);
        self.handle(id, generation)
    }

    pub fn create_gain(&self) -> GainNode {
        GainNode::from_node(self.add(Processor::Gain(Timeline::new(1.0))))
    }

    /// A stopped oscillator; call `start` to run it.
    pub fn create_oscillator(&self, waveform: Waveform) -> OscillatorNode {
        OscillatorNode::from_node(self.add(Processor::oscillator(waveform, self.sample_rate)))
    }

    pub fn create_biquad_filter(&self, filter_type: FilterType) -> BiquadFilterNode {
        BiquadFilterNode::from_node(self.add(Processor::biquad(filter_type, self.sample_rate)))
    }

    /// A delay line able to hold `max_delay` seconds.
    pub fn create_delay(&self, max_delay: f64) -> Result<DelayNode, ConfigError> {
        if !(max_delay.is_finite() && max_delay > 0.0) {
            return Err(ConfigError::NonPositiveDuration {
                name: "max delay",
                value: max_delay,
            });
        }
        Ok(DelayNode::from_node(self.add(Processor::delay(max_delay, self.sample_rate))))
    }

    pub fn create_convolver(&self) -> ConvolverNode {
        ConvolverNode::from_node(self.add(Processor::convolver()))
    }

    pub fn create_buffer_source(&self) -> AudioBufferSourceNode {
        AudioBufferSourceNode::from_node(self.add(Processor::BufferSource(Default::default())))
    }

    /// Allocate a silent buffer at this context's sample rate.
    pub fn create_buffer(&self, channels: usize, length: usize) -> Result<AudioBuffer, ConfigError> {
        AudioBuffer::new(channels, length, self.sample_rate)
    }

    /// Render one quantum of stereo output, advancing the clock.
    pub fn render_quantum(&self) -> [[f32; RENDER_QUANTUM]; 2] {
        lock_graph(&self.graph).render_quantum()
    }

    /// Fill an interleaved stereo slice. Partial quanta carry over between calls.
    pub fn render_interleaved(&self, out: &mut [f32]) {
        lock_graph(&self.graph).render_interleaved(out);
    }

    /// Number of nodes currently alive in the graph, destination included.
    pub fn node_count(&self) -> usize {
        lock_graph(&self.graph).nodes.iter().filter(|n| n.is_some()).count()
    }

    /// Slots allocated in the graph, live or free.
    #[cfg(test)]
    pub(crate) fn slot_count(&self) -> usize {
        lock_graph(&self.graph).nodes.len()
    }
}
