//! DSP components: sources, effects and the reverb, built on the node graph.
//!
//! The sample-level kernels (`oscillator`, `filter`, `delay`, `convolver`)
//! are driven by the graph's processors. The components above them only
//! create nodes, wire them and schedule automation.

pub mod convolver;
pub mod delay;
pub mod effect;
pub mod envelope;
pub mod filter;
pub mod oscillator;
pub mod reverb;
pub mod sampler;
pub mod voice;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::graph::AudioNode;

/// A note-on event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoteEvent {
    /// Note identity, if the caller tracks one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<i32>,
    /// Frequency in Hz.
    pub frequency: f64,
    /// MIDI-style velocity in 0..=127.
    pub velocity: f64,
}

/// What a component is triggered with: a full note, or just a velocity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Trigger {
    Note(NoteEvent),
    Velocity(f64),
}

impl Trigger {
    pub fn velocity(&self) -> f64 {
        match self {
            Trigger::Note(note) => note.velocity,
            Trigger::Velocity(velocity) => *velocity,
        }
    }

    pub fn frequency(&self) -> Option<f64> {
        match self {
            Trigger::Note(note) => Some(note.frequency),
            Trigger::Velocity(_) => None,
        }
    }

    pub fn value(&self) -> Option<i32> {
        match self {
            Trigger::Note(note) => note.value,
            Trigger::Velocity(_) => None,
        }
    }
}

impl From<NoteEvent> for Trigger {
    fn from(note: NoteEvent) -> Self {
        Trigger::Note(note)
    }
}

impl From<f64> for Trigger {
    fn from(velocity: f64) -> Self {
        Trigger::Velocity(velocity)
    }
}

/// Components that start and release on note triggers.
pub trait Gate {
    fn on(&mut self, trigger: Trigger);
    fn off(&mut self);
}

/// Components with an output stage that can feed another node.
pub trait Connect {
    fn connect(&mut self, destination: &AudioNode) -> Result<(), GraphError>;
}
