//! Sample-accurate parameter automation.
//!
//! A [`Timeline`] holds a current segment plus a time-ordered list of
//! pending events. Rendering walks forward in time and folds due events into
//! the segment; control code can evaluate the schedule at any instant
//! without disturbing it.

/// A scheduled change to a parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Event {
    SetValue {
        time: f64,
        value: f32,
    },
    SetTarget {
        time: f64,
        target: f32,
        time_constant: f64,
    },
}

impl Event {
    fn time(&self) -> f64 {
        match *self {
            Event::SetValue { time, .. } | Event::SetTarget { time, .. } => time,
        }
    }
}

/// What the parameter is doing between events.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Segment {
    Hold(f32),
    Target {
        start: f64,
        from: f32,
        target: f32,
        time_constant: f64,
    },
}

impl Segment {
    fn value_at(&self, time: f64) -> f32 {
        match *self {
            Segment::Hold(v) => v,
            Segment::Target {
                start,
                from,
                target,
                time_constant,
            } => {
                let elapsed = (time - start).max(0.0);
                let k = (-elapsed / time_constant).exp() as f32;
                target + (from - target) * k
            }
        }
    }

    /// The segment that results from applying `event` at its own time.
    fn apply(&self, event: &Event) -> Segment {
        match *event {
            Event::SetValue { value, .. } => Segment::Hold(value),
            Event::SetTarget { time, target, time_constant } => {
                let from = self.value_at(time);
                if time_constant <= 0.0 {
                    Segment::Hold(target)
                } else {
                    Segment::Target {
                        start: time,
                        from,
                        target,
                        time_constant,
                    }
                }
            }
        }
    }
}

/// The automation schedule of one parameter.
#[derive(Debug, Clone)]
pub(crate) struct Timeline {
    segment: Segment,
    events: Vec<Event>,
}

impl Timeline {
    pub(crate) fn new(value: f32) -> Self {
        Timeline {
            segment: Segment::Hold(value),
            events: Vec::new(),
        }
    }

    fn insert(&mut self, event: Event) {
        // Equal times keep insertion order.
        let at = self.events.partition_point(|e| e.time() <= event.time());
        self.events.insert(at, event);
    }

    pub(crate) fn set_value_at_time(&mut self, value: f32, time: f64) {
        self.insert(Event::SetValue {
            time: time.max(0.0),
            value,
        });
    }

    pub(crate) fn set_target_at_time(&mut self, target: f32, start: f64, time_constant: f64) {
        self.insert(Event::SetTarget {
            time: start.max(0.0),
            target,
            time_constant,
        });
    }

    /// Drop every pending event scheduled at or after `time`.
    pub(crate) fn cancel_scheduled_values(&mut self, time: f64) {
        self.events.retain(|e| e.time() < time);
    }

    /// Evaluate the schedule at `time` without consuming anything.
    pub(crate) fn value_at(&self, time: f64) -> f32 {
        let mut segment = self.segment;
        for event in self.events.iter().take_while(|e| e.time() <= time) {
            segment = segment.apply(event);
        }
        segment.value_at(time)
    }

    /// Advance to `time`, folding due events into the current segment.
    ///
    /// Calls must be made with non-decreasing `time`.
    pub(crate) fn advance(&mut self, time: f64) -> f32 {
        let due = self.events.partition_point(|e| e.time() <= time);
        if due > 0 {
            for event in self.events.drain(..due) {
                self.segment = self.segment.apply(&event);
            }
        }
        self.segment.value_at(time)
    }

    /// Fill `out` with per-sample values starting at `start`.
    pub(crate) fn fill(&mut self, start: f64, sample_rate: f64, out: &mut [f32]) {
        for (i, v) in out.iter_mut().enumerate() {
            *v = self.advance(start + i as f64 / sample_rate);
        }
    }

    /// Whether nothing is pending and the value no longer moves.
    pub(crate) fn is_static(&self) -> bool {
        self.events.is_empty() && matches!(self.segment, Segment::Hold(_))
    }
}
