//! Delay line: stereo fractional delay with a fixed maximum.

/// A stereo delay line that can hold up to `max_delay_seconds` of audio.
///
/// Unlike a feedback echo, the line is a pure delay: every input sample is
/// reproduced once, `delay_time` seconds later. The delay time may change
/// between calls and is read with linear interpolation.
#[derive(Debug, Clone)]
pub struct DelayLine {
    buffer_l: Vec<f32>,
    buffer_r: Vec<f32>,
    write_pos: usize,
    sample_rate: f64,
    max_delay: f64,
}

impl DelayLine {
    /// Create a new delay line.
    ///
    /// # Arguments
    /// - `sample_rate`: Audio sample rate in Hz.
    /// - `max_delay_seconds`: Maximum supported delay time.
    pub fn new(sample_rate: f64, max_delay_seconds: f64) -> Self {
        let buffer_size = (sample_rate * max_delay_seconds).ceil() as usize + 2;
        Self {
            buffer_l: vec![0.0; buffer_size],
            buffer_r: vec![0.0; buffer_size],
            write_pos: 0,
            sample_rate,
            max_delay: max_delay_seconds,
        }
    }

    pub fn max_delay(&self) -> f64 {
        self.max_delay
    }

    /// Push a stereo sample pair and read the pair delayed by `delay_time`.
    #[inline]
    pub fn process(&mut self, left: f32, right: f32, delay_time: f64) -> (f32, f32) {
        let buffer_len = self.buffer_l.len();
        self.buffer_l[self.write_pos] = left;
        self.buffer_r[self.write_pos] = right;

        let delay = delay_time.clamp(0.0, self.max_delay) * self.sample_rate;
        let whole = delay.floor() as usize;
        let frac = (delay - whole as f64) as f32;

        let tap = |offset: usize| (self.write_pos + buffer_len - offset) % buffer_len;
        let near = tap(whole);
        let far = tap(whole + 1);
        let out_l = self.buffer_l[near] * (1.0 - frac) + self.buffer_l[far] * frac;
        let out_r = self.buffer_r[near] * (1.0 - frac) + self.buffer_r[far] * frac;

        self.write_pos = (self.write_pos + 1) % buffer_len;
        (out_l, out_r)
    }

    /// Clear the delay buffers.
    pub fn clear(&mut self) {
        self.buffer_l.fill(0.0);
        self.buffer_r.fill(0.0);
        self.write_pos = 0;
    }
}
