//! Anti-aliased oscillators using PolyBLEP.

use std::f64::consts::PI;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Supported waveform shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Waveform {
    Sine,
    Square,
    #[default]
    Sawtooth,
    Triangle,
}

impl FromStr for Waveform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sine" => Ok(Waveform::Sine),
            "square" => Ok(Waveform::Square),
            "sawtooth" | "saw" => Ok(Waveform::Sawtooth),
            "triangle" => Ok(Waveform::Triangle),
            other => Err(format!("unknown waveform '{other}'")),
        }
    }
}

/// A band-limited oscillator kernel.
///
/// Frequency and detune are supplied per sample by the owning graph node so
/// that both can be automated.
#[derive(Debug, Clone)]
pub struct Oscillator {
    pub waveform: Waveform,
    phase: f64,
    sample_rate: f64,
}

impl Oscillator {
    pub fn new(waveform: Waveform, sample_rate: f64) -> Self {
        Oscillator {
            waveform,
            phase: 0.0,
            sample_rate,
        }
    }

    /// Generate the next sample at `frequency` Hz shifted by `detune` cents.
    pub fn next_sample(&mut self, frequency: f64, detune: f64) -> f64 {
        let inc = frequency * 2.0_f64.powf(detune / 1200.0) / self.sample_rate;
        let sample = match self.waveform {
            Waveform::Sine => (2.0 * PI * self.phase).sin(),
            Waveform::Sawtooth => self.sawtooth(inc),
            Waveform::Square => self.square(inc),
            Waveform::Triangle => self.triangle(),
        };

        self.phase += inc;
        self.phase -= self.phase.floor();

        sample
    }

    /// Naive sawtooth: rises from -1 to +1, then drops.
    /// PolyBLEP corrects the discontinuity at the wrap.
    fn sawtooth(&self, inc: f64) -> f64 {
        let naive = 2.0 * self.phase - 1.0;
        naive - poly_blep(self.phase, inc)
    }

    fn square(&self, inc: f64) -> f64 {
        let mut value = if self.phase < 0.5 { 1.0 } else { -1.0 };
        value += poly_blep(self.phase, inc);
        value -= poly_blep((self.phase + 0.5) % 1.0, inc);
        value
    }

    /// Piecewise linear: -1 to +1 over the first half, back over the second.
    fn triangle(&self) -> f64 {
        if self.phase < 0.5 {
            4.0 * self.phase - 1.0
        } else {
            3.0 - 4.0 * self.phase
        }
    }

    /// Reset oscillator phase.
    pub fn reset(&mut self) {
        self.phase = 0.0;
    }
}

/// PolyBLEP (Polynomial Band-Limited Step) anti-aliasing correction.
///
/// `t` is the phase [0, 1), `dt` is the phase increment per sample.
fn poly_blep(t: f64, dt: f64) -> f64 {
    if dt <= 0.0 {
        return 0.0;
    }
    if t < dt {
        let t = t / dt;
        2.0 * t - t * t - 1.0
    } else if t > 1.0 - dt {
        let t = (t - 1.0) / dt;
        t * t + 2.0 * t + 1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sine_output_range() {
        let mut osc = Oscillator::new(Waveform::Sine, 44100.0);
        for _ in 0..44100 {
            let s = osc.next_sample(440.0, 0.0);
            assert!((-1.0..=1.0).contains(&s), "Sine out of range: {s}");
        }
    }

    #[test]
    fn sawtooth_bounded() {
        let mut osc = Oscillator::new(Waveform::Sawtooth, 44100.0);
        for _ in 0..44100 {
            let s = osc.next_sample(1000.0, 0.0);
            assert!(s.abs() <= 1.1, "Sawtooth out of range: {s}");
        }
    }

    #[test]
    fn detune_octave_doubles_pitch() {
        // Count zero crossings of a sine over one second.
        let crossings = |detune: f64| {
            let mut osc = Oscillator::new(Waveform::Sine, 48000.0);
            let mut prev = osc.next_sample(100.0, detune);
            let mut n = 0;
            for _ in 1..48000 {
                let s = osc.next_sample(100.0, detune);
                if prev < 0.0 && s >= 0.0 {
                    n += 1;
                }
                prev = s;
            }
            n
        };
        let base = crossings(0.0);
        let up = crossings(1200.0);
        assert!((up as i32 - 2 * base as i32).abs() <= 1, "{base} vs {up}");
    }

    #[test]
    fn parses_waveform_names() {
        assert_eq!("saw".parse::<Waveform>(), Ok(Waveform::Sawtooth));
        assert_eq!("triangle".parse::<Waveform>(), Ok(Waveform::Triangle));
        assert!("noise".parse::<Waveform>().is_err());
    }
}
