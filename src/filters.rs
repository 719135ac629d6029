//! First-order low-pass filter primitives: PT1, plus the PT2 and PT3 cascades
//! built from the same section. These condition the PID derivative terms and
//! upsample the GPS-rate pitch command to the task rate.

use core::f32::consts::TAU;

/// Section gain for a one-pole low-pass, from cutoff frequency in Hz and
/// sample interval in seconds.
pub fn low_pass_gain(cutoff_hz: f32, dt: f32) -> f32 {
    dt / (dt + 1.0 / (TAU * cutoff_hz))
}

/// Operations common to the PT-family filters, so a consumer can modulate a
/// filter's cutoff without knowing its section count.
pub trait LowPass {
    /// Clear state and set the section gain.
    fn init(&mut self, gain: f32);
    /// Set the section gain, preserving state. Used where the cutoff varies
    /// at runtime, e.g. with descent proximity.
    fn update_cutoff(&mut self, gain: f32);
    /// Advance the filter by one sample.
    fn apply(&mut self, input: f32) -> f32;
}

/// Single one-pole section: `y += k * (x - y)`.
#[derive(Clone, Debug, Default)]
pub struct Pt1Filter {
    state: f32,
    k: f32,
}

impl Pt1Filter {
    pub fn new(gain: f32) -> Self {
        Self { state: 0.0, k: gain }
    }
}

impl LowPass for Pt1Filter {
    fn init(&mut self, gain: f32) {
        self.state = 0.0;
        self.k = gain;
    }

    fn update_cutoff(&mut self, gain: f32) {
        self.k = gain;
    }

    fn apply(&mut self, input: f32) -> f32 {
        self.state += self.k * (input - self.state);
        self.state
    }
}

/// Two cascaded one-pole sections sharing one gain.
#[derive(Clone, Debug, Default)]
pub struct Pt2Filter {
    state: f32,
    state1: f32,
    k: f32,
}

impl Pt2Filter {
    pub fn new(gain: f32) -> Self {
        Self {
            state: 0.0,
            state1: 0.0,
            k: gain,
        }
    }
}

impl LowPass for Pt2Filter {
    fn init(&mut self, gain: f32) {
        self.state = 0.0;
        self.state1 = 0.0;
        self.k = gain;
    }

    fn update_cutoff(&mut self, gain: f32) {
        self.k = gain;
    }

    fn apply(&mut self, input: f32) -> f32 {
        self.state1 += self.k * (input - self.state1);
        self.state += self.k * (self.state1 - self.state);
        self.state
    }
}

/// Three cascaded one-pole sections sharing one gain.
#[derive(Clone, Debug, Default)]
pub struct Pt3Filter {
    state: f32,
    state1: f32,
    state2: f32,
    k: f32,
}

impl Pt3Filter {
    pub fn new(gain: f32) -> Self {
        Self {
            state: 0.0,
            state1: 0.0,
            state2: 0.0,
            k: gain,
        }
    }
}

impl LowPass for Pt3Filter {
    fn init(&mut self, gain: f32) {
        self.state = 0.0;
        self.state1 = 0.0;
        self.state2 = 0.0;
        self.k = gain;
    }

    fn update_cutoff(&mut self, gain: f32) {
        self.k = gain;
    }

    fn apply(&mut self, input: f32) -> f32 {
        self.state1 += self.k * (input - self.state1);
        self.state2 += self.k * (self.state1 - self.state2);
        self.state += self.k * (self.state2 - self.state);
        self.state
    }
}
