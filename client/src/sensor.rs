//! Synthetic motion data for simulated phones

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use shared::get_timestamp;

/// Produces a plausible stream of orientation and acceleration readings
pub struct SensorSimulator {
    rng: StdRng,
    next_sequence: u32,
    // Current orientation in degrees; drifts a little every frame
    alpha: f64,
    beta: f64,
    gamma: f64,
}

impl SensorSimulator {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            rng,
            next_sequence: 1,
            alpha: 0.0,
            beta: 0.0,
            gamma: 0.0,
        }
    }

    /// Builds the next `sensor:data` payload
    pub fn next_frame(&mut self) -> Value {
        self.alpha = (self.alpha + self.rng.gen_range(-2.0..2.0)).rem_euclid(360.0);
        self.beta = (self.beta + self.rng.gen_range(-1.5..1.5)).clamp(-180.0, 180.0);
        self.gamma = (self.gamma + self.rng.gen_range(-1.5..1.5)).clamp(-90.0, 90.0);

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        json!({
            "sequence": sequence,
            "timestamp": get_timestamp(),
            "orientation": {
                "alpha": self.alpha,
                "beta": self.beta,
                "gamma": self.gamma,
            },
            "acceleration": {
                "x": self.rng.gen_range(-1.0..1.0),
                "y": self.rng.gen_range(-1.0..1.0),
                "z": 9.81 + self.rng.gen_range(-0.2..0.2),
            },
            "rotationRate": {
                "alpha": self.rng.gen_range(-10.0..10.0),
                "beta": self.rng.gen_range(-10.0..10.0),
                "gamma": self.rng.gen_range(-10.0..10.0),
            },
        })
    }
}

impl Default for SensorSimulator {
    fn default() -> Self {
        Self::new()
    }
}
