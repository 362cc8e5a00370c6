use serde::{Deserialize, Serialize};

use crate::state::Coordinates;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RotaryAxis {
    A,
    B,
    C,
}
impl RotaryAxis {
    pub fn index(self) -> usize {
        match self {
            RotaryAxis::A => 3,
            RotaryAxis::B => 4,
            RotaryAxis::C => 5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Per-axis maximum rate in mm/min (deg/min for rotary axes); rapids travel at these.
    pub max_rates: Coordinates,
    /// mm/s²
    pub acceleration: f64,
    pub min_feed_rate: f64,
    pub max_feed_rate: f64,
    pub arc_points: usize,
    /// When set, moves commanding this axis are tessellated as curves wrapped around it.
    pub rotary_wrap: Option<RotaryAxis>,
    pub curve_points: usize,
}
impl Default for InterpreterConfig {
    fn default() -> Self {
        InterpreterConfig {
            max_rates: [5000.0, 5000.0, 3000.0, 36000.0, 36000.0, 36000.0],
            acceleration: 500.0,
            min_feed_rate: 1.0,
            max_feed_rate: 5000.0,
            arc_points: 32,
            rotary_wrap: None,
            curve_points: 32,
        }
    }
}
impl InterpreterConfig {
    pub fn clamp_feed(&self, feed: f64) -> f64 {
        feed.max(self.min_feed_rate).min(self.max_feed_rate)
    }
}
