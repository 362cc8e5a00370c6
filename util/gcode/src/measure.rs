use serde::{Deserialize, Serialize};

use crate::{
    config::InterpreterConfig,
    state::{Coordinates, FeedMode, MotionMode, AXIS_COUNT, AXIS_LETTERS},
    vm::{arc_geometry, Motion},
};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EstimatedExtent {
    pub bounds: [Option<(f64, f64)>; AXIS_COUNT],
}
impl EstimatedExtent {
    pub fn extend_axis(&mut self, axis: usize, point: f64) {
        match &mut self.bounds[axis] {
            Some((min, max)) => {
                *min = f64::min(*min, point);
                *max = f64::max(*max, point);
            }
            bound => *bound = Some((point, point)),
        }
    }
    /// Only the axes flagged in `axes` are touched.
    pub fn extend_to(&mut self, position: &Coordinates, axes: &[bool; AXIS_COUNT]) {
        for axis in 0..AXIS_COUNT {
            if axes[axis] {
                self.extend_axis(axis, position[axis]);
            }
        }
    }
    pub fn axis_bounds(&self) -> Vec<AxisBounds> {
        self.bounds.iter().zip(AXIS_LETTERS.iter()).filter_map(|(bound, axis)| {
            bound.map(|(min, max)| AxisBounds { axis: *axis, min, max })
        }).collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AxisBounds {
    pub axis: char,
    pub min: f64,
    pub max: f64,
}

/// Seconds to cover `distance` mm at cruise `velocity` mm/s, accelerating from and to rest.
pub fn ramp_time(distance: f64, velocity: f64, acceleration: f64) -> f64 {
    if distance <= 0.0 || velocity <= 0.0 {
        return 0.0;
    }
    if acceleration <= 0.0 || distance >= velocity * velocity / acceleration {
        distance / velocity + if acceleration > 0.0 { velocity / acceleration } else { 0.0 }
    } else {
        2.0 * (distance / acceleration).sqrt()
    }
}

fn delta(start: &Coordinates, end: &Coordinates) -> Coordinates {
    let mut delta = [0.0; AXIS_COUNT];
    for axis in 0..AXIS_COUNT {
        delta[axis] = end[axis] - start[axis];
    }
    delta
}

/// Cartesian length; pure rotary moves fall back to the rotary norm.
pub fn travel_distance(start: &Coordinates, end: &Coordinates) -> f64 {
    let delta = delta(start, end);
    let linear = (delta[0] * delta[0] + delta[1] * delta[1] + delta[2] * delta[2]).sqrt();
    if linear > 0.0 {
        linear
    } else {
        (delta[3] * delta[3] + delta[4] * delta[4] + delta[5] * delta[5]).sqrt()
    }
}

/// Fastest rate (mm/min) along the move direction that keeps every axis within its limit.
pub fn max_velocity(config: &InterpreterConfig, start: &Coordinates, end: &Coordinates) -> f64 {
    let delta = delta(start, end);
    let distance = travel_distance(start, end);
    delta.iter().enumerate()
        .filter(|(_, delta)| delta.abs() > 1e-12)
        .map(|(axis, delta)| config.max_rates[axis] * distance / delta.abs())
        .fold(f64::INFINITY, f64::min)
}

fn cruise_rate(feed_mode: FeedMode, feedrate: f64, spindle_speed: f64, limit: f64) -> f64 {
    let requested = match feed_mode {
        FeedMode::UnitsPerMinute => feedrate,
        FeedMode::UnitsPerRevolution => feedrate * spindle_speed,
        FeedMode::InverseTime => 0.0,
    };
    if requested > 0.0 { requested.min(limit) } else { limit }
}

/// Estimated seconds for one motion.
pub fn motion_time(
    config: &InterpreterConfig,
    feed_mode: FeedMode,
    feedrate: f64,
    spindle_speed: f64,
    motion: &Motion,
) -> f64 {
    let (distance, limit) = if motion.kind.is_arc() {
        let (axis_0, axis_1, _) = motion.plane.axes();
        let length = arc_geometry(motion).map(|arc| arc.length()).unwrap_or(0.0);
        (length, config.max_rates[axis_0].min(config.max_rates[axis_1]))
    } else {
        (travel_distance(&motion.start, &motion.end), max_velocity(config, &motion.start, &motion.end))
    };
    if distance <= 0.0 || !limit.is_finite() {
        return 0.0;
    }
    let rate = match motion.kind {
        MotionMode::Rapid => limit,
        _ if feed_mode == FeedMode::InverseTime && feedrate > 0.0 => {
            // The whole move takes 1/F minutes.
            return 60.0 / feedrate;
        }
        _ => cruise_rate(feed_mode, feedrate, spindle_speed, limit),
    };
    ramp_time(distance, rate / 60.0, config.acceleration)
}
