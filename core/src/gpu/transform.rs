//! Display transforms applied to beam points as a frame is uploaded: sweep
//! with trigger, mirror flips and the goniometer rotation.
//!
//! Sweep is stateful. The trace position and trigger history carry over from
//! one frame to the next, so a sweep longer than a frame continues where the
//! previous frame left off.

use crate::audio::points::BeamPoint;

use super::params::RenderParameters;

/// Horizontal coordinate a sweep starts from, mirrored at the right. Just
/// outside the screen so the ends of the trace stay hidden.
pub const SWEEP_EDGE: f64 = 1.135;

/// Maps incoming beam points to screen points.
#[derive(Debug, Clone, Default)]
pub struct PointTransform {
    /// Points emitted since the sweep last restarted.
    since_trigger: u64,
    below_trigger: bool,
}

impl PointTransform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the next sweep from the left edge.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// True when `params` leave every point untouched.
    pub fn is_identity(params: &RenderParameters) -> bool {
        !(params.sweep || params.flip_horizontal || params.flip_vertical || params.goniometer)
    }

    /// Transform one point. `point_rate` is points per second of the frame
    /// the point belongs to.
    pub fn apply(&mut self, point: BeamPoint, params: &RenderParameters, point_rate: f64) -> BeamPoint {
        if params.sweep {
            let swept = self.sweep(point, params, point_rate);
            flip(swept, params)
        } else {
            let flipped = flip(point, params);
            if params.goniometer {
                goniometer(flipped)
            } else {
                flipped
            }
        }
    }

    /// Plot channel 0 against time. A sweep that has run off the right edge
    /// restarts when channel 0 rises through the trigger level; until then
    /// the trace keeps running off screen.
    fn sweep(&mut self, point: BeamPoint, params: &RenderParameters, point_rate: f64) -> BeamPoint {
        let per_sweep = point_rate.max(1.0) * params.sweep_seconds();
        let x = self.since_trigger as f64 / per_sweep * 2.0 * SWEEP_EDGE - SWEEP_EDGE;

        let value = point.x;
        let trigger = params.trigger;
        if x > SWEEP_EDGE && self.below_trigger && value >= trigger {
            self.since_trigger = 0;
        }
        self.below_trigger = value < trigger;
        self.since_trigger += 1;

        BeamPoint {
            x: x as f32,
            y: value,
            z: 1.0,
            colour: point.colour,
        }
    }
}

fn flip(mut point: BeamPoint, params: &RenderParameters) -> BeamPoint {
    if params.flip_horizontal {
        point.x = -point.x;
    }
    if params.flip_vertical {
        point.y = -point.y;
    }
    point
}

/// Rotate by 45 degrees and scale by `1/sqrt(2)`: in-phase channels
/// land on the vertical axis, opposed channels on the horizontal one, and the
/// unit square still fits the screen.
fn goniometer(point: BeamPoint) -> BeamPoint {
    BeamPoint {
        x: (point.x - point.y) * 0.5,
        y: (point.x + point.y) * 0.5,
        ..point
    }
}
