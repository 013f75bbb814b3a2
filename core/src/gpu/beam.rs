//! Host-side beam and phosphor math.
//!
//! The line shader evaluates the same closed-form profile as
//! [`segment_intensity`]; keep the two in step.

use crate::audio::points::DEFAULT_POINT_RATE;

use super::params::RenderParameters;

/// Segments shorter than this (in pixels) are drawn as a round dot.
pub const MIN_SEGMENT_LENGTH: f32 = 1e-3;

/// Energy a focused beam deposits along one pass at unit intensity, chosen so
/// the default parameters sit in the responsive part of the tone curve.
pub const LINE_ENERGY: f32 = 100.0;

/// Fraction of the image a 60 fps frame removes at the reference exponent.
const FADE_AT_60: f32 = 0.4;

/// Error function approximation (Abramowitz and Stegun 7.1.27), max error
/// about 5e-4. Matches `erf` in `line.wgsl`.
pub fn erf(x: f32) -> f32 {
    let s = x.signum();
    let a = x.abs().min(10.0);
    let mut t = 1.0 + (0.278393 + (0.230389 + (0.000972 + 0.078108 * a) * a) * a) * a;
    t *= t;
    s - s / (t * t)
}

/// Beam profile of one segment at a point.
///
/// The segment runs from the origin along +x for `length` pixels; `(x, y)`
/// is the sample position in the same frame. `sigma` is the Gaussian beam
/// radius in pixels. The result is the beam's time-integrated exposure,
/// normalised so it never exceeds one, and degenerates to a round Gaussian
/// dot for zero-length segments.
pub fn segment_intensity(x: f32, y: f32, length: f32, sigma: f32) -> f32 {
    let sigma = sigma.max(1e-4);
    if length < MIN_SEGMENT_LENGTH {
        return (-(x * x + y * y) / (2.0 * sigma * sigma)).exp();
    }
    let k = std::f32::consts::SQRT_2 * sigma;
    let across = (-(y * y) / (2.0 * sigma * sigma)).exp();
    let along = 0.5 * (erf(x / k) - erf((x - length) / k));
    let norm = (2.0 * std::f32::consts::PI).sqrt() * sigma / length;
    (across * along * norm).clamp(0.0, 1.0)
}

/// Per-frame fade amount: the fraction of accumulated light removed at each
/// frame. Derived so the visual half-life is the same at any frame rate.
pub fn fade_amount(persistence_exponent: f32, frame_rate: f32) -> f32 {
    let retention = frame_retention(persistence_exponent, frame_rate);
    1.0 - retention
}

/// Fraction of accumulated light that survives one frame.
pub fn frame_retention(persistence_exponent: f32, frame_rate: f32) -> f32 {
    let f60 = (FADE_AT_60 * 0.5f32.powf(persistence_exponent)).min(1.0);
    let fps = frame_rate.max(1.0);
    (1.0 - f60).max(0.0).powf(60.0 / fps)
}

/// Fade applied to one pixel whose brightest channel is `level`. Afterglow
/// holds bright light back: at zero every pixel loses `amount`, otherwise the
/// loss shrinks as the pixel gets brighter. Matches `fs_main` in `fade.wgsl`.
pub fn afterglow_fade(amount: f32, afterglow: f32, level: f32) -> f32 {
    amount / (1.0 + afterglow.max(0.0) * level.max(0.0))
}

/// Largest boost shutter sync applies to a sparse frame.
pub const MAX_SHUTTER_GAIN: f32 = 8.0;

/// Energy scale that makes a frame of `points` beam points as bright as a
/// full frame interval's worth at `point_rate`.
pub fn shutter_gain(points: usize, point_rate: f32, frame_rate: f32) -> f32 {
    if points < 2 || point_rate <= 0.0 {
        return 1.0;
    }
    let expected = point_rate / frame_rate.max(1.0);
    (expected / (points - 1) as f32).clamp(1.0 / MAX_SHUTTER_GAIN, MAX_SHUTTER_GAIN)
}

/// Wall-clock seconds for accumulated light to halve.
pub fn half_life_seconds(persistence_exponent: f32, frame_rate: f32) -> f32 {
    let retention = frame_retention(persistence_exponent, frame_rate) as f64;
    if retention <= 0.0 {
        return 0.0;
    }
    (0.5f64.ln() / (frame_rate.max(1.0) as f64 * retention.ln())) as f32
}

/// Beam size and per-segment energy for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeamProfile {
    /// Quad half-width and end-cap length, in pixels.
    pub size_px: f32,
    /// Gaussian radius, in pixels.
    pub sigma_px: f32,
    /// Energy multiplier applied to [`segment_intensity`].
    pub energy: f32,
}

impl BeamProfile {
    pub fn new(params: &RenderParameters, resolution: u32, point_rate: f32) -> Self {
        let size_px = (params.beam_size() * resolution as f32 * 0.5).max(0.5);
        let focus = params.focus.max(0.01);
        let rate = if point_rate > 0.0 {
            point_rate
        } else {
            DEFAULT_POINT_RATE as f32
        };
        let energy =
            LINE_ENERGY * params.beam_intensity() / focus * (DEFAULT_POINT_RATE as f32 / rate);
        Self {
            size_px,
            sigma_px: size_px / 4.0,
            energy,
        }
    }

    /// Energy deposited at `(x, y)` by a segment, as the shader computes it.
    pub fn deposit(&self, x: f32, y: f32, length: f32) -> f32 {
        segment_intensity(x, y, length, self.sigma_px) * self.energy
    }
}
