//! Turning interleaved audio into beam points.

use super::resampler::LanczosResampler;

/// Default density of beam points, independent of the host sample rate.
pub const DEFAULT_POINT_RATE: f64 = 192_000.0;

/// One sample of simulated beam position and brightness.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeamPoint {
    /// Horizontal deflection, nominally -1.0..1.0.
    pub x: f32,
    /// Vertical deflection, nominally -1.0..1.0 (up is positive).
    pub y: f32,
    /// Brightness multiplier.
    pub z: f32,
    /// Beam colour; `None` uses the hue from the render parameters.
    pub colour: Option<[f32; 3]>,
}

impl BeamPoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            z: 1.0,
            colour: None,
        }
    }
}

/// How input channels map onto beam coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLayout {
    /// One channel drives both axes.
    Mono,
    /// Left = x, right = y.
    Xy,
    /// Third channel is brightness.
    Xyz,
    /// Channels 3..5 are red, green, blue; brightness is fixed at one.
    Xyrgb,
}

impl ChannelLayout {
    pub fn from_channels(channels: usize) -> Self {
        match channels {
            0 | 1 => ChannelLayout::Mono,
            2 => ChannelLayout::Xy,
            3 | 4 => ChannelLayout::Xyz,
            _ => ChannelLayout::Xyrgb,
        }
    }

    /// Number of beam components this layout carries.
    pub fn components(&self) -> usize {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Xy => 2,
            ChannelLayout::Xyz => 3,
            ChannelLayout::Xyrgb => 5,
        }
    }

    fn point(&self, c: &[f32]) -> BeamPoint {
        match self {
            ChannelLayout::Mono => BeamPoint::new(c[0], c[0]),
            ChannelLayout::Xy => BeamPoint::new(c[0], c[1]),
            ChannelLayout::Xyz => BeamPoint {
                x: c[0],
                y: c[1],
                z: c[2],
                colour: None,
            },
            ChannelLayout::Xyrgb => BeamPoint {
                x: c[0],
                y: c[1],
                z: 1.0,
                colour: Some([c[2], c[3], c[4]]),
            },
        }
    }
}

/// Points for one rendered frame.
#[derive(Debug, Clone, Default)]
pub struct BeamFrame {
    pub points: Vec<BeamPoint>,
    /// Points per second the frame was shaped at.
    pub point_rate: f32,
    /// Increments per frame produced by one shaper.
    pub sequence: u64,
}

/// Resamples interleaved audio to the point rate and maps channels to beam
/// coordinates. Keeps resampler state across calls.
pub struct PointShaper {
    layout: ChannelLayout,
    input_channels: usize,
    point_rate: f64,
    resamplers: Vec<LanczosResampler>,
    deinterleaved: Vec<Vec<f32>>,
    resampled: Vec<Vec<f32>>,
    sequence: u64,
}

impl PointShaper {
    pub fn new(input_channels: usize, input_rate: f64, point_rate: f64) -> Self {
        let layout = ChannelLayout::from_channels(input_channels);
        let components = layout.components();
        Self {
            layout,
            input_channels: input_channels.max(1),
            point_rate,
            resamplers: (0..components)
                .map(|_| LanczosResampler::new(input_rate, point_rate))
                .collect(),
            deinterleaved: vec![Vec::new(); components],
            resampled: vec![Vec::new(); components],
            sequence: 0,
        }
    }

    pub fn layout(&self) -> ChannelLayout {
        self.layout
    }

    pub fn point_rate(&self) -> f64 {
        self.point_rate
    }

    /// Change the input rate, dropping resampler history.
    pub fn set_input_rate(&mut self, input_rate: f64) {
        for resampler in &mut self.resamplers {
            resampler.set_rates(input_rate, self.point_rate);
        }
    }

    /// Append the points for `interleaved` to `out`.
    pub fn shape_into(&mut self, interleaved: &[f32], out: &mut Vec<BeamPoint>) {
        let components = self.layout.components();
        for channel in &mut self.deinterleaved {
            channel.clear();
        }
        for frame in interleaved.chunks_exact(self.input_channels) {
            for (c, channel) in self.deinterleaved.iter_mut().enumerate() {
                channel.push(frame[c.min(frame.len() - 1)]);
            }
        }

        for (c, resampler) in self.resamplers.iter_mut().enumerate() {
            self.resampled[c].clear();
            resampler.process(&self.deinterleaved[c], &mut self.resampled[c]);
        }

        // Every resampler saw the same input, so lengths agree.
        let len = self.resampled.iter().map(Vec::len).min().unwrap_or(0);
        out.reserve(len);
        let mut components_buf = [0.0f32; 5];
        for i in 0..len {
            for c in 0..components {
                components_buf[c] = self.resampled[c][i];
            }
            out.push(self.layout.point(&components_buf[..components]));
        }
    }

    /// Shape one frame's worth of audio.
    pub fn shape_frame(&mut self, interleaved: &[f32]) -> BeamFrame {
        let mut points = Vec::new();
        self.shape_into(interleaved, &mut points);
        let sequence = self.sequence;
        self.sequence += 1;
        BeamFrame {
            points,
            point_rate: self.point_rate as f32,
            sequence,
        }
    }
}
