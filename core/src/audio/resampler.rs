//! Streaming band-limited resampler.
//!
//! A windowed-sinc (Lanczos, a = 4) interpolator with a precomputed kernel
//! table. Each channel gets its own [`LanczosResampler`]; state carries
//! across calls so blocks can be fed in as they arrive.

use std::f64::consts::PI;
use std::sync::{Arc, OnceLock};

/// Lanczos window radius.
const LOBES: usize = 4;
/// Input samples contributing to each output sample.
pub const TAPS: usize = LOBES * 2;
/// Fractional positions resolved by the kernel table.
pub const PHASES: usize = 2048;

/// Kernel weights for `PHASES + 1` fractional offsets, `TAPS` weights each.
/// Row `p` serves fractional position `p / PHASES`; each row sums to one.
fn kernel_table() -> Arc<[f32]> {
    static TABLE: OnceLock<Arc<[f32]>> = OnceLock::new();
    TABLE
        .get_or_init(|| {
            let mut table = Vec::with_capacity((PHASES + 1) * TAPS);
            for phase in 0..=PHASES {
                let frac = phase as f64 / PHASES as f64;
                let mut row = [0.0f64; TAPS];
                for (k, w) in row.iter_mut().enumerate() {
                    let x = k as f64 - (LOBES - 1) as f64 - frac;
                    *w = lanczos(x);
                }
                let sum: f64 = row.iter().sum();
                table.extend(row.iter().map(|w| (w / sum) as f32));
            }
            table.into()
        })
        .clone()
}

fn lanczos(x: f64) -> f64 {
    if x.abs() < 1e-9 {
        return 1.0;
    }
    if x.abs() >= LOBES as f64 {
        return 0.0;
    }
    let a = LOBES as f64;
    let px = PI * x;
    a * px.sin() * (px / a).sin() / (px * px)
}

/// Fractional bits of the fixed-point read position.
const FRAC_BITS: u32 = 32;
const ONE: u64 = 1 << FRAC_BITS;

/// Single-channel streaming resampler.
///
/// The read position is kept in 32.32 fixed point so output is identical no
/// matter how the input is split into blocks.
#[derive(Clone)]
pub struct LanczosResampler {
    table: Arc<[f32]>,
    /// Input samples consumed per output sample, fixed point.
    step: u64,
    history: Vec<f32>,
    /// Read position into `history`, fixed point.
    position: u64,
}

impl LanczosResampler {
    pub fn new(input_rate: f64, output_rate: f64) -> Self {
        let mut resampler = Self {
            table: kernel_table(),
            step: ONE,
            history: Vec::new(),
            position: 0,
        };
        resampler.set_rates(input_rate, output_rate);
        resampler
    }

    /// Change rates and clear history.
    pub fn set_rates(&mut self, input_rate: f64, output_rate: f64) {
        let step = if input_rate > 0.0 && output_rate > 0.0 {
            input_rate / output_rate
        } else {
            1.0
        };
        self.step = ((step * ONE as f64).round() as u64).max(1);
        self.reset();
    }

    /// Output samples produced per input sample.
    pub fn ratio(&self) -> f64 {
        ONE as f64 / self.step as f64
    }

    /// Drop all buffered input.
    pub fn reset(&mut self) {
        self.history.clear();
        // Leading silence so the first input sample sits at the kernel centre.
        self.history.resize(LOBES - 1, 0.0);
        self.position = ((LOBES - 1) as u64) << FRAC_BITS;
    }

    /// Upper bound on outputs for `input_len` further inputs.
    pub fn max_output_len(&self, input_len: usize) -> usize {
        ((self.history.len() + input_len) as f64 * self.ratio()).ceil() as usize + 1
    }

    /// Feed input samples, appending every output sample that can be fully
    /// computed to `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        self.history.extend_from_slice(input);

        loop {
            let index = (self.position >> FRAC_BITS) as usize;
            if index + LOBES >= self.history.len() {
                break;
            }

            let frac = self.position & (ONE - 1);
            let phase = ((frac * PHASES as u64 + (ONE >> 1)) >> FRAC_BITS) as usize;
            let weights = &self.table[phase * TAPS..(phase + 1) * TAPS];
            let window = &self.history[index + 1 - LOBES..index + 1 + LOBES];

            let sample: f32 = window.iter().zip(weights).map(|(s, w)| s * w).sum();
            out.push(sample);
            self.position += self.step;
        }

        // Keep just enough history for the next kernel window.
        let keep_from = ((self.position >> FRAC_BITS) as usize).saturating_sub(LOBES - 1);
        if keep_from > 0 {
            self.history.drain(..keep_from);
            self.position -= (keep_from as u64) << FRAC_BITS;
        }
    }
}
