//! Render parameters shared between the host and the render thread.
//!
//! The host writes individual fields whenever it likes; the render thread
//! takes one [`RenderParameters`] snapshot at the start of every frame. Each
//! field is an independent atomic, so the latest write to a field wins and
//! no lock is ever taken.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Static texture multiplied over the image, simulating the tube's face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ScreenOverlay {
    Empty = 0,
    #[default]
    Graticule = 1,
    Smudged = 2,
    SmudgedGraticule = 3,
}

impl ScreenOverlay {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ScreenOverlay::Graticule,
            2 => ScreenOverlay::Smudged,
            3 => ScreenOverlay::SmudgedGraticule,
            _ => ScreenOverlay::Empty,
        }
    }

    pub fn has_graticule(&self) -> bool {
        matches!(self, ScreenOverlay::Graticule | ScreenOverlay::SmudgedGraticule)
    }

    pub fn has_smudge(&self) -> bool {
        matches!(self, ScreenOverlay::Smudged | ScreenOverlay::SmudgedGraticule)
    }
}

/// One frame's worth of render settings, in user-facing units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderParameters {
    /// Phosphor persistence; higher keeps trails longer.
    pub persistence: f32,
    /// Beam brightness.
    pub intensity: f32,
    /// Beam width multiplier; smaller is sharper and brighter.
    pub focus: f32,
    /// Beam hue in degrees.
    pub hue: f32,
    /// Saturation of the beam colour.
    pub saturation: f32,
    /// Hue of the graticule and ambient screen light, in degrees.
    pub screen_hue: f32,
    pub screen_saturation: f32,
    /// Strength of the bloom layers.
    pub glow: f32,
    /// How strongly very bright regions burn out towards white.
    pub overexposure: f32,
    /// Ambient light falling on the screen face.
    pub ambient: f32,
    /// Film-grain style noise on top of the dithering.
    pub noise: f32,
    /// Exposure term of the tone curve `1 - 2^(-exposure * light)`.
    pub exposure: f32,
    /// How much longer bright light lingers than dim light, 0..10. Zero
    /// fades every pixel at the same rate.
    pub afterglow: f32,
    /// Plot channel 0 against time instead of against channel 1.
    pub sweep: bool,
    /// Milliseconds one left-to-right sweep takes.
    pub sweep_ms: f32,
    /// Level channel 0 must rise through before a finished sweep restarts.
    pub trigger: f32,
    pub flip_horizontal: bool,
    pub flip_vertical: bool,
    /// Mid/side view: mono signals stand upright, out-of-phase ones lie flat.
    pub goniometer: bool,
    /// Scale each frame's beam energy to exactly one frame interval of
    /// points, so frame brightness stays constant when point counts jitter.
    pub shutter_sync: bool,
    pub overlay: ScreenOverlay,
    /// Frames per second the compositor is being driven at.
    pub frame_rate: f32,
    /// Square output edge in pixels.
    pub resolution: u32,
}

impl Default for RenderParameters {
    fn default() -> Self {
        Self {
            persistence: 0.5,
            intensity: 5.0,
            focus: 1.0,
            hue: 125.0,
            saturation: 1.0,
            screen_hue: 0.0,
            screen_saturation: 1.0,
            glow: 0.3,
            overexposure: 0.5,
            ambient: 0.0,
            noise: 0.0,
            exposure: 0.25,
            afterglow: 0.0,
            sweep: false,
            sweep_ms: 10.0,
            trigger: 0.0,
            flip_horizontal: false,
            flip_vertical: false,
            goniometer: false,
            shutter_sync: false,
            overlay: ScreenOverlay::Graticule,
            frame_rate: 60.0,
            resolution: 1024,
        }
    }
}

impl RenderParameters {
    /// Persistence exponent fed into the fade formula.
    pub fn persistence_exponent(&self) -> f32 {
        self.persistence - 1.33
    }

    /// Intensity scale applied to every beam segment.
    pub fn beam_intensity(&self) -> f32 {
        self.intensity / 100.0
    }

    /// Beam width as a fraction of the half-screen.
    pub fn beam_size(&self) -> f32 {
        (self.focus * 0.008).max(1e-4)
    }

    pub fn glow_amount(&self) -> f32 {
        self.glow * 3.0
    }

    pub fn noise_amount(&self) -> f32 {
        self.noise / 5.0
    }

    pub fn afterglow_amount(&self) -> f32 {
        self.afterglow.clamp(0.0, 10.0)
    }

    /// Sweep duration, never zero.
    pub fn sweep_seconds(&self) -> f64 {
        (self.sweep_ms as f64 / 1000.0).max(1e-4)
    }

    /// Fully saturated beam colour. Saturation is applied to the whole
    /// line image at composite time.
    pub fn beam_colour(&self) -> [f32; 3] {
        hsv_to_rgb(self.hue, 1.0, 1.0)
    }

    /// Screen light colour from screen hue and saturation.
    pub fn screen_colour(&self) -> [f32; 3] {
        hsv_to_rgb(self.screen_hue, self.screen_saturation, 1.0)
    }
}

/// HSV to linear RGB. Hue in degrees, saturation and value in 0..1.
pub fn hsv_to_rgb(hue: f32, saturation: f32, value: f32) -> [f32; 3] {
    let h = hue.rem_euclid(360.0) / 60.0;
    let s = saturation.clamp(0.0, 1.0);
    let c = value * s;
    let x = c * (1.0 - (h % 2.0 - 1.0).abs());
    let m = value - c;
    let (r, g, b) = match h as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    [r + m, g + m, b + m]
}

#[derive(Default)]
struct AtomicF32(AtomicU32);

impl AtomicF32 {
    fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Lock-free home of the current parameters.
#[derive(Default)]
pub struct SharedRenderParameters {
    persistence: AtomicF32,
    intensity: AtomicF32,
    focus: AtomicF32,
    hue: AtomicF32,
    saturation: AtomicF32,
    screen_hue: AtomicF32,
    screen_saturation: AtomicF32,
    glow: AtomicF32,
    overexposure: AtomicF32,
    ambient: AtomicF32,
    noise: AtomicF32,
    exposure: AtomicF32,
    afterglow: AtomicF32,
    sweep: AtomicBool,
    sweep_ms: AtomicF32,
    trigger: AtomicF32,
    flip_horizontal: AtomicBool,
    flip_vertical: AtomicBool,
    goniometer: AtomicBool,
    shutter_sync: AtomicBool,
    overlay: AtomicU8,
    frame_rate: AtomicF32,
    resolution: AtomicU32,
}

impl SharedRenderParameters {
    pub fn new(initial: &RenderParameters) -> Self {
        let shared = Self::default();
        shared.store(initial);
        shared
    }

    /// Overwrite every field.
    pub fn store(&self, p: &RenderParameters) {
        self.persistence.store(p.persistence);
        self.intensity.store(p.intensity);
        self.focus.store(p.focus);
        self.hue.store(p.hue);
        self.saturation.store(p.saturation);
        self.screen_hue.store(p.screen_hue);
        self.screen_saturation.store(p.screen_saturation);
        self.glow.store(p.glow);
        self.overexposure.store(p.overexposure);
        self.ambient.store(p.ambient);
        self.noise.store(p.noise);
        self.exposure.store(p.exposure);
        self.afterglow.store(p.afterglow);
        self.sweep.store(p.sweep, Ordering::Relaxed);
        self.sweep_ms.store(p.sweep_ms);
        self.trigger.store(p.trigger);
        self.flip_horizontal.store(p.flip_horizontal, Ordering::Relaxed);
        self.flip_vertical.store(p.flip_vertical, Ordering::Relaxed);
        self.goniometer.store(p.goniometer, Ordering::Relaxed);
        self.shutter_sync.store(p.shutter_sync, Ordering::Relaxed);
        self.overlay.store(p.overlay as u8, Ordering::Relaxed);
        self.frame_rate.store(p.frame_rate);
        self.resolution.store(p.resolution, Ordering::Relaxed);
    }

    /// Read every field once.
    pub fn snapshot(&self) -> RenderParameters {
        RenderParameters {
            persistence: self.persistence.load(),
            intensity: self.intensity.load(),
            focus: self.focus.load(),
            hue: self.hue.load(),
            saturation: self.saturation.load(),
            screen_hue: self.screen_hue.load(),
            screen_saturation: self.screen_saturation.load(),
            glow: self.glow.load(),
            overexposure: self.overexposure.load(),
            ambient: self.ambient.load(),
            noise: self.noise.load(),
            exposure: self.exposure.load(),
            afterglow: self.afterglow.load(),
            sweep: self.sweep.load(Ordering::Relaxed),
            sweep_ms: self.sweep_ms.load(),
            trigger: self.trigger.load(),
            flip_horizontal: self.flip_horizontal.load(Ordering::Relaxed),
            flip_vertical: self.flip_vertical.load(Ordering::Relaxed),
            goniometer: self.goniometer.load(Ordering::Relaxed),
            shutter_sync: self.shutter_sync.load(Ordering::Relaxed),
            overlay: ScreenOverlay::from_u8(self.overlay.load(Ordering::Relaxed)),
            frame_rate: self.frame_rate.load(),
            resolution: self.resolution.load(Ordering::Relaxed),
        }
    }

    pub fn set_persistence(&self, value: f32) {
        self.persistence.store(value);
    }

    pub fn set_intensity(&self, value: f32) {
        self.intensity.store(value);
    }

    pub fn set_focus(&self, value: f32) {
        self.focus.store(value);
    }

    pub fn set_hue(&self, value: f32) {
        self.hue.store(value);
    }

    pub fn set_glow(&self, value: f32) {
        self.glow.store(value);
    }

    pub fn set_afterglow(&self, value: f32) {
        self.afterglow.store(value);
    }

    /// Switch sweep mode with its duration and trigger level.
    pub fn set_sweep(&self, enabled: bool, sweep_ms: f32, trigger: f32) {
        self.sweep_ms.store(sweep_ms);
        self.trigger.store(trigger);
        self.sweep.store(enabled, Ordering::Relaxed);
    }

    pub fn set_flip(&self, horizontal: bool, vertical: bool) {
        self.flip_horizontal.store(horizontal, Ordering::Relaxed);
        self.flip_vertical.store(vertical, Ordering::Relaxed);
    }

    pub fn set_goniometer(&self, enabled: bool) {
        self.goniometer.store(enabled, Ordering::Relaxed);
    }

    pub fn set_shutter_sync(&self, enabled: bool) {
        self.shutter_sync.store(enabled, Ordering::Relaxed);
    }

    pub fn set_overlay(&self, overlay: ScreenOverlay) {
        self.overlay.store(overlay as u8, Ordering::Relaxed);
    }

    pub fn set_frame_rate(&self, value: f32) {
        self.frame_rate.store(value);
    }

    pub fn set_resolution(&self, value: u32) {
        self.resolution.store(value, Ordering::Relaxed);
    }
}
