//! Procedural screen-face textures.
//!
//! The rgb channels hold a multiplier for the image (white means untouched)
//! and alpha marks graticule lines, which the composite pass lights with the
//! screen colour.

use image::{Rgba, RgbaImage};

use super::params::ScreenOverlay;

/// Edge length of generated overlays in pixels.
pub const OVERLAY_SIZE: u32 = 512;

/// Major divisions across each axis.
const DIVISIONS: u32 = 10;
/// Minor ticks per major division along the centre axes.
const MINOR_TICKS: u32 = 5;

/// Darkest multiplier a smudge can reach.
const SMUDGE_FLOOR: f32 = 0.82;

/// Generate the overlay for `mode` at `size` x `size` pixels.
pub fn generate_overlay(mode: ScreenOverlay, size: u32) -> RgbaImage {
    let size = size.max(DIVISIONS * 2);
    let mut image = RgbaImage::from_pixel(size, size, Rgba([255, 255, 255, 0]));

    if mode.has_smudge() {
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            let u = x as f32 / size as f32;
            let v = y as f32 / size as f32;
            let m = smudge(u, v);
            let value = (m * 255.0).round() as u8;
            pixel.0 = [value, value, value, 0];
        }
    }

    if mode.has_graticule() {
        draw_graticule(&mut image, size);
    }

    image
}

fn draw_graticule(image: &mut RgbaImage, size: u32) {
    let cell = size as f32 / DIVISIONS as f32;
    let centre = size as f32 / 2.0;
    let tick_half = (cell * 0.08).max(1.0);

    for y in 0..size {
        for x in 0..size {
            let px = x as f32 + 0.5;
            let py = y as f32 + 0.5;

            let major = distance_to_grid(px, cell).min(distance_to_grid(py, cell));
            let mut mask = line_coverage(major, 0.9);

            // Minor ticks crossing the two centre lines.
            let minor = cell / MINOR_TICKS as f32;
            if (py - centre).abs() <= tick_half {
                mask = mask.max(line_coverage(distance_to_grid(px, minor), 0.6));
            }
            if (px - centre).abs() <= tick_half {
                mask = mask.max(line_coverage(distance_to_grid(py, minor), 0.6));
            }

            if mask > 0.0 {
                let pixel = image.get_pixel_mut(x, y);
                pixel.0[3] = pixel.0[3].max((mask * 255.0).round() as u8);
            }
        }
    }
}

fn distance_to_grid(p: f32, spacing: f32) -> f32 {
    let r = p.rem_euclid(spacing);
    r.min(spacing - r)
}

/// Anti-aliased coverage of a line of the given half-width.
fn line_coverage(distance: f32, half_width: f32) -> f32 {
    (half_width + 0.5 - distance).clamp(0.0, 1.0)
}

/// Low-frequency value noise in `SMUDGE_FLOOR..=1`. Deterministic.
fn smudge(u: f32, v: f32) -> f32 {
    let coarse = value_noise(u * 4.0, v * 4.0, 17);
    let fine = value_noise(u * 11.0, v * 11.0, 91);
    let n = (coarse * 0.7 + fine * 0.3).clamp(0.0, 1.0);
    1.0 - (1.0 - SMUDGE_FLOOR) * n * n
}

fn value_noise(x: f32, y: f32, seed: u32) -> f32 {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = smoothstep(x - x0);
    let fy = smoothstep(y - y0);
    let (xi, yi) = (x0 as i32, y0 as i32);

    let a = lattice(xi, yi, seed);
    let b = lattice(xi + 1, yi, seed);
    let c = lattice(xi, yi + 1, seed);
    let d = lattice(xi + 1, yi + 1, seed);
    let top = a + (b - a) * fx;
    let bottom = c + (d - c) * fx;
    top + (bottom - top) * fy
}

fn smoothstep(t: f32) -> f32 {
    t * t * (3.0 - 2.0 * t)
}

fn lattice(x: i32, y: i32, seed: u32) -> f32 {
    let mut h = (x as u32).wrapping_mul(0x27d4_eb2d)
        ^ (y as u32).wrapping_mul(0x1656_67b1)
        ^ seed.wrapping_mul(0x9e37_79b9);
    h ^= h >> 15;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    (h & 0xffff) as f32 / 65535.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_overlay_is_transparent_white() {
        let image = generate_overlay(ScreenOverlay::Empty, 64);
        assert!(image.pixels().all(|p| p.0 == [255, 255, 255, 0]));
    }

    #[test]
    fn test_graticule_marks_centre_lines_only() {
        let size = 100;
        let image = generate_overlay(ScreenOverlay::Graticule, size);
        // Vertical centre line.
        assert!(image.get_pixel(50, 25).0[3] > 200);
        // Middle of a cell.
        assert_eq!(image.get_pixel(15, 15).0[3], 0);
        // Graticule does not darken the face.
        assert!(image.pixels().all(|p| p.0[0] == 255));
    }

    #[test]
    fn test_graticule_has_minor_ticks_on_axes() {
        let size = 500;
        let image = generate_overlay(ScreenOverlay::Graticule, size);
        // One minor division is 10 px; x = 260 is a tick on the horizontal axis.
        assert!(image.get_pixel(260, 250).0[3] > 0);
        // Same x away from the axis is clear.
        assert_eq!(image.get_pixel(260, 225).0[3], 0);
    }

    #[test]
    fn test_smudge_is_deterministic_and_bounded() {
        let a = generate_overlay(ScreenOverlay::Smudged, 128);
        let b = generate_overlay(ScreenOverlay::Smudged, 128);
        assert_eq!(a, b);

        let floor = (SMUDGE_FLOOR * 255.0).floor() as u8;
        assert!(a.pixels().all(|p| p.0[0] >= floor && p.0[3] == 0));
        assert!(a.pixels().any(|p| p.0[0] < 250));
    }

    #[test]
    fn test_smudged_graticule_combines_both() {
        let image = generate_overlay(ScreenOverlay::SmudgedGraticule, 100);
        assert!(image.get_pixel(50, 25).0[3] > 200);
        assert!(image.pixels().any(|p| p.0[0] < 255));
    }
}
