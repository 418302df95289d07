//! Photometry sweep synthesis.
//!
//! Photometry always runs on a 1 MHz sample clock. A base cycle (one revolution, or one
//! in-and-out spiral) is computed once, checked for saturation, then tiled enough times to
//! cover the requested duration plus one extra cycle.

use std::f64::consts::{FRAC_PI_2, PI};

use tracing::{info, warn};

use super::{clamp_to_safe, linspace, PatternMetrics, PhotometryMetrics, Saturation, WaveformSet};
use crate::error::{AppResult, DaqError};
use crate::scan::{PhotometryConfiguration, PhotometryShape, DAC_SAFE_VOLTS};

/// Sample period of the photometry clock (µs).
pub const PHOTOMETRY_PIXEL_US: f64 = 1.0;

const POINTS_PER_MS: f64 = 1000.0 / PHOTOMETRY_PIXEL_US;

/// Lissajous frequency ratio.
const LISSAJOUS_A: f64 = 3.0;
const LISSAJOUS_B: f64 = 4.0;

/// Rings and innermost radius fraction of each spiral variant.
fn spiral_rings(shape: PhotometryShape) -> Option<(usize, f64)> {
    match shape {
        PhotometryShape::Spiral => Some((5, 0.1)),
        PhotometryShape::HalfSpiral => Some((3, 0.5)),
        PhotometryShape::Circle | PhotometryShape::Lissajous => None,
    }
}

/// Angles of `n` samples around a full turn, end point excluded.
fn angles(n: usize) -> impl Iterator<Item = f64> {
    (0..n).map(move |k| 2.0 * PI * k as f64 / n as f64)
}

fn ring(cx: f64, cy: f64, radius: f64, points: usize, x: &mut Vec<f64>, y: &mut Vec<f64>) {
    for theta in angles(points) {
        x.push(cx + radius * theta.cos());
        y.push(cy + radius * theta.sin());
    }
}

/// One base cycle of `config.shape`.
fn base_cycle(config: &PhotometryConfiguration, points_per_rev: usize) -> (Vec<f64>, Vec<f64>) {
    let (cx, cy) = (config.center_x_volts, config.center_y_volts);
    let radius = config.radius_volts();
    let mut x = Vec::new();
    let mut y = Vec::new();

    match config.shape {
        PhotometryShape::Circle => ring(cx, cy, radius, points_per_rev, &mut x, &mut y),
        PhotometryShape::Lissajous => {
            for theta in angles(points_per_rev) {
                x.push(cx + radius * (FRAC_PI_2 + LISSAJOUS_A * theta).sin());
                y.push(cy + radius * (LISSAJOUS_B * theta).cos());
            }
        }
        PhotometryShape::Spiral | PhotometryShape::HalfSpiral => {
            let (steps, inner) = spiral_rings(config.shape).unwrap_or((1, 1.0));
            let radii = linspace(radius, inner * radius, steps);
            // Points scale with circumference so the spot speed stays roughly constant.
            let points_for = |r: f64| (points_per_rev as f64 * (r / radius)).trunc() as usize;
            for &r in &radii {
                ring(cx, cy, r, points_for(r), &mut x, &mut y);
            }
            for &r in radii[..radii.len() - 1].iter().rev() {
                ring(cx, cy, r, points_for(r), &mut x, &mut y);
            }
        }
    }
    (x, y)
}

/// Synthesize the full photometry sweep for `config`.
pub fn synthesize_photometry(config: &PhotometryConfiguration) -> AppResult<WaveformSet> {
    config.validate()?;
    let ms_per_rev = config.ms_per_rev();
    let points_per_rev = (POINTS_PER_MS * ms_per_rev).trunc() as usize;
    if points_per_rev == 0 {
        return Err(DaqError::configuration(
            "photometryrevperms",
            format!(
                "{} revolutions per ms leaves no samples per revolution",
                config.rev_per_ms
            ),
        ));
    }

    let (cycle_x, cycle_y) = base_cycle(config, points_per_rev);
    if cycle_x.is_empty() {
        return Err(DaqError::configuration(
            "photometrydiameter",
            "pattern has no samples",
        ));
    }
    let cycle_ms = match config.shape {
        PhotometryShape::Circle | PhotometryShape::Lissajous => ms_per_rev,
        PhotometryShape::Spiral | PhotometryShape::HalfSpiral => {
            cycle_x.len() as f64 / POINTS_PER_MS
        }
    };
    let num_revs = 1 + (config.duration_ms / cycle_ms).floor() as usize;

    let saturation = Saturation::of(&cycle_x, &cycle_y);
    if saturation.any() {
        warn!(
            x = saturation.x,
            y = saturation.y,
            "photometry waveform clipped to ±{} V",
            DAC_SAFE_VOLTS
        );
    }

    let mut x = cycle_x.repeat(num_revs);
    let mut y = cycle_y.repeat(num_revs);
    clamp_to_safe(&mut x);
    clamp_to_safe(&mut y);

    let status_msg = format!(
        "Photometry {} mode is armed ({} points per cycle)",
        config.shape,
        cycle_x.len()
    );
    info!("{}", status_msg);

    Ok(WaveformSet {
        x,
        y,
        row_pair: Vec::new(),
        saturation,
        repeats: 1,
        status_msg,
        metrics: PatternMetrics::Photometry(PhotometryMetrics {
            num_revs,
            ms_per_rev,
            pixel_us: PHOTOMETRY_PIXEL_US,
            cycle_points: cycle_x.len(),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waveform::{synthesize, ScanPattern};

    fn config(shape: PhotometryShape) -> PhotometryConfiguration {
        PhotometryConfiguration {
            center_x_volts: 1.0,
            center_y_volts: -2.0,
            duration_ms: 10.0,
            diameter_um: 1000.0,
            shape,
            rev_per_ms: 0.5,
            ..Default::default()
        }
    }

    fn metrics(set: &WaveformSet) -> &PhotometryMetrics {
        match &set.metrics {
            PatternMetrics::Photometry(m) => m,
            PatternMetrics::Raster(_) => panic!("expected photometry metrics"),
        }
    }

    #[test]
    fn test_circle_covers_duration() {
        let set = synthesize(ScanPattern::Photometry(&config(PhotometryShape::Circle))).unwrap();
        let m = metrics(&set);
        assert_eq!(m.cycle_points, 2000);
        assert_eq!(m.num_revs, 6);
        assert_eq!(set.len(), 12_000);
        assert_eq!(set.repeats, 1);
        assert_eq!(set.turn_length(), 0);
        // theta = 0 sits on the +X side of the spot
        assert!((set.x[0] - 1.5).abs() < 1e-12);
        assert!((set.y[0] + 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_lissajous_stays_within_radius() {
        let set = synthesize_photometry(&config(PhotometryShape::Lissajous)).unwrap();
        assert!(set
            .x
            .iter()
            .zip(&set.y)
            .all(|(x, y)| (x - 1.0).abs() <= 0.5 + 1e-12 && (y + 2.0).abs() <= 0.5 + 1e-12));
        assert!((set.y[0] - (-1.5)).abs() < 1e-12);
    }

    #[test]
    fn test_spiral_ring_sizes() {
        let set = synthesize_photometry(&config(PhotometryShape::Spiral)).unwrap();
        // Radii 1.0, 0.775, 0.55, 0.325, 0.1 of the outer ring, then back out without
        // repeating the innermost one. Each ring may lose one point to truncation.
        let inward = 2000 + 1550 + 1100 + 650 + 200;
        let outward = 650 + 1100 + 1550 + 2000;
        let cycle = metrics(&set).cycle_points;
        assert!(cycle <= inward + outward && cycle + 9 >= inward + outward, "{}", cycle);
        assert_eq!(metrics(&set).num_revs, 1 + (10.0 / (cycle as f64 / 1000.0)) as usize);
        assert_eq!(set.len(), cycle * metrics(&set).num_revs);
        // The sweep ends back on the outer ring.
        let last = cycle - 1;
        let r = ((set.x[last] - 1.0).powi(2) + (set.y[last] + 2.0).powi(2)).sqrt();
        assert!((r - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_half_spiral_ring_sizes() {
        // Radii 0.5, 0.375, 0.25 V are exact in binary.
        let set = synthesize_photometry(&config(PhotometryShape::HalfSpiral)).unwrap();
        let cycle = 2000 + 1500 + 1000 + 1500 + 2000;
        assert_eq!(metrics(&set).cycle_points, cycle);
        assert_eq!(metrics(&set).num_revs, 2);
    }

    #[test]
    fn test_saturation_is_flagged_and_clipped() {
        let mut cfg = config(PhotometryShape::Circle);
        cfg.center_x_volts = 9.9;
        cfg.center_y_volts = -9.9;
        let set = synthesize_photometry(&cfg).unwrap();
        assert_eq!(set.saturation, Saturation { x: 1, y: -1 });
        assert!(set.x.iter().chain(&set.y).all(|v| v.abs() <= DAC_SAFE_VOLTS));
    }

    #[test]
    fn test_too_fast_revolution_is_rejected() {
        let mut cfg = config(PhotometryShape::Circle);
        cfg.rev_per_ms = 2000.0;
        assert!(synthesize_photometry(&cfg).is_err());
    }

    #[test]
    fn test_derived_section_keys() {
        let set = synthesize_photometry(&config(PhotometryShape::Circle)).unwrap();
        let derived = set.derived_section("now");
        assert_eq!(derived.get("numrevs"), Some("6"));
        assert_eq!(derived.get("msperrev"), Some("2"));
        assert_eq!(derived.get("pixelus"), Some("1"));
        assert_eq!(derived.get("scanpointsx"), Some("ScanPointsX_float64.bin"));
    }
}
