//! Raster frame synthesis.
//!
//! A frame is built from one *row pair*: a turnaround and forward sweep followed by a
//! turnaround and return sweep. Row `i` of the frame uses half `i % 2` of the row pair, so
//! unidirectional scans (whose halves are identical) and odd line counts need no special
//! casing. Each line is `x_size + turn_length` samples long.

use tracing::{debug, warn};

use super::{
    clamp_to_safe, linspace, min_max, PatternMetrics, RasterMetrics, Saturation, WaveformSet,
};
use crate::error::{AppResult, DaqError};
use crate::scan::{ScanConfiguration, TurnaroundStyle, DAC_SAFE_VOLTS};

/// Turn length of the `flat` and `square` turnarounds.
pub const FIXED_TURN_LENGTH: usize = 100;

/// One forward + return line and the turnaround length it contains.
#[derive(Debug, Clone, PartialEq)]
pub struct RowPair {
    /// Samples of both halves
    pub samples: Vec<f64>,
    /// Turnaround samples at the start of each half
    pub turn_length: usize,
    /// Summary of the policy that produced it
    pub status: String,
}

/// Scalars shared by every turnaround policy.
#[derive(Debug, Clone, Copy)]
struct LineGeometry {
    x_size: usize,
    center_x: f64,
    volts_x: f64,
    max_accel_adjusted: f64,
}

impl LineGeometry {
    fn half(&self) -> f64 {
        self.volts_x / 2.0
    }

    fn slope(&self) -> f64 {
        self.volts_x / self.x_size as f64
    }

    fn forward(&self) -> Vec<f64> {
        linspace(
            self.center_x + self.half(),
            self.center_x - self.half(),
            self.x_size,
        )
    }
}

/// Acceleration bound before attenuation correction: `pixel_us² / accel_factor / 1000`.
pub fn temp_accel(config: &ScanConfiguration) -> f64 {
    config.pixel_us * config.pixel_us / config.accel_factor / 1000.0
}

/// Attenuation-corrected acceleration bound. A 1:4 command path (0.25) leaves the bound
/// unchanged; a 1:1 path shrinks it fourfold, lengthening the turnaround.
pub fn max_accel_adjusted(config: &ScanConfiguration) -> f64 {
    temp_accel(config) / (4.0 * config.command_attenuation)
}

/// Turnaround length of a unidirectional line, rejected outside `[0, x_size]`.
pub fn unidirectional_turn_length(x_size: usize, linear_percentage: f64) -> AppResult<usize> {
    let total = (x_size as f64 * (100.0 / linear_percentage)).trunc();
    let turn = total - x_size as f64;
    if !(0.0..=x_size as f64).contains(&turn) {
        return Err(DaqError::configuration(
            "linearpercentage",
            format!(
                "{} gives a turn length of {} outside [0, {}]",
                linear_percentage, turn, x_size
            ),
        ));
    }
    Ok(turn as usize)
}

/// Build the row pair for `config`.
pub fn row_pair(config: &ScanConfiguration) -> AppResult<RowPair> {
    let geometry = LineGeometry {
        x_size: config.x_size,
        center_x: config.center_x_volts,
        volts_x: config.zoom_volts(),
        max_accel_adjusted: max_accel_adjusted(config),
    };
    if config.bidirectional {
        Ok(bidirectional(&geometry, config.turnaround, config.accel_factor))
    } else {
        unidirectional(&geometry, config.linear_percentage)
    }
}

fn unidirectional(geometry: &LineGeometry, linear_percentage: f64) -> AppResult<RowPair> {
    let turn_length = unidirectional_turn_length(geometry.x_size, linear_percentage)?;
    let turn = linspace(
        geometry.center_x - geometry.half(),
        geometry.center_x + geometry.half(),
        turn_length,
    );
    let forward = geometry.forward();
    let samples = [&turn[..], &forward[..], &turn[..], &forward[..]].concat();
    Ok(RowPair {
        samples,
        turn_length,
        status: format!(
            "Standard unidir (TL {}, linear {}",
            turn_length, linear_percentage
        ),
    })
}

fn bidirectional(geometry: &LineGeometry, style: TurnaroundStyle, accel_factor: f64) -> RowPair {
    let forward = geometry.forward();
    let reverse: Vec<f64> = forward.iter().rev().copied().collect();
    let x_size = geometry.x_size;
    let fwd0 = forward.first().copied().unwrap_or(geometry.center_x);
    let rev0 = reverse.first().copied().unwrap_or(geometry.center_x);

    let point = |status: String| RowPair {
        samples: [&forward[..], &reverse[..]].concat(),
        turn_length: 0,
        status,
    };

    match style {
        TurnaroundStyle::Point => point("Standard bidir/point (TL 0".to_string()),
        TurnaroundStyle::Flat => {
            let turn_length = FIXED_TURN_LENGTH;
            let samples = [
                &vec![fwd0; turn_length][..],
                &forward[..],
                &vec![rev0; turn_length][..],
                &reverse[..],
            ]
            .concat();
            RowPair {
                samples,
                turn_length,
                status: format!("Standard bidir/flat (TL {}", turn_length),
            }
        }
        TurnaroundStyle::Square => {
            let turn_length = FIXED_TURN_LENGTH;
            let samples = [
                vec![fwd0; turn_length + x_size],
                vec![rev0; turn_length + x_size],
            ]
            .concat();
            RowPair {
                samples,
                turn_length,
                status: format!("Standard bidir/square (TL {}", turn_length),
            }
        }
        TurnaroundStyle::Parabolic => {
            let factor = 0.5 * geometry.max_accel_adjusted;
            let end_point = (geometry.slope() / (2.0 * factor)).floor() as i64;
            let start = -end_point;
            // Offset from the line start: zero at both ends, peaking mid-turn.
            let end_portion: Vec<f64> = (start..=end_point)
                .map(|t| factor * ((start * start) as f64 - (t * t) as f64))
                .collect();
            if end_portion.len() <= 2 {
                return point(format!(
                    "Standard bidir/parabolic (TL 0, F {}",
                    accel_factor
                ));
            }
            let inner = &end_portion[1..end_portion.len() - 1];
            let turn: Vec<f64> = inner.iter().map(|e| fwd0 + e).collect();
            let turn_rev: Vec<f64> = inner.iter().map(|e| rev0 - e).collect();
            let turn_length = inner.len();
            RowPair {
                samples: [&turn[..], &forward[..], &turn_rev[..], &reverse[..]].concat(),
                turn_length,
                status: format!(
                    "Standard bidir/parabolic (TL {}, F {}",
                    turn_length, accel_factor
                ),
            }
        }
        TurnaroundStyle::MaxAccel => {
            let f = geometry.max_accel_adjusted;
            let turn_length = (2.0 * geometry.slope() / f).trunc() as usize + 1;
            let accel = [
                vec![-f; turn_length],
                vec![0.0; x_size],
                vec![f; turn_length],
                vec![0.0; x_size],
            ]
            .concat();
            let mut velocity = cumulative_sum(&accel);
            subtract_mean(&mut velocity);
            let mut samples = cumulative_sum(&velocity);
            subtract_mean(&mut samples);
            for v in samples.iter_mut() {
                *v += geometry.center_x;
            }
            RowPair {
                samples,
                turn_length,
                status: format!(
                    "Standard bidir/maxAccel (TL {}, F {}",
                    turn_length, accel_factor
                ),
            }
        }
    }
}

fn cumulative_sum(values: &[f64]) -> Vec<f64> {
    values
        .iter()
        .scan(0.0, |acc, &v| {
            *acc += v;
            Some(*acc)
        })
        .collect()
}

fn subtract_mean(values: &mut [f64]) {
    if values.is_empty() {
        return;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    for v in values.iter_mut() {
        *v -= mean;
    }
}

/// Rotate every (x, y) pair by `degrees` about `(cx, cy)`.
fn rotate(x: &mut [f64], y: &mut [f64], degrees: f64, cx: f64, cy: f64) {
    let (sin, cos) = degrees.to_radians().sin_cos();
    for (px, py) in x.iter_mut().zip(y.iter_mut()) {
        let dx = *px - cx;
        let dy = *py - cy;
        *px = dx * cos - dy * sin + cx;
        *py = dx * sin + dy * cos + cy;
    }
}

/// Synthesize one raster frame for `config`.
pub fn synthesize_raster(config: &ScanConfiguration) -> AppResult<WaveformSet> {
    config.validate()?;
    let zoom_volts = config.zoom_volts();
    let volts_x = zoom_volts;
    let volts_y = volts_x * config.y_size as f64 / config.x_size as f64;

    let RowPair {
        samples: mut pair,
        turn_length,
        status,
    } = row_pair(config)?;

    let (pair_min, pair_max) = min_max(&pair);
    let saturated_row_pair = pair_max > DAC_SAFE_VOLTS || pair_min < -DAC_SAFE_VOLTS;

    let line_len = config.x_size + turn_length;
    let frame_points = config.y_size * line_len;
    let estimated_frame_ms = frame_points as f64 * config.pixel_us / 1000.0;
    let row_pair_ms = config.pixel_us * pair.len() as f64 / 1000.0;

    let half_y = volts_y / 2.0;
    let levels = linspace(
        config.center_y_volts + half_y,
        config.center_y_volts - half_y,
        config.y_size,
    );
    let mut x = Vec::with_capacity(frame_points);
    let mut y = Vec::with_capacity(frame_points);
    for (row, level) in levels.iter().enumerate() {
        let offset = (row % 2) * line_len;
        x.extend_from_slice(&pair[offset..offset + line_len]);
        y.extend(std::iter::repeat(*level).take(line_len));
    }

    if config.rotation_degrees != 0.0 {
        rotate(
            &mut x,
            &mut y,
            config.rotation_degrees,
            config.center_x_volts,
            config.center_y_volts,
        );
    }

    let saturation = Saturation::of(&x, &y);
    if saturation.any() || saturated_row_pair {
        warn!(
            x = saturation.x,
            y = saturation.y,
            saturated_row_pair,
            "scan waveform clipped to ±{} V",
            DAC_SAFE_VOLTS
        );
    }
    clamp_to_safe(&mut x);
    clamp_to_safe(&mut y);
    clamp_to_safe(&mut pair);
    let (pair_min, pair_max) = min_max(&pair);
    let row_pair_volt_span = pair_max - pair_min;

    let channels = config.enabled_channels();
    let status_msg = format!("{}, Frame {} ms)", status, estimated_frame_ms.trunc() as i64);
    debug!(
        turn_length,
        row_pair_points = pair.len(),
        frame_points,
        estimated_frame_ms,
        "{}",
        status_msg
    );

    let metrics = RasterMetrics {
        zoom_volts,
        volts_x,
        volts_y,
        temp_accel: temp_accel(config),
        max_accel_adjusted: max_accel_adjusted(config),
        lag_us: config.lag_us(),
        lag_pixels: config.lag_pixels(),
        turn_length,
        row_pair_points: pair.len(),
        row_pair_ms,
        saturated_row_pair,
        row_pair_volt_span,
        frame_points,
        estimated_frame_ms,
        estimated_total_seconds: config.frame_count as f64 * estimated_frame_ms / 1000.0,
        num_adcs: channels.len(),
        channel_letters: config.channel_letters(),
    };

    Ok(WaveformSet {
        x,
        y,
        row_pair: pair,
        saturation,
        repeats: config.frame_count,
        status_msg,
        metrics: PatternMetrics::Raster(metrics),
    })
}
