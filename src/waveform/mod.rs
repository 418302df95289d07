//! Galvo drive waveform synthesis.
//!
//! One entry point, [`synthesize`], turns a [`ScanPattern`] into a [`WaveformSet`]: the X
//! and Y voltage sequences for one frame (raster) or one full sweep (photometry), plus the
//! derived timing and saturation metadata that ends up in the `[Derived]` descriptor
//! section.
//!
//! Synthesis is pure and deterministic. Writing the samples to disk or into an archive is
//! the caller's business ([`WaveformSet::entries`]).

pub mod photometry;
pub mod raster;

use crate::error::AppResult;
use crate::protocol::archive::{ArchiveEntry, SCAN_POINTS_X, SCAN_POINTS_Y};
use crate::protocol::manifest::Section;
use crate::scan::{PhotometryConfiguration, ScanConfiguration, DAC_SAFE_VOLTS};

/// Version tag written as `doscanversion`.
pub const GENERATOR_VERSION: &str = "1.2";

/// What to synthesize.
#[derive(Debug, Clone, Copy)]
pub enum ScanPattern<'a> {
    /// Rectilinear raster frame
    Raster(&'a ScanConfiguration),
    /// Closed curve around a photometry spot
    Photometry(&'a PhotometryConfiguration),
}

/// Synthesize the waveforms for `pattern`.
pub fn synthesize(pattern: ScanPattern<'_>) -> AppResult<WaveformSet> {
    match pattern {
        ScanPattern::Raster(config) => raster::synthesize_raster(config),
        ScanPattern::Photometry(config) => photometry::synthesize_photometry(config),
    }
}

/// Which rail each axis tried to exceed: `1` positive, `-1` negative, `0` neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Saturation {
    /// Fast axis flag
    pub x: i8,
    /// Slow axis flag
    pub y: i8,
}

impl Saturation {
    /// Flags for a pair of unclamped sample sequences.
    pub fn of(x: &[f64], y: &[f64]) -> Self {
        Self {
            x: saturation_flag(x),
            y: saturation_flag(y),
        }
    }

    /// True when either axis was clipped.
    pub fn any(&self) -> bool {
        self.x != 0 || self.y != 0
    }
}

/// `1` if any sample exceeds [`DAC_SAFE_VOLTS`], `-1` if any falls below its negative
/// (the negative rail wins when both are hit), else `0`.
pub fn saturation_flag(samples: &[f64]) -> i8 {
    let (min, max) = min_max(samples);
    if min < -DAC_SAFE_VOLTS {
        -1
    } else if max > DAC_SAFE_VOLTS {
        1
    } else {
        0
    }
}

/// Clip samples in place to the safe DAC envelope.
pub fn clamp_to_safe(samples: &mut [f64]) {
    for v in samples.iter_mut() {
        *v = v.clamp(-DAC_SAFE_VOLTS, DAC_SAFE_VOLTS);
    }
}

pub(crate) fn min_max(samples: &[f64]) -> (f64, f64) {
    samples
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
}

/// `n` evenly spaced samples from `start` to `stop` inclusive.
pub(crate) fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            let mut out: Vec<f64> = (0..n).map(|i| start + i as f64 * step).collect();
            out[n - 1] = stop;
            out
        }
    }
}

/// Derived values of a raster synthesis.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RasterMetrics {
    /// Peak-to-peak X span
    pub zoom_volts: f64,
    /// X span (same as `zoom_volts`)
    pub volts_x: f64,
    /// Y span, scaled by the aspect ratio
    pub volts_y: f64,
    /// Acceleration bound before attenuation correction
    pub temp_accel: f64,
    /// Attenuation-corrected acceleration bound
    pub max_accel_adjusted: f64,
    /// Total detector lag (µs)
    pub lag_us: f64,
    /// Detector lag (pixels)
    pub lag_pixels: i64,
    /// Samples inserted before each line
    pub turn_length: usize,
    /// Samples in one forward + return row pair
    pub row_pair_points: usize,
    /// Duration of one row pair (ms)
    pub row_pair_ms: f64,
    /// Row pair exceeded the safe envelope before clipping
    pub saturated_row_pair: bool,
    /// Peak-to-peak span of the clipped row pair
    pub row_pair_volt_span: f64,
    /// Samples in one frame
    pub frame_points: usize,
    /// Duration of one frame (ms)
    pub estimated_frame_ms: f64,
    /// Duration of all requested frames (s)
    pub estimated_total_seconds: f64,
    /// Number of enabled ADC channels
    pub num_adcs: usize,
    /// Letters of the enabled channels
    pub channel_letters: String,
}

/// Derived values of a photometry synthesis.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PhotometryMetrics {
    /// Times the base cycle was tiled
    pub num_revs: usize,
    /// Milliseconds per revolution
    pub ms_per_rev: f64,
    /// Sample clock period (µs)
    pub pixel_us: f64,
    /// Samples in one base cycle
    pub cycle_points: usize,
}

/// Metadata specific to the pattern kind.
#[derive(Debug, Clone, PartialEq)]
pub enum PatternMetrics {
    /// Raster frame metadata
    Raster(RasterMetrics),
    /// Photometry sweep metadata
    Photometry(PhotometryMetrics),
}

/// Synthesized X/Y drive samples and their derived metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformSet {
    /// Fast-axis samples (V), clipped to the safe envelope
    pub x: Vec<f64>,
    /// Slow-axis samples (V), same length as `x`
    pub y: Vec<f64>,
    /// One forward + return line of the fast axis (raster only)
    pub row_pair: Vec<f64>,
    /// Rails hit before clipping
    pub saturation: Saturation,
    /// How many times the hardware replays `x`/`y`
    pub repeats: usize,
    /// Human-readable summary of the synthesis
    pub status_msg: String,
    /// Pattern-specific metadata
    pub metrics: PatternMetrics,
}

impl WaveformSet {
    /// Samples per transmitted pattern.
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// True when no samples were produced.
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Turnaround samples per line (0 for photometry).
    pub fn turn_length(&self) -> usize {
        match &self.metrics {
            PatternMetrics::Raster(m) => m.turn_length,
            PatternMetrics::Photometry(_) => 0,
        }
    }

    /// Expected duration of one frame in milliseconds (raster only).
    pub fn estimated_frame_ms(&self) -> Option<f64> {
        match &self.metrics {
            PatternMetrics::Raster(m) => Some(m.estimated_frame_ms),
            PatternMetrics::Photometry(_) => None,
        }
    }

    /// Raster metadata, if this is a raster set.
    pub fn raster(&self) -> Option<&RasterMetrics> {
        match &self.metrics {
            PatternMetrics::Raster(m) => Some(m),
            PatternMetrics::Photometry(_) => None,
        }
    }

    /// The transmitted pattern replayed `repeats` times, as the hardware will drive it.
    pub fn replicated(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        (0..self.repeats).flat_map(move |_| self.x.iter().copied().zip(self.y.iter().copied()))
    }

    /// Waveform binaries for the command archive.
    pub fn entries(&self) -> Vec<ArchiveEntry> {
        vec![
            ArchiveEntry::float64(SCAN_POINTS_X, &self.x),
            ArchiveEntry::float64(SCAN_POINTS_Y, &self.y),
        ]
    }

    /// `[Derived]` descriptor section.
    pub fn derived_section(&self, timestamp: &str) -> Section {
        let mut derived = Section::new("Derived");
        match &self.metrics {
            PatternMetrics::Raster(m) => {
                let saturated = if m.saturated_row_pair { "True" } else { "False" };
                derived
                    .set("doscanversion", GENERATOR_VERSION)
                    .set("zoomasvolts", m.zoom_volts)
                    .set("lagus", m.lag_us)
                    .set("lagpixels", m.lag_pixels)
                    .set("numadcs", m.num_adcs)
                    .set("adcchanletters", &m.channel_letters)
                    .set("voltsx", m.volts_x)
                    .set("voltsy", m.volts_y)
                    .set("tempaccel", m.temp_accel)
                    .set("maxacceladjusted", m.max_accel_adjusted)
                    .set("statusmsg", &self.status_msg)
                    .set("turnlength", m.turn_length)
                    .set("rowpairpoints", m.row_pair_points)
                    .set("rowpairms", m.row_pair_ms)
                    .set("saturatedrowpair", saturated)
                    .set("rowpairvoltspan", m.row_pair_volt_span)
                    .set("numframepixels", m.frame_points)
                    .set("estimatedframems", m.estimated_frame_ms)
                    .set("estimatedtotalseconds", m.estimated_total_seconds);
            }
            PatternMetrics::Photometry(m) => {
                derived
                    .set("numrevs", m.num_revs)
                    .set("msperrev", m.ms_per_rev)
                    .set("pixelus", m.pixel_us);
            }
        }
        derived
            .set("saturatedframex", self.saturation.x)
            .set("saturatedframey", self.saturation.y)
            .set("scanpointsx", SCAN_POINTS_X)
            .set("scanpointsy", SCAN_POINTS_Y)
            .set("scanwaveformstimestamp", timestamp);
        derived
    }
}
