//! Typed scan parameters.
//!
//! [`ScanConfiguration`] and [`PhotometryConfiguration`] are the strongly-typed form of the
//! `[Major]`/`[Minor]` parameter blocks the hardware controller understands. They are
//! plain values: loaded from settings, compared for dirty-tracking by the orchestrator,
//! and translated to manifest sections only at the protocol boundary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::SystemConfig;
use crate::error::{AppResult, DaqError, DecodeError};
use crate::protocol::archive::channel_letter;
use crate::protocol::manifest::{parse_flag, Manifest, Section};
use crate::waveform::raster::unidirectional_turn_length;

/// Largest magnitude either DAC output may be driven to.
pub const DAC_SAFE_VOLTS: f64 = 9.996;

/// Number of ADC channels (A..D) the controller can digitize.
pub const MAX_CHANNELS: usize = 4;

/// Lowest and highest zoom accepted by [`zoom_to_voltage`].
pub const ZOOM_RANGE: (f64, f64) = (1.0, 9.0);

/// Convert a zoom level to the peak-to-peak X voltage span.
///
/// Zoom 1 gives roughly the full ±10 V span. Out-of-range zoom is clamped to
/// [`ZOOM_RANGE`] with a warning.
pub fn zoom_to_voltage(zoom: f64) -> f64 {
    let (min, max) = ZOOM_RANGE;
    let clamped = if zoom < min {
        warn!(zoom, "minimum zoom is {}", min);
        min
    } else if zoom > max {
        warn!(zoom, "maximum zoom is {}", max);
        max
    } else {
        zoom
    };
    39.9998 * (-clamped / 1.4427).exp()
}

/// How the fast axis reverses direction between bidirectional lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TurnaroundStyle {
    /// Instant reversal (debugging only)
    Point,
    /// Hold the line start voltage for a fixed number of samples
    Flat,
    /// Hold each endpoint for the turnaround and the whole line
    Square,
    /// Quadratic, constant-deceleration turnaround
    Parabolic,
    /// Bang-bang acceleration integrated twice
    #[default]
    MaxAccel,
}

impl TurnaroundStyle {
    /// Name used in the `bidirends` descriptor key.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Point => "point",
            Self::Flat => "flat",
            Self::Square => "square",
            Self::Parabolic => "parabolic",
            Self::MaxAccel => "maxaccel",
        }
    }
}

impl fmt::Display for TurnaroundStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TurnaroundStyle {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "point" => Ok(Self::Point),
            "flat" => Ok(Self::Flat),
            "square" => Ok(Self::Square),
            "parabolic" => Ok(Self::Parabolic),
            "maxaccel" => Ok(Self::MaxAccel),
            other => Err(DaqError::configuration(
                "bidirends",
                format!("unknown bidirectional scan mode '{}'", other),
            )),
        }
    }
}

/// Closed curve traced during photometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PhotometryShape {
    /// Single circle
    #[default]
    Circle,
    /// 3:4 Lissajous figure
    Lissajous,
    /// Five rings shrinking to 10% of the diameter and back
    Spiral,
    /// Three rings shrinking to 50% of the diameter and back
    HalfSpiral,
}

impl PhotometryShape {
    /// Name used in the `photometryshape` key.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Circle => "circle",
            Self::Lissajous => "lissajous",
            Self::Spiral => "spiral",
            Self::HalfSpiral => "halfspiral",
        }
    }
}

impl fmt::Display for PhotometryShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhotometryShape {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "circle" => Ok(Self::Circle),
            "lissajous" => Ok(Self::Lissajous),
            "spiral" => Ok(Self::Spiral),
            "halfspiral" => Ok(Self::HalfSpiral),
            other => Err(DaqError::configuration(
                "photometryshape",
                format!("no generator for photometry shape '{}'", other),
            )),
        }
    }
}

/// Everything needed to synthesize one raster frame and decode what comes back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfiguration {
    /// Pixels per line
    pub x_size: usize,
    /// Lines per frame
    pub y_size: usize,
    /// Pixel dwell time in microseconds
    pub pixel_us: f64,
    /// Zoom level, mapped to a voltage span by [`zoom_to_voltage`]
    pub zoom: f64,
    /// Acquire on both the forward and the return sweep
    pub bidirectional: bool,
    /// Turnaround policy for bidirectional scans
    pub turnaround: TurnaroundStyle,
    /// Share of a unidirectional line spent on the linear ramp (percent)
    pub linear_percentage: f64,
    /// Acceleration divisor; larger means gentler turnarounds
    pub accel_factor: f64,
    /// Attenuation of the galvo command input (0.25 for a 1:4 path)
    pub command_attenuation: f64,
    /// Full-scale input voltage per channel A..D; zero disables the channel
    pub channel_full_scale: [f64; MAX_CHANNELS],
    /// Display names per channel A..D
    pub channel_names: [String; MAX_CHANNELS],
    /// Fast-axis offset in volts
    pub center_x_volts: f64,
    /// Slow-axis offset in volts
    pub center_y_volts: f64,
    /// Frame rotation in degrees about the center
    pub rotation_degrees: f64,
    /// Installation detector lag (µs)
    pub system_lag_us: f64,
    /// Per-session lag tweak added to the system lag (µs)
    pub lag_tweak_us: f64,
    /// Frames requested from the hardware
    pub frame_count: usize,
    /// Dump one row pair to the temp folder for inspection
    pub save_row_pair: bool,
}

impl Default for ScanConfiguration {
    fn default() -> Self {
        Self {
            x_size: 512,
            y_size: 512,
            pixel_us: 2.0,
            zoom: 1.0,
            bidirectional: true,
            turnaround: TurnaroundStyle::MaxAccel,
            linear_percentage: 80.0,
            accel_factor: 13.0,
            command_attenuation: 0.25,
            channel_full_scale: [1.0, 1.0, 0.0, 0.0],
            channel_names: [
                "Green".to_string(),
                "Red".to_string(),
                "ChanC".to_string(),
                "ChanD".to_string(),
            ],
            center_x_volts: 0.0,
            center_y_volts: 0.0,
            rotation_degrees: 0.0,
            system_lag_us: 0.0,
            lag_tweak_us: 0.0,
            frame_count: 1,
            save_row_pair: false,
        }
    }
}

impl ScanConfiguration {
    /// Check the values synthesis relies on.
    pub fn validate(&self) -> AppResult<()> {
        if self.x_size == 0 {
            return Err(DaqError::configuration("xsize", "must be a positive integer"));
        }
        if self.y_size == 0 {
            return Err(DaqError::configuration("ysize", "must be a positive integer"));
        }
        if !(self.pixel_us > 0.0) {
            return Err(DaqError::configuration("pixelus", "dwell time must be positive"));
        }
        if !(self.accel_factor > 0.0) {
            return Err(DaqError::configuration("accelfactor", "must be positive"));
        }
        if !(self.command_attenuation > 0.0) {
            return Err(DaqError::configuration(
                "scancmdattenuation",
                "must be positive",
            ));
        }
        if !(self.linear_percentage > 0.0 && self.linear_percentage <= 100.0) {
            return Err(DaqError::configuration(
                "linearpercentage",
                format!("{} is outside (0, 100]", self.linear_percentage),
            ));
        }
        if !self.bidirectional {
            unidirectional_turn_length(self.x_size, self.linear_percentage)?;
        }
        if self.frame_count == 0 {
            return Err(DaqError::configuration("numframes", "at least one frame is required"));
        }
        Ok(())
    }

    /// Copy the installation constants into this configuration.
    pub fn apply_system(&mut self, system: &SystemConfig) {
        self.system_lag_us = system.system_lag_us;
        self.command_attenuation = system.scan_cmd_attenuation;
    }

    /// Builder-style frame count.
    pub fn with_frames(mut self, frames: usize) -> Self {
        self.frame_count = frames;
        self
    }

    /// Peak-to-peak X span in volts.
    pub fn zoom_volts(&self) -> f64 {
        zoom_to_voltage(self.zoom)
    }

    /// Total detector lag in microseconds.
    pub fn lag_us(&self) -> f64 {
        self.system_lag_us + self.lag_tweak_us
    }

    /// Detector lag as a whole number of pixels (truncated toward zero).
    pub fn lag_pixels(&self) -> i64 {
        (self.lag_us() / self.pixel_us).trunc() as i64
    }

    /// Indices of channels with a positive full-scale voltage.
    pub fn enabled_channels(&self) -> Vec<usize> {
        let channels: Vec<usize> = self
            .channel_full_scale
            .iter()
            .enumerate()
            .filter(|(_, fs)| **fs > 0.0)
            .map(|(i, _)| i)
            .collect();
        if channels.is_empty() {
            warn!("no ADC channels are enabled");
        }
        channels
    }

    /// Letters of the enabled channels, e.g. `"AB"`.
    pub fn channel_letters(&self) -> String {
        self.enabled_channels()
            .into_iter()
            .map(channel_letter)
            .collect()
    }

    /// `[Major]` and `[Minor]` descriptor sections.
    pub fn to_sections(&self) -> (Section, Section) {
        let mut major = Section::new("Major");
        major
            .set("xsize", self.x_size)
            .set("ysize", self.y_size)
            .set("pixelus", self.pixel_us)
            .set("zoom", self.zoom)
            .set("rotation", self.rotation_degrees);
        for i in 0..MAX_CHANNELS {
            let letter = channel_letter(i).to_ascii_lowercase();
            major.set(format!("chan{}fullscale", letter), self.channel_full_scale[i]);
            major.set(format!("chan{}name", letter), &self.channel_names[i]);
        }

        let mut minor = Section::new("Minor");
        minor
            .set("scanfunction", "standard")
            .set("bidirectional", u8::from(self.bidirectional))
            .set("bidirends", self.turnaround)
            .set("linearpercentage", self.linear_percentage)
            .set("accelfactor", self.accel_factor)
            .set("centerxvolts", self.center_x_volts)
            .set("centeryvolts", self.center_y_volts)
            .set("lagtweakus", self.lag_tweak_us)
            .set("saverowpair", u8::from(self.save_row_pair));
        (major, minor)
    }

    /// Rebuild a configuration from a descriptor (`[Major]`, `[Minor]`, `[System]`),
    /// optionally merged with the command file that carries `numframes`.
    pub fn from_manifest(manifest: &Manifest) -> AppResult<Self> {
        let flat = manifest.flatten();
        let text = |key: &str| -> Result<&str, DecodeError> {
            flat.get(key)
                .map(String::as_str)
                .ok_or_else(|| DecodeError::MissingParameter(key.to_string()))
        };
        let number = |key: &str| -> Result<f64, DecodeError> {
            let value = text(key)?;
            value.parse::<f64>().map_err(|_| DecodeError::InvalidParameter {
                key: key.to_string(),
                value: value.to_string(),
            })
        };
        let optional = |key: &str, default: f64| -> Result<f64, DecodeError> {
            if flat.contains_key(key) {
                number(key)
            } else {
                Ok(default)
            }
        };

        let defaults = Self::default();
        let mut config = Self {
            x_size: number("xsize")? as usize,
            y_size: number("ysize")? as usize,
            pixel_us: number("pixelus")?,
            zoom: number("zoom")?,
            bidirectional: parse_flag(text("bidirectional")?),
            turnaround: match flat.get("bidirends") {
                Some(name) => name.parse()?,
                None => defaults.turnaround,
            },
            linear_percentage: optional("linearpercentage", defaults.linear_percentage)?,
            accel_factor: optional("accelfactor", defaults.accel_factor)?,
            command_attenuation: optional("scancmdattenuation", defaults.command_attenuation)?,
            center_x_volts: optional("centerxvolts", 0.0)?,
            center_y_volts: optional("centeryvolts", 0.0)?,
            rotation_degrees: optional("rotation", 0.0)?,
            system_lag_us: optional("systemlagus", 0.0)?,
            lag_tweak_us: optional("lagtweakus", 0.0)?,
            frame_count: optional("numframes", 1.0)? as usize,
            save_row_pair: flat.get("saverowpair").is_some_and(|v| parse_flag(v)),
            ..defaults
        };
        for i in 0..MAX_CHANNELS {
            let letter = channel_letter(i).to_ascii_lowercase();
            config.channel_full_scale[i] =
                optional(&format!("chan{}fullscale", letter), 0.0)?;
            if let Some(name) = flat.get(&format!("chan{}name", letter)) {
                config.channel_names[i] = name.clone();
            }
        }
        Ok(config)
    }
}

/// Parameters of a photometry (non-raster) spot measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhotometryConfiguration {
    /// Spot center, fast axis (V)
    pub center_x_volts: f64,
    /// Spot center, slow axis (V)
    pub center_y_volts: f64,
    /// Sweep duration (ms)
    pub duration_ms: f64,
    /// Spot diameter; divided by 2000 to give the radius in volts
    pub diameter_um: f64,
    /// Curve traced around the spot
    pub shape: PhotometryShape,
    /// Revolutions per millisecond
    pub rev_per_ms: f64,
    /// Spot label shown by front ends
    pub spot_name: String,
    /// Objective label, e.g. `"40X"`
    pub objective: String,
    /// Episode number tagged onto position data
    pub position_episode: u32,
}

impl Default for PhotometryConfiguration {
    fn default() -> Self {
        Self {
            center_x_volts: 0.0,
            center_y_volts: 0.0,
            duration_ms: 100.0,
            diameter_um: 100.0,
            shape: PhotometryShape::Circle,
            rev_per_ms: 1.0,
            spot_name: "Spot1".to_string(),
            objective: "40X".to_string(),
            position_episode: 0,
        }
    }
}

impl PhotometryConfiguration {
    /// Check the values synthesis relies on.
    pub fn validate(&self) -> AppResult<()> {
        if !(self.rev_per_ms > 0.0) {
            return Err(DaqError::configuration("photometryrevperms", "must be positive"));
        }
        if !(self.diameter_um > 0.0) {
            return Err(DaqError::configuration("photometrydiameter", "must be positive"));
        }
        if !(self.duration_ms >= 0.0 && self.duration_ms.is_finite()) {
            return Err(DaqError::configuration(
                "photometrydurms",
                "must be finite and not negative",
            ));
        }
        Ok(())
    }

    /// Spot moved to a new center.
    pub fn at(mut self, x_volts: f64, y_volts: f64) -> Self {
        self.center_x_volts = x_volts;
        self.center_y_volts = y_volts;
        self
    }

    /// Milliseconds per revolution.
    pub fn ms_per_rev(&self) -> f64 {
        1.0 / self.rev_per_ms
    }

    /// Radius in volts.
    pub fn radius_volts(&self) -> f64 {
        self.diameter_um / 2000.0
    }

    /// `[Minor]` photometry keys.
    pub fn to_section(&self) -> Section {
        Section::new("Minor")
            .with("photometrycurxvolts", self.center_x_volts)
            .with("photometrycuryvolts", self.center_y_volts)
            .with("photometrydurms", self.duration_ms)
            .with("photometrydiameter", self.diameter_um)
            .with("photometryshape", self.shape)
            .with("photometryrevperms", self.rev_per_ms)
            .with("photometryname", &self.spot_name)
            .with("objective", &self.objective)
            .with("positionepisode", self.position_episode)
    }
}
