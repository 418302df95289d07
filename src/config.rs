//! Configuration System using Figment
//!
//! Settings are loaded from:
//! 1. `config/raster.toml` (base configuration)
//! 2. Environment variables prefixed with `RASTERDAQ_`, nesting levels separated by `__`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! RASTERDAQ_APPLICATION__LOG_LEVEL=debug
//! RASTERDAQ_SYSTEM__HARDWARE_ADC_IP=192.168.10.2
//! RASTERDAQ_SCAN__ZOOM=2.5
//! ```
//!
//! # Example
//!
//! ```no_run
//! use raster_daq::config::Settings;
//!
//! fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load()?;
//!     println!("Hardware controller: {}", settings.system.hardware_addr());
//!     Ok(())
//! }
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};
use crate::protocol::manifest::Section;
use crate::scan::{PhotometryConfiguration, ScanConfiguration};

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/raster.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "RASTERDAQ_";

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Installation constants and transport tunables
    #[serde(default)]
    pub system: SystemConfig,
    /// Default raster scan parameters
    #[serde(default)]
    pub scan: ScanConfiguration,
    /// Default photometry parameters
    #[serde(default)]
    pub photometry: PhotometryConfiguration,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Ask the hardware controller for verbose diagnostics
    #[serde(default)]
    pub diag_mode: bool,
    /// Where acquired `.gsi` files land when no explicit path is given
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            diag_mode: false,
            output_dir: default_output_dir(),
        }
    }
}

/// Installation constants (the `[System]` descriptor section) plus transport tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Hardware controller address
    pub hardware_adc_ip: IpAddr,
    /// Hardware controller command port
    pub hardware_adc_port: u16,
    /// Address the controller connects back to
    pub return_ip: IpAddr,
    /// Port the controller connects back to (0 picks an ephemeral port)
    pub return_port: u16,
    /// Scratch folder for command files and test returns
    pub temp_folder: PathBuf,
    /// Detector lag of this installation (µs)
    pub system_lag_us: f64,
    /// Galvo command attenuation (0.25 for 1:4, 1.0 for 1:1)
    pub scan_cmd_attenuation: f64,
    /// Field of view calibration at 10X
    pub microns_per_volt_10x: f64,
    /// Connect timeout towards the controller
    pub connect_timeout_ms: u64,
    /// Fixed slack added to every receive deadline
    pub receive_grace_secs: f64,
    /// Per-frame estimate used before any frame time is known
    pub fallback_sec_per_frame: f64,
    /// Longest silence tolerated while data is streaming back
    pub idle_read_timeout_ms: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            hardware_adc_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            hardware_adc_port: 5000,
            return_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            return_port: 5001,
            temp_folder: std::env::temp_dir().join("raster_daq"),
            system_lag_us: 0.0,
            scan_cmd_attenuation: 0.25,
            microns_per_volt_10x: 100.0,
            connect_timeout_ms: 1000,
            receive_grace_secs: 2.0,
            fallback_sec_per_frame: 2.0,
            idle_read_timeout_ms: 10_000,
        }
    }
}

impl SystemConfig {
    /// Hardware controller socket address.
    pub fn hardware_addr(&self) -> SocketAddr {
        SocketAddr::new(self.hardware_adc_ip, self.hardware_adc_port)
    }

    /// Return socket address.
    pub fn return_addr(&self) -> SocketAddr {
        SocketAddr::new(self.return_ip, self.return_port)
    }

    /// Connect timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Idle read timeout as a duration.
    pub fn idle_read_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_read_timeout_ms)
    }

    /// Folder holding the files of the request being assembled.
    pub fn input_folder(&self) -> PathBuf {
        self.temp_folder.join("Input")
    }

    /// `[System]` descriptor section.
    pub fn to_section(&self) -> Section {
        Section::new("System")
            .with("hardwareadcip", self.hardware_adc_ip)
            .with("hardwareadcport", self.hardware_adc_port)
            .with("returnip", self.return_ip)
            .with("returnport", self.return_port)
            .with("tempfolder", self.temp_folder.display())
            .with("systemlagus", self.system_lag_us)
            .with("scancmdattenuation", self.scan_cmd_attenuation)
            .with("micronspervolt10x", self.microns_per_volt_10x)
    }
}

fn default_name() -> String {
    "Raster DAQ".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Settings {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment, then validate.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment, then validate.
    ///
    /// A missing file is not an error; every field has a default.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Self::figment(path).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// The provider stack, environment taking precedence over the file.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate after loading.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::configuration(
                "application.log_level",
                format!(
                    "'{}' must be one of: {}",
                    self.application.log_level,
                    valid_levels.join(", ")
                ),
            ));
        }

        let system = &self.system;
        if system.hardware_adc_port == 0 {
            return Err(DaqError::configuration(
                "system.hardware_adc_port",
                "controller port cannot be 0",
            ));
        }
        if system.connect_timeout_ms == 0 || system.idle_read_timeout_ms == 0 {
            return Err(DaqError::configuration(
                "system.connect_timeout_ms",
                "transport timeouts must be positive",
            ));
        }
        if !(system.receive_grace_secs >= 0.0) {
            return Err(DaqError::configuration(
                "system.receive_grace_secs",
                "must not be negative",
            ));
        }
        if !(system.fallback_sec_per_frame > 0.0) {
            return Err(DaqError::configuration(
                "system.fallback_sec_per_frame",
                "must be positive",
            ));
        }
        if !(system.scan_cmd_attenuation > 0.0) {
            return Err(DaqError::configuration(
                "system.scan_cmd_attenuation",
                "must be positive",
            ));
        }

        self.scan.validate()?;
        self.photometry.validate()
    }

    /// Effective settings rendered back to TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DaqError::configuration("settings", e.to_string()))
    }

    /// Scan parameters with the installation constants applied.
    pub fn scan_configuration(&self) -> ScanConfiguration {
        let mut scan = self.scan.clone();
        scan.apply_system(&self.system);
        scan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_validation_valid() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "chatty".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("application.log_level"));
    }

    #[test]
    fn test_invalid_fallback_estimate() {
        let mut settings = Settings::default();
        settings.system.fallback_sec_per_frame = 0.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_scan_errors_surface() {
        let mut settings = Settings::default();
        settings.scan.y_size = 0;
        let err = settings.validate().unwrap_err();
        assert!(matches!(err, DaqError::Configuration { ref field, .. } if field == "ysize"));
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[system]
hardware_adc_ip = "10.0.0.7"
hardware_adc_port = 6000
system_lag_us = 40.0

[scan]
x_size = 256
turnaround = "parabolic"

[photometry]
shape = "halfspiral"
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.application.log_level, "debug");
        assert_eq!(settings.system.hardware_addr(), "10.0.0.7:6000".parse().unwrap());
        assert_eq!(settings.scan.x_size, 256);
        assert_eq!(settings.scan.y_size, ScanConfiguration::default().y_size);
        assert_eq!(
            settings.photometry.shape,
            crate::scan::PhotometryShape::HalfSpiral
        );
        assert_eq!(settings.scan_configuration().system_lag_us, 40.0);
    }

    #[test]
    fn test_toml_round_trip() {
        let mut settings = Settings::default();
        settings.scan.zoom = 2.5;
        settings.system.return_port = 0;
        let text = settings.to_toml().unwrap();
        assert!(text.contains("[scan]"));
        let back: Settings = Figment::from(Toml::string(&text)).extract().unwrap();
        assert_eq!(back, settings);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let settings = Settings::load_from("does/not/exist.toml").unwrap();
        assert_eq!(settings.system.connect_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_system_section() {
        let section = SystemConfig::default().to_section();
        assert_eq!(section.get("scancmdattenuation"), Some("0.25"));
        assert_eq!(section.get("hardwareadcport"), Some("5000"));
    }
}
