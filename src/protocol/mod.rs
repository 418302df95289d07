//! Wire-level pieces of the hardware controller protocol.
//!
//! - [`manifest`]: the INI-like key/value text format of command and descriptor files
//! - [`archive`]: zip bundling and typed binary sample files
//! - [`client`]: the TCP send/receive exchange

pub mod archive;
pub mod client;
pub mod manifest;

pub use archive::{ArchiveEntry, ArchiveReader, SampleArray};
pub use client::{AcquisitionClient, ResponseListener, COMMAND_FILE};
pub use manifest::{Manifest, Section};

/// Descriptor written alongside raster waveforms.
pub const IMAGE_DESCRIPTION_FILE: &str = "ImageDescription.txt";

/// Descriptor written alongside photometry waveforms.
pub const PHOTOMETRY_DESCRIPTION_FILE: &str = "PhotometryDescription.txt";

/// Optional controller settings dump inside returned archives.
pub const HARDWARE_SETTINGS_FILE: &str = "hardwareSettings.txt";

/// `doscanfunction` discriminator of a command file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFunction {
    /// Acquire raster frames
    RunScanner,
    /// One-way command such as closing a shutter
    GenericCommand,
    /// Load photometry waveforms for a later trigger
    ArmPhotometry,
    /// Run a short photometry sweep and return the samples
    TestPhotometry,
}

impl ScanFunction {
    /// Value written to `doscanfunction`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunScanner => "runScanner",
            Self::GenericCommand => "genericCommand",
            Self::ArmPhotometry => "armPhotometry",
            Self::TestPhotometry => "testPhotometry",
        }
    }

    /// Case-insensitive parse of a `doscanfunction` value.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "runscanner" => Some(Self::RunScanner),
            "genericcommand" => Some(Self::GenericCommand),
            "armphotometry" => Some(Self::ArmPhotometry),
            "testphotometry" => Some(Self::TestPhotometry),
            _ => None,
        }
    }

    /// True when the controller answers with a data archive.
    pub fn expects_response(self) -> bool {
        matches!(self, Self::RunScanner | Self::TestPhotometry)
    }
}

impl std::fmt::Display for ScanFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_function_names() {
        for function in [
            ScanFunction::RunScanner,
            ScanFunction::GenericCommand,
            ScanFunction::ArmPhotometry,
            ScanFunction::TestPhotometry,
        ] {
            assert_eq!(ScanFunction::parse(function.as_str()), Some(function));
        }
        assert_eq!(ScanFunction::parse(" RUNSCANNER "), Some(ScanFunction::RunScanner));
        assert_eq!(ScanFunction::parse("dance"), None);
        assert!(!ScanFunction::ArmPhotometry.expects_response());
    }
}
