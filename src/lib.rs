//! Core library for the raster_daq application.
//!
//! Drives a two-axis galvanometer laser-scanning microscope through a remote hardware
//! controller: synthesizes the scan waveforms, ships them with a command manifest as a
//! zip archive over TCP, receives the digitized detector samples back and decodes them
//! into image stacks. The `raster_daq` binary is a thin CLI over this library.

pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod orchestrator;
pub mod protocol;
pub mod scan;
pub mod waveform;

pub use config::Settings;
pub use error::{AppResult, DaqError, DecodeError};
pub use orchestrator::{
    AcquisitionOrchestrator, AcquisitionReport, AcquisitionResult, AcquisitionState, Operation,
    ScanRequest,
};
pub use scan::{PhotometryConfiguration, PhotometryShape, ScanConfiguration, TurnaroundStyle};
pub use waveform::{synthesize, ScanPattern, WaveformSet};
