//! Decoding and export of acquired data.

pub mod decoder;
pub mod export;
pub mod raster_file;
pub mod stack;

pub use decoder::{
    channel_max_value, DecodeOptions, RasterDecoder, ScanGeometry, FRAME_DRIFT_SAMPLES,
};
pub use export::{export_stack, FrameSelection};
pub use raster_file::{load_photometry_archive, load_raster_archive, LoadOptions};
pub use stack::{ChannelMeans, ChannelStack, DecodedImageStack, PhotometryTrace};
