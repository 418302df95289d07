//! Loading of `.gsi` archives returned by the hardware controller.
//!
//! A raster archive holds `Cmd.txt` (naming the descriptor in `imagedesc` and carrying
//! `numframes`), the descriptor itself, an optional `hardwareSettings.txt` and one
//! `ADC<n>_ImageRaw_int16.bin` per digitized channel.

use std::collections::BTreeMap;
use std::io::{Read, Seek};
use std::path::Path;

use tracing::{info, warn};

use super::decoder::{
    channel_max_value, DecodeOptions, RasterDecoder, ScanGeometry, FAST_MODE_MAX_VALUE,
    MAX_POSSIBLE_VALUE,
};
use super::stack::{ChannelStack, DecodedImageStack, PhotometryTrace};
use crate::error::{AppResult, DecodeError};
use crate::protocol::archive::{adc_file_name, channel_index, channel_letter, ArchiveReader};
use crate::protocol::manifest::{parse_flag, Manifest};
use crate::protocol::{COMMAND_FILE, HARDWARE_SETTINGS_FILE};
use crate::scan::MAX_CHANNELS;

/// How to decode a raster archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Channel letters to extract (`None` = every channel present)
    pub channels: Option<String>,
    /// Post-hoc lag adjustment in pixels (capped at +20, negative allowed)
    pub lag_adjust: i64,
    /// Skip the percentile statistic
    pub fast: bool,
}

/// Load and decode a raster archive on disk.
pub fn load_raster_archive(
    path: impl AsRef<Path>,
    options: &LoadOptions,
) -> AppResult<DecodedImageStack> {
    let path = path.as_ref();
    let mut reader = ArchiveReader::open(path)?;
    let stack = decode_raster_archive(&mut reader, options)?;
    info!(
        path = %path.display(),
        channels = %stack.letters(),
        frames = stack.frame_count,
        "loaded raster archive"
    );
    Ok(stack)
}

/// Decode a raster archive from any reader.
pub fn decode_raster_archive<R: Read + Seek>(
    reader: &mut ArchiveReader<R>,
    options: &LoadOptions,
) -> AppResult<DecodedImageStack> {
    let command = reader.read_manifest(COMMAND_FILE)?;
    let descriptor_name = command
        .get("commands", "imagedesc")
        .ok_or_else(|| DecodeError::MissingParameter("imagedesc".to_string()))?
        .to_string();
    let descriptor = reader.read_manifest(&descriptor_name)?;

    let mut parameters = descriptor.flatten();
    if reader.contains(HARDWARE_SETTINGS_FILE) {
        let hardware = reader.read_manifest(HARDWARE_SETTINGS_FILE)?;
        for (key, value) in hardware.flatten() {
            parameters.insert(format!("hardware.{}", key), value);
        }
    }
    let frames = command
        .get("commands", "numframes")
        .ok_or_else(|| DecodeError::MissingParameter("numframes".to_string()))?;
    parameters.insert("numframes".to_string(), frames.to_string());
    let position_data = command
        .get("commands", "returnpositiondata")
        .is_some_and(parse_flag);

    let geometry = ScanGeometry::from_parameters(&parameters)?;
    let selected = select_channels(reader, options.channels.as_deref())?;
    let decoder = RasterDecoder::with_options(
        geometry,
        DecodeOptions {
            lag_adjust: options.lag_adjust,
            ..Default::default()
        },
    );

    let mut channels = BTreeMap::new();
    for index in selected {
        let letter = channel_letter(index);
        let file = adc_file_name(index);
        let raw = reader.read_samples(&file)?.into_i16(&file)?;
        let frames = decoder.decode(&raw)?;
        let max_value = if options.fast {
            FAST_MODE_MAX_VALUE
        } else {
            channel_max_value(&frames)
        };
        let name = parameters
            .get(&format!("chan{}name", letter.to_ascii_lowercase()))
            .cloned()
            .unwrap_or_else(|| letter.to_string());
        channels.insert(
            letter,
            ChannelStack {
                letter,
                name,
                frames,
                max_value,
            },
        );
    }

    Ok(DecodedImageStack {
        channels,
        x_size: geometry.x_size,
        y_size: geometry.y_size,
        frame_count: geometry.frame_count,
        max_possible_value: MAX_POSSIBLE_VALUE,
        position_data,
        parameters,
    })
}

/// Indices of the channels to decode: those present, filtered by `requested`.
fn select_channels<R: Read + Seek>(
    reader: &ArchiveReader<R>,
    requested: Option<&str>,
) -> Result<Vec<usize>, DecodeError> {
    let included: Vec<usize> = (0..MAX_CHANNELS)
        .filter(|i| reader.contains(&adc_file_name(*i)))
        .collect();
    if included.is_empty() {
        return Err(DecodeError::NoChannels);
    }

    let selected = match requested {
        None => included,
        Some(letters) => {
            let mut selected = Vec::new();
            for letter in letters.chars().filter(|c| !c.is_whitespace() && *c != ',') {
                match channel_index(letter) {
                    Some(index) if included.contains(&index) => {
                        if !selected.contains(&index) {
                            selected.push(index);
                        }
                    }
                    _ => warn!(channel = %letter, "requested channel not included in archive"),
                }
            }
            selected
        }
    };
    if selected.is_empty() {
        return Err(DecodeError::NoChannels);
    }
    Ok(selected)
}

/// Load the raw channel A and B samples of a photometry archive.
pub fn load_photometry_archive(path: impl AsRef<Path>) -> AppResult<PhotometryTrace> {
    let mut reader = ArchiveReader::open(path)?;
    decode_photometry_archive(&mut reader)
}

/// Read the raw channel A and B samples of a photometry archive from any reader.
pub fn decode_photometry_archive<R: Read + Seek>(
    reader: &mut ArchiveReader<R>,
) -> AppResult<PhotometryTrace> {
    let a_file = adc_file_name(0);
    let b_file = adc_file_name(1);
    Ok(PhotometryTrace {
        a: reader.read_samples(&a_file)?.into_i16(&a_file)?,
        b: reader.read_samples(&b_file)?.into_i16(&b_file)?,
    })
}

/// Descriptor of a raster archive without decoding any samples.
pub fn read_descriptor<R: Read + Seek>(reader: &mut ArchiveReader<R>) -> AppResult<Manifest> {
    let command = reader.read_manifest(COMMAND_FILE)?;
    let name = command
        .get("commands", "imagedesc")
        .ok_or_else(|| DecodeError::MissingParameter("imagedesc".to_string()))?
        .to_string();
    reader.read_manifest(&name)
}
