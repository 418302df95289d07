//! Raw binary export of decoded stacks.
//!
//! Each channel is written as little-endian `int16`, frames in order, each frame row-major
//! (`y_size` rows of `x_size` samples). The dimensions go into the file name:
//! `<root>_ADC<letter>_<name>_<frames>x<X>x<Y>_int16.bin`, or `_<X>x<Y>_int16.bin` for a
//! single exported frame.

use std::path::{Path, PathBuf};

use tracing::info;

use super::stack::{ChannelStack, DecodedImageStack};
use crate::error::{AppResult, DaqError};
use crate::protocol::archive::encode_i16;

/// Which frames to export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSelection {
    /// The whole movie
    All,
    /// One frame by index
    Single(usize),
}

/// Write every channel of `stack` next to `source` (its extension is dropped).
/// Returns the files written.
pub fn export_stack(
    stack: &DecodedImageStack,
    source: &Path,
    selection: FrameSelection,
) -> AppResult<Vec<PathBuf>> {
    let root = source.with_extension("");
    let mut written = Vec::with_capacity(stack.channels.len());
    for channel in stack.channels.values() {
        let path = export_channel(stack, channel, &root, selection)?;
        info!(path = %path.display(), "saved");
        written.push(path);
    }
    Ok(written)
}

fn export_channel(
    stack: &DecodedImageStack,
    channel: &ChannelStack,
    root: &Path,
    selection: FrameSelection,
) -> AppResult<PathBuf> {
    let (frames, size) = match selection {
        FrameSelection::All => (
            &channel.frames[..],
            format!("{}x{}x{}", stack.frame_count, stack.x_size, stack.y_size),
        ),
        FrameSelection::Single(index) => {
            let frame = channel.frames.get(index..=index).ok_or_else(|| {
                DaqError::configuration(
                    "frame",
                    format!("frame {} requested but stack has {}", index, channel.frames.len()),
                )
            })?;
            (frame, format!("{}x{}", stack.x_size, stack.y_size))
        }
    };

    let samples: Vec<i16> = frames.iter().flat_map(|f| f.iter().copied()).collect();
    let name = format!(
        "{}_ADC{}_{}_{}_int16.bin",
        root.display(),
        channel.letter,
        channel.name,
        size
    );
    let path = PathBuf::from(name);
    std::fs::write(&path, encode_i16(&samples))?;
    Ok(path)
}
