//! Zip bundling of manifests and binary sample files.
//!
//! Binary files carry their element type in the last `_` component of the file stem
//! (`ScanPointsX_float64.bin`, `ADC0_ImageRaw_int16.bin`). Samples are little-endian.

use std::fs::File;
use std::io::{Cursor, Read, Seek, Write};
use std::path::Path;

use bytes::{Buf, BufMut};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{AppResult, DaqError, DecodeError};
use crate::protocol::manifest::Manifest;

/// File name of the X-axis waveform inside a command archive.
pub const SCAN_POINTS_X: &str = "ScanPointsX_float64.bin";
/// File name of the Y-axis waveform inside a command archive.
pub const SCAN_POINTS_Y: &str = "ScanPointsY_float64.bin";
/// Debug dump of one raster row pair, written to the temp folder on request.
pub const ROW_PAIR_FILE: &str = "RowPair_float64.bin";

/// Name of the raw sample file for ADC channel `index` (0 = A).
pub fn adc_file_name(index: usize) -> String {
    format!("ADC{}_ImageRaw_int16.bin", index)
}

/// Channel letter for an ADC index (0 = 'A').
pub fn channel_letter(index: usize) -> char {
    (b'A' + index as u8) as char
}

/// ADC index for a channel letter ('a' or 'A' = 0).
pub fn channel_index(letter: char) -> Option<usize> {
    let upper = letter.to_ascii_uppercase();
    ('A'..='D')
        .contains(&upper)
        .then(|| (upper as u8 - b'A') as usize)
}

/// One named file inside an archive.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveEntry {
    /// File name inside the archive
    pub name: String,
    /// Raw file contents
    pub bytes: Vec<u8>,
}

impl ArchiveEntry {
    /// Entry holding arbitrary bytes.
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    /// Entry holding a rendered manifest.
    pub fn manifest(name: impl Into<String>, manifest: &Manifest) -> Self {
        Self::new(name, manifest.render().into_bytes())
    }

    /// Entry holding little-endian `f64` samples.
    pub fn float64(name: impl Into<String>, samples: &[f64]) -> Self {
        Self::new(name, encode_f64(samples))
    }

    /// Entry holding little-endian `i16` samples.
    pub fn int16(name: impl Into<String>, samples: &[i16]) -> Self {
        Self::new(name, encode_i16(samples))
    }
}

/// Element types understood by the file-name convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    /// `int16`
    Int16,
    /// `uint16`
    UInt16,
    /// `int32`
    Int32,
    /// `float32`
    Float32,
    /// `float64`
    Float64,
}

impl ElementType {
    /// Infer the element type from the last `_` component of the file stem.
    pub fn from_file_name(name: &str) -> Result<Self, DecodeError> {
        let stem = Path::new(name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(name);
        let suffix = stem.rsplit('_').next().unwrap_or("").to_lowercase();
        match suffix.as_str() {
            "int16" => Ok(Self::Int16),
            "uint16" => Ok(Self::UInt16),
            "int32" => Ok(Self::Int32),
            "float32" => Ok(Self::Float32),
            "float64" => Ok(Self::Float64),
            other => Err(DecodeError::ElementType {
                name: name.to_string(),
                reason: format!("unknown element suffix '{}'", other),
            }),
        }
    }

    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }
}

/// A decoded binary file.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleArray {
    /// Signed 16-bit samples (raw ADC data)
    Int16(Vec<i16>),
    /// Unsigned 16-bit samples
    UInt16(Vec<u16>),
    /// Signed 32-bit samples
    Int32(Vec<i32>),
    /// 32-bit floats
    Float32(Vec<f32>),
    /// 64-bit floats (waveforms)
    Float64(Vec<f64>),
}

impl SampleArray {
    /// Decode `bytes` as little-endian elements of `element`.
    pub fn decode(name: &str, element: ElementType, bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() % element.size() != 0 {
            return Err(DecodeError::ElementType {
                name: name.to_string(),
                reason: format!(
                    "{} bytes is not a whole number of {}-byte elements",
                    bytes.len(),
                    element.size()
                ),
            });
        }
        let mut buf = bytes;
        let count = bytes.len() / element.size();
        Ok(match element {
            ElementType::Int16 => Self::Int16((0..count).map(|_| buf.get_i16_le()).collect()),
            ElementType::UInt16 => Self::UInt16((0..count).map(|_| buf.get_u16_le()).collect()),
            ElementType::Int32 => Self::Int32((0..count).map(|_| buf.get_i32_le()).collect()),
            ElementType::Float32 => Self::Float32((0..count).map(|_| buf.get_f32_le()).collect()),
            ElementType::Float64 => Self::Float64((0..count).map(|_| buf.get_f64_le()).collect()),
        })
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            Self::Int16(v) => v.len(),
            Self::UInt16(v) => v.len(),
            Self::Int32(v) => v.len(),
            Self::Float32(v) => v.len(),
            Self::Float64(v) => v.len(),
        }
    }

    /// True when no elements were decoded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unwrap raw ADC samples.
    pub fn into_i16(self, name: &str) -> Result<Vec<i16>, DecodeError> {
        match self {
            Self::Int16(v) => Ok(v),
            _ => Err(DecodeError::ElementType {
                name: name.to_string(),
                reason: "expected int16 samples".to_string(),
            }),
        }
    }

    /// Unwrap waveform samples.
    pub fn into_f64(self, name: &str) -> Result<Vec<f64>, DecodeError> {
        match self {
            Self::Float64(v) => Ok(v),
            _ => Err(DecodeError::ElementType {
                name: name.to_string(),
                reason: "expected float64 samples".to_string(),
            }),
        }
    }
}

/// Encode samples as little-endian `f64`.
pub fn encode_f64(samples: &[f64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 8);
    for &v in samples {
        out.put_f64_le(v);
    }
    out
}

/// Encode samples as little-endian `i16`.
pub fn encode_i16(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &v in samples {
        out.put_i16_le(v);
    }
    out
}

/// Bundle entries into an in-memory zip archive (stored, uncompressed).
pub fn bundle(entries: &[ArchiveEntry]) -> AppResult<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Stored);
    for entry in entries {
        writer.start_file(entry.name.as_str(), options)?;
        writer.write_all(&entry.bytes)?;
    }
    Ok(writer.finish()?.into_inner())
}

/// Random access to the files of a zip archive.
pub struct ArchiveReader<R: Read + Seek> {
    inner: ZipArchive<R>,
}

impl ArchiveReader<File> {
    /// Open an archive on disk. `.gsi` files are plain zip archives with another extension.
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let file = File::open(path.as_ref())?;
        Ok(Self {
            inner: ZipArchive::new(file)?,
        })
    }
}

impl ArchiveReader<Cursor<Vec<u8>>> {
    /// Read an archive held in memory.
    pub fn from_bytes(bytes: Vec<u8>) -> AppResult<Self> {
        Ok(Self {
            inner: ZipArchive::new(Cursor::new(bytes))?,
        })
    }
}

impl<R: Read + Seek> ArchiveReader<R> {
    /// Names of all files in the archive.
    pub fn names(&self) -> Vec<String> {
        self.inner.file_names().map(str::to_string).collect()
    }

    /// True when the archive has a file called `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.file_names().any(|n| n == name)
    }

    /// Raw bytes of one file.
    pub fn read_bytes(&mut self, name: &str) -> AppResult<Vec<u8>> {
        let mut file = match self.inner.by_name(name) {
            Ok(file) => file,
            Err(zip::result::ZipError::FileNotFound) => {
                return Err(DecodeError::MissingEntry(name.to_string()).into())
            }
            Err(e) => return Err(e.into()),
        };
        let mut bytes = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    /// Read and parse a manifest file.
    pub fn read_manifest(&mut self, name: &str) -> AppResult<Manifest> {
        let bytes = self.read_bytes(name)?;
        let text = String::from_utf8(bytes).map_err(|e| {
            DaqError::Protocol(format!("'{}' is not valid UTF-8: {}", name, e))
        })?;
        Manifest::parse(&text)
    }

    /// Read a binary file, inferring the element type from its name.
    pub fn read_samples(&mut self, name: &str) -> AppResult<SampleArray> {
        let element = ElementType::from_file_name(name)?;
        let bytes = self.read_bytes(name)?;
        Ok(SampleArray::decode(name, element, &bytes)?)
    }
}
