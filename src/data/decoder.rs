//! Raster decoding: flat ADC samples back to rectilinear frames.
//!
//! The hardware digitizes continuously while the mirrors sweep, so a channel's raw buffer
//! is laid out exactly like the drive waveform, delayed by the detector lag:
//!
//! ```text
//! [lag][TL][row 0 ->][TL][<- row 1][TL][row 2 ->] ... [drift][TL][row 0 ->] ...
//! ```
//!
//! Decoding is pure index arithmetic over that layout. Running past the end of the buffer
//! is a configuration/data mismatch and fails the whole decode; no partial stack is
//! returned.

use std::collections::BTreeMap;

use ndarray::{s, Array2};
use tracing::{debug, warn};

use crate::error::DecodeError;
use crate::protocol::manifest::parse_flag;
use crate::scan::ScanConfiguration;
use crate::waveform::WaveformSet;

/// Extra samples skipped after every frame. Found empirically to keep long movies aligned.
pub const FRAME_DRIFT_SAMPLES: usize = 1;

/// Largest positive lag adjustment accepted at decode time.
pub const MAX_LAG_ADJUST: i64 = 20;

/// Value reported as the channel maximum when the percentile is skipped.
pub const FAST_MODE_MAX_VALUE: i32 = 2047;

/// Largest magnitude an ADC sample can take.
pub const MAX_POSSIBLE_VALUE: i32 = 2048;

/// Everything the decoder needs to know about how the samples were acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanGeometry {
    /// Pixels per line
    pub x_size: usize,
    /// Lines per frame
    pub y_size: usize,
    /// Odd lines were acquired on the return sweep
    pub bidirectional: bool,
    /// Samples to skip before the first turnaround
    pub lag_pixels: i64,
    /// Turnaround samples before every line
    pub turn_length: usize,
    /// Frames in the buffer
    pub frame_count: usize,
}

impl ScanGeometry {
    /// Geometry of an acquisition driven by `waveforms`, synthesized from `config`.
    pub fn from_waveforms(config: &ScanConfiguration, waveforms: &WaveformSet) -> Self {
        Self {
            x_size: config.x_size,
            y_size: config.y_size,
            bidirectional: config.bidirectional,
            lag_pixels: config.lag_pixels(),
            turn_length: waveforms.turn_length(),
            frame_count: config.frame_count,
        }
    }

    /// Geometry from flattened descriptor parameters (`xsize`, `ysize`, `bidirectional`,
    /// `lagpixels`, `turnlength`, `numframes`).
    pub fn from_parameters(params: &BTreeMap<String, String>) -> Result<Self, DecodeError> {
        fn field<T: std::str::FromStr>(
            params: &BTreeMap<String, String>,
            key: &str,
        ) -> Result<T, DecodeError> {
            let value = params
                .get(key)
                .ok_or_else(|| DecodeError::MissingParameter(key.to_string()))?;
            value.trim().parse().map_err(|_| DecodeError::InvalidParameter {
                key: key.to_string(),
                value: value.clone(),
            })
        }

        Ok(Self {
            x_size: field(params, "xsize")?,
            y_size: field(params, "ysize")?,
            bidirectional: parse_flag(
                params
                    .get("bidirectional")
                    .ok_or_else(|| DecodeError::MissingParameter("bidirectional".to_string()))?,
            ),
            lag_pixels: field(params, "lagpixels")?,
            turn_length: field(params, "turnlength")?,
            frame_count: field(params, "numframes")?,
        })
    }

    /// Samples in one line including its turnaround.
    pub fn line_len(&self) -> usize {
        self.x_size.saturating_add(self.turn_length)
    }

    /// Samples in one frame.
    pub fn frame_len(&self) -> usize {
        self.y_size.saturating_mul(self.line_len())
    }
}

/// Tunables applied at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Shift of the read start relative to the recorded lag, clamped to
    /// [`MAX_LAG_ADJUST`]; negative values are allowed
    pub lag_adjust: i64,
    /// Samples skipped after each frame
    pub drift_samples: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            lag_adjust: 0,
            drift_samples: FRAME_DRIFT_SAMPLES,
        }
    }
}

/// Decodes one channel's raw samples into frames of shape `(y_size, x_size)`.
#[derive(Debug, Clone)]
pub struct RasterDecoder {
    geometry: ScanGeometry,
    options: DecodeOptions,
}

impl RasterDecoder {
    /// Decoder with default options.
    pub fn new(geometry: ScanGeometry) -> Self {
        Self::with_options(geometry, DecodeOptions::default())
    }

    /// Decoder with explicit options.
    pub fn with_options(geometry: ScanGeometry, options: DecodeOptions) -> Self {
        Self { geometry, options }
    }

    /// Geometry being decoded.
    pub fn geometry(&self) -> &ScanGeometry {
        &self.geometry
    }

    /// Recorded lag plus the (clamped) adjustment.
    pub fn effective_lag(&self) -> i64 {
        let adjust = if self.options.lag_adjust > MAX_LAG_ADJUST {
            warn!(
                requested = self.options.lag_adjust,
                "max allowable positive lag pixel adjustment is {}; using it", MAX_LAG_ADJUST
            );
            MAX_LAG_ADJUST
        } else {
            self.options.lag_adjust
        };
        self.geometry.lag_pixels + adjust
    }

    /// Decode `raw` into `frame_count` frames.
    pub fn decode(&self, raw: &[i16]) -> Result<Vec<Array2<i16>>, DecodeError> {
        let g = &self.geometry;
        let lag = self.effective_lag();
        self.check_bounds(lag, raw.len())?;

        let mut cursor = lag;
        let mut frames = Vec::with_capacity(g.frame_count);
        for _ in 0..g.frame_count {
            let mut frame = Array2::<i16>::zeros((g.y_size, g.x_size));
            for row in 0..g.y_size {
                cursor += g.turn_length as i64;
                let start = cursor as usize;
                let end = start + g.x_size;
                let line = &raw[start..end];
                let mut target = frame.slice_mut(s![row, ..]);
                if g.bidirectional && row % 2 == 1 {
                    for (dst, src) in target.iter_mut().zip(line.iter().rev()) {
                        *dst = *src;
                    }
                } else {
                    for (dst, src) in target.iter_mut().zip(line) {
                        *dst = *src;
                    }
                }
                cursor = end as i64;
            }
            cursor += self.options.drift_samples as i64;
            frames.push(frame);
        }

        debug!(
            frames = frames.len(),
            lag,
            consumed = cursor,
            available = raw.len(),
            "decoded raster channel"
        );
        Ok(frames)
    }

    /// Walk every row's read window without copying. Nothing is allocated until each
    /// window is known to lie inside `0..available`.
    fn check_bounds(&self, lag: i64, available: usize) -> Result<(), DecodeError> {
        let g = &self.geometry;
        if g.x_size == 0 || g.y_size == 0 {
            let (key, value) = if g.x_size == 0 {
                ("xsize", g.x_size)
            } else {
                ("ysize", g.y_size)
            };
            return Err(DecodeError::InvalidParameter {
                key: key.to_string(),
                value: value.to_string(),
            });
        }

        // Every row advances the cursor, so this stops within `available` rows.
        let limit = available as i128;
        let mut cursor = i128::from(lag);
        for frame in 0..g.frame_count {
            for row in 0..g.y_size {
                cursor += g.turn_length as i128;
                if cursor < 0 {
                    return Err(DecodeError::NegativeCursor { lag_pixels: lag });
                }
                let end = cursor + g.x_size as i128;
                if end > limit {
                    return Err(DecodeError::CursorOverrun {
                        frame,
                        row,
                        needed: usize::try_from(end).unwrap_or(usize::MAX),
                        available,
                    });
                }
                cursor = end;
            }
            cursor += self.options.drift_samples as i128;
        }
        Ok(())
    }
}

/// 99th percentile (linear interpolation) of every sample in `frames`, truncated to a
/// multiple of 10.
pub fn channel_max_value(frames: &[Array2<i16>]) -> i32 {
    let mut values: Vec<i16> = frames.iter().flat_map(|f| f.iter().copied()).collect();
    if values.is_empty() {
        return 0;
    }
    let rank = 0.99 * (values.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let frac = rank - lo as f64;
    let (_, lo_value, upper) = values.select_nth_unstable(lo);
    let lo_value = f64::from(*lo_value);
    let hi_value = upper.iter().min().map_or(lo_value, |v| f64::from(*v));
    let percentile = lo_value + (hi_value - lo_value) * frac;
    10 * (percentile / 10.0).trunc() as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::TurnaroundStyle;
    use crate::waveform::raster::synthesize_raster;
    use ndarray::Array1;

    /// Convert volts to ADC counts the way a perfect detector would.
    fn counts(v: f64) -> i16 {
        (v * 1000.0).round() as i16
    }

    /// Readout of `frames` repetitions of `x`, delayed by `delay` samples.
    fn perfect_readout(x: &[f64], frames: usize, delay: usize, drift: usize) -> Vec<i16> {
        let mut raw = vec![0i16; delay];
        for _ in 0..frames {
            raw.extend(x.iter().map(|v| counts(*v)));
            raw.extend(std::iter::repeat(0).take(drift));
        }
        raw
    }

    fn geometry(bidirectional: bool) -> ScanGeometry {
        ScanGeometry {
            x_size: 4,
            y_size: 2,
            bidirectional,
            lag_pixels: 1,
            turn_length: 2,
            frame_count: 1,
        }
    }

    #[test]
    fn test_bidirectional_reverses_odd_rows() {
        // lag, TL, row0, TL, row1 (reversed on readout)
        let raw: Vec<i16> = vec![-1, 0, 0, 1, 2, 3, 4, 0, 0, 8, 7, 6, 5];
        let frames = RasterDecoder::new(geometry(true)).decode(&raw).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].row(0).to_vec(), vec![1, 2, 3, 4]);
        assert_eq!(frames[0].row(1).to_vec(), vec![5, 6, 7, 8]);
    }

    #[test]
    fn test_unidirectional_keeps_order() {
        let raw: Vec<i16> = vec![-1, 0, 0, 1, 2, 3, 4, 0, 0, 8, 7, 6, 5];
        let frames = RasterDecoder::new(geometry(false)).decode(&raw).unwrap();
        assert_eq!(frames[0].row(1).to_vec(), vec![8, 7, 6, 5]);
    }

    #[test]
    fn test_round_trip_over_lag_adjustments() {
        let config = ScanConfiguration {
            x_size: 32,
            y_size: 6,
            pixel_us: 2.0,
            zoom: 6.0,
            bidirectional: true,
            turnaround: TurnaroundStyle::MaxAccel,
            system_lag_us: 40.0,
            frame_count: 2,
            ..Default::default()
        };
        let set = synthesize_raster(&config).unwrap();
        let geometry = ScanGeometry::from_waveforms(&config, &set);
        assert_eq!(geometry.lag_pixels, 20);

        let tl = set.turn_length();
        let forward: Vec<i16> = set.row_pair[tl..tl + 32].iter().map(|v| counts(*v)).collect();
        let reverse: Vec<i16> = set.row_pair[2 * tl + 32..].iter().map(|v| counts(*v)).collect();
        assert_eq!(reverse.len(), 32);

        for adjust in -20..=20i64 {
            let delay = (20 + adjust) as usize;
            let raw = perfect_readout(&set.x, 2, delay, FRAME_DRIFT_SAMPLES);
            let decoder = RasterDecoder::with_options(
                geometry,
                DecodeOptions {
                    lag_adjust: adjust,
                    ..Default::default()
                },
            );
            let frames = decoder.decode(&raw).unwrap();
            assert_eq!(frames.len(), 2);
            for frame in &frames {
                assert_eq!(frame.dim(), (6, 32));
                for row in (0..6).step_by(2) {
                    assert_eq!(frame.row(row).to_vec(), forward, "lag adjust {}", adjust);
                }
                for row in (1..6).step_by(2) {
                    let rev: Vec<i16> = frame.row(row).iter().rev().copied().collect();
                    assert_eq!(rev, reverse, "lag adjust {}", adjust);
                }
            }
        }
    }

    #[test]
    fn test_short_buffer_is_decode_error() {
        let g = ScanGeometry {
            x_size: 16,
            y_size: 1,
            bidirectional: true,
            lag_pixels: 5,
            turn_length: 3,
            frame_count: 1,
        };
        let raw = vec![0i16; 5 + 3 + 16 - 1];
        let err = RasterDecoder::new(g).decode(&raw).unwrap_err();
        assert_eq!(
            err,
            DecodeError::CursorOverrun {
                frame: 0,
                row: 0,
                needed: 24,
                available: 23,
            }
        );
        assert!(RasterDecoder::new(g).decode(&vec![0i16; 24]).is_ok());
    }

    #[test]
    fn test_oversized_geometry_fails_without_allocating() {
        let raw = vec![0i16; 16];
        let many_frames = ScanGeometry {
            frame_count: usize::MAX / 2,
            ..geometry(true)
        };
        assert!(matches!(
            RasterDecoder::new(many_frames).decode(&raw).unwrap_err(),
            DecodeError::CursorOverrun { frame: 1, available: 16, .. }
        ));

        let huge_frame = ScanGeometry {
            x_size: 1 << 40,
            y_size: 1 << 30,
            ..geometry(true)
        };
        assert!(matches!(
            RasterDecoder::new(huge_frame).decode(&raw).unwrap_err(),
            DecodeError::CursorOverrun { frame: 0, row: 0, available: 16, .. }
        ));

        let huge_turn = ScanGeometry {
            turn_length: usize::MAX,
            ..geometry(true)
        };
        assert_eq!(
            RasterDecoder::new(huge_turn).decode(&raw).unwrap_err(),
            DecodeError::CursorOverrun {
                frame: 0,
                row: 0,
                needed: usize::MAX,
                available: 16,
            }
        );

        let empty = ScanGeometry {
            y_size: 0,
            frame_count: usize::MAX,
            ..geometry(true)
        };
        assert!(matches!(
            RasterDecoder::new(empty).decode(&raw).unwrap_err(),
            DecodeError::InvalidParameter { .. }
        ));
    }

    #[test]
    fn test_negative_cursor_is_decode_error() {
        let mut g = geometry(true);
        g.turn_length = 0;
        let decoder = RasterDecoder::with_options(
            g,
            DecodeOptions {
                lag_adjust: -5,
                ..Default::default()
            },
        );
        assert_eq!(
            decoder.decode(&[0; 64]).unwrap_err(),
            DecodeError::NegativeCursor { lag_pixels: -4 }
        );
    }

    #[test]
    fn test_positive_lag_adjust_is_capped() {
        let decoder = RasterDecoder::with_options(
            geometry(true),
            DecodeOptions {
                lag_adjust: 50,
                ..Default::default()
            },
        );
        assert_eq!(decoder.effective_lag(), 1 + MAX_LAG_ADJUST);
    }

    #[test]
    fn test_from_parameters() {
        let params: BTreeMap<String, String> = [
            ("xsize", "64"),
            ("ysize", "32"),
            ("bidirectional", "1"),
            ("lagpixels", "-3"),
            ("turnlength", "12"),
            ("numframes", "4"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let g = ScanGeometry::from_parameters(&params).unwrap();
        assert_eq!(g.lag_pixels, -3);
        assert_eq!(g.frame_len(), 32 * 76);

        let mut bad = params.clone();
        bad.insert("xsize".to_string(), "wide".to_string());
        assert!(matches!(
            ScanGeometry::from_parameters(&bad),
            Err(DecodeError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_channel_max_value_percentile() {
        let values = Array1::from_iter(0..=1000i16);
        let frame = values.into_shape_with_order((1, 1001)).unwrap();
        // 99th percentile of 0..=1000 is 990
        assert_eq!(channel_max_value(&[frame]), 990);

        let frame = Array2::from_shape_vec((1, 4), vec![0i16, 10, 20, 1000]).unwrap();
        // rank 2.97 -> 20 + 0.97 * 980 = 970.6
        assert_eq!(channel_max_value(&[frame]), 970);
        assert_eq!(channel_max_value(&[]), 0);
    }
}
