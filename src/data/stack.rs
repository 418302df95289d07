//! Decoded image stacks and photometry traces.

use std::collections::BTreeMap;
use std::ops::Range;

use ndarray::Array2;

/// Frames of one ADC channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStack {
    /// Channel letter, `'A'..='D'`
    pub letter: char,
    /// Display name from the descriptor (e.g. "Green")
    pub name: String,
    /// Frames of shape `(y_size, x_size)`, in acquisition order
    pub frames: Vec<Array2<i16>>,
    /// 99th percentile of all samples, truncated to a multiple of 10
    pub max_value: i32,
}

/// Every decoded channel of one acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImageStack {
    /// Channels keyed by letter
    pub channels: BTreeMap<char, ChannelStack>,
    /// Pixels per line
    pub x_size: usize,
    /// Lines per frame
    pub y_size: usize,
    /// Frames per channel
    pub frame_count: usize,
    /// Largest magnitude a sample can take
    pub max_possible_value: i32,
    /// The acquisition also returned stage position data
    pub position_data: bool,
    /// Flattened descriptor parameters (lowercase keys)
    pub parameters: BTreeMap<String, String>,
}

impl DecodedImageStack {
    /// Channel by letter (case-insensitive).
    pub fn channel(&self, letter: char) -> Option<&ChannelStack> {
        self.channels.get(&letter.to_ascii_uppercase())
    }

    /// Letters of the decoded channels, in order.
    pub fn letters(&self) -> String {
        self.channels.keys().collect()
    }

    /// Descriptor parameter by key.
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(&key.to_lowercase()).map(String::as_str)
    }
}

/// Per-channel mean photoresponse.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelMeans {
    /// Mean of channel A
    pub a: f64,
    /// Mean of channel B
    pub b: f64,
}

/// Raw photometry samples of channels A and B.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PhotometryTrace {
    /// Channel A samples
    pub a: Vec<i16>,
    /// Channel B samples
    pub b: Vec<i16>,
}

impl PhotometryTrace {
    /// Means over `window`, or `None` if either channel is too short to cover it.
    pub fn window_means(&self, window: Range<usize>) -> Option<ChannelMeans> {
        if window.is_empty() || self.a.len() < window.end || self.b.len() < window.end {
            return None;
        }
        let mean = |samples: &[i16]| {
            samples.iter().map(|v| f64::from(*v)).sum::<f64>() / samples.len() as f64
        };
        Some(ChannelMeans {
            a: mean(&self.a[window.clone()]),
            b: mean(&self.b[window]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_means() {
        let trace = PhotometryTrace {
            a: (0..10).collect(),
            b: vec![4; 10],
        };
        let means = trace.window_means(2..6).unwrap();
        assert_eq!(means.a, 3.5);
        assert_eq!(means.b, 4.0);
        assert!(trace.window_means(5..11).is_none());
    }

    #[test]
    fn test_channel_lookup_is_case_insensitive() {
        let mut channels = BTreeMap::new();
        channels.insert(
            'B',
            ChannelStack {
                letter: 'B',
                name: "Red".to_string(),
                frames: vec![Array2::zeros((2, 3))],
                max_value: 0,
            },
        );
        let stack = DecodedImageStack {
            channels,
            x_size: 3,
            y_size: 2,
            frame_count: 1,
            max_possible_value: 2048,
            position_data: false,
            parameters: BTreeMap::new(),
        };
        assert_eq!(stack.channel('b').map(|c| c.name.as_str()), Some("Red"));
        assert_eq!(stack.letters(), "B");
    }
}
