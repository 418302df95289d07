//! Key/value text manifests exchanged with the hardware controller.
//!
//! The controller speaks an INI-like dialect: `[Section]` headers followed by
//! `key = value` lines. Keys are case-insensitive (stored lowercase), values may carry a
//! trailing `; comment`, and every line is terminated with CRLF because the controller
//! runs on Windows.
//!
//! ```text
//! [Commands]
//! doscanfunction = runScanner
//! numframes = 4
//! ```
//!
//! The typed core never touches this format directly; [`Section`] is the thin boundary
//! that `ScanConfiguration`, `SystemConfig` and `WaveformSet` translate to and from.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{AppResult, DaqError};

const LINE_END: &str = "\r\n";

/// One `[Name]` block of sorted, lowercase key/value pairs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Section {
    name: String,
    entries: BTreeMap<String, String>,
}

impl Section {
    /// Create an empty section.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Section name as written in the header.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert or replace a value. The key is stored lowercase.
    pub fn set(&mut self, key: impl AsRef<str>, value: impl ToString) -> &mut Self {
        self.entries
            .insert(key.as_ref().trim().to_lowercase(), value.to_string());
        self
    }

    /// Builder-style [`Section::set`].
    pub fn with(mut self, key: impl AsRef<str>, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    /// Case-insensitive lookup.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(&key.to_lowercase()).map(String::as_str)
    }

    /// Iterate entries in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the section has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy every entry of `other` into this section, replacing existing keys.
    pub fn extend_from(&mut self, other: &Section) {
        for (key, value) in &other.entries {
            self.entries.insert(key.clone(), value.clone());
        }
    }
}

/// An ordered list of sections.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Manifest {
    sections: Vec<Section>,
}

impl Manifest {
    /// Create an empty manifest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a section, merging into an existing one with the same (case-insensitive) name.
    pub fn push(&mut self, section: Section) {
        match self.section_mut(&section.name) {
            Some(existing) => existing.extend_from(&section),
            None => self.sections.push(section),
        }
    }

    /// Builder-style [`Manifest::push`].
    pub fn with_section(mut self, section: Section) -> Self {
        self.push(section);
        self
    }

    /// Find a section by case-insensitive name.
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }

    fn section_mut(&mut self, name: &str) -> Option<&mut Section> {
        self.sections
            .iter_mut()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }

    /// All sections in insertion order.
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// Look up `key` inside `section`.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section).and_then(|s| s.get(key))
    }

    /// Collapse all sections into one map; later sections win on duplicate keys.
    pub fn flatten(&self) -> BTreeMap<String, String> {
        let mut flat = BTreeMap::new();
        for section in &self.sections {
            for (key, value) in section.entries() {
                flat.insert(key.to_string(), value.to_string());
            }
        }
        flat
    }

    /// Render with CRLF line ends and a blank separator line between sections.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (index, section) in self.sections.iter().enumerate() {
            if index > 0 {
                out.push(' ');
                out.push_str(LINE_END);
            }
            out.push('[');
            out.push_str(&section.name);
            out.push(']');
            out.push_str(LINE_END);
            for (key, value) in section.entries() {
                out.push_str(key);
                out.push_str(" = ");
                out.push_str(value);
                out.push_str(LINE_END);
            }
        }
        out
    }

    /// Parse manifest text.
    ///
    /// Accepts `=` or `:` as the key delimiter, strips `;` comments and surrounding
    /// whitespace, and ignores blank or `#` lines.
    pub fn parse(text: &str) -> AppResult<Self> {
        let mut manifest = Manifest::new();
        let mut current: Option<Section> = None;

        for (line_no, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                if let Some(done) = current.take() {
                    manifest.push(done);
                }
                current = Some(Section::new(name.trim()));
                continue;
            }

            let Some(section) = current.as_mut() else {
                return Err(DaqError::Protocol(format!(
                    "manifest line {} is outside any section: '{}'",
                    line_no + 1,
                    line
                )));
            };
            let Some(split) = line.find(['=', ':']) else {
                return Err(DaqError::Protocol(format!(
                    "manifest line {} has no key delimiter: '{}'",
                    line_no + 1,
                    line
                )));
            };
            let key = line[..split].trim();
            let value = line[split + 1..].split(';').next().unwrap_or("").trim();
            section.set(key, value);
        }

        if let Some(done) = current.take() {
            manifest.push(done);
        }
        Ok(manifest)
    }
}

impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Parse a manifest boolean the way the controller writes them (`1`, `true`, `on`, ...).
pub fn parse_flag(value: &str) -> bool {
    !matches!(
        value.trim().to_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off" | "none"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_uses_crlf_and_sorted_lowercase_keys() {
        let manifest = Manifest::new().with_section(
            Section::new("Commands")
                .with("numFrames", 4)
                .with("doScanFunction", "runScanner"),
        );
        assert_eq!(
            manifest.render(),
            "[Commands]\r\ndoscanfunction = runScanner\r\nnumframes = 4\r\n"
        );
    }

    #[test]
    fn test_parse_is_case_insensitive_and_strips_comments() {
        let text = "[Major]\nXsize = 512 ; pixels\nZoom: 2\n\n[System]\nreturnIP = 10.0.0.2\n";
        let manifest = Manifest::parse(text).unwrap();
        assert_eq!(manifest.get("major", "XSIZE"), Some("512"));
        assert_eq!(manifest.get("MAJOR", "zoom"), Some("2"));
        assert_eq!(manifest.get("system", "returnip"), Some("10.0.0.2"));
    }

    #[test]
    fn test_parse_keeps_colons_inside_values() {
        let manifest =
            Manifest::parse("[Commands]\ncommandtimestamp = 2017-12-19 10:04:55\n").unwrap();
        assert_eq!(
            manifest.get("commands", "commandtimestamp"),
            Some("2017-12-19 10:04:55")
        );
    }

    #[test]
    fn test_render_parse_preserves_sections() {
        let manifest = Manifest::new()
            .with_section(Section::new("Major").with("xsize", 64))
            .with_section(Section::new("Derived").with("turnlength", 12));
        let parsed = Manifest::parse(&manifest.render()).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn test_entry_outside_section_is_rejected() {
        let err = Manifest::parse("xsize = 4\n").unwrap_err();
        assert!(err.to_string().contains("outside any section"));
    }

    #[test]
    fn test_flatten_later_sections_win() {
        let manifest = Manifest::new()
            .with_section(Section::new("Major").with("numframes", 1))
            .with_section(Section::new("Commands").with("numframes", 5));
        assert_eq!(manifest.flatten().get("numframes").map(String::as_str), Some("5"));
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("1"));
        assert!(parse_flag("True"));
        assert!(!parse_flag("off"));
        assert!(!parse_flag("0"));
    }
}
