//! Source text as a flat, traceable stream of lines.
//!
//! Every later pass works over [`Line`]s rather than raw strings so that
//! macro/routine expansion can splice in synthetic lines (carrying a
//! synthetic file name such as `"<macro FOO>"`) without losing the ability
//! to report a [`crate::error::Location`] back to the programmer.

use std::sync::Arc;

use crate::error::Location;

/// One line of assembly source, tagged with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// The line's text, with trailing whitespace and comments stripped.
    pub text: String,
    /// Where this line came from.
    pub location: Location,
}

impl Line {
    /// Build a line from raw text and its origin.
    pub fn new(text: impl Into<String>, file: impl Into<Arc<str>>, line_number: usize) -> Self {
        Self {
            text: text.into(),
            location: Location::new(file, line_number),
        }
    }

    /// This line with a different origin, keeping the same text — used by
    /// the expander to re-tag a macro body's lines with a synthetic file
    /// name while preserving the original line number for diagnostics.
    pub fn retagged(&self, file: impl Into<Arc<str>>) -> Self {
        Self {
            text: self.text.clone(),
            location: Location::new(file, self.location.line),
        }
    }

    /// Whether this line, after stripping, has any content.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// The line's first whitespace-delimited token, if any (a directive or
    /// mnemonic keyword).
    pub fn head(&self) -> Option<&str> {
        self.text.split_whitespace().next()
    }

    /// The line's text with its head token removed, trimmed.
    pub fn rest(&self) -> &str {
        match self.text.find(char::is_whitespace) {
            Some(idx) => self.text[idx..].trim_start(),
            None => "",
        }
    }
}

/// Strip a trailing `#` line comment and surrounding whitespace from a raw
/// source line.
fn strip_comment(raw: &str) -> &str {
    match raw.find('#') {
        Some(idx) => raw[..idx].trim_end(),
        None => raw.trim_end(),
    }
}

/// A named body of source text, split into traceable [`Line`]s with
/// comments stripped and blank lines kept (callers filter those that
/// matter).
pub struct LineSource {
    lines: Vec<Line>,
}

impl LineSource {
    /// Split `text` into lines tagged with `file`.
    pub fn new(file: impl Into<Arc<str>>, text: &str) -> Self {
        let file = file.into();
        let lines = text
            .lines()
            .enumerate()
            .map(|(i, raw)| Line::new(strip_comment(raw), file.clone(), i + 1))
            .collect();
        Self { lines }
    }

    /// All non-blank lines, in file order.
    pub fn non_blank(&self) -> impl Iterator<Item = &Line> {
        self.lines.iter().filter(|l| !l.is_blank())
    }

    /// Every line, including blanks.
    pub fn lines(&self) -> &[Line] {
        &self.lines
    }
}
