//! Covered-line bookkeeping shared between the analyzer and the engine.

pub mod mapping;

pub use mapping::CoverageMapping;

use std::fmt;

use serde::{Deserialize, Serialize};

/// A source line, identified by file path and 1-based line number.
///
/// The canonical text form is `file:line`; that is the shape used as the
/// key of the persisted mapping document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LineId {
    pub file: String,
    pub line: u32,
}

impl LineId {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self { file: file.into(), line }
    }

    /// Parse the canonical `file:line` form. The file part may itself
    /// contain colons; the line number is everything after the last one.
    pub fn parse(s: &str) -> Option<Self> {
        let (file, line) = s.rsplit_once(':')?;
        if file.is_empty() {
            return None;
        }
        Some(Self { file: file.to_string(), line: line.parse().ok()? })
    }
}

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}
