use std::io::BufRead;
use thiserror::Error;
use tracing::{debug, trace};

use crate::record::TopologyRecord;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("malformed report line {line_number}, expected `key: value`: {line:?}")]
    Malformed { line_number: usize, line: String },

    #[error("report line {line_number} repeats key {key:?}")]
    DuplicateKey { line_number: usize, key: String },

    #[error("failed to read report: {0}")]
    Read(#[from] std::io::Error),
}

/// Turns the text output of a diagnostic command into a record.
///
/// Implementations own both the command and its output format, so the
/// diagnostic source can change without touching verification.
pub trait ReportParser: Send + Sync {
    /// Command to run inside the guest.
    fn command(&self) -> &str;

    fn parse(&self, reader: &mut dyn BufRead) -> Result<TopologyRecord, ParseError>;
}

/// Parser for `lscpu` style `Key: Value` reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct LscpuParser;

impl LscpuParser {
    pub const COMMAND: &'static str = "lscpu";

    pub fn parse_str(&self, report: &str) -> Result<TopologyRecord, ParseError> {
        self.parse(&mut report.as_bytes())
    }
}

impl ReportParser for LscpuParser {
    fn command(&self) -> &str {
        Self::COMMAND
    }

    fn parse(&self, reader: &mut dyn BufRead) -> Result<TopologyRecord, ParseError> {
        let mut record = TopologyRecord::new();

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let line_number = index + 1;

            // A blank line ends the report.
            if line.trim().is_empty() {
                trace!(line_number, "Reached end of report");
                break;
            }

            let (key, value) = split_pair(&line).ok_or_else(|| ParseError::Malformed {
                line_number,
                line: line.clone(),
            })?;

            if record.contains_key(key) {
                return Err(ParseError::DuplicateKey {
                    line_number,
                    key: key.to_owned(),
                });
            }
            record.insert(key.to_owned(), value.to_owned());
        }

        debug!(attributes = record.len(), "Parsed topology report");
        Ok(record)
    }
}

fn split_pair(line: &str) -> Option<(&str, &str)> {
    let mut parts = line.split(':');
    let (Some(key), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
        return None;
    };
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, value.trim()))
}
