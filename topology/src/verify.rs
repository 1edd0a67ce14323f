use std::io::BufRead;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::{
    parser::{ParseError, ReportParser},
    record::{ExpectedTopology, TopologyRecord},
};

/// First expected attribute whose observed value differs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{key:?} does not have the expected value: expected {expected:?}, found {}", display_actual(.actual))]
pub struct TopologyMismatch {
    pub key: String,
    pub expected: String,
    /// `None` when the report has no such attribute.
    pub actual: Option<String>,
}

fn display_actual(actual: &Option<String>) -> String {
    match actual {
        Some(value) => format!("{value:?}"),
        None => "nothing (attribute missing from report)".to_owned(),
    }
}

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("diagnostic command reported errors: {stderr}")]
    StderrNonEmpty { stderr: String },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Mismatch(#[from] TopologyMismatch),
}

/// Compare every expected attribute against the record, in expectation
/// order. Values are compared trimmed; case and inner spacing matter.
pub fn verify(record: &TopologyRecord, expected: &ExpectedTopology) -> Result<(), TopologyMismatch> {
    for (key, expected_value) in expected.iter() {
        let actual = record.get(key).map(str::trim);
        if actual != Some(expected_value.trim()) {
            return Err(TopologyMismatch {
                key: key.to_owned(),
                expected: expected_value.trim().to_owned(),
                actual: actual.map(str::to_owned),
            });
        }
        debug!(key, value = expected_value.trim(), "Topology attribute matches");
    }
    Ok(())
}

/// Check a diagnostic command's output: stderr must be empty, stdout must
/// parse, and the parsed record must satisfy the expectation.
#[instrument(skip_all)]
pub fn verify_report(
    stderr: &str,
    stdout: &mut dyn BufRead,
    parser: &dyn ReportParser,
    expected: &ExpectedTopology,
) -> Result<TopologyRecord, VerifyError> {
    if !stderr.is_empty() {
        return Err(VerifyError::StderrNonEmpty {
            stderr: stderr.to_owned(),
        });
    }
    let record = parser.parse(stdout)?;
    verify(&record, expected)?;
    Ok(record)
}
