use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One labelled value produced by a scanner for a transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelledValue {
    pub label: String,
    pub value: serde_json::Value,
}

impl LabelledValue {
    pub fn new(label: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
        }
    }
}

/// Error payload carried by an error-typed result record.
///
/// `refusal` distinguishes a model refusal from an ordinary scanner failure;
/// both are unit-scoped and never abort the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordError {
    pub message: String,
    #[serde(default)]
    pub trace: Option<String>,
    #[serde(default)]
    pub refusal: bool,
}

/// The durable result of running one scanner over one transcript (or one
/// segment of it). At most one authoritative row set per
/// `(scanner, transcript_id)` key ever reaches the durable store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub scanner: String,
    pub transcript_id: String,
    #[serde(default)]
    pub values: Vec<LabelledValue>,
    #[serde(default)]
    pub explanation: Option<String>,
    /// Pointers back into the transcript (event indices, spans, urls).
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default)]
    pub error: Option<RecordError>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub recorded_at: DateTime<Utc>,
}

impl ResultRecord {
    /// Successful record with a single labelled value.
    pub fn value(
        scanner: impl Into<String>,
        transcript_id: impl Into<String>,
        label: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        Self {
            scanner: scanner.into(),
            transcript_id: transcript_id.into(),
            values: vec![LabelledValue::new(label, value)],
            explanation: None,
            references: Vec::new(),
            error: None,
            metadata: BTreeMap::new(),
            recorded_at: Utc::now(),
        }
    }

    /// Error-typed record for a failed unit.
    pub fn failure(
        scanner: impl Into<String>,
        transcript_id: impl Into<String>,
        error: RecordError,
    ) -> Self {
        Self {
            scanner: scanner.into(),
            transcript_id: transcript_id.into(),
            values: Vec::new(),
            explanation: None,
            references: Vec::new(),
            error: Some(error),
            metadata: BTreeMap::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
