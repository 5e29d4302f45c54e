//! Result classification.
//!
//! Workers report results as loosely-typed JSON produced by several legacy
//! generations of the worker. This module is the single place where such a
//! payload is turned into a definite [`Outcome`]. Rules are evaluated in
//! order and the first match wins:
//!
//! 1. `status` is one of the error statuses → explicit error status
//! 2. an `error` field is present → worker error
//! 3. the success-evidence fields are empty → empty/incomplete result
//! 4. the free-text field contains a "not found" phrase → negative phrase
//! 5. otherwise → success
//!
//! The field names are part of the worker contract and live in
//! [`ClassifierRules`] so deployments can match their worker's payload.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The definite outcome of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    /// The worker produced a usable result. The reservation stands.
    Success,

    /// The job did not succeed. The reservation is refunded.
    Failure(FailureReason),
}

impl Outcome {
    /// Whether the outcome requires a compensating refund.
    #[must_use]
    pub const fn requires_refund(&self) -> bool {
        matches!(self, Self::Failure(_))
    }
}

/// Why a job failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// The worker reported an error status.
    ExplicitStatus,

    /// The worker attached an error message.
    WorkerError(String),

    /// The result carries no success evidence.
    EmptyResult,

    /// The result text says nothing was found.
    NegativePhrase,

    /// The result is not a JSON object.
    Unparseable,

    /// The task could not be published to the worker queue.
    PublishFailed,

    /// No result arrived before the reconciliation deadline.
    DeadlineExceeded,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExplicitStatus => f.write_str("explicit error status"),
            Self::WorkerError(error) => write!(f, "worker error: {error}"),
            Self::EmptyResult => f.write_str("empty/incomplete result"),
            Self::NegativePhrase => f.write_str("negative-result phrase match"),
            Self::Unparseable => f.write_str("unparseable result"),
            Self::PublishFailed => f.write_str("publish failed"),
            Self::DeadlineExceeded => f.write_str("settlement deadline exceeded"),
        }
    }
}

/// Field names and phrase lists of the worker result contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierRules {
    /// Field holding the worker's own status string.
    pub status_field: String,

    /// Status values that mean the job failed.
    pub error_statuses: Vec<String>,

    /// Status value that claims success.
    pub success_status: String,

    /// Field whose presence means the worker hit an error.
    pub error_field: String,

    /// Count of detected items; missing or non-positive means empty.
    pub count_field: Option<String>,

    /// Categorical fields of which at least one must be non-empty when the
    /// status claims success.
    pub evidence_fields: Vec<String>,

    /// Free-text summary field searched for negative phrases.
    pub text_field: Option<String>,

    /// Lower-case phrases meaning "nothing found".
    pub negative_phrases: Vec<String>,
}

impl Default for ClassifierRules {
    fn default() -> Self {
        Self {
            status_field: "status".into(),
            error_statuses: vec!["failed".into(), "error".into()],
            success_status: "completed".into(),
            error_field: "error".into(),
            count_field: Some("faces_count".into()),
            evidence_fields: vec!["emotions".into(), "dominant_emotion".into()],
            text_field: Some("prediction".into()),
            negative_phrases: vec![
                "no face detected".into(),
                "face not found".into(),
                "no faces found".into(),
                "лица не обнаружены".into(),
                "лицо не обнаружено".into(),
            ],
        }
    }
}

impl ClassifierRules {
    /// Classify a raw worker result.
    #[must_use]
    pub fn classify(&self, raw: &Value) -> Outcome {
        let Some(fields) = raw.as_object() else {
            return Outcome::Failure(FailureReason::Unparseable);
        };

        let status = fields
            .get(&self.status_field)
            .and_then(Value::as_str)
            .map(|s| s.trim().to_lowercase());

        if let Some(status) = status.as_deref() {
            if self.error_statuses.iter().any(|s| s.eq_ignore_ascii_case(status)) {
                return Outcome::Failure(FailureReason::ExplicitStatus);
            }
        }

        if let Some(error) = fields.get(&self.error_field) {
            return Outcome::Failure(FailureReason::WorkerError(render(error)));
        }

        if let Some(count_field) = &self.count_field {
            if count_of(fields.get(count_field)) <= 0.0 {
                return Outcome::Failure(FailureReason::EmptyResult);
            }
        }

        let claims_success = status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case(&self.success_status));
        if claims_success
            && !self.evidence_fields.is_empty()
            && !self
                .evidence_fields
                .iter()
                .any(|field| fields.get(field).is_some_and(is_truthy))
        {
            return Outcome::Failure(FailureReason::EmptyResult);
        }

        if let Some(text_field) = &self.text_field {
            if let Some(text) = fields.get(text_field) {
                let text = render(text).to_lowercase();
                if self
                    .negative_phrases
                    .iter()
                    .any(|phrase| text.contains(&phrase.to_lowercase()))
                {
                    return Outcome::Failure(FailureReason::NegativePhrase);
                }
            }
        }

        Outcome::Success
    }
}

/// Classify a raw worker result with the default worker contract.
#[must_use]
pub fn classify(raw: &Value) -> Outcome {
    ClassifierRules::default().classify(raw)
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[allow(clippy::cast_precision_loss)]
fn count_of(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        Some(Value::Array(items)) => items.len() as f64,
        _ => 0.0,
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
