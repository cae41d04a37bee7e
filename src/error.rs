//! Engine error taxonomy.
//!
//! Every variant carries a stable snake_case code (see [`EngineError::code`])
//! which is what IPC error envelopes and batch issue lists expose.

use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("no grading scale configured for {scope}")]
    NoScaleConfigured { scope: String },

    #[error("no assessment configuration '{assessment_type}' for {scope}")]
    NoAssessmentConfig {
        scope: String,
        assessment_type: String,
    },

    #[error("invalid grading scale for {scope}: {reason}")]
    InvalidScale { scope: String, reason: String },

    #[error("invalid assessment configuration: {reason}")]
    InvalidAssessmentConfig { reason: String },

    #[error("score {score} is outside the allowed range {min}..={max}")]
    ScoreOutOfRange { score: f64, min: f64, max: f64 },

    #[error("component '{component}' score {value} is invalid (allowed 0..={max})")]
    InvalidComponentScore {
        component: String,
        value: f64,
        max: f64,
    },

    #[error("unknown component '{component}'")]
    UnknownComponent { component: String },

    #[error("incomplete subject set: missing {}", missing.join(", "))]
    IncompleteSubjectSet { missing: Vec<String> },

    #[error("duplicate key '{key}' in batch (first seen on line {first_line})")]
    IdentityConflict { key: String, first_line: usize },

    #[error("{field}: {message}")]
    Validation { field: String, message: String },

    #[error("payload could not be parsed: {0}")]
    Parse(String),

    #[error("record store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("record store rejected the write: {0}")]
    StoreRejected(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoScaleConfigured { .. } => "no_scale_configured",
            Self::NoAssessmentConfig { .. } => "no_assessment_config",
            Self::InvalidScale { .. } => "invalid_scale",
            Self::InvalidAssessmentConfig { .. } => "invalid_assessment_config",
            Self::ScoreOutOfRange { .. } => "score_out_of_range",
            Self::InvalidComponentScore { .. } => "invalid_component_score",
            Self::UnknownComponent { .. } => "unknown_component",
            Self::IncompleteSubjectSet { .. } => "incomplete_subject_set",
            Self::IdentityConflict { .. } => "identity_conflict",
            Self::Validation { .. } => "validation_error",
            Self::Parse(_) => "parse_failed",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::StoreRejected(_) => "store_rejected",
            Self::NotFound(_) => "not_found",
        }
    }

    /// Scope-level configuration problems abort only the affected scope.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::NoScaleConfigured { .. }
                | Self::NoAssessmentConfig { .. }
                | Self::InvalidScale { .. }
                | Self::InvalidAssessmentConfig { .. }
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn details(&self) -> Option<Value> {
        match self {
            Self::ScoreOutOfRange { score, min, max } => {
                Some(json!({ "score": score, "min": min, "max": max }))
            }
            Self::InvalidComponentScore {
                component,
                value,
                max,
            } => Some(json!({ "component": component, "value": value, "max": max })),
            Self::IncompleteSubjectSet { missing } => Some(json!({ "missing": missing })),
            Self::IdentityConflict { key, first_line } => {
                Some(json!({ "key": key, "firstLine": first_line }))
            }
            Self::Validation { field, .. } => Some(json!({ "field": field })),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        // Constraint failures are about the row being written; anything else
        // means the store itself can no longer be trusted for this batch.
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::ConstraintViolation) => {
                EngineError::StoreRejected(err.to_string())
            }
            _ => EngineError::StoreUnavailable(err.to_string()),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let e = EngineError::ScoreOutOfRange {
            score: 150.0,
            min: 0.0,
            max: 100.0,
        };
        assert_eq!(e.code(), "score_out_of_range");
        assert!(e.to_string().contains("150"));
        assert!(!e.is_configuration());

        let e = EngineError::NoScaleConfigured {
            scope: "Science/2024/2025/first".into(),
        };
        assert!(e.is_configuration());
        assert!(!e.is_fatal());
        assert!(EngineError::StoreUnavailable("gone".into()).is_fatal());
    }

    #[test]
    fn incomplete_subject_set_lists_missing() {
        let e = EngineError::IncompleteSubjectSet {
            missing: vec!["english".into(), "mathematics".into()],
        };
        assert_eq!(
            e.to_string(),
            "incomplete subject set: missing english, mathematics"
        );
    }
}
