//! Interpreting inference responses.
//!
//! Inference services disagree on field names, so label and confidence are
//! looked up in a fixed priority order and the first present field wins.
//! Confidence may be a 0–1 fraction or already a percentage; values up to
//! 1 are treated as fractions.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{LinkError, LinkResult};

/// Shown in place of a missing label or confidence.
pub const PLACEHOLDER: &str = "--";

const LABEL_FIELDS: [&str; 5] = ["predicted_label", "label", "prediction", "class", "result"];
const CONFIDENCE_FIELDS: [&str; 4] = ["confidence", "predicted_confidence", "score", "probability"];
const DISTRIBUTION_FIELD: &str = "all_confidences";

/// Structured result of one classification.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Prediction {
    pub label: Option<String>,
    /// Raw confidence as sent by the service (fraction or percentage).
    pub confidence: Option<f64>,
    /// Label → raw confidence, highest first.
    pub distribution: Vec<(String, f64)>,
    /// Response text, kept when it could not be parsed.
    pub raw: Option<String>,
}

impl Prediction {
    /// Parse a response body.
    ///
    /// # Errors
    /// [`LinkError::InferenceResponseUnparseable`] if the body is not JSON.
    pub fn from_body(body: &str) -> LinkResult<Self> {
        let value: Value =
            serde_json::from_str(body).map_err(|e| LinkError::InferenceResponseUnparseable {
                reason: e.to_string(),
            })?;
        Ok(Self::from_json(&value))
    }

    /// Extract label, confidence and distribution from a JSON response.
    /// Anything but an object yields an empty prediction.
    pub fn from_json(value: &Value) -> Self {
        let Some(object) = value.as_object() else {
            return Self::default();
        };
        Self {
            label: extract_label(object),
            confidence: extract_confidence(object),
            distribution: object
                .get(DISTRIBUTION_FIELD)
                .and_then(Value::as_object)
                .map(rank_confidences)
                .unwrap_or_default(),
            raw: None,
        }
    }

    /// A result for a body that could not be parsed: only the raw text.
    pub fn degraded(raw: impl Into<String>) -> Self {
        Self {
            raw: Some(raw.into()),
            ..Self::default()
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.raw.is_some()
    }

    pub fn label_text(&self) -> &str {
        self.label.as_deref().unwrap_or(PLACEHOLDER)
    }

    /// Confidence as a rounded percentage, e.g. `87%`.
    pub fn confidence_text(&self) -> String {
        self.confidence
            .map_or_else(|| PLACEHOLDER.to_string(), format_confidence)
    }

    /// Ranked distribution, e.g. `blight(70.00%), rust(20.00%)`.
    pub fn distribution_text(&self) -> String {
        if self.distribution.is_empty() {
            PLACEHOLDER.to_string()
        } else {
            format_distribution(&self.distribution)
        }
    }
}

fn extract_label(object: &Map<String, Value>) -> Option<String> {
    let found = LABEL_FIELDS
        .iter()
        .find_map(|field| object.get(*field).filter(|v| !v.is_null()));
    if let Some(value) = found {
        return Some(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
    }
    object
        .get("healthy")
        .and_then(Value::as_bool)
        .map(|healthy| if healthy { "Healthy" } else { "Unhealthy" }.to_string())
}

fn extract_confidence(object: &Map<String, Value>) -> Option<f64> {
    let found = CONFIDENCE_FIELDS
        .iter()
        .find_map(|field| object.get(*field).filter(|v| !v.is_null()));
    if let Some(value) = found {
        return numeric(value);
    }
    let scores = object.get("scores")?.as_array()?;
    scores
        .iter()
        .map(numeric)
        .collect::<Option<Vec<f64>>>()?
        .into_iter()
        .reduce(f64::max)
}

/// A finite number, or a string holding one.
fn numeric(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// Convert a fraction (≤ 1) to a percentage; larger values pass through.
pub fn normalize_confidence(value: f64) -> f64 {
    if value <= 1.0 { value * 100.0 } else { value }
}

/// Rounded percentage: `0.873` and `87.3` both give `87%`.
pub fn format_confidence(value: f64) -> String {
    format!("{:.0}%", normalize_confidence(value).round())
}

/// Two-decimal percentage: `0.873` and `87.3` both give `87.30%`.
pub fn format_confidence_precise(value: f64) -> String {
    format!("{:.2}%", normalize_confidence(value))
}

/// Keep numeric entries and sort them by confidence, highest first.
pub fn rank_confidences(map: &Map<String, Value>) -> Vec<(String, f64)> {
    let mut ranked: Vec<(String, f64)> = map
        .iter()
        .filter_map(|(label, value)| numeric(value).map(|v| (label.clone(), v)))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked
}

pub fn format_distribution(ranked: &[(String, f64)]) -> String {
    ranked
        .iter()
        .map(|(label, value)| format!("{label}({})", format_confidence_precise(*value)))
        .collect::<Vec<_>>()
        .join(", ")
}
