//! Form completeness scoring.
//!
//! A policy assigns a weight to each form field (addressed by a dotted
//! path). The score is the share of total weight whose fields are filled in,
//! rounded down to a whole percentage.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Score an application must reach before it can be submitted.
pub const DEFAULT_THRESHOLD: u8 = 70;

/// One weighted form field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedField {
    /// Dotted path into the form data (`farm.area`)
    pub path: String,
    /// Relative weight
    pub weight: u32,
}

/// Weighted-field completeness policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletenessPolicy {
    fields: Vec<WeightedField>,
    threshold: u8,
}

/// Result of scoring a form.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Completeness {
    /// Score (0-100)
    pub score: u8,
    /// Paths of empty fields, in policy order
    pub missing: Vec<String>,
}

impl CompletenessPolicy {
    /// Build a policy from `(path, weight)` pairs.
    #[must_use]
    pub fn new<I, S>(fields: I, threshold: u8) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        Self {
            fields: fields
                .into_iter()
                .map(|(path, weight)| WeightedField {
                    path: path.into(),
                    weight,
                })
                .collect(),
            threshold,
        }
    }

    /// Submission threshold.
    #[must_use]
    pub const fn threshold(&self) -> u8 {
        self.threshold
    }

    /// Same fields with a different threshold.
    #[must_use]
    pub fn with_threshold(mut self, threshold: u8) -> Self {
        self.threshold = threshold;
        self
    }

    /// Score a form.
    #[must_use]
    pub fn evaluate(&self, form: &Map<String, Value>) -> Completeness {
        let total: u64 = self.fields.iter().map(|f| u64::from(f.weight)).sum();
        let mut filled: u64 = 0;
        let mut missing = Vec::new();

        for field in &self.fields {
            if lookup(form, &field.path).is_some_and(is_filled) {
                filled += u64::from(field.weight);
            } else {
                missing.push(field.path.clone());
            }
        }

        let score = if total == 0 {
            100
        } else {
            u8::try_from(filled * 100 / total).unwrap_or(100)
        };
        Completeness { score, missing }
    }

    /// Whether a score is high enough to submit.
    #[must_use]
    pub const fn passes(&self, score: u8) -> bool {
        score >= self.threshold
    }
}

impl Default for CompletenessPolicy {
    fn default() -> Self {
        Self::new(
            [
                ("farmName", 15),
                ("ownerName", 10),
                ("farmAddress", 10),
                ("contactPhone", 5),
                ("contactEmail", 5),
                ("farmArea", 10),
                ("cropTypes", 15),
                ("cultivationMethod", 10),
                ("waterSource", 10),
                ("landTitle", 10),
            ],
            DEFAULT_THRESHOLD,
        )
    }
}

fn lookup<'a>(form: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = form.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn is_filled(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}
