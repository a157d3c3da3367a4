use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::blocking::{BlockingConfig, BlockingRule};
use crate::error::EngineError;

/// How two normalized values of one field are compared.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Exact,
    JaroWinkler,
    Levenshtein,
    TokenJaccard,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct FieldWeight {
    pub field: String,
    pub comparator: Comparator,
    pub weight: f64,
    /// Contribution used instead of `weight * similarity` when either side
    /// is `missing`.
    #[serde(default)]
    pub missing_weight: f64,
}

/// Externally trained scoring artifact: a logistic model over per-field
/// similarities, together with the blocking rules it was trained with.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ScoringModel {
    pub version: String,
    pub bias: f64,
    pub fields: Vec<FieldWeight>,
    #[serde(default)]
    pub blocking: BlockingConfig,
}

impl ScoringModel {
    /// Parses and validates a model artifact.
    pub fn from_json(bytes: &[u8]) -> Result<Self, EngineError> {
        let model: ScoringModel = serde_json::from_slice(bytes)
            .map_err(|err| EngineError::ModelUnavailable(format!("corrupt model artifact: {err}")))?;
        model.validate()?;
        Ok(model)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |msg: String| Err(EngineError::ModelUnavailable(msg));
        if self.fields.is_empty() {
            return invalid(format!("model {} declares no fields", self.version));
        }
        if !self.bias.is_finite() {
            return invalid(format!("model {} has a non-finite bias", self.version));
        }
        let mut names = HashSet::new();
        for field in &self.fields {
            if !field.weight.is_finite() || !field.missing_weight.is_finite() {
                return invalid(format!("field {} has a non-finite weight", field.field));
            }
            if !names.insert(field.field.as_str()) {
                return invalid(format!("field {} is declared twice", field.field));
            }
        }
        for rule in &self.blocking.rules {
            for name in rule.fields() {
                if !names.contains(name) {
                    return invalid(format!("blocking rule references unknown field {name}"));
                }
            }
            match rule {
                BlockingRule::Prefix { length: 0, .. }
                | BlockingRule::Suffix { length: 0, .. }
                | BlockingRule::CharNgram { size: 0, .. } => {
                    return invalid(format!("{} must use a positive length", rule.describe()));
                }
                BlockingRule::MinHash {
                    num_perm, num_bands, ..
                } if *num_bands == 0 || *num_perm == 0 || num_perm % num_bands != 0 => {
                    return invalid(format!(
                        "min_hash needs num_perm ({num_perm}) divisible by num_bands ({num_bands})"
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.field.as_str()).collect()
    }
}
