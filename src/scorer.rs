use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashSet;
use strsim::{jaro_winkler, normalized_levenshtein};

use crate::dto::cmp_ids;
use crate::error::EngineError;
use crate::model::{Comparator, ScoringModel};
use crate::normalize::NormalizedRecord;

/// A scored candidate pair, identified by record id.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Score {
    pub left: String,
    pub right: String,
    pub probability: f64,
}

/// Similarity of two non-missing values under `comparator`, in [0,1].
pub fn compare(comparator: Comparator, a: &str, b: &str) -> f64 {
    match comparator {
        Comparator::Exact => {
            if a == b {
                1.0
            } else {
                0.0
            }
        }
        Comparator::JaroWinkler => jaro_winkler(a, b),
        Comparator::Levenshtein => normalized_levenshtein(a, b),
        Comparator::TokenJaccard => {
            let left: HashSet<&str> = a.split_whitespace().collect();
            let right: HashSet<&str> = b.split_whitespace().collect();
            let union = left.union(&right).count();
            if union == 0 {
                return 0.0;
            }
            left.intersection(&right).count() as f64 / union as f64
        }
    }
}

/// Per-field similarities in model field order; `None` where either side is
/// `missing`.
pub fn similarity_vector(
    a: &NormalizedRecord,
    b: &NormalizedRecord,
    model: &ScoringModel,
) -> Result<Vec<Option<f64>>, EngineError> {
    model
        .fields
        .iter()
        .map(|feature| {
            let left = field(a, &feature.field)?;
            let right = field(b, &feature.field)?;
            Ok(match (left, right) {
                (Some(l), Some(r)) => Some(compare(feature.comparator, l, r).clamp(0.0, 1.0)),
                _ => None,
            })
        })
        .collect()
}

fn field<'r>(record: &'r NormalizedRecord, name: &str) -> Result<Option<&'r str>, EngineError> {
    match record.get(name) {
        Some(_) => Ok(record.value(name)),
        None => Err(EngineError::Scoring {
            record_id: record.id.clone(),
            field: name.to_string(),
        }),
    }
}

/// Match probability of two normalized records. Pure; safe to call from any
/// number of threads. The pair is put in id order first so the result does
/// not depend on argument order.
pub fn score(
    a: &NormalizedRecord,
    b: &NormalizedRecord,
    model: &ScoringModel,
) -> Result<f64, EngineError> {
    let (a, b) = match cmp_ids(&a.id, &b.id) {
        Ordering::Greater => (b, a),
        _ => (a, b),
    };
    let similarities = similarity_vector(a, b, model)?;
    let z = model
        .fields
        .iter()
        .zip(similarities)
        .fold(model.bias, |acc, (feature, sim)| match sim {
            Some(sim) => acc + feature.weight * sim,
            None => acc + feature.missing_weight,
        });
    Ok(logistic(z))
}

fn logistic(z: f64) -> f64 {
    (1.0 / (1.0 + (-z).exp())).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::BlockingConfig;
    use crate::dto::Record;
    use crate::model::FieldWeight;

    fn model() -> ScoringModel {
        let weight = |field: &str, comparator, weight| FieldWeight {
            field: field.to_string(),
            comparator,
            weight,
            missing_weight: 0.0,
        };
        ScoringModel {
            version: "unit".into(),
            bias: -6.0,
            fields: vec![
                weight("NAME_FIRST", Comparator::JaroWinkler, 4.0),
                weight("EMAIL", Comparator::Exact, 6.0),
                weight("ADDRESS", Comparator::TokenJaccard, 3.0),
                weight("MOB_NUMBER", Comparator::Levenshtein, 3.0),
            ],
            blocking: BlockingConfig {
                rules: vec![],
                max_block_size: None,
            },
        }
    }

    fn rec(id: &str, name: &str, email: &str, address: &str, phone: &str) -> NormalizedRecord {
        NormalizedRecord::from_record(
            &Record::new(id)
                .with_field("NAME_FIRST", name)
                .with_field("EMAIL", email)
                .with_field("ADDRESS", address)
                .with_field("MOB_NUMBER", phone),
        )
    }

    #[test]
    fn identical_records_score_near_one() {
        let a = rec("1", "Asha Rao", "asha@x.in", "12 Main Rd", "9876543210");
        let b = rec("2", "Asha Rao", "asha@x.in", "12 Main Rd", "9876543210");
        assert!(score(&a, &b, &model()).unwrap() > 0.9999);
    }

    #[test]
    fn unrelated_records_score_low() {
        let a = rec("1", "Asha Rao", "asha@x.in", "12 Main Rd", "9876543210");
        let b = rec("2", "Zed Quill", "zq@y.com", "Harbour View", "1112223334");
        assert!(score(&a, &b, &model()).unwrap() < 0.1);
    }

    #[test]
    fn score_is_symmetric() {
        let a = rec("1", "Asha Rao", "asha@x.in", "12 Main Rd", "9876543210");
        let b = rec("2", "Asha R", "asha@x.in", "Main Road 12", "9876543211");
        let m = model();
        assert_eq!(score(&a, &b, &m).unwrap(), score(&b, &a, &m).unwrap());
    }

    #[test]
    fn missing_values_use_missing_weight() {
        let mut m = model();
        m.fields[1].missing_weight = -2.0;
        let a = rec("1", "Asha", "", "x", "1");
        let b = rec("2", "Asha", "asha@x.in", "x", "1");
        let sims = similarity_vector(&a, &b, &m).unwrap();
        assert_eq!(sims[1], None);
        let expected = logistic(-6.0 + 4.0 + -2.0 + 3.0 + 3.0);
        assert!((score(&a, &b, &m).unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn absent_model_field_is_a_scoring_error() {
        let a = NormalizedRecord::from_record(&Record::new("7").with_field("NAME_FIRST", "x"));
        let b = rec("2", "x", "y", "z", "1");
        let err = score(&a, &b, &model()).unwrap_err();
        assert_eq!(
            err,
            EngineError::Scoring {
                record_id: "7".into(),
                field: "EMAIL".into()
            }
        );
    }

    #[test]
    fn token_jaccard_ignores_order() {
        assert_eq!(compare(Comparator::TokenJaccard, "a b c", "c b a"), 1.0);
        assert_eq!(compare(Comparator::TokenJaccard, "a b", "b c"), 1.0 / 3.0);
    }
}
