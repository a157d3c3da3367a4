use log::{debug, info, warn};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::sync::Arc;

use crate::blocking::BlockingIndex;
use crate::classify::classify;
use crate::dto::{cmp_ids, BlockingInfo, MatchEntry, MatchOutcome, Record};
use crate::error::EngineError;
use crate::model::ScoringModel;
use crate::normalize::NormalizedRecord;
use crate::scorer::score;

/// A fixed reference set indexed for point lookups, paired with the model it
/// was indexed under. Immutable once built.
#[derive(Debug)]
pub struct Gazetteer {
    model: Arc<ScoringModel>,
    index: BlockingIndex,
}

impl Gazetteer {
    /// Normalizes and indexes the reference records. Records with no usable
    /// value in any model field are dropped.
    pub fn build(model: Arc<ScoringModel>, records: &[Record]) -> Result<Self, EngineError> {
        let fields = model.field_names();
        let normalized: Vec<NormalizedRecord> = records
            .iter()
            .map(|r| NormalizedRecord::with_fields(r, &fields))
            .filter(NormalizedRecord::has_signal)
            .collect();
        let dropped = records.len() - normalized.len();
        if dropped > 0 {
            warn!("Dropped {} reference records with no usable fields", dropped);
        }
        let index = BlockingIndex::build(normalized, &model.blocking)?;
        info!(
            "Reference set ready: {} records, model {}",
            index.len(),
            model.version
        );
        Ok(Gazetteer { model, index })
    }

    pub fn model(&self) -> &ScoringModel {
        &self.model
    }

    pub fn index(&self) -> &BlockingIndex {
        &self.index
    }

    pub fn reference_count(&self) -> usize {
        self.index.len()
    }

    fn normalize_query(&self, query: &Record) -> NormalizedRecord {
        NormalizedRecord::with_fields(query, &self.model.field_names())
    }

    /// Ranks reference records against `query`: candidates from the index,
    /// scored, kept at or above `threshold`, ordered by descending percentage
    /// then ascending id, truncated to `limit`.
    pub fn find_matches(
        &self,
        query: &Record,
        threshold: f64,
        limit: usize,
    ) -> Result<MatchOutcome, EngineError> {
        let normalized = self.normalize_query(query);
        let total = self.reference_count();
        let candidates = self.index.candidates_for(&normalized);
        if candidates.is_empty() {
            debug!("Query produced no candidates; returning no matches");
            return Ok(MatchOutcome::new(Vec::new(), total));
        }

        let scored: Vec<(usize, f64)> = candidates
            .par_iter()
            .map(|&pos| score(&normalized, self.index.record(pos), &self.model).map(|p| (pos, p)))
            .collect::<Result<_, _>>()?;

        let mut matches: Vec<MatchEntry> = scored
            .into_iter()
            .filter(|&(_, probability)| probability >= threshold)
            .map(|(pos, probability)| {
                let reference = self.index.record(pos);
                let confidence = classify(probability);
                MatchEntry {
                    matching_record_id: reference.id.clone(),
                    probability,
                    confidence_percent: confidence.percentage,
                    dedupe_category: confidence.category,
                    record_data: reference.fields().clone(),
                }
            })
            .collect();
        matches.sort_by(|a, b| {
            b.confidence_percent
                .partial_cmp(&a.confidence_percent)
                .unwrap_or(Ordering::Equal)
                .then_with(|| cmp_ids(&a.matching_record_id, &b.matching_record_id))
        });
        matches.truncate(limit);
        debug!(
            "Scored {} candidates, {} matches kept",
            candidates.len(),
            matches.len()
        );
        Ok(MatchOutcome::new(matches, total))
    }

    /// The normalized query and the blocking keys it produces, without
    /// scoring anything.
    pub fn blocking_info(&self, query: &Record) -> BlockingInfo {
        let normalized = self.normalize_query(query);
        BlockingInfo {
            block_keys: self.index.query_keys(&normalized),
            candidate_count: self.index.candidates_for(&normalized).len(),
            input: normalized.fields().clone(),
        }
    }

    pub fn describe_rules(&self) -> Vec<String> {
        self.index.generator().describe().to_vec()
    }
}
