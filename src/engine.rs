use log::{error, info};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::blocking::BlockingIndex;
use crate::classify::classify;
use crate::dto::{AnnotatedRecord, BlockingInfo, MatchOutcome, Record};
use crate::error::EngineError;
use crate::gazetteer::Gazetteer;
use crate::model::ScoringModel;
use crate::normalize::NormalizedRecord;
use crate::scorer::{score, Score};

/// Cancellation token for a bulk run: an external flag plus an optional
/// deadline.
#[derive(Clone, Debug, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Cancellation {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed) || self.deadline.map_or(false, |d| Instant::now() >= d)
    }
}

/// The model together with the reference index built from it. Published
/// and replaced as one value.
struct Snapshot {
    model: Arc<ScoringModel>,
    reference: Option<Arc<Gazetteer>>,
}

/// Owned, thread-safe engine handle created once at startup.
///
/// Bulk runs use the current model. Lookups go through the published
/// snapshot, so a lookup always sees one consistent model and index.
/// Publishers are serialized; readers never wait on a build.
pub struct Engine {
    pool: ThreadPool,
    workers: usize,
    snapshot: RwLock<Arc<Snapshot>>,
    publishing: Mutex<()>,
}

impl Engine {
    pub fn new(model: ScoringModel, workers: usize) -> Result<Self, EngineError> {
        model.validate()?;
        let workers = workers.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("dedup-worker-{i}"))
            .build()
            .map_err(|err| EngineError::WorkerPool(err.to_string()))?;
        info!("Engine started with {} workers, model {}", workers, model.version);
        Ok(Engine {
            pool,
            workers,
            snapshot: RwLock::new(Arc::new(Snapshot {
                model: Arc::new(model),
                reference: None,
            })),
            publishing: Mutex::new(()),
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn model(&self) -> Arc<ScoringModel> {
        self.snapshot.read().model.clone()
    }

    /// Indexes `records` under the current model and publishes the result.
    pub fn index_reference(&self, records: &[Record]) -> Result<(), EngineError> {
        let _publishing = self.publishing.lock();
        let model = self.model();
        self.publish(model, records)
    }

    /// Builds a new snapshot from `model` and `records` and swaps it in. The
    /// previous snapshot stays live until the build succeeds.
    pub fn reload(&self, model: ScoringModel, records: &[Record]) -> Result<(), EngineError> {
        model.validate()?;
        let _publishing = self.publishing.lock();
        self.publish(Arc::new(model), records)
    }

    /// Caller must hold `publishing`.
    fn publish(&self, model: Arc<ScoringModel>, records: &[Record]) -> Result<(), EngineError> {
        let gazetteer = self
            .pool
            .install(|| Gazetteer::build(model.clone(), records))?;
        info!(
            "Published model {} with {} reference records",
            model.version,
            gazetteer.reference_count()
        );
        *self.snapshot.write() = Arc::new(Snapshot {
            model,
            reference: Some(Arc::new(gazetteer)),
        });
        Ok(())
    }

    fn gazetteer(&self) -> Result<Arc<Gazetteer>, EngineError> {
        self.snapshot
            .read()
            .reference
            .clone()
            .ok_or_else(|| EngineError::ModelUnavailable(String::from("no reference set indexed")))
    }

    /// Ranked matches of one query record against the published reference set.
    pub fn find_matches(
        &self,
        query: &Record,
        threshold: f64,
        limit: usize,
    ) -> Result<MatchOutcome, EngineError> {
        let gazetteer = self.gazetteer()?;
        self.pool
            .install(|| gazetteer.find_matches(query, threshold, limit))
    }

    pub fn blocking_info(&self, query: &Record) -> Result<BlockingInfo, EngineError> {
        Ok(self.gazetteer()?.blocking_info(query))
    }

    pub fn describe_rules(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.gazetteer()?.describe_rules())
    }

    /// Partitions `records` into duplicate clusters.
    ///
    /// All candidate pairs are scored before any cluster is resolved; a
    /// single scoring failure or a cancellation aborts the run and nothing
    /// partial is returned.
    pub fn resolve_duplicates(
        &self,
        records: &[Record],
        threshold: f64,
        cancel: &Cancellation,
    ) -> Result<Vec<AnnotatedRecord>, EngineError> {
        let model = self.model();
        let start = Instant::now();
        let normalized: Vec<NormalizedRecord> =
            records.iter().map(NormalizedRecord::with_schema).collect();
        let index = self
            .pool
            .install(|| BlockingIndex::build(normalized, &model.blocking))?;

        let scores = self.pool.install(|| score_candidates(&index, &model, cancel));
        let scores = scores.map_err(|err| {
            if err != EngineError::Cancelled {
                error!("Bulk scoring aborted: {}", err);
            }
            err
        })?;
        info!(
            "Scored {} candidate pairs over {} records in {:.4} secs",
            scores.len(),
            index.len(),
            start.elapsed().as_secs_f64()
        );
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let ids: Vec<String> = index.records().iter().map(|r| r.id.clone()).collect();
        let assignments = crate::cluster::resolve(&ids, &scores, threshold)?;

        let by_id: FxHashMap<&str, &Record> =
            records.iter().map(|r| (r.id.as_str(), r)).collect();
        let annotated = assignments
            .into_iter()
            .map(|a| {
                let record = by_id.get(a.id.as_str()).map(|r| (*r).clone()).ok_or_else(|| {
                    EngineError::Clustering(format!("assignment for unknown record {}", a.id))
                })?;
                let confidence = a.confidence.map(classify);
                Ok(AnnotatedRecord {
                    record,
                    cluster_id: a.cluster_id,
                    confidence: a.confidence.map(crate::classify::round2),
                    matching_score_percent: confidence.map(|c| c.percentage),
                    dedupe_category: confidence.map(|c| c.category),
                    role: a.role,
                })
            })
            .collect::<Result<Vec<_>, EngineError>>()?;
        info!(
            "Resolved {} records into {} clusters in {:.4} secs",
            annotated.len(),
            annotated.last().map_or(0, |a| a.cluster_id + 1),
            start.elapsed().as_secs_f64()
        );
        Ok(annotated)
    }
}

fn score_candidates(
    index: &BlockingIndex,
    model: &ScoringModel,
    cancel: &Cancellation,
) -> Result<Vec<Score>, EngineError> {
    let rows: Vec<Vec<Score>> = (0..index.len())
        .into_par_iter()
        .map(|left| -> Result<Vec<Score>, EngineError> {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let a = index.record(left);
            index
                .neighbors_after(left)
                .into_iter()
                .map(|right| {
                    let b = index.record(right);
                    score(a, b, model).map(|probability| Score {
                        left: a.id.clone(),
                        right: b.id.clone(),
                        probability,
                    })
                })
                .collect()
        })
        .collect::<Result<_, _>>()?;
    Ok(rows.into_iter().flatten().collect())
}
