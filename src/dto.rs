use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::classify::Category;
use crate::error::EngineError;

/// Field schema supplied by the record source, in output order.
pub const FIELDS: [&str; 8] = [
    "CENTER",
    "NODE",
    "NAME_FIRST",
    "EMAIL",
    "MOB_NUMBER",
    "ADDRESS",
    "POI_DOC_ID",
    "POA_DOC_ID",
];

pub const REQUIRED_FIELDS: [&str; 7] = [
    "CENTER",
    "NODE",
    "NAME_FIRST",
    "EMAIL",
    "MOB_NUMBER",
    "ADDRESS",
    "POA_DOC_ID",
];

pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.2;
pub const DEFAULT_CLUSTER_THRESHOLD: f64 = 0.5;
pub const DEFAULT_MATCH_LIMIT: usize = 15;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DataFile {
    pub bucket: String,
    pub key: String,
}

/// Bulk deduplication job.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupConfig {
    pub data: DataFile,
    pub model: DataFile,
    #[serde(default = "default_cluster_threshold")]
    pub threshold: f64,
    #[serde(default)]
    pub workers: Option<usize>,
}

fn default_cluster_threshold() -> f64 {
    DEFAULT_CLUSTER_THRESHOLD
}

fn default_match_threshold() -> f64 {
    DEFAULT_MATCH_THRESHOLD
}

fn default_match_limit() -> usize {
    DEFAULT_MATCH_LIMIT
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    RecordMatch,
    BlockingInfo,
    Reload,
}

impl RequestMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestMode::RecordMatch => "record-match",
            RequestMode::BlockingInfo => "blocking-info",
            RequestMode::Reload => "reload",
        }
    }
}

/// Lookup request as received by the match service.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MatchRequest {
    pub mode: RequestMode,
    #[serde(default = "default_match_threshold")]
    pub threshold: f64,
    #[serde(default = "default_match_limit")]
    pub limit: usize,
    #[serde(default)]
    pub record: Option<Map<String, Value>>,
    #[serde(default)]
    pub records: Option<Vec<Map<String, Value>>>,
}

/// A source record: a stable identifier plus raw field values.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Record {
    pub id: String,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Option<String>>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Record {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<String>) -> Self {
        self.fields.insert(name.to_string(), Some(value.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.as_deref())
    }

    /// Builds a record from a JSON object, stringifying scalar values.
    pub fn from_json(id: impl Into<String>, object: &Map<String, Value>) -> Self {
        let fields = object
            .iter()
            .map(|(name, value)| (name.clone(), json_field(value)))
            .collect();
        Record {
            id: id.into(),
            fields,
        }
    }
}

fn json_field(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Returns the required fields that are absent, null, blank or `missing`,
/// in schema order.
pub fn validate_record_fields(record: &Record) -> Vec<&'static str> {
    REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|&field| match record.get(field) {
            None => true,
            Some(value) => {
                let value = value.trim();
                value.is_empty() || value == crate::normalize::MISSING
            }
        })
        .collect()
}

/// Request-boundary check: fails with the missing field names.
pub fn require_fields(record: &Record) -> Result<(), EngineError> {
    let missing = validate_record_fields(record);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Validation {
            missing: missing.into_iter().map(String::from).collect(),
        })
    }
}

/// Total order on record identifiers: numeric ids by value first, then
/// everything else lexicographically.
pub fn cmp_ids(a: &str, b: &str) -> Ordering {
    id_sort_key(a).cmp(&id_sort_key(b))
}

fn id_sort_key(id: &str) -> (u8, u64, &str) {
    match id.parse::<u64>() {
        Ok(n) => (0, n, id),
        Err(_) => (1, 0, id),
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    #[serde(rename = "Original")]
    Original,
    #[serde(rename = "Duplicate")]
    Duplicate,
    #[serde(rename = "Not Duplicate")]
    NotDuplicate,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Original => "Original",
            Role::Duplicate => "Duplicate",
            Role::NotDuplicate => "Not Duplicate",
        }
    }
}

/// One record of the bulk output, annotated with its cluster.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct AnnotatedRecord {
    pub record: Record,
    pub cluster_id: usize,
    pub confidence: Option<f64>,
    pub matching_score_percent: Option<f64>,
    pub dedupe_category: Option<Category>,
    pub role: Role,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct MatchEntry {
    pub matching_record_id: String,
    pub probability: f64,
    pub confidence_percent: f64,
    pub dedupe_category: Category,
    pub record_data: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct MatchOutcome {
    pub total_cases: usize,
    pub matching_count: usize,
    pub matching_score_percent: f64,
    pub matches: Vec<MatchEntry>,
}

impl MatchOutcome {
    pub fn new(matches: Vec<MatchEntry>, total_cases: usize) -> Self {
        let matching_count = matches.len();
        let matching_score_percent = if total_cases == 0 {
            0.0
        } else {
            crate::classify::round2(matching_count as f64 / total_cases as f64 * 100.0)
        };
        MatchOutcome {
            total_cases,
            matching_count,
            matching_score_percent,
            matches,
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct BlockingInfo {
    pub input: BTreeMap<String, String>,
    pub block_keys: Vec<String>,
    pub candidate_count: usize,
}
