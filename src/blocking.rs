use log::{info, warn};
use rand::prelude::*;
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet, FxHasher};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

use crate::dto::cmp_ids;
use crate::error::EngineError;
use crate::normalize::NormalizedRecord;

/// One key-generation rule. Rules only ever look at non-`missing` values.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockingRule {
    /// The whole normalized value.
    Exact { field: String },
    /// The first `length` characters.
    Prefix { field: String, length: usize },
    /// The last `length` characters (phone numbers, document ids).
    Suffix { field: String, length: usize },
    /// Every whitespace token of at least `min_length` characters.
    Token {
        field: String,
        #[serde(default = "default_min_token_length")]
        min_length: usize,
    },
    /// Tokens sorted and re-joined, so word order does not matter.
    SortedTokens { field: String },
    /// Every character n-gram of `size`.
    CharNgram { field: String, size: usize },
    /// MinHash signature over the tokens of `fields`, split into
    /// `num_bands` bands; each band is a key.
    MinHash {
        fields: Vec<String>,
        num_perm: usize,
        num_bands: usize,
        seed: u64,
    },
}

fn default_min_token_length() -> usize {
    2
}

impl BlockingRule {
    pub fn fields(&self) -> Vec<&str> {
        match self {
            BlockingRule::Exact { field }
            | BlockingRule::Prefix { field, .. }
            | BlockingRule::Suffix { field, .. }
            | BlockingRule::Token { field, .. }
            | BlockingRule::SortedTokens { field }
            | BlockingRule::CharNgram { field, .. } => vec![field.as_str()],
            BlockingRule::MinHash { fields, .. } => fields.iter().map(String::as_str).collect(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            BlockingRule::Exact { field } => format!("exact({field})"),
            BlockingRule::Prefix { field, length } => format!("prefix({field}, {length})"),
            BlockingRule::Suffix { field, length } => format!("suffix({field}, {length})"),
            BlockingRule::Token { field, min_length } => format!("token({field}, min {min_length})"),
            BlockingRule::SortedTokens { field } => format!("sorted_tokens({field})"),
            BlockingRule::CharNgram { field, size } => format!("char_ngram({field}, {size})"),
            BlockingRule::MinHash {
                fields,
                num_perm,
                num_bands,
                seed,
            } => format!(
                "min_hash({}, perm {num_perm}, bands {num_bands}, seed {seed})",
                fields.join("+")
            ),
        }
    }
}

/// Blocking configuration carried by the model artifact.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct BlockingConfig {
    pub rules: Vec<BlockingRule>,
    /// Key groups larger than this are left out of candidate generation.
    #[serde(default)]
    pub max_block_size: Option<usize>,
}

impl Default for BlockingConfig {
    fn default() -> Self {
        let field = |name: &str| name.to_string();
        BlockingConfig {
            rules: vec![
                BlockingRule::Exact { field: field("EMAIL") },
                BlockingRule::Exact { field: field("MOB_NUMBER") },
                BlockingRule::Suffix {
                    field: field("MOB_NUMBER"),
                    length: 6,
                },
                BlockingRule::Exact { field: field("POA_DOC_ID") },
                BlockingRule::Exact { field: field("POI_DOC_ID") },
                BlockingRule::SortedTokens { field: field("NAME_FIRST") },
                BlockingRule::MinHash {
                    fields: vec![field("ADDRESS")],
                    num_perm: 32,
                    num_bands: 8,
                    seed: 7,
                },
            ],
            max_block_size: None,
        }
    }
}

#[derive(Clone, Debug)]
struct MinHash {
    hash_values: Vec<u32>,
}

impl MinHash {
    fn new<'t>(items: impl Iterator<Item = &'t str>, permutations: &[(u64, u64)]) -> Self {
        let mut hash_values = vec![u32::MAX; permutations.len()];
        for item in items {
            let item_hash = calculate_hash(&item);
            for (i, &(a, b)) in permutations.iter().enumerate() {
                let hash = permute_hash(item_hash, a, b);
                hash_values[i] = hash_values[i].min(hash);
            }
        }
        MinHash { hash_values }
    }
}

#[derive(Clone, Debug)]
enum CompiledRule {
    Simple(BlockingRule),
    MinHash {
        fields: Vec<String>,
        permutations: Vec<(u64, u64)>,
        band_size: usize,
    },
}

/// Compiled form of a [`BlockingConfig`]. MinHash permutations are drawn
/// from a seeded generator, so the same config always yields the same keys.
#[derive(Clone, Debug)]
pub struct KeyGenerator {
    rules: Vec<CompiledRule>,
    descriptions: Vec<String>,
}

impl KeyGenerator {
    pub fn new(config: &BlockingConfig) -> Self {
        let rules = config
            .rules
            .iter()
            .map(|rule| match rule {
                BlockingRule::MinHash {
                    fields,
                    num_perm,
                    num_bands,
                    seed,
                } => {
                    let mut rng = StdRng::seed_from_u64(*seed);
                    let permutations = (0..*num_perm).map(|_| (rng.gen(), rng.gen())).collect();
                    CompiledRule::MinHash {
                        fields: fields.clone(),
                        permutations,
                        band_size: num_perm / (*num_bands).max(1),
                    }
                }
                other => CompiledRule::Simple(other.clone()),
            })
            .collect();
        KeyGenerator {
            rules,
            descriptions: config.rules.iter().map(BlockingRule::describe).collect(),
        }
    }

    /// Sorted, de-duplicated blocking keys of one record. Empty when the
    /// record has no usable value for any rule.
    pub fn keys(&self, record: &NormalizedRecord) -> Vec<String> {
        let mut keys = Vec::new();
        for (idx, rule) in self.rules.iter().enumerate() {
            match rule {
                CompiledRule::Simple(rule) => simple_keys(idx, rule, record, &mut keys),
                CompiledRule::MinHash {
                    fields,
                    permutations,
                    band_size,
                } => {
                    let values: Vec<&str> = fields.iter().filter_map(|f| record.value(f)).collect();
                    if values.is_empty() || *band_size == 0 {
                        continue;
                    }
                    let tokens = values.iter().flat_map(|v| v.split_whitespace());
                    let minhash = MinHash::new(tokens, permutations);
                    for (band, chunk) in minhash.hash_values.chunks_exact(*band_size).enumerate() {
                        keys.push(format!("{idx}:mh{band}:{:016x}", calculate_band_hash(chunk)));
                    }
                }
            }
        }
        keys.sort();
        keys.dedup();
        keys
    }

    pub fn describe(&self) -> &[String] {
        &self.descriptions
    }
}

fn simple_keys(idx: usize, rule: &BlockingRule, record: &NormalizedRecord, keys: &mut Vec<String>) {
    let field = match rule.fields().first() {
        Some(field) => *field,
        None => return,
    };
    let value = match record.value(field) {
        Some(value) => value,
        None => return,
    };
    match rule {
        BlockingRule::Exact { .. } => keys.push(format!("{idx}:{value}")),
        BlockingRule::Prefix { length, .. } => {
            let prefix: String = value.chars().take(*length).collect();
            keys.push(format!("{idx}:{prefix}"));
        }
        BlockingRule::Suffix { length, .. } => {
            let count = value.chars().count();
            let suffix: String = value.chars().skip(count.saturating_sub(*length)).collect();
            keys.push(format!("{idx}:{suffix}"));
        }
        BlockingRule::Token { min_length, .. } => keys.extend(
            value
                .split_whitespace()
                .filter(|t| t.chars().count() >= *min_length)
                .map(|t| format!("{idx}:{t}")),
        ),
        BlockingRule::SortedTokens { .. } => {
            let mut tokens: Vec<&str> = value.split_whitespace().collect();
            tokens.sort_unstable();
            keys.push(format!("{idx}:{}", tokens.join(" ")));
        }
        BlockingRule::CharNgram { size, .. } => {
            let chars: Vec<char> = value.chars().collect();
            if *size == 0 || chars.len() < *size {
                keys.push(format!("{idx}:{value}"));
            } else {
                keys.extend(
                    chars
                        .windows(*size)
                        .map(|w| format!("{idx}:{}", w.iter().collect::<String>())),
                );
            }
        }
        BlockingRule::MinHash { .. } => {}
    }
}

/// An unordered pair of index positions, stored with `left < right`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CandidatePair {
    pub left: usize,
    pub right: usize,
}

/// Read-only mapping from blocking key to the records that produced it.
///
/// Records are held in ascending identifier order, so positions compare the
/// same way identifiers do.
#[derive(Debug)]
pub struct BlockingIndex {
    records: Vec<NormalizedRecord>,
    key_ids: FxHashMap<String, usize>,
    /// Ascending record positions per key id.
    groups: Vec<Vec<usize>>,
    /// Key ids per record position.
    record_keys: Vec<Vec<usize>>,
    oversized: Vec<bool>,
    generator: KeyGenerator,
}

impl BlockingIndex {
    pub fn build(
        mut records: Vec<NormalizedRecord>,
        config: &BlockingConfig,
    ) -> Result<Self, EngineError> {
        if records.is_empty() {
            return Err(EngineError::IndexBuild(String::from("no records to index")));
        }
        if records.iter().any(|r| r.id.trim().is_empty()) {
            return Err(EngineError::IndexBuild(String::from(
                "record without identifier",
            )));
        }
        records.sort_by(|a, b| cmp_ids(&a.id, &b.id));
        if let Some(pair) = records.windows(2).find(|w| w[0].id == w[1].id) {
            return Err(EngineError::IndexBuild(format!(
                "duplicate record identifier {}",
                pair[0].id
            )));
        }

        let start = std::time::Instant::now();
        let generator = KeyGenerator::new(config);
        let per_record: Vec<Vec<String>> =
            records.par_iter().map(|r| generator.keys(r)).collect();

        let mut key_ids: FxHashMap<String, usize> = FxHashMap::default();
        let mut groups: Vec<Vec<usize>> = Vec::new();
        let mut record_keys = Vec::with_capacity(records.len());
        for (pos, keys) in per_record.into_iter().enumerate() {
            let mut ids = Vec::with_capacity(keys.len());
            for key in keys {
                let next = groups.len();
                let id = *key_ids.entry(key).or_insert(next);
                if id == next {
                    groups.push(Vec::new());
                }
                groups[id].push(pos);
                ids.push(id);
            }
            record_keys.push(ids);
        }

        let oversized: Vec<bool> = groups
            .iter()
            .map(|g| config.max_block_size.map_or(false, |max| g.len() > max))
            .collect();
        let skipped = oversized.iter().filter(|&&o| o).count();
        if skipped > 0 {
            warn!(
                "{} blocking keys exceed max_block_size {:?} and will not produce candidates",
                skipped, config.max_block_size
            );
        }
        info!(
            "Indexed {} records under {} blocking keys in {:.4} secs",
            records.len(),
            groups.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(BlockingIndex {
            records,
            key_ids,
            groups,
            record_keys,
            oversized,
            generator,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn key_count(&self) -> usize {
        self.groups.len()
    }

    pub fn record(&self, pos: usize) -> &NormalizedRecord {
        &self.records[pos]
    }

    pub fn records(&self) -> &[NormalizedRecord] {
        &self.records
    }

    pub fn generator(&self) -> &KeyGenerator {
        &self.generator
    }

    /// Records after `pos` sharing at least one usable key with it, ascending.
    pub fn neighbors_after(&self, pos: usize) -> Vec<usize> {
        let mut neighbors: Vec<usize> = self.record_keys[pos]
            .iter()
            .filter(|&&key| !self.oversized[key])
            .flat_map(|&key| self.groups[key].iter().copied().filter(|&other| other > pos))
            .collect();
        neighbors.sort_unstable();
        neighbors.dedup();
        neighbors
    }

    /// Every candidate pair exactly once, ordered by (left, right).
    pub fn candidates(&self) -> impl Iterator<Item = CandidatePair> + '_ {
        (0..self.records.len()).flat_map(move |left| {
            self.neighbors_after(left)
                .into_iter()
                .map(move |right| CandidatePair { left, right })
        })
    }

    /// Blocking keys the query produces. Does not touch the index.
    pub fn query_keys(&self, query: &NormalizedRecord) -> Vec<String> {
        self.generator.keys(query)
    }

    /// Positions of indexed records sharing at least one key with the query,
    /// ascending.
    pub fn candidates_for(&self, query: &NormalizedRecord) -> Vec<usize> {
        let mut found: FxHashSet<usize> = FxHashSet::default();
        for key in self.query_keys(query) {
            if let Some(&id) = self.key_ids.get(&key) {
                if !self.oversized[id] {
                    found.extend(self.groups[id].iter().copied());
                }
            }
        }
        let mut positions: Vec<usize> = found.into_iter().collect();
        positions.sort_unstable();
        positions
    }
}

#[inline]
fn calculate_hash<T: Hash>(t: &T) -> u64 {
    let mut s = FxHasher::default();
    t.hash(&mut s);
    s.finish()
}

#[inline]
fn permute_hash(hash: u64, a: u64, b: u64) -> u32 {
    ((a.wrapping_mul(hash).wrapping_add(b)) >> 32) as u32
}

#[inline]
fn calculate_band_hash(band: &[u32]) -> u64 {
    let mut hasher = FxHasher::default();
    for &value in band {
        hasher.write_u32(value);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::Record;

    fn rec(id: &str, fields: &[(&str, &str)]) -> NormalizedRecord {
        let record = fields
            .iter()
            .fold(Record::new(id), |r, (k, v)| r.with_field(k, *v));
        NormalizedRecord::from_record(&record)
    }

    fn config(rules: Vec<BlockingRule>) -> BlockingConfig {
        BlockingConfig {
            rules,
            max_block_size: None,
        }
    }

    fn exact(field: &str) -> BlockingRule {
        BlockingRule::Exact {
            field: field.to_string(),
        }
    }

    #[test]
    fn empty_input_fails() {
        let err = BlockingIndex::build(vec![], &BlockingConfig::default()).unwrap_err();
        assert!(matches!(err, EngineError::IndexBuild(_)));
    }

    #[test]
    fn duplicate_or_blank_ids_fail() {
        let records = vec![rec("1", &[("EMAIL", "a")]), rec("1", &[("EMAIL", "b")])];
        assert!(BlockingIndex::build(records, &config(vec![exact("EMAIL")])).is_err());
        let records = vec![rec(" ", &[("EMAIL", "a")])];
        assert!(BlockingIndex::build(records, &config(vec![exact("EMAIL")])).is_err());
    }

    #[test]
    fn pairs_sharing_several_keys_are_emitted_once() {
        let records = vec![
            rec("1", &[("EMAIL", "a@x.com"), ("MOB_NUMBER", "555")]),
            rec("2", &[("EMAIL", "a@x.com"), ("MOB_NUMBER", "555")]),
            rec("3", &[("EMAIL", "b@x.com"), ("MOB_NUMBER", "555")]),
            rec("4", &[("EMAIL", "c@x.com"), ("MOB_NUMBER", "999")]),
        ];
        let index =
            BlockingIndex::build(records, &config(vec![exact("EMAIL"), exact("MOB_NUMBER")]))
                .unwrap();
        let pairs: Vec<(usize, usize)> = index.candidates().map(|p| (p.left, p.right)).collect();
        assert_eq!(pairs, vec![(0, 1), (0, 2), (1, 2)]);
    }

    #[test]
    fn missing_values_produce_no_keys() {
        let records = vec![
            rec("1", &[("EMAIL", "")]),
            rec("2", &[("EMAIL", "  ")]),
        ];
        let index = BlockingIndex::build(records, &config(vec![exact("EMAIL")])).unwrap();
        assert_eq!(index.key_count(), 0);
        assert_eq!(index.candidates().count(), 0);
    }

    #[test]
    fn records_are_held_in_id_order() {
        let records = vec![
            rec("10", &[("EMAIL", "a")]),
            rec("2", &[("EMAIL", "a")]),
            rec("1", &[("EMAIL", "a")]),
        ];
        let index = BlockingIndex::build(records, &config(vec![exact("EMAIL")])).unwrap();
        let ids: Vec<&str> = index.records().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "10"]);
    }

    #[test]
    fn probing_returns_union_without_rebuilding() {
        let records = vec![
            rec("1", &[("EMAIL", "a@x.com"), ("NAME_FIRST", "ann lee")]),
            rec("2", &[("EMAIL", "b@x.com"), ("NAME_FIRST", "lee ann")]),
            rec("3", &[("EMAIL", "c@x.com"), ("NAME_FIRST", "bob")]),
        ];
        let rules = vec![
            exact("EMAIL"),
            BlockingRule::SortedTokens {
                field: "NAME_FIRST".into(),
            },
        ];
        let index = BlockingIndex::build(records, &config(rules)).unwrap();
        let query = rec("q", &[("EMAIL", "a@x.com"), ("NAME_FIRST", "Lee Ann")]);
        assert_eq!(index.candidates_for(&query), vec![0, 1]);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn prefix_suffix_token_and_ngram_rules() {
        let record = rec(
            "1",
            &[("MOB_NUMBER", "98765 43210"), ("NAME_FIRST", "ann marie")],
        );
        let generator = KeyGenerator::new(&config(vec![
            BlockingRule::Prefix {
                field: "MOB_NUMBER".into(),
                length: 3,
            },
            BlockingRule::Suffix {
                field: "MOB_NUMBER".into(),
                length: 4,
            },
            BlockingRule::Token {
                field: "NAME_FIRST".into(),
                min_length: 4,
            },
            BlockingRule::CharNgram {
                field: "NAME_FIRST".into(),
                size: 8,
            },
        ]));
        assert_eq!(
            generator.keys(&record),
            vec!["0:987", "1:3210", "2:marie", "3:ann mari", "3:nn marie"]
        );
    }

    #[test]
    fn min_hash_keys_are_deterministic_and_shared_by_equal_text() {
        let rule = BlockingRule::MinHash {
            fields: vec!["ADDRESS".into()],
            num_perm: 16,
            num_bands: 4,
            seed: 11,
        };
        let a = rec("1", &[("ADDRESS", "12 main road springfield")]);
        let b = rec("2", &[("ADDRESS", "springfield, 12 Main Road")]);
        let first = KeyGenerator::new(&config(vec![rule.clone()])).keys(&a);
        let second = KeyGenerator::new(&config(vec![rule])).keys(&b);
        assert_eq!(first.len(), 4);
        assert_eq!(first, second);
    }

    #[test]
    fn oversized_blocks_are_skipped() {
        let records = (0..5)
            .map(|i| rec(&i.to_string(), &[("CENTER", "hq"), ("EMAIL", "x")]))
            .collect();
        let mut cfg = config(vec![exact("CENTER")]);
        cfg.max_block_size = Some(3);
        let index = BlockingIndex::build(records, &cfg).unwrap();
        assert_eq!(index.candidates().count(), 0);
        assert!(index.candidates_for(&rec("q", &[("CENTER", "hq")])).is_empty());
    }
}
