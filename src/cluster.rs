use rustc_hash::FxHashMap;
use std::cmp::Ordering;

use crate::dto::{cmp_ids, Role};
use crate::error::EngineError;
use crate::scorer::Score;

/// Cluster membership of one record.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterAssignment {
    pub id: String,
    pub cluster_id: usize,
    pub role: Role,
    /// Highest probability against any other member; `None` for singletons.
    pub confidence: Option<f64>,
}

///
/// Disjoint-set over record positions, merged by above-threshold scores.
///
pub struct DeduplicationTable<'a> {
    ids: &'a [String],
    parent: Vec<usize>,
    rank: Vec<u8>,
    /// Best score seen per record across its qualifying edges
    best: Vec<Option<f64>>,
}

impl<'a> DeduplicationTable<'a> {
    ///
    /// Builds the table from every score at or above `threshold`.
    ///
    /// ## Arguments
    ///
    /// * `ids` - Identifiers of the full record set.
    /// * `scores` - Scored candidate pairs; lower-scoring pairs are ignored.
    /// * `threshold` - Minimum probability (inclusive) for a pair to link records.
    ///
    pub fn new(ids: &'a [String], scores: &[Score], threshold: f64) -> Result<Self, EngineError> {
        let mut lookup: FxHashMap<&str, usize> = FxHashMap::default();
        lookup.reserve(ids.len());
        for (pos, id) in ids.iter().enumerate() {
            if lookup.insert(id.as_str(), pos).is_some() {
                return Err(EngineError::Clustering(format!(
                    "record {id} appears more than once"
                )));
            }
        }
        let mut table = DeduplicationTable {
            ids,
            parent: (0..ids.len()).collect(),
            rank: vec![0; ids.len()],
            best: vec![None; ids.len()],
        };
        for score in scores {
            let position = |id: &str| {
                lookup.get(id).copied().ok_or_else(|| {
                    EngineError::Clustering(format!("score references unknown record {id}"))
                })
            };
            let left = position(&score.left)?;
            let right = position(&score.right)?;
            if score.probability < threshold || left == right {
                continue;
            }
            table.union(left, right);
            table.observe(left, score.probability);
            table.observe(right, score.probability);
        }
        Ok(table)
    }

    fn observe(&mut self, pos: usize, probability: f64) {
        let best = &mut self.best[pos];
        if best.map_or(true, |b| probability > b) {
            *best = Some(probability);
        }
    }

    fn find(&mut self, pos: usize) -> usize {
        let mut root = pos;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = pos;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            Ordering::Less => self.parent[ra] = rb,
            Ordering::Greater => self.parent[rb] = ra,
            Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }

    ///
    /// Connected components as lists of positions, each in presentation
    /// order (Original, then Duplicates by descending confidence). Clusters
    /// with several members come first, ordered by their lowest id;
    /// singletons follow in id order.
    ///
    pub fn grouped_ids(&mut self) -> Vec<Vec<usize>> {
        let mut components: FxHashMap<usize, Vec<usize>> = FxHashMap::default();
        for pos in 0..self.ids.len() {
            let root = self.find(pos);
            components.entry(root).or_default().push(pos);
        }
        let mut groups: Vec<Vec<usize>> = components.into_values().collect();
        for group in groups.iter_mut() {
            group.sort_by(|&a, &b| self.presentation_order(a, b));
        }
        groups.sort_by(|a, b| {
            let singleton = (a.len() == 1).cmp(&(b.len() == 1));
            singleton.then_with(|| cmp_ids(&self.ids[self.lowest(a)], &self.ids[self.lowest(b)]))
        });
        groups
    }

    fn presentation_order(&self, a: usize, b: usize) -> Ordering {
        let (sa, sb) = (self.best[a].unwrap_or(0.0), self.best[b].unwrap_or(0.0));
        sb.partial_cmp(&sa)
            .unwrap_or(Ordering::Equal)
            .then_with(|| cmp_ids(&self.ids[a], &self.ids[b]))
    }

    fn lowest(&self, group: &[usize]) -> usize {
        group
            .iter()
            .copied()
            .min_by(|&a, &b| cmp_ids(&self.ids[a], &self.ids[b]))
            .unwrap_or(0)
    }

    /// Roles and confidences for every record, in presentation order.
    pub fn assignments(&mut self) -> Vec<ClusterAssignment> {
        let groups = self.grouped_ids();
        let mut out = Vec::with_capacity(self.ids.len());
        for (cluster_id, group) in groups.into_iter().enumerate() {
            let single = group.len() == 1;
            for (rank, pos) in group.into_iter().enumerate() {
                let role = match (single, rank) {
                    (true, _) => Role::NotDuplicate,
                    (false, 0) => Role::Original,
                    (false, _) => Role::Duplicate,
                };
                out.push(ClusterAssignment {
                    id: self.ids[pos].clone(),
                    cluster_id,
                    role,
                    confidence: if single { None } else { self.best[pos] },
                });
            }
        }
        out
    }
}

/// Partitions `ids` into duplicate clusters linked by scores at or above
/// `threshold`. Every id appears in exactly one assignment.
pub fn resolve(
    ids: &[String],
    scores: &[Score],
    threshold: f64,
) -> Result<Vec<ClusterAssignment>, EngineError> {
    let mut table = DeduplicationTable::new(ids, scores, threshold)?;
    Ok(table.assignments())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (1..=n).map(|i| i.to_string()).collect()
    }

    fn score(left: &str, right: &str, probability: f64) -> Score {
        Score {
            left: left.into(),
            right: right.into(),
            probability,
        }
    }

    fn role_of<'a>(out: &'a [ClusterAssignment], id: &str) -> &'a ClusterAssignment {
        out.iter().find(|a| a.id == id).unwrap()
    }

    #[test]
    fn five_record_scenario() {
        let ids = ids(5);
        let scores = vec![
            score("2", "4", 0.95),
            score("4", "5", 0.92),
            score("1", "3", 0.3),
        ];
        let out = resolve(&ids, &scores, 0.5).unwrap();
        assert_eq!(out.len(), 5);

        let cluster = role_of(&out, "2").cluster_id;
        assert_eq!(role_of(&out, "4").cluster_id, cluster);
        assert_eq!(role_of(&out, "5").cluster_id, cluster);
        // 2 and 4 both peak at 0.95; the lower id wins.
        assert_eq!(role_of(&out, "2").role, Role::Original);
        assert_eq!(role_of(&out, "4").role, Role::Duplicate);
        assert_eq!(role_of(&out, "5").role, Role::Duplicate);
        assert_eq!(role_of(&out, "5").confidence, Some(0.92));

        for id in ["1", "3"] {
            let a = role_of(&out, id);
            assert_eq!(a.role, Role::NotDuplicate);
            assert_eq!(a.confidence, None);
            assert_ne!(a.cluster_id, cluster);
        }
        assert_ne!(role_of(&out, "1").cluster_id, role_of(&out, "3").cluster_id);
    }

    #[test]
    fn presentation_order_groups_clusters_then_singletons() {
        let ids = ids(5);
        let scores = vec![score("2", "4", 0.95), score("4", "5", 0.92)];
        let out = resolve(&ids, &scores, 0.5).unwrap();
        let order: Vec<(&str, Role, usize)> = out
            .iter()
            .map(|a| (a.id.as_str(), a.role, a.cluster_id))
            .collect();
        assert_eq!(
            order,
            vec![
                ("2", Role::Original, 0),
                ("4", Role::Duplicate, 0),
                ("5", Role::Duplicate, 0),
                ("1", Role::NotDuplicate, 1),
                ("3", Role::NotDuplicate, 2),
            ]
        );
    }

    #[test]
    fn original_is_member_with_highest_peak_score() {
        let ids = ids(3);
        let scores = vec![score("1", "2", 0.6), score("2", "3", 0.8)];
        let out = resolve(&ids, &scores, 0.5).unwrap();
        assert_eq!(role_of(&out, "2").role, Role::Original);
        assert_eq!(role_of(&out, "2").confidence, Some(0.8));
        assert_eq!(role_of(&out, "1").confidence, Some(0.6));
    }

    #[test]
    fn transitive_links_form_one_cluster() {
        let ids = ids(3);
        let scores = vec![score("1", "2", 0.9), score("2", "3", 0.9), score("1", "3", 0.1)];
        let out = resolve(&ids, &scores, 0.5).unwrap();
        let clusters: Vec<usize> = out.iter().map(|a| a.cluster_id).collect();
        assert!(clusters.iter().all(|&c| c == clusters[0]));
        assert_eq!(out.iter().filter(|a| a.role == Role::Original).count(), 1);
    }

    #[test]
    fn threshold_is_inclusive() {
        let out = resolve(&ids(2), &[score("1", "2", 0.5)], 0.5).unwrap();
        assert_eq!(out[0].role, Role::Original);
        assert_eq!(out[1].role, Role::Duplicate);
    }

    #[test]
    fn unknown_record_in_scores_is_an_error() {
        let err = resolve(&ids(2), &[score("1", "9", 0.9)], 0.5).unwrap_err();
        assert!(matches!(err, EngineError::Clustering(_)));
    }

    #[test]
    fn below_threshold_scores_still_validate_ids() {
        let err = resolve(&ids(2), &[score("1", "9", 0.1)], 0.5).unwrap_err();
        assert!(matches!(err, EngineError::Clustering(_)));
    }
}
