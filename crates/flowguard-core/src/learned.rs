use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Observed "suggestion shown → suggestion taken" counts, keyed
/// `from → to → count`.
///
/// Growth is bounded: once the number of distinct pairs exceeds the decay
/// threshold every count is halved and pairs that reach zero are dropped, so
/// stale habits fade while strong ones keep their relative order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LearnedTransitions(BTreeMap<String, BTreeMap<String, u64>>);

impl LearnedTransitions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one `from → to` observation. A new pair that would take the
    /// table past `decay_threshold` distinct pairs decays the table first, so
    /// the observation itself always survives.
    pub fn record(&mut self, from: &str, to: &str, decay_threshold: usize) {
        if self.count(from, to) == 0 && self.pair_count() >= decay_threshold {
            self.decay();
        }
        *self
            .0
            .entry(from.to_string())
            .or_default()
            .entry(to.to_string())
            .or_insert(0) += 1;
    }

    pub fn count(&self, from: &str, to: &str) -> u64 {
        self.0
            .get(from)
            .and_then(|row| row.get(to))
            .copied()
            .unwrap_or(0)
    }

    /// Largest count among transitions out of `from`.
    pub fn row_max(&self, from: &str) -> u64 {
        self.0
            .get(from)
            .and_then(|row| row.values().max().copied())
            .unwrap_or(0)
    }

    /// Up to `k` successors of `from`, highest count first, ties by id.
    pub fn top_k(&self, from: &str, k: usize) -> Vec<(&str, u64)> {
        let Some(row) = self.0.get(from) else {
            return Vec::new();
        };
        let mut v: Vec<(&str, u64)> = row.iter().map(|(to, c)| (to.as_str(), *c)).collect();
        v.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        v.truncate(k);
        v
    }

    pub fn pair_count(&self) -> usize {
        self.0.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Halve every count, dropping pairs (and rows) that reach zero.
    pub fn decay(&mut self) {
        for row in self.0.values_mut() {
            for c in row.values_mut() {
                *c /= 2;
            }
            row.retain(|_, c| *c > 0);
        }
        self.0.retain(|_, row| !row.is_empty());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, u64)> {
        self.0.iter().flat_map(|(from, row)| {
            row.iter()
                .map(move |(to, c)| (from.as_str(), to.as_str(), *c))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_count() {
        let mut l = LearnedTransitions::new();
        l.record("a", "b", 100);
        l.record("a", "b", 100);
        l.record("a", "c", 100);
        assert_eq!(l.count("a", "b"), 2);
        assert_eq!(l.count("a", "c"), 1);
        assert_eq!(l.count("x", "y"), 0);
        assert_eq!(l.row_max("a"), 2);
        assert_eq!(l.pair_count(), 2);
    }

    #[test]
    fn top_k_orders_by_count_then_id() {
        let mut l = LearnedTransitions::new();
        for _ in 0..3 {
            l.record("a", "z", 100);
        }
        l.record("a", "c", 100);
        l.record("a", "b", 100);
        let top = l.top_k("a", 2);
        assert_eq!(top, vec![("z", 3), ("b", 1)]);
        assert!(l.top_k("none", 3).is_empty());
    }

    #[test]
    fn exceeding_threshold_halves_and_drops_zeroes() {
        let mut l = LearnedTransitions::new();
        for _ in 0..4 {
            l.record("a", "b", 2);
        }
        l.record("a", "c", 2);
        assert_eq!(l.pair_count(), 2);
        // Third distinct pair pushes past the threshold.
        l.record("x", "y", 2);
        assert_eq!(l.count("a", "b"), 2);
        assert_eq!(l.count("a", "c"), 0);
        assert_eq!(l.count("x", "y"), 1);
        assert_eq!(l.pair_count(), 2);
    }

    #[test]
    fn observation_that_triggers_decay_is_kept() {
        let mut l = LearnedTransitions::new();
        for from in ["p", "q", "r", "s"] {
            for _ in 0..4 {
                l.record(from, "t", 4);
            }
        }
        l.record("A", "B", 4);
        assert_eq!(l.count("A", "B"), 1);
        assert_eq!(l.count("p", "t"), 2);
        l.record("A", "B", 4);
        assert_eq!(l.count("A", "B"), 2);
    }

    #[test]
    fn serializes_as_nested_map() {
        let mut l = LearnedTransitions::new();
        l.record("start_feature", "generate_tasks", 10);
        let yaml = serde_yaml::to_string(&l).unwrap();
        assert!(yaml.contains("start_feature:"));
        let back: LearnedTransitions = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, l);
    }
}
