use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// Per-node compression table over child-state combinations.
///
/// For every site pattern, records the compact index `0..k` of the distinct
/// `(child1-id, child2-id)` combination that pattern realizes, plus the reverse list of the
/// `k` distinct pairs themselves. Partials of the owning node are stored per compact id, so
/// the expensive per-state work runs once per distinct combination instead of once per
/// pattern.
///
/// An empty pair list marks the table as stale: it must be rebuilt (one scan over the
/// pattern axis) before the next use. Staleness is only ever introduced by a `Filthy`
/// change below the owning node; branch-length-only (`Dirty`) updates reuse the table
/// verbatim.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PatternIdCache {
  map: Vec<usize>,
  pairs: Vec<(usize, usize)>,
}

impl PatternIdCache {
  #[inline]
  pub fn is_stale(&self) -> bool {
    self.pairs.is_empty()
  }

  pub fn invalidate(&mut self) {
    self.pairs.clear();
  }

  /// Number of distinct child-id combinations
  #[inline]
  pub fn distinct_count(&self) -> usize {
    self.pairs.len()
  }

  /// Pattern index to compact id
  #[inline]
  pub fn map(&self) -> &[usize] {
    &self.map
  }

  /// Compact id to the (child1-id, child2-id) pair it stands for
  #[inline]
  pub fn pairs(&self) -> &[(usize, usize)] {
    &self.pairs
  }

  /// Rescan the pattern axis, assigning compact ids in order of first occurrence
  pub fn rebuild(&mut self, ids1: &[usize], ids2: &[usize]) {
    debug_assert_eq!(ids1.len(), ids2.len());
    self.map.clear();
    self.map.resize(ids1.len(), 0);
    self.pairs.clear();

    let mut seen: HashMap<(usize, usize), usize> = HashMap::with_capacity(ids1.len());
    for (p, (&a, &b)) in ids1.iter().zip(ids2).enumerate() {
      let id = match seen.entry((a, b)) {
        Entry::Occupied(entry) => *entry.get(),
        Entry::Vacant(entry) => {
          let id = self.pairs.len();
          self.pairs.push((a, b));
          *entry.insert(id)
        }
      };
      self.map[p] = id;
    }
  }
}
