use crate::alphabet::alphabet::{Alphabet, StateCode};
use crate::make_error;
use crate::utils::float::log_sum_exp;
use eyre::Report;
use itertools::Itertools;
use log::debug;
use smart_default::SmartDefault;
use std::collections::HashMap;
use std::ops::Range;

/// Deduplicate alignment columns into unique patterns with occurrence weights.
///
/// Patterns are numbered by first occurrence, so that downstream indices are deterministic:
/// pattern 0 is the first unique column of the input. Returns the pattern list, the parallel
/// weight list (summing to the number of input columns) and, for each input column, the index
/// of the pattern it collapsed into.
pub fn compress(columns: &[Vec<usize>]) -> Result<(Vec<Vec<usize>>, Vec<usize>, Vec<usize>), Report> {
  let mut store = Compressor::new(columns.first().map_or(0, Vec::len));
  for column in columns {
    store.push_data_column(column)?;
  }
  Ok((store.patterns, store.weights, store.site_pattern_indices))
}

struct Compressor {
  n_taxa: usize,
  patterns: Vec<Vec<usize>>,
  weights: Vec<usize>,
  site_pattern_indices: Vec<usize>,
  excluded_mask: Vec<bool>,
  index_of: HashMap<Vec<usize>, usize>,
}

impl Compressor {
  fn new(n_taxa: usize) -> Self {
    Self {
      n_taxa,
      patterns: vec![],
      weights: vec![],
      site_pattern_indices: vec![],
      excluded_mask: vec![],
      index_of: HashMap::new(),
    }
  }

  fn intern(&mut self, column: &[usize]) -> Result<usize, Report> {
    if column.len() != self.n_taxa {
      return make_error!(
        "When compressing alignment columns: expected {} taxa per column, but found a column with {}",
        self.n_taxa,
        column.len()
      );
    }
    match self.index_of.get(column) {
      Some(&index) => Ok(index),
      None => {
        let index = self.patterns.len();
        self.patterns.push(column.to_vec());
        self.weights.push(0);
        self.excluded_mask.push(false);
        self.index_of.insert(column.to_vec(), index);
        Ok(index)
      }
    }
  }

  fn push_data_column(&mut self, column: &[usize]) -> Result<(), Report> {
    let index = self.intern(column)?;
    self.weights[index] += 1;
    self.site_pattern_indices.push(index);
    Ok(())
  }

  fn push_ascertainment_column(&mut self, column: &[usize]) -> Result<(), Report> {
    let index = self.intern(column)?;
    self.excluded_mask[index] = true;
    Ok(())
  }
}

#[derive(Clone, Debug, SmartDefault)]
pub struct PatternStoreParams {
  /// Site range dropped from the alignment before compression
  pub exclude_sites: Option<Range<usize>>,

  /// Site range describing the ascertainment-excluded site class. These columns are kept in
  /// the store with zero data weight and form the ascertainment correction set.
  pub ascertainment_exclude: Option<Range<usize>>,
}

/// Deduplicated site patterns of one alignment, with per-pattern occurrence weights.
///
/// Created once per alignment and immutable thereafter.
#[derive(Clone, Debug)]
pub struct PatternStore {
  alphabet: Alphabet,
  taxa: Vec<String>,
  patterns: Vec<Vec<usize>>,
  weights: Vec<usize>,
  site_pattern_indices: Vec<usize>,
  excluded_mask: Vec<bool>,
  ascertained: bool,
  site_count: usize,
}

impl PatternStore {
  /// Compress named, aligned sequences into a pattern store
  pub fn from_sequences<N: AsRef<str>, S: AsRef<str>>(
    alphabet: &Alphabet,
    records: &[(N, S)],
    params: &PatternStoreParams,
  ) -> Result<Self, Report> {
    if records.is_empty() {
      return make_error!("When building pattern store: alignment contains no sequences");
    }

    let taxa = records.iter().map(|(name, _)| name.as_ref().to_owned()).collect_vec();
    if taxa.iter().unique().count() != taxa.len() {
      return make_error!("When building pattern store: sequence names are not unique");
    }

    let length = records[0].1.as_ref().len();
    let codes: Vec<Vec<usize>> = records
      .iter()
      .map(|(name, seq)| {
        let seq = seq.as_ref();
        if seq.len() != length {
          return make_error!(
            "When building pattern store: sequence '{}' has length {}, expected {}",
            name.as_ref(),
            seq.len(),
            length
          );
        }
        alphabet.seq_codes(seq)
      })
      .collect::<Result<_, Report>>()?;

    for range in [&params.exclude_sites, &params.ascertainment_exclude].into_iter().flatten() {
      if range.end > length {
        return make_error!(
          "When building pattern store: site range {}..{} is out of bounds for alignment of length {length}",
          range.start,
          range.end
        );
      }
    }

    let in_range = |range: &Option<Range<usize>>, site: usize| range.as_ref().is_some_and(|r| r.contains(&site));

    let mut compressor = Compressor::new(records.len());
    for site in 0..length {
      if in_range(&params.exclude_sites, site) {
        continue;
      }
      let column = codes.iter().map(|seq| seq[site]).collect_vec();
      if in_range(&params.ascertainment_exclude, site) {
        compressor.push_ascertainment_column(&column)?;
      } else {
        compressor.push_data_column(&column)?;
      }
    }

    let site_count = compressor.site_pattern_indices.len();
    if site_count == 0 {
      return make_error!("When building pattern store: no sites remain after exclusions");
    }

    debug!(
      "Compressed {} sites into {} patterns ({} taxa)",
      site_count,
      compressor.patterns.len(),
      records.len()
    );

    Ok(Self {
      alphabet: alphabet.clone(),
      taxa,
      patterns: compressor.patterns,
      weights: compressor.weights,
      site_pattern_indices: compressor.site_pattern_indices,
      excluded_mask: compressor.excluded_mask,
      ascertained: params.ascertainment_exclude.is_some(),
      site_count,
    })
  }

  #[inline]
  pub fn n_patterns(&self) -> usize {
    self.patterns.len()
  }

  #[inline]
  pub fn n_taxa(&self) -> usize {
    self.taxa.len()
  }

  #[inline]
  pub const fn site_count(&self) -> usize {
    self.site_count
  }

  #[inline]
  pub const fn alphabet(&self) -> &Alphabet {
    &self.alphabet
  }

  #[inline]
  pub fn taxa(&self) -> &[String] {
    &self.taxa
  }

  pub fn taxon_index(&self, name: &str) -> Option<usize> {
    self.taxa.iter().position(|t| t == name)
  }

  #[inline]
  pub fn weights(&self) -> &[usize] {
    &self.weights
  }

  #[inline]
  pub fn weight(&self, pattern: usize) -> usize {
    self.weights[pattern]
  }

  #[inline]
  pub fn site_pattern_indices(&self) -> &[usize] {
    &self.site_pattern_indices
  }

  #[inline]
  pub const fn is_ascertained(&self) -> bool {
    self.ascertained
  }

  #[inline]
  pub fn is_excluded(&self, pattern: usize) -> bool {
    self.excluded_mask[pattern]
  }

  /// Ascertainment correction term: log of the total probability of the excluded site class,
  /// computed from the per-pattern log-likelihoods of the current evaluation.
  pub fn ascertainment_correction(&self, pattern_log_likelihoods: &[f64]) -> f64 {
    let excluded = self
      .excluded_mask
      .iter()
      .enumerate()
      .filter(|(_, &excluded)| excluded)
      .map(|(p, _)| pattern_log_likelihoods[p])
      .collect_vec();
    log_sum_exp(&excluded)
  }

  /// Engine state codes of one taxon across all patterns (ambiguity collapsed to unknown)
  pub fn pattern_states(&self, taxon: usize) -> Vec<StateCode> {
    self
      .patterns
      .iter()
      .map(|pattern| self.alphabet.state_code(pattern[taxon]))
      .collect_vec()
  }

  /// Per-state 0/1 profiles of one taxon across all patterns (ambiguity preserved),
  /// flattened to `n_patterns * n_states`
  pub fn pattern_profiles(&self, taxon: usize) -> Vec<f64> {
    let n_states = self.alphabet.n_states();
    let mut profiles = Vec::with_capacity(self.n_patterns() * n_states);
    for pattern in &self.patterns {
      profiles.extend(self.alphabet.profile(pattern[taxon]).iter().copied());
    }
    profiles
  }

  /// All `(pattern, state)` pairs where every taxon is compatible with `state` (equal to it,
  /// or carrying no information). These receive the invariant-site contribution at the root.
  pub fn constant_pattern_states(&self) -> Vec<(usize, usize)> {
    let n_states = self.alphabet.n_states();
    let unknown = self.alphabet.unknown_code();
    let mut constant = vec![];
    for (p, pattern) in self.patterns.iter().enumerate() {
      for s in 0..n_states {
        let compatible = pattern.iter().all(|&code| {
          let state = self.alphabet.state_code(code);
          state == s || state == unknown
        });
        if compatible {
          constant.push((p, s));
        }
      }
    }
    constant
  }

  /// Restrict the store to a contiguous pattern range. The slice carries no ascertainment
  /// state: corrections couple pattern slices and belong to the orchestrating layer.
  pub fn slice(&self, range: Range<usize>) -> Self {
    let patterns = self.patterns[range.clone()].to_vec();
    let weights = self.weights[range].to_vec();
    let site_count = weights.iter().sum();
    Self {
      alphabet: self.alphabet.clone(),
      taxa: self.taxa.clone(),
      excluded_mask: vec![false; patterns.len()],
      site_pattern_indices: vec![],
      ascertained: false,
      patterns,
      weights,
      site_count,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  fn nuc() -> Alphabet {
    Alphabet::nuc().unwrap()
  }

  fn store(records: &[(&str, &str)]) -> PatternStore {
    PatternStore::from_sequences(&nuc(), records, &PatternStoreParams::default()).unwrap()
  }

  #[test]
  fn weights_sum_to_site_count() {
    let store = store(&[("a", "ACGTACGA"), ("b", "ACGTACGC"), ("c", "ACGAACGA")]);
    assert_eq!(store.weights().iter().sum::<usize>(), 8);
    assert_eq!(store.site_count(), 8);
  }

  #[test]
  fn first_unique_column_becomes_pattern_zero() {
    let store = store(&[("a", "GATTA"), ("b", "GCTTA"), ("c", "GATTC")]);
    // Column 0 is (G, G, G); columns 2 and 3 collapse.
    assert_eq!(store.patterns[0], nuc().seq_codes("GGG").unwrap());
    assert_eq!(store.n_patterns(), 4);
    assert_eq!(store.site_pattern_indices(), &[0, 1, 2, 2, 3]);
    assert_eq!(store.weights(), &[1, 1, 2, 1]);
  }

  #[test]
  fn ambiguity_codes_are_distinct_patterns() {
    // R resolves to A/G but is not the same observation as A: columns must not collapse.
    let store = store(&[("a", "AR"), ("b", "AA")]);
    assert_eq!(store.n_patterns(), 2);
  }

  #[test]
  fn compress_rejects_mismatched_taxon_counts() {
    let columns = vec![vec![0, 1, 2], vec![0, 1]];
    assert!(compress(&columns).is_err());
  }

  #[test]
  fn rejects_mismatched_sequence_lengths() {
    let result = PatternStore::from_sequences(&nuc(), &[("a", "ACGT"), ("b", "ACG")], &PatternStoreParams::default());
    assert!(result.is_err());
  }

  #[test]
  fn rejects_duplicate_names() {
    let result = PatternStore::from_sequences(&nuc(), &[("a", "ACGT"), ("a", "ACGT")], &PatternStoreParams::default());
    assert!(result.is_err());
  }

  #[test]
  fn excluded_sites_are_dropped_before_compression() {
    let store = PatternStore::from_sequences(
      &nuc(),
      &[("a", "AAACGT"), ("b", "AAACGT")],
      &PatternStoreParams {
        exclude_sites: Some(0..3),
        ..PatternStoreParams::default()
      },
    )
    .unwrap();
    assert_eq!(store.site_count(), 3);
    assert_eq!(store.n_patterns(), 3);
  }

  #[test]
  fn ascertainment_prefix_carries_zero_weight() {
    let store = PatternStore::from_sequences(
      &nuc(),
      &[("a", "ACGTGT"), ("b", "ACGTGA")],
      &PatternStoreParams {
        ascertainment_exclude: Some(0..4),
        ..PatternStoreParams::default()
      },
    )
    .unwrap();
    assert!(store.is_ascertained());
    // Four excluded columns: (A,A), (C,C), (G,G), (T,T); two data columns.
    assert_eq!(store.n_patterns(), 6);
    assert_eq!(store.site_count(), 2);
    for p in 0..4 {
      assert!(store.is_excluded(p));
      assert_eq!(store.weight(p), 0);
    }
    for p in 4..6 {
      assert!(!store.is_excluded(p));
      assert_eq!(store.weight(p), 1);
    }
  }

  #[test]
  fn constant_patterns_respect_unknowns() {
    let store = store(&[("a", "ANC"), ("b", "ANA")]);
    // Column 0: constant at A. Column 1: all-unknown, compatible with every state.
    // Column 2: (C, A) is not constant.
    let constant = store.constant_pattern_states();
    assert_eq!(constant, vec![(0, 0), (1, 0), (1, 1), (1, 2), (1, 3)]);
  }

  #[rstest]
  #[case(0..2)]
  #[case(1..3)]
  fn slicing_preserves_patterns_and_weights(#[case] range: Range<usize>) {
    let full = store(&[("a", "ACCGA"), ("b", "ACCTA")]);
    let sliced = full.slice(range.clone());
    assert_eq!(sliced.n_patterns(), range.len());
    for (i, p) in range.enumerate() {
      assert_eq!(sliced.patterns[i], full.patterns[p]);
      assert_eq!(sliced.weight(i), full.weight(p));
    }
    assert!(!sliced.is_ascertained());
  }
}
