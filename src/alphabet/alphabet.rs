use crate::{make_error, make_report};
use eyre::Report;
use indexmap::{indexmap, IndexMap, IndexSet};
use itertools::Itertools;
use ndarray::Array1;

/// Discrete state code as consumed by the likelihood engine. Canonical states occupy
/// `0..n_states`; the value `n_states` itself is the reserved "unknown" sentinel.
pub type StateCode = usize;

#[derive(Clone, Debug)]
pub struct AlphabetConfig {
  pub canonical: Vec<char>,
  pub ambiguous: IndexMap<char, Vec<char>>,
  pub unknown: char,
  pub gap: char,
}

/// Character state space of an alignment: canonical states, ambiguity codes resolving to
/// subsets of canonical states, and unknown/gap characters which carry no information.
///
/// Every character is assigned a stable "full code" (its index of first definition), used
/// for pattern deduplication. Full codes project either onto engine state codes (ambiguity
/// collapses to the unknown sentinel) or onto 0/1 profile vectors (ambiguity preserved).
#[derive(Clone, Debug, PartialEq)]
pub struct Alphabet {
  canonical: IndexSet<char>,
  chars: IndexSet<char>,
  state_of: Vec<StateCode>,
  profiles: Vec<Array1<f64>>,
  unknown: char,
  gap: char,
}

impl Alphabet {
  /// Standard nucleotide alphabet with IUPAC ambiguity codes.
  pub fn nuc() -> Result<Self, Report> {
    Self::with_config(&AlphabetConfig {
      canonical: vec!['A', 'C', 'G', 'T'],
      ambiguous: indexmap! {
        'R' => vec!['A', 'G'],
        'Y' => vec!['C', 'T'],
        'S' => vec!['C', 'G'],
        'W' => vec!['A', 'T'],
        'K' => vec!['G', 'T'],
        'M' => vec!['A', 'C'],
        'D' => vec!['A', 'G', 'T'],
        'H' => vec!['A', 'C', 'T'],
        'B' => vec!['C', 'G', 'T'],
        'V' => vec!['A', 'C', 'G'],
      },
      unknown: 'N',
      gap: '-',
    })
  }

  /// Create a custom alphabet from a given config
  pub fn with_config(cfg: &AlphabetConfig) -> Result<Self, Report> {
    let AlphabetConfig {
      canonical,
      ambiguous,
      unknown,
      gap,
    } = cfg;

    if canonical.is_empty() {
      return make_error!("When creating alphabet: canonical character set should not be empty");
    }

    let canonical: IndexSet<char> = canonical.iter().copied().collect();
    if canonical.len() != cfg.canonical.len() {
      return make_error!(
        "When creating alphabet: canonical characters contain duplicates: {}",
        cfg.canonical.iter().join(", ")
      );
    }

    let n_states = canonical.len();

    let mut chars: IndexSet<char> = canonical.clone();
    let mut state_of: Vec<StateCode> = (0..n_states).collect();
    let mut profiles: Vec<Array1<f64>> = (0..n_states)
      .map(|i| {
        let mut profile = Array1::<f64>::zeros(n_states);
        profile[i] = 1.0;
        profile
      })
      .collect();

    for (c, resolutions) in ambiguous {
      if !chars.insert(*c) {
        return make_error!("When creating alphabet: ambiguity character '{c}' is already defined");
      }
      let mut profile = Array1::<f64>::zeros(n_states);
      for r in resolutions {
        match canonical.get_index_of(r) {
          Some(i) => profile[i] = 1.0,
          None => {
            return make_error!("When creating alphabet: ambiguity character '{c}' resolves to non-canonical '{r}'")
          }
        }
      }
      state_of.push(n_states);
      profiles.push(profile);
    }

    for c in [unknown, gap] {
      if !chars.insert(*c) {
        return make_error!("When creating alphabet: character '{c}' is already defined");
      }
      state_of.push(n_states);
      profiles.push(Array1::<f64>::ones(n_states));
    }

    Ok(Self {
      canonical,
      chars,
      state_of,
      profiles,
      unknown: *unknown,
      gap: *gap,
    })
  }

  /// Number of canonical states
  #[inline]
  pub fn n_states(&self) -> usize {
    self.canonical.len()
  }

  /// Total number of defined characters (canonical + ambiguous + unknown + gap)
  #[inline]
  pub fn n_chars(&self) -> usize {
    self.chars.len()
  }

  /// Reserved sentinel state code for characters carrying no information
  #[inline]
  pub fn unknown_code(&self) -> StateCode {
    self.canonical.len()
  }

  #[inline]
  pub const fn unknown(&self) -> char {
    self.unknown
  }

  #[inline]
  pub const fn gap(&self) -> char {
    self.gap
  }

  /// Full code of a character: its stable index among all defined characters
  pub fn full_code(&self, c: char) -> Result<usize, Report> {
    let c = c.to_ascii_uppercase();
    self
      .chars
      .get_index_of(&c)
      .ok_or_else(|| make_report!("Character '{c}' is not in the alphabet"))
  }

  /// Engine state code of a full code: canonical index, or the unknown sentinel for
  /// ambiguous, unknown and gap characters
  #[inline]
  pub fn state_code(&self, full_code: usize) -> StateCode {
    self.state_of[full_code]
  }

  /// 0/1 profile vector of a full code over canonical states
  #[inline]
  pub fn profile(&self, full_code: usize) -> &Array1<f64> {
    &self.profiles[full_code]
  }

  /// Character of a canonical state code; the unknown character for the sentinel
  pub fn char(&self, state: StateCode) -> char {
    match self.canonical.get_index(state) {
      Some(c) => *c,
      None => self.unknown,
    }
  }

  /// Full codes of an entire sequence
  pub fn seq_codes(&self, seq: &str) -> Result<Vec<usize>, Report> {
    seq.chars().map(|c| self.full_code(c)).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::array;
  use pretty_assertions::assert_eq;

  #[test]
  fn nuc_alphabet_maps_canonical_states() {
    let alphabet = Alphabet::nuc().unwrap();
    assert_eq!(alphabet.n_states(), 4);
    assert_eq!(alphabet.unknown_code(), 4);
    for (i, c) in ['A', 'C', 'G', 'T'].into_iter().enumerate() {
      let code = alphabet.full_code(c).unwrap();
      assert_eq!(alphabet.state_code(code), i);
      assert_eq!(alphabet.char(i), c);
    }
  }

  #[test]
  fn nuc_alphabet_collapses_ambiguity_to_unknown_state() {
    let alphabet = Alphabet::nuc().unwrap();
    for c in ['R', 'Y', 'N', '-'] {
      let code = alphabet.full_code(c).unwrap();
      assert_eq!(alphabet.state_code(code), alphabet.unknown_code());
    }
  }

  #[test]
  fn nuc_alphabet_preserves_ambiguity_in_profiles() {
    let alphabet = Alphabet::nuc().unwrap();
    let r = alphabet.full_code('R').unwrap();
    assert_eq!(alphabet.profile(r), &array![1.0, 0.0, 1.0, 0.0]);
    let n = alphabet.full_code('N').unwrap();
    assert_eq!(alphabet.profile(n), &array![1.0, 1.0, 1.0, 1.0]);
    let gap = alphabet.full_code('-').unwrap();
    assert_eq!(alphabet.profile(gap), &array![1.0, 1.0, 1.0, 1.0]);
  }

  #[test]
  fn nuc_alphabet_accepts_lowercase() {
    let alphabet = Alphabet::nuc().unwrap();
    assert_eq!(alphabet.full_code('a').unwrap(), alphabet.full_code('A').unwrap());
  }

  #[test]
  fn rejects_unexpected_characters() {
    let alphabet = Alphabet::nuc().unwrap();
    assert!(alphabet.full_code('?').is_err());
  }

  #[test]
  fn custom_two_state_alphabet() {
    let alphabet = Alphabet::with_config(&AlphabetConfig {
      canonical: vec!['0', '1'],
      ambiguous: indexmap! {},
      unknown: '?',
      gap: '-',
    })
    .unwrap();
    assert_eq!(alphabet.n_states(), 2);
    let q = alphabet.full_code('?').unwrap();
    assert_eq!(alphabet.state_code(q), 2);
  }

  #[test]
  fn rejects_duplicate_definitions() {
    let result = Alphabet::with_config(&AlphabetConfig {
      canonical: vec!['A', 'C'],
      ambiguous: indexmap! { 'A' => vec!['A', 'C'] },
      unknown: 'N',
      gap: '-',
    });
    assert!(result.is_err());
  }
}
