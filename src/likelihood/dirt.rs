/// Tiered invalidation flag of a tree node.
///
/// `Dirty` means node values (transition matrices, partials) must be recomputed; `Filthy`
/// additionally forces reconstruction of cached index structures (the pattern-id compression
/// table), because topology or state assignments below the node have changed. The two levels
/// must never be conflated: reusing a compression table across a `Filthy` change silently
/// corrupts likelihoods.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Dirt {
  #[default]
  Clean,
  Dirty,
  Filthy,
}

impl Dirt {
  /// The stronger of two flags
  #[inline]
  #[must_use]
  pub fn combine(self, other: Self) -> Self {
    self.max(other)
  }

  #[inline]
  pub fn is_clean(self) -> bool {
    self == Self::Clean
  }
}
