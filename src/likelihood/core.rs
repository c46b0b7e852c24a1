use crate::likelihood::pattern_cache::PatternIdCache;
use crate::{make_error, make_internal_report};
use eyre::Report;
use std::mem;

/// Constant applied to every freshly computed set of internal-node partials when scaling is
/// enabled. Compensated globally at output time, see [`LikelihoodCore::log_scaling_factor`].
pub const SCALE_FACTOR: f64 = 1.0e10;

/// Tip observations of one leaf: either one discrete state code per pattern (fast path,
/// ambiguity collapsed to the unknown sentinel), or an explicit per-state probability vector
/// per pattern (slow path, preserving ambiguity and uncertainty). Exactly one representation
/// is installed per leaf for the lifetime of the run.
enum LeafData {
  States(Vec<usize>),
  Partials(Vec<f64>),
}

enum ChildKind<'a> {
  States,
  Partials(&'a [f64]),
}

/// Buffers and kernels of the pruning recursion.
///
/// Owns, per node, double-buffered partials (`categories × patterns × states`, flat) and
/// double-buffered padded transition matrices (`categories × (states+1)²`), with per-node
/// 0/1 slot indices selecting the active half. MCMC store/restore swaps the small index
/// arrays; the large buffers themselves are allocated once and never copied or reallocated.
///
/// Internal-node partials are indexed by the compact ids of the node's [`PatternIdCache`]
/// rather than by pattern, so each distinct child-state combination is computed once.
pub struct LikelihoodCore {
  n_states: usize,
  padded: usize,
  matrix_len: usize,
  n_patterns: usize,
  n_categories: usize,
  n_leaves: usize,
  n_nodes: usize,

  leaves: Vec<Option<LeafData>>,
  partials: Vec<[Vec<f64>; 2]>,
  matrices: Vec<[Vec<f64>; 2]>,
  caches: Vec<[PatternIdCache; 2]>,
  identity_ids: Vec<usize>,

  current_partials: Vec<usize>,
  stored_partials: Vec<usize>,
  current_matrices: Vec<usize>,
  stored_matrices: Vec<usize>,
  current_ids: Vec<usize>,
  stored_ids: Vec<usize>,

  use_scaling: bool,
  scale_factor: f64,

  partials_computed: usize,
  caches_rebuilt: usize,
}

impl LikelihoodCore {
  pub fn new(n_states: usize, n_patterns: usize, n_categories: usize, n_leaves: usize) -> Result<Self, Report> {
    if n_states < 2 {
      return make_error!("When allocating likelihood core: at least 2 states are required, got {n_states}");
    }
    if n_patterns == 0 {
      return make_error!("When allocating likelihood core: at least one pattern is required");
    }
    if n_categories == 0 {
      return make_error!("When allocating likelihood core: at least one rate category is required");
    }
    if n_leaves < 2 {
      return make_error!("When allocating likelihood core: at least 2 leaves are required, got {n_leaves}");
    }

    let n_nodes = 2 * n_leaves - 1;
    let padded = n_states + 1;
    let matrix_len = padded * padded;
    let partials_len = n_categories * n_patterns * n_states;

    let partials = (0..n_nodes)
      .map(|node| {
        if node < n_leaves {
          [vec![], vec![]]
        } else {
          [vec![0.0; partials_len], vec![0.0; partials_len]]
        }
      })
      .collect();
    let matrices = (0..n_nodes)
      .map(|_| [vec![0.0; n_categories * matrix_len], vec![0.0; n_categories * matrix_len]])
      .collect();
    let caches = (0..n_nodes)
      .map(|_| [PatternIdCache::default(), PatternIdCache::default()])
      .collect();

    Ok(Self {
      n_states,
      padded,
      matrix_len,
      n_patterns,
      n_categories,
      n_leaves,
      n_nodes,
      leaves: (0..n_leaves).map(|_| None).collect(),
      partials,
      matrices,
      caches,
      identity_ids: (0..n_patterns).collect(),
      current_partials: vec![0; n_nodes],
      stored_partials: vec![0; n_nodes],
      current_matrices: vec![0; n_nodes],
      stored_matrices: vec![0; n_nodes],
      current_ids: vec![0; n_nodes],
      stored_ids: vec![0; n_nodes],
      use_scaling: false,
      scale_factor: SCALE_FACTOR,
      partials_computed: 0,
      caches_rebuilt: 0,
    })
  }

  #[inline]
  pub const fn n_patterns(&self) -> usize {
    self.n_patterns
  }

  #[inline]
  pub const fn n_nodes(&self) -> usize {
    self.n_nodes
  }

  /// Install discrete tip states for a leaf (one code per pattern; `n_states` means unknown)
  pub fn set_leaf_states(&mut self, node: usize, states: &[usize]) -> Result<(), Report> {
    self.check_leaf_unset(node)?;
    if states.len() != self.n_patterns {
      return make_error!(
        "When setting leaf states: expected {} states for node {node}, got {}",
        self.n_patterns,
        states.len()
      );
    }
    if let Some(bad) = states.iter().find(|&&s| s > self.n_states) {
      return make_error!("When setting leaf states: state code {bad} exceeds the unknown sentinel {}", self.n_states);
    }
    self.leaves[node] = Some(LeafData::States(states.to_vec()));
    Ok(())
  }

  /// Install explicit tip partials for a leaf (`patterns × states`, replicated across
  /// rate categories)
  pub fn set_leaf_partials(&mut self, node: usize, partials: &[f64]) -> Result<(), Report> {
    self.check_leaf_unset(node)?;
    if partials.len() != self.n_patterns * self.n_states {
      return make_error!(
        "When setting leaf partials: expected {} values for node {node}, got {}",
        self.n_patterns * self.n_states,
        partials.len()
      );
    }
    if partials.iter().any(|p| !p.is_finite() || *p < 0.0) {
      return make_error!("When setting leaf partials: values must be finite and non-negative");
    }
    let mut replicated = Vec::with_capacity(self.n_categories * partials.len());
    for _ in 0..self.n_categories {
      replicated.extend_from_slice(partials);
    }
    self.leaves[node] = Some(LeafData::Partials(replicated));
    Ok(())
  }

  fn check_leaf_unset(&self, node: usize) -> Result<(), Report> {
    if node >= self.n_leaves {
      return Err(make_internal_report!(
        "When setting leaf data: node {node} is not a leaf (leaf ids end at {})",
        self.n_leaves
      ));
    }
    if self.leaves[node].is_some() {
      return Err(make_internal_report!(
        "When setting leaf data: node {node} already carries tip data; exactly one representation is allowed per run"
      ));
    }
    Ok(())
  }

  /// True once every leaf carries tip data
  pub fn all_leaves_set(&self) -> bool {
    self.leaves.iter().all(Option::is_some)
  }

  /// Flip the active matrix buffer half of a node, preserving the other half for restore
  pub fn set_node_matrix_for_update(&mut self, node: usize) {
    self.current_matrices[node] ^= 1;
  }

  /// Write the padded transition matrix of one rate category into the active buffer half
  pub fn set_node_matrix(&mut self, node: usize, category: usize, matrix: &[f64]) {
    debug_assert_eq!(matrix.len(), self.matrix_len);
    let slot = self.current_matrices[node];
    self.matrices[node][slot][category * self.matrix_len..(category + 1) * self.matrix_len].copy_from_slice(matrix);
  }

  /// Flip the active partials buffer half of a node
  pub fn set_node_partials_for_update(&mut self, node: usize) {
    self.current_partials[node] ^= 1;
  }

  /// Flip the active pattern-id table of a node and mark it stale, forcing reconstruction on
  /// the next `compute_partials`. Only `Filthy` changes may call this.
  pub fn set_node_ids_for_update(&mut self, node: usize) {
    self.current_ids[node] ^= 1;
    let slot = self.current_ids[node];
    self.caches[node][slot].invalidate();
  }

  fn is_partials_backed(&self, node: usize) -> bool {
    if node < self.n_leaves {
      matches!(self.leaves[node], Some(LeafData::Partials(_)))
    } else {
      true
    }
  }

  /// Children are ordered so that a states-backed child never follows a partials-backed one;
  /// the ordering is a pure function of the leaf representations, hence stable across calls.
  fn normalize_children(&self, child1: usize, child2: usize) -> (usize, usize) {
    if self.is_partials_backed(child1) && !self.is_partials_backed(child2) {
      (child2, child1)
    } else {
      (child1, child2)
    }
  }

  /// Per-pattern ids of a node as seen by its parent's compression table: tip state codes
  /// for states-backed leaves, pattern indices for partials-backed leaves, compact ids for
  /// internal nodes.
  fn node_ids(&self, node: usize) -> &[usize] {
    if node < self.n_leaves {
      match &self.leaves[node] {
        Some(LeafData::States(states)) => states,
        _ => &self.identity_ids,
      }
    } else {
      self.caches[node][self.current_ids[node]].map()
    }
  }

  fn child_kind(&self, node: usize) -> ChildKind {
    if node < self.n_leaves {
      match &self.leaves[node] {
        Some(LeafData::States(_)) => ChildKind::States,
        Some(LeafData::Partials(partials)) => ChildKind::Partials(partials),
        None => unreachable!("leaf {node} has no tip data; callers must install tip data before computing"),
      }
    } else {
      ChildKind::Partials(&self.partials[node][self.current_partials[node]])
    }
  }

  fn active_cache(&self, node: usize) -> &PatternIdCache {
    &self.caches[node][self.current_ids[node]]
  }

  /// Rebuild the pattern-id table of `parent` from its children's current ids. In parallel
  /// mode this runs in the sequential pre-pass only; the table is shared bookkeeping that
  /// workers must never reconstruct concurrently.
  pub fn rebuild_pattern_ids(&mut self, child1: usize, child2: usize, parent: usize) {
    let (c1, c2) = self.normalize_children(child1, child2);
    let slot = self.current_ids[parent];
    let mut cache = mem::take(&mut self.caches[parent][slot]);
    cache.rebuild(self.node_ids(c1), self.node_ids(c2));
    self.caches[parent][slot] = cache;
    self.caches_rebuilt += 1;
  }

  /// The central pruning step: combine the two children's partials (or tip states) through
  /// the transition matrices on the branches above them, writing `parent`'s partials into
  /// its active buffer half.
  ///
  /// A stale pattern-id table is rebuilt first by one scan over the pattern axis; otherwise
  /// the table is reused verbatim and the numeric work is proportional to the number of
  /// distinct child-state combinations, not the number of patterns.
  pub fn compute_partials(&mut self, child1: usize, child2: usize, parent: usize) {
    let (c1, c2) = self.normalize_children(child1, child2);
    if self.active_cache(parent).is_stale() {
      self.rebuild_pattern_ids(c1, c2, parent);
    }
    self.partials_computed += 1;

    let slot = self.current_partials[parent];
    let mut out = mem::take(&mut self.partials[parent][slot]);
    let distinct = {
      let m1 = &self.matrices[c1][self.current_matrices[c1]];
      let m2 = &self.matrices[c2][self.current_matrices[c2]];
      let pairs = self.active_cache(parent).pairs();
      let dims = KernelDims {
        n_states: self.n_states,
        padded: self.padded,
        matrix_len: self.matrix_len,
        n_patterns: self.n_patterns,
        n_categories: self.n_categories,
      };
      match (self.child_kind(c1), self.child_kind(c2)) {
        (ChildKind::States, ChildKind::States) => states_states_kernel(&dims, pairs, m1, m2, &mut out),
        (ChildKind::States, ChildKind::Partials(p2)) => states_partials_kernel(&dims, pairs, m1, m2, p2, &mut out),
        (ChildKind::Partials(p1), ChildKind::Partials(p2)) => {
          partials_partials_kernel(&dims, pairs, m1, m2, p1, p2, &mut out);
        }
        (ChildKind::Partials(_), ChildKind::States) => {
          unreachable!("children are normalized so a states-backed child never follows a partials-backed one")
        }
      }
      pairs.len()
    };

    if self.use_scaling {
      self.scale_partials(&mut out, distinct);
    }
    self.partials[parent][slot] = out;
  }

  /// Like [`Self::compute_partials`], but refuses to rebuild a stale pattern-id table.
  /// Pattern-range workers call this during parallel replay: tables index the full pattern
  /// range and may only be reconstructed by the sequential pre-pass, so a stale table here
  /// is a broken invariant, not a recoverable condition.
  pub fn compute_partials_prepared(&mut self, child1: usize, child2: usize, parent: usize) -> Result<(), Report> {
    if self.active_cache(parent).is_stale() {
      return Err(make_internal_report!(
        "Pattern-id table of node {parent} is stale during parallel replay; tables must be rebuilt in the sequential pre-pass"
      ));
    }
    self.compute_partials(child1, child2, parent);
    Ok(())
  }

  /// Constant-factor rescale of the freshly computed blocks, counteracting underflow in
  /// deep trees
  fn scale_partials(&self, out: &mut [f64], distinct: usize) {
    for c in 0..self.n_categories {
      let start = c * self.n_patterns * self.n_states;
      for x in &mut out[start..start + distinct * self.n_states] {
        *x *= self.scale_factor;
      }
    }
  }

  /// Weighted sum of the root's partials over rate categories, expanded back to the pattern
  /// axis: `out[p, s] = Σ_c proportions[c] · partials[c, id(p), s]`
  pub fn integrate_partials(&self, root: usize, proportions: &[f64], out: &mut [f64]) {
    debug_assert!(root >= self.n_leaves);
    debug_assert_eq!(proportions.len(), self.n_categories);
    debug_assert_eq!(out.len(), self.n_patterns * self.n_states);

    let partials = &self.partials[root][self.current_partials[root]];
    let map = self.active_cache(root).map();

    out.fill(0.0);
    for (c, &proportion) in proportions.iter().enumerate() {
      for (p, &id) in map.iter().enumerate() {
        let src = (c * self.n_patterns + id) * self.n_states;
        let dst = p * self.n_states;
        for s in 0..self.n_states {
          out[dst + s] += proportion * partials[src + s];
        }
      }
    }
  }

  /// Per-pattern log-likelihoods: log of the dot product of root partials with equilibrium
  /// frequencies, plus the global scaling correction
  pub fn log_likelihoods(&self, root_partials: &[f64], frequencies: &[f64], out: &mut [f64]) {
    debug_assert_eq!(root_partials.len(), self.n_patterns * self.n_states);
    debug_assert_eq!(frequencies.len(), self.n_states);
    debug_assert_eq!(out.len(), self.n_patterns);

    let correction = self.log_scaling_factor();
    for (p, out) in out.iter_mut().enumerate() {
      let mut sum = 0.0;
      for (s, &freq) in frequencies.iter().enumerate() {
        sum += root_partials[p * self.n_states + s] * freq;
      }
      *out = sum.ln() + correction;
    }
  }

  /// Global compensation for the constant-factor scaling: every internal node (there are
  /// `node_count / 2` of them) inflates the root likelihood by one factor of the scale
  /// constant. This is a documented approximation, deliberately coarser than per-node
  /// per-pattern bookkeeping.
  pub fn log_scaling_factor(&self) -> f64 {
    if self.use_scaling {
      -((self.n_nodes / 2) as f64) * self.scale_factor.ln()
    } else {
      0.0
    }
  }

  /// Enable or disable constant-factor scaling. The owner is responsible for forcing a full
  /// recomputation afterwards; stale unscaled partials must not be mixed with scaled ones.
  pub fn set_use_scaling(&mut self, on: bool) {
    self.use_scaling = on;
  }

  #[inline]
  pub const fn scaling_enabled(&self) -> bool {
    self.use_scaling
  }

  /// Snapshot the per-node buffer-slot indices. Only the small index arrays are copied; the
  /// buffer halves they point at become the protected state. The MCMC contract allows at
  /// most one evaluation between `store` and a matching `restore`, so a protected half is
  /// never overwritten before it can be restored.
  pub fn store(&mut self) {
    self.stored_partials.copy_from_slice(&self.current_partials);
    self.stored_matrices.copy_from_slice(&self.current_matrices);
    self.stored_ids.copy_from_slice(&self.current_ids);
  }

  /// Swap back to the stored buffer halves, bit-identically and without recomputation
  pub fn restore(&mut self) {
    mem::swap(&mut self.current_partials, &mut self.stored_partials);
    mem::swap(&mut self.current_matrices, &mut self.stored_matrices);
    mem::swap(&mut self.current_ids, &mut self.stored_ids);
  }

  /// Overwrite the active indices with the stored snapshot without swapping, discarding the
  /// in-flight halves
  pub fn unstore(&mut self) {
    self.current_partials.copy_from_slice(&self.stored_partials);
    self.current_matrices.copy_from_slice(&self.stored_matrices);
    self.current_ids.copy_from_slice(&self.stored_ids);
  }

  /// Active partials buffer of an internal node (compact-id indexed)
  pub fn active_partials(&self, node: usize) -> &[f64] {
    &self.partials[node][self.current_partials[node]]
  }

  /// Distinct child-id combination count of a node's active pattern-id table
  pub fn pattern_id_count(&self, node: usize) -> usize {
    self.active_cache(node).distinct_count()
  }

  /// Pattern-to-compact-id map of a node's active pattern-id table
  pub fn pattern_id_map(&self, node: usize) -> &[usize] {
    self.active_cache(node).map()
  }

  /// Number of `compute_partials` invocations since construction
  #[inline]
  pub const fn partials_computed(&self) -> usize {
    self.partials_computed
  }

  /// Number of pattern-id table reconstructions since construction
  #[inline]
  pub const fn caches_rebuilt(&self) -> usize {
    self.caches_rebuilt
  }
}

struct KernelDims {
  n_states: usize,
  padded: usize,
  matrix_len: usize,
  n_patterns: usize,
  n_categories: usize,
}

fn states_states_kernel(dims: &KernelDims, pairs: &[(usize, usize)], m1: &[f64], m2: &[f64], out: &mut [f64]) {
  for c in 0..dims.n_categories {
    let m1 = &m1[c * dims.matrix_len..(c + 1) * dims.matrix_len];
    let m2 = &m2[c * dims.matrix_len..(c + 1) * dims.matrix_len];
    for (k, &(u, v)) in pairs.iter().enumerate() {
      let dst = (c * dims.n_patterns + k) * dims.n_states;
      for s in 0..dims.n_states {
        out[dst + s] = m1[s * dims.padded + u] * m2[s * dims.padded + v];
      }
    }
  }
}

fn states_partials_kernel(
  dims: &KernelDims,
  pairs: &[(usize, usize)],
  m1: &[f64],
  m2: &[f64],
  p2: &[f64],
  out: &mut [f64],
) {
  for c in 0..dims.n_categories {
    let m1 = &m1[c * dims.matrix_len..(c + 1) * dims.matrix_len];
    let m2 = &m2[c * dims.matrix_len..(c + 1) * dims.matrix_len];
    for (k, &(u, v)) in pairs.iter().enumerate() {
      let child2 = &p2[(c * dims.n_patterns + v) * dims.n_states..][..dims.n_states];
      let dst = (c * dims.n_patterns + k) * dims.n_states;
      for s in 0..dims.n_states {
        let mut sum2 = 0.0;
        for (j, &p) in child2.iter().enumerate() {
          sum2 += m2[s * dims.padded + j] * p;
        }
        out[dst + s] = m1[s * dims.padded + u] * sum2;
      }
    }
  }
}

fn partials_partials_kernel(
  dims: &KernelDims,
  pairs: &[(usize, usize)],
  m1: &[f64],
  m2: &[f64],
  p1: &[f64],
  p2: &[f64],
  out: &mut [f64],
) {
  for c in 0..dims.n_categories {
    let m1 = &m1[c * dims.matrix_len..(c + 1) * dims.matrix_len];
    let m2 = &m2[c * dims.matrix_len..(c + 1) * dims.matrix_len];
    for (k, &(u, v)) in pairs.iter().enumerate() {
      let child1 = &p1[(c * dims.n_patterns + u) * dims.n_states..][..dims.n_states];
      let child2 = &p2[(c * dims.n_patterns + v) * dims.n_states..][..dims.n_states];
      let dst = (c * dims.n_patterns + k) * dims.n_states;
      for s in 0..dims.n_states {
        let mut sum1 = 0.0;
        let mut sum2 = 0.0;
        for j in 0..dims.n_states {
          sum1 += m1[s * dims.padded + j] * child1[j];
          sum2 += m2[s * dims.padded + j] * child2[j];
        }
        out[dst + s] = sum1 * sum2;
      }
    }
  }
}
