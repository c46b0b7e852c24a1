use crate::likelihood::core::LikelihoodCore;
use crate::likelihood::dirt::Dirt;
use crate::{make_error, make_report};
use crate::model::site::{SiteModel, StrictClock};
use crate::model::substitution::SubstitutionModel;
use crate::pattern::pattern::PatternStore;
use crate::tree::tree::Tree;
use eyre::Report;
use log::{debug, trace};
use smart_default::SmartDefault;
use std::mem;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, SmartDefault)]
pub struct TreeLikelihoodParams {
  /// Install explicit per-state tip partials for every leaf, preserving ambiguity codes.
  /// Off by default: tips are discrete states with ambiguity collapsed to unknown.
  pub use_ambiguities: bool,
}

/// One tree-likelihood evaluation unit: drives the bottom-up traversal over a tree,
/// refreshing transition matrices and partials only where dirt or branch-length changes
/// demand it, then folds the root partials into a scalar log-likelihood.
///
/// The tree is context-passed into every evaluation and never mutated here; collaborator
/// parameter changes are announced through the explicit `set_*` mutators, which feed
/// `requires_recalculation`.
pub struct TreeLikelihood {
  core: LikelihoodCore,
  patterns: PatternStore,
  substitution: Arc<dyn SubstitutionModel>,
  site_model: SiteModel,
  clock: StrictClock,
  frequencies: Vec<f64>,
  constant_pattern_states: Vec<(usize, usize)>,

  branch_lengths: Vec<f64>,
  stored_branch_lengths: Vec<f64>,

  probs: Vec<f64>,
  root_partials: Vec<f64>,
  pattern_log_likelihoods: Vec<f64>,

  has_dirt: Dirt,
  log_p: f64,
  stored_log_p: f64,
}

impl TreeLikelihood {
  pub fn new(
    tree: &Tree,
    patterns: PatternStore,
    substitution: Arc<dyn SubstitutionModel>,
    site_model: SiteModel,
    clock: StrictClock,
    params: &TreeLikelihoodParams,
  ) -> Result<Self, Report> {
    let n_states = substitution.n_states();
    if n_states != patterns.alphabet().n_states() {
      return make_error!(
        "When initializing tree likelihood: substitution model has {n_states} states, but the alignment alphabet has {}",
        patterns.alphabet().n_states()
      );
    }
    if tree.n_leaves() != patterns.n_taxa() {
      return make_error!(
        "When initializing tree likelihood: tree has {} leaves, but the alignment has {} taxa",
        tree.n_leaves(),
        patterns.n_taxa()
      );
    }

    let mut core = LikelihoodCore::new(
      n_states,
      patterns.n_patterns(),
      site_model.category_count(),
      tree.n_leaves(),
    )?;

    for leaf in 0..tree.n_leaves() {
      let name = tree.taxon_name(leaf);
      let taxon = patterns.taxon_index(name).ok_or_else(|| {
        make_report!("When initializing tree likelihood: taxon '{name}' of the tree is missing from the alignment")
      })?;
      if params.use_ambiguities {
        core.set_leaf_partials(leaf, &patterns.pattern_profiles(taxon))?;
      } else {
        core.set_leaf_states(leaf, &patterns.pattern_states(taxon))?;
      }
    }
    debug_assert!(core.all_leaves_set());

    debug!(
      "Tree likelihood initialized: {} patterns, {n_states} states, {} categories, {} leaves",
      patterns.n_patterns(),
      site_model.category_count(),
      tree.n_leaves()
    );

    let n_nodes = tree.n_nodes();
    let frequencies = substitution.frequencies().to_vec();
    let constant_pattern_states = patterns.constant_pattern_states();
    let probs = vec![0.0; substitution.padded_matrix_len()];
    let root_partials = vec![0.0; patterns.n_patterns() * n_states];
    let pattern_log_likelihoods = vec![0.0; patterns.n_patterns()];

    Ok(Self {
      core,
      patterns,
      substitution,
      site_model,
      clock,
      frequencies,
      constant_pattern_states,
      branch_lengths: vec![f64::NAN; n_nodes],
      stored_branch_lengths: vec![f64::NAN; n_nodes],
      probs,
      root_partials,
      pattern_log_likelihoods,
      has_dirt: Dirt::Filthy,
      log_p: f64::NAN,
      stored_log_p: f64::NAN,
    })
  }

  /// Evaluate the log-likelihood of the data on the given tree, recomputing only what the
  /// accumulated dirt demands. `NaN` and `+inf` results are hard errors for the current
  /// step; `-inf` is returned as a value (the caller's cue to enable scaling).
  pub fn calculate_log_likelihood(&mut self, tree: &Tree) -> Result<f64, Report> {
    self.check_tree(tree)?;
    let update = self.traverse(tree, tree.root())?;
    if !update.is_clean() {
      self.finish_pattern_log_likelihoods(tree.root());
      self.log_p = sum_log_likelihoods(&self.patterns, &self.pattern_log_likelihoods);
      trace!("Evaluated log-likelihood {} (dirt: {update:?})", self.log_p);
    }
    self.has_dirt = Dirt::Clean;
    ensure_valid(self.log_p)
  }

  /// Post-order walk deciding, per node, whether transition matrices and partials need
  /// recomputation. Children are fully resolved before their parent; the returned flag is
  /// the strongest dirt seen in the subtree and propagates upward so clean subtrees are
  /// never touched.
  fn traverse(&mut self, tree: &Tree, node: usize) -> Result<Dirt, Report> {
    let mut update = tree.node_dirt(node).combine(self.has_dirt);

    if let Some(parent) = tree.parent(node) {
      let branch_rate = self.clock.rate_for_branch(node);
      let branch_time = tree.branch_length(node) * branch_rate;
      if !update.is_clean() || branch_time != self.branch_lengths[node] {
        self.branch_lengths[node] = branch_time;
        self.core.set_node_matrix_for_update(node);
        for category in 0..self.site_model.category_count() {
          let rate = self.site_model.category_rates()[category] * branch_rate;
          self
            .substitution
            .transition_probabilities(tree.height(parent), tree.height(node), rate, &mut self.probs)?;
          self.core.set_node_matrix(node, category, &self.probs);
        }
        update = update.combine(Dirt::Dirty);
      }
    }

    if let Some((child1, child2)) = tree.children_of(node) {
      let update1 = self.traverse(tree, child1)?;
      let update2 = self.traverse(tree, child2)?;
      let child_update = update1.combine(update2);
      if !child_update.is_clean() {
        update = update.combine(child_update);
        self.core.set_node_partials_for_update(node);
        if update == Dirt::Filthy {
          self.core.set_node_ids_for_update(node);
        }
        self.core.compute_partials(child1, child2, node);
      }
    }

    Ok(update)
  }

  /// Root integration: category-weighted root partials, the invariant-site contribution on
  /// constant patterns, then per-pattern log-likelihoods.
  pub(crate) fn finish_pattern_log_likelihoods(&mut self, root: usize) {
    self
      .core
      .integrate_partials(root, self.site_model.category_proportions(), &mut self.root_partials);

    let p_inv = self.site_model.proportion_invariant();
    if p_inv > 0.0 {
      let n_states = self.frequencies.len();
      for &(pattern, state) in &self.constant_pattern_states {
        self.root_partials[pattern * n_states + state] += p_inv;
      }
    }

    self
      .core
      .log_likelihoods(&self.root_partials, &self.frequencies, &mut self.pattern_log_likelihoods);
  }

  /// Replay a fixed work list of `(child1, child2, parent)` recomputation triples, in order.
  /// Used by the pattern-parallel layer after its sequential pre-pass; all pattern-id tables
  /// must be fresh by then.
  pub(crate) fn replay_partials(&mut self, ops: &[(usize, usize, usize)]) -> Result<(), Report> {
    for &(child1, child2, parent) in ops {
      self.core.compute_partials_prepared(child1, child2, parent)?;
    }
    Ok(())
  }

  fn check_tree(&self, tree: &Tree) -> Result<(), Report> {
    if tree.n_nodes() != self.core.n_nodes() {
      return make_error!(
        "When evaluating tree likelihood: tree has {} nodes, but the engine was sized for {}",
        tree.n_nodes(),
        self.core.n_nodes()
      );
    }
    Ok(())
  }

  /// True if any upstream dependency (data, tree, site model, clock) has reported dirt
  /// since the last evaluation
  pub fn requires_recalculation(&self, tree: &Tree) -> bool {
    !self.has_dirt.is_clean() || tree.something_is_dirty()
  }

  /// Snapshot engine state, symmetric with the MCMC state store. At most one evaluation may
  /// happen between `store` and a matching `restore`/`accept`.
  pub fn store(&mut self) {
    self.core.store();
    self.stored_branch_lengths.copy_from_slice(&self.branch_lengths);
    self.stored_log_p = self.log_p;
  }

  /// Revert to the snapshot bit-identically, without any recomputation
  pub fn restore(&mut self) {
    self.core.restore();
    mem::swap(&mut self.branch_lengths, &mut self.stored_branch_lengths);
    self.log_p = self.stored_log_p;
    self.has_dirt = Dirt::Clean;
  }

  /// Replace the site model (category structure must be unchanged; buffers are sized once)
  pub fn set_site_model(&mut self, site_model: SiteModel) -> Result<(), Report> {
    if site_model.category_count() != self.site_model.category_count() {
      return make_error!(
        "When updating site model: category count changed from {} to {}; buffers are allocated once per run",
        self.site_model.category_count(),
        site_model.category_count()
      );
    }
    self.site_model = site_model;
    self.has_dirt = self.has_dirt.combine(Dirt::Dirty);
    Ok(())
  }

  /// Replace the substitution model (state count must be unchanged)
  pub fn set_substitution_model(&mut self, substitution: Arc<dyn SubstitutionModel>) -> Result<(), Report> {
    if substitution.n_states() != self.frequencies.len() {
      return make_error!(
        "When updating substitution model: state count changed from {} to {}",
        self.frequencies.len(),
        substitution.n_states()
      );
    }
    self.frequencies = substitution.frequencies().to_vec();
    self.substitution = substitution;
    self.has_dirt = self.has_dirt.combine(Dirt::Dirty);
    Ok(())
  }

  pub fn set_clock(&mut self, clock: StrictClock) {
    self.clock = clock;
    self.has_dirt = self.has_dirt.combine(Dirt::Dirty);
  }

  /// Announce that the underlying data changed identity; forces full reconstruction
  /// including all pattern-id tables
  pub fn notify_data_changed(&mut self) {
    self.has_dirt = Dirt::Filthy;
  }

  /// Toggle constant-factor scaling. Forces a full value recomputation on the next
  /// evaluation so scaled and unscaled partials are never mixed.
  pub fn set_use_scaling(&mut self, on: bool) {
    if on != self.core.scaling_enabled() {
      debug!("Constant-factor scaling turned {}", if on { "on" } else { "off" });
      self.core.set_use_scaling(on);
      self.has_dirt = self.has_dirt.combine(Dirt::Dirty);
    }
  }

  /// The most recently evaluated log-likelihood
  #[inline]
  pub const fn log_likelihood(&self) -> f64 {
    self.log_p
  }

  /// Per-pattern log-likelihoods of the most recent evaluation
  #[inline]
  pub fn pattern_log_likelihoods(&self) -> &[f64] {
    &self.pattern_log_likelihoods
  }

  #[inline]
  pub const fn core(&self) -> &LikelihoodCore {
    &self.core
  }

  #[inline]
  pub(crate) fn core_mut(&mut self) -> &mut LikelihoodCore {
    &mut self.core
  }
}

/// Weighted aggregation of per-pattern log-likelihoods, with the ascertainment correction
/// subtracted from every included pattern. Runs in pattern order so parallel and sequential
/// evaluations aggregate bit-identically.
pub(crate) fn sum_log_likelihoods(patterns: &PatternStore, pattern_log_likelihoods: &[f64]) -> f64 {
  let correction = if patterns.is_ascertained() {
    patterns.ascertainment_correction(pattern_log_likelihoods)
  } else {
    0.0
  };

  let mut log_p = 0.0;
  for (p, &log_likelihood) in pattern_log_likelihoods.iter().enumerate() {
    if patterns.is_excluded(p) {
      continue;
    }
    log_p += (log_likelihood - correction) * patterns.weight(p) as f64;
  }
  log_p
}

/// `NaN` and `+inf` aggregates are unrecoverable for the current step and are surfaced as
/// errors; `-inf` passes through as a value.
pub(crate) fn ensure_valid(log_p: f64) -> Result<f64, Report> {
  if log_p.is_nan() || log_p == f64::INFINITY {
    return make_error!(
      "Log-likelihood evaluated to {log_p}: numeric failure in the current step; the proposal must be rejected"
    );
  }
  Ok(log_p)
}
