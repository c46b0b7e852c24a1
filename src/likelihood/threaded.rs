use crate::likelihood::dirt::Dirt;
use crate::likelihood::tree_likelihood::{ensure_valid, sum_log_likelihoods, TreeLikelihood, TreeLikelihoodParams};
use crate::make_error;
use crate::model::site::{SiteModel, StrictClock};
use crate::model::substitution::SubstitutionModel;
use crate::pattern::pattern::PatternStore;
use crate::tree::tree::Tree;
use eyre::Report;
use itertools::Itertools;
use log::{debug, trace};
use rayon::prelude::*;
use rayon::ThreadPool;
use std::mem;
use std::ops::Range;
use std::sync::Arc;

/// Pattern-parallel tree likelihood: the pattern axis is split into contiguous chunks, one
/// independent worker engine per chunk, each owning replica buffers restricted to its slice.
///
/// One evaluation runs in two phases. A sequential pre-pass walks the tree exactly like the
/// single-threaded traversal but only collects the ordered work list of recomputation
/// triples, refreshes transition matrices (shared read-only inputs, installed into every
/// replica by this single thread) and rebuilds every stale pattern-id table — tables index
/// the full pattern range of their replica and must never be reconstructed concurrently.
/// Workers then replay the fixed work list over their own slices on the caller-supplied
/// thread pool; the orchestrator joins, concatenates per-pattern log-likelihoods and sums
/// them sequentially in pattern order, which makes the total bit-for-bit identical to the
/// sequential engine. Any worker failure aborts the whole evaluation with a single error.
pub struct ThreadedTreeLikelihood {
  pool: Arc<ThreadPool>,
  workers: Vec<TreeLikelihood>,
  slices: Vec<Range<usize>>,
  patterns: PatternStore,
  substitution: Arc<dyn SubstitutionModel>,
  site_model: SiteModel,
  clock: StrictClock,

  branch_lengths: Vec<f64>,
  stored_branch_lengths: Vec<f64>,
  probs: Vec<f64>,
  pattern_log_likelihoods: Vec<f64>,

  has_dirt: Dirt,
  log_p: f64,
  stored_log_p: f64,
}

impl ThreadedTreeLikelihood {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    tree: &Tree,
    patterns: PatternStore,
    substitution: Arc<dyn SubstitutionModel>,
    site_model: SiteModel,
    clock: StrictClock,
    params: &TreeLikelihoodParams,
    pool: Arc<ThreadPool>,
    thread_count: usize,
  ) -> Result<Self, Report> {
    if thread_count == 0 {
      return make_error!("When initializing threaded tree likelihood: at least one worker is required");
    }

    let n_patterns = patterns.n_patterns();
    let workers_wanted = thread_count.min(n_patterns);
    let chunk = (n_patterns + workers_wanted - 1) / workers_wanted;
    let slices = (0..workers_wanted)
      .map(|i| i * chunk..((i + 1) * chunk).min(n_patterns))
      .filter(|range| !range.is_empty())
      .collect_vec();

    let workers = slices
      .iter()
      .map(|range| {
        TreeLikelihood::new(
          tree,
          patterns.slice(range.clone()),
          Arc::clone(&substitution),
          site_model.clone(),
          clock,
          params,
        )
      })
      .collect::<Result<Vec<_>, Report>>()?;

    debug!(
      "Threaded tree likelihood initialized: {} workers over {n_patterns} patterns",
      workers.len()
    );

    let probs = vec![0.0; substitution.padded_matrix_len()];
    Ok(Self {
      pool,
      workers,
      slices,
      patterns,
      substitution,
      site_model,
      clock,
      branch_lengths: vec![f64::NAN; tree.n_nodes()],
      stored_branch_lengths: vec![f64::NAN; tree.n_nodes()],
      probs,
      pattern_log_likelihoods: vec![0.0; n_patterns],
      has_dirt: Dirt::Filthy,
      log_p: f64::NAN,
      stored_log_p: f64::NAN,
    })
  }

  pub fn calculate_log_likelihood(&mut self, tree: &Tree) -> Result<f64, Report> {
    if tree.n_nodes() != self.branch_lengths.len() {
      return make_error!(
        "When evaluating threaded tree likelihood: tree has {} nodes, but the engine was sized for {}",
        tree.n_nodes(),
        self.branch_lengths.len()
      );
    }

    let mut ops = vec![];
    let update = self.plan(tree, tree.root(), &mut ops)?;

    if !update.is_clean() {
      let root = tree.root();
      let ops = &ops;
      let workers = &mut self.workers;
      self.pool.install(|| {
        workers.par_iter_mut().try_for_each(|worker| -> Result<(), Report> {
          worker.replay_partials(ops)?;
          worker.finish_pattern_log_likelihoods(root);
          Ok(())
        })
      })?;

      for (worker, range) in self.workers.iter().zip(&self.slices) {
        self.pattern_log_likelihoods[range.clone()].copy_from_slice(worker.pattern_log_likelihoods());
      }
      self.log_p = sum_log_likelihoods(&self.patterns, &self.pattern_log_likelihoods);
      trace!(
        "Evaluated log-likelihood {} across {} workers ({} recomputation triples)",
        self.log_p,
        self.workers.len(),
        ops.len()
      );
    }

    self.has_dirt = Dirt::Clean;
    ensure_valid(self.log_p)
  }

  /// Sequential pre-pass: the single-threaded traversal decision logic, collecting the
  /// post-ordered work list instead of executing it. Matrix refreshes and pattern-id table
  /// rebuilds happen here, on this thread, before any worker runs.
  fn plan(&mut self, tree: &Tree, node: usize, ops: &mut Vec<(usize, usize, usize)>) -> Result<Dirt, Report> {
    let mut update = tree.node_dirt(node).combine(self.has_dirt);

    if let Some(parent) = tree.parent(node) {
      let branch_rate = self.clock.rate_for_branch(node);
      let branch_time = tree.branch_length(node) * branch_rate;
      if !update.is_clean() || branch_time != self.branch_lengths[node] {
        self.branch_lengths[node] = branch_time;
        for worker in &mut self.workers {
          worker.core_mut().set_node_matrix_for_update(node);
        }
        for category in 0..self.site_model.category_count() {
          let rate = self.site_model.category_rates()[category] * branch_rate;
          self
            .substitution
            .transition_probabilities(tree.height(parent), tree.height(node), rate, &mut self.probs)?;
          for worker in &mut self.workers {
            worker.core_mut().set_node_matrix(node, category, &self.probs);
          }
        }
        update = update.combine(Dirt::Dirty);
      }
    }

    if let Some((child1, child2)) = tree.children_of(node) {
      let update1 = self.plan(tree, child1, ops)?;
      let update2 = self.plan(tree, child2, ops)?;
      let child_update = update1.combine(update2);
      if !child_update.is_clean() {
        update = update.combine(child_update);
        let filthy = update == Dirt::Filthy;
        for worker in &mut self.workers {
          let core = worker.core_mut();
          core.set_node_partials_for_update(node);
          if filthy {
            core.set_node_ids_for_update(node);
          }
        }
        if filthy {
          // Children appear earlier in the post-order, so their tables are already fresh.
          for worker in &mut self.workers {
            worker.core_mut().rebuild_pattern_ids(child1, child2, node);
          }
        }
        ops.push((child1, child2, node));
      }
    }

    Ok(update)
  }

  pub fn requires_recalculation(&self, tree: &Tree) -> bool {
    !self.has_dirt.is_clean() || tree.something_is_dirty()
  }

  pub fn store(&mut self) {
    for worker in &mut self.workers {
      worker.store();
    }
    self.stored_branch_lengths.copy_from_slice(&self.branch_lengths);
    self.stored_log_p = self.log_p;
  }

  pub fn restore(&mut self) {
    for worker in &mut self.workers {
      worker.restore();
    }
    mem::swap(&mut self.branch_lengths, &mut self.stored_branch_lengths);
    self.log_p = self.stored_log_p;
    self.has_dirt = Dirt::Clean;
  }

  pub fn set_use_scaling(&mut self, on: bool) {
    for worker in &mut self.workers {
      worker.set_use_scaling(on);
    }
    self.has_dirt = self.has_dirt.combine(Dirt::Dirty);
  }

  pub fn set_clock(&mut self, clock: StrictClock) {
    self.clock = clock;
    for worker in &mut self.workers {
      worker.set_clock(clock);
    }
    self.has_dirt = self.has_dirt.combine(Dirt::Dirty);
  }

  pub fn set_site_model(&mut self, site_model: SiteModel) -> Result<(), Report> {
    for worker in &mut self.workers {
      worker.set_site_model(site_model.clone())?;
    }
    self.site_model = site_model;
    self.has_dirt = self.has_dirt.combine(Dirt::Dirty);
    Ok(())
  }

  pub fn set_substitution_model(&mut self, substitution: Arc<dyn SubstitutionModel>) -> Result<(), Report> {
    for worker in &mut self.workers {
      worker.set_substitution_model(Arc::clone(&substitution))?;
    }
    self.substitution = substitution;
    self.has_dirt = self.has_dirt.combine(Dirt::Dirty);
    Ok(())
  }

  pub fn notify_data_changed(&mut self) {
    self.has_dirt = Dirt::Filthy;
  }

  #[inline]
  pub const fn log_likelihood(&self) -> f64 {
    self.log_p
  }

  #[inline]
  pub fn pattern_log_likelihoods(&self) -> &[f64] {
    &self.pattern_log_likelihoods
  }

  #[inline]
  pub fn worker_count(&self) -> usize {
    self.workers.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::alphabet::alphabet::Alphabet;
  use crate::model::site::SiteModelParams;
  use crate::model::substitution::EigenModel;
  use crate::pattern::pattern::PatternStoreParams;
  use ndarray::array;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  const NEWICK: &str = "((((human:0.024003,(chimp:0.010772,bonobo:0.010772):0.013231):0.012035,gorilla:0.036038):0.033087,orangutan:0.069125):0.030457,siamang:0.099582);";

  fn records() -> Vec<(&'static str, &'static str)> {
    vec![
      ("human", "AAGCTTCACCGGCGCAGTCATTCTCATAAT"),
      ("chimp", "AAGCTTCACCGGCGCAATTATCCTCATAAT"),
      ("bonobo", "AAGCTTCACCGGCGCAGTTGTTCTCATAAT"),
      ("gorilla", "AAGCTTCACCGGCGCGGTCGTTCTCATAAT"),
      ("orangutan", "AAGCTTCACCGGCGCAGTCACCCTCATAAT"),
      ("siamang", "AAGCTTTACAGGCGCAACCACCCTCATGAT"),
    ]
  }

  fn patterns() -> PatternStore {
    PatternStore::from_sequences(&Alphabet::nuc().unwrap(), &records(), &PatternStoreParams::default()).unwrap()
  }

  fn model() -> EigenModel {
    EigenModel::gtr(&[0.7, 3.1, 0.4, 0.5, 4.2, 1.0], &array![0.32, 0.31, 0.11, 0.26]).unwrap()
  }

  fn site_model() -> SiteModel {
    SiteModel::new(&SiteModelParams {
      gamma_category_count: 4,
      gamma_shape: Some(0.5),
      proportion_invariant: 0.2,
    })
    .unwrap()
  }

  fn pool() -> Arc<ThreadPool> {
    Arc::new(rayon::ThreadPoolBuilder::new().num_threads(3).build().unwrap())
  }

  fn sequential(tree: &Tree, patterns: &PatternStore) -> TreeLikelihood {
    TreeLikelihood::new(
      tree,
      patterns.clone(),
      Arc::new(model()),
      site_model(),
      StrictClock::default(),
      &TreeLikelihoodParams::default(),
    )
    .unwrap()
  }

  fn threaded(tree: &Tree, patterns: &PatternStore, thread_count: usize) -> ThreadedTreeLikelihood {
    ThreadedTreeLikelihood::new(
      tree,
      patterns.clone(),
      Arc::new(model()),
      site_model(),
      StrictClock::default(),
      &TreeLikelihoodParams::default(),
      pool(),
      thread_count,
    )
    .unwrap()
  }

  #[rstest]
  #[case(1)]
  #[case(2)]
  #[case(3)]
  #[case(5)]
  fn parallel_total_is_bit_identical_to_sequential(#[case] thread_count: usize) {
    let mut tree = Tree::from_newick(NEWICK).unwrap();
    let patterns = patterns();
    let mut reference = sequential(&tree, &patterns);
    let mut parallel = threaded(&tree, &patterns, thread_count);

    let expected = reference.calculate_log_likelihood(&tree).unwrap();
    let actual = parallel.calculate_log_likelihood(&tree).unwrap();
    assert_eq!(expected.to_bits(), actual.to_bits());
    tree.clean_all();

    // An incremental branch update must stay in lockstep.
    let node = tree.n_leaves();
    tree.set_height(node, tree.height(node) * 1.05);
    tree.mark_dirty(node);
    let expected = reference.calculate_log_likelihood(&tree).unwrap();
    let actual = parallel.calculate_log_likelihood(&tree).unwrap();
    assert_eq!(expected.to_bits(), actual.to_bits());
    tree.clean_all();

    // A store / reject / restore cycle as driven by the sampler.
    reference.store();
    parallel.store();
    let root = tree.root();
    let root_height = tree.height(root);
    tree.set_height(root, root_height * 1.2);
    tree.mark_dirty(root);
    let expected = reference.calculate_log_likelihood(&tree).unwrap();
    let actual = parallel.calculate_log_likelihood(&tree).unwrap();
    assert_eq!(expected.to_bits(), actual.to_bits());
    tree.set_height(root, root_height);
    tree.clean_all();
    reference.restore();
    parallel.restore();
    assert_eq!(
      reference.log_likelihood().to_bits(),
      parallel.log_likelihood().to_bits()
    );

    // A topology-grade (filthy) invalidation rebuilds tables in the pre-pass only.
    tree.mark_filthy(tree.n_leaves() + 1);
    let expected = reference.calculate_log_likelihood(&tree).unwrap();
    let actual = parallel.calculate_log_likelihood(&tree).unwrap();
    assert_eq!(expected.to_bits(), actual.to_bits());
  }

  #[test]
  fn per_pattern_log_likelihoods_match_sequential() {
    let tree = Tree::from_newick(NEWICK).unwrap();
    let patterns = patterns();
    let mut reference = sequential(&tree, &patterns);
    let mut parallel = threaded(&tree, &patterns, 3);
    reference.calculate_log_likelihood(&tree).unwrap();
    parallel.calculate_log_likelihood(&tree).unwrap();

    for (a, b) in reference
      .pattern_log_likelihoods()
      .iter()
      .zip(parallel.pattern_log_likelihoods())
    {
      assert_eq!(a.to_bits(), b.to_bits());
    }
  }

  #[test]
  fn worker_count_is_capped_by_pattern_count() {
    let tree = Tree::from_newick("(a:0.1,b:0.2);").unwrap();
    let patterns =
      PatternStore::from_sequences(&Alphabet::nuc().unwrap(), &[("a", "AC"), ("b", "AG")], &PatternStoreParams::default())
        .unwrap();
    let parallel = ThreadedTreeLikelihood::new(
      &tree,
      patterns,
      Arc::new(EigenModel::jc69(4).unwrap()),
      SiteModel::single_category(),
      StrictClock::default(),
      &TreeLikelihoodParams::default(),
      pool(),
      64,
    )
    .unwrap();
    assert_eq!(parallel.worker_count(), 2);
  }

  #[test]
  fn ascertained_alignment_matches_sequential() {
    let tree = Tree::from_newick("((a:0.1,b:0.2):0.05,(c:0.15,d:0.3):0.1);").unwrap();
    let records = [
      ("a", "ACGTACGTTGCA"),
      ("b", "ACGTACGATGCA"),
      ("c", "ACGTACGTTGCC"),
      ("d", "ACGTTCGTTGCA"),
    ];
    let store = PatternStore::from_sequences(
      &Alphabet::nuc().unwrap(),
      &records,
      &PatternStoreParams {
        ascertainment_exclude: Some(0..4),
        ..PatternStoreParams::default()
      },
    )
    .unwrap();

    let jc: Arc<dyn SubstitutionModel> = Arc::new(EigenModel::jc69(4).unwrap());
    let mut reference = TreeLikelihood::new(
      &tree,
      store.clone(),
      Arc::clone(&jc),
      SiteModel::single_category(),
      StrictClock::default(),
      &TreeLikelihoodParams::default(),
    )
    .unwrap();
    let mut parallel = ThreadedTreeLikelihood::new(
      &tree,
      store,
      jc,
      SiteModel::single_category(),
      StrictClock::default(),
      &TreeLikelihoodParams::default(),
      pool(),
      3,
    )
    .unwrap();

    let expected = reference.calculate_log_likelihood(&tree).unwrap();
    let actual = parallel.calculate_log_likelihood(&tree).unwrap();
    assert_eq!(expected.to_bits(), actual.to_bits());
  }

  #[test]
  fn model_updates_propagate_to_all_workers() {
    let mut tree = Tree::from_newick(NEWICK).unwrap();
    let patterns = patterns();
    let mut reference = sequential(&tree, &patterns);
    let mut parallel = threaded(&tree, &patterns, 3);
    reference.calculate_log_likelihood(&tree).unwrap();
    parallel.calculate_log_likelihood(&tree).unwrap();
    tree.clean_all();

    let hky: Arc<dyn SubstitutionModel> = Arc::new(EigenModel::hky(5.0, &array![0.32, 0.31, 0.11, 0.26]).unwrap());
    reference.set_substitution_model(Arc::clone(&hky)).unwrap();
    parallel.set_substitution_model(hky).unwrap();
    assert!(parallel.requires_recalculation(&tree));

    let expected = reference.calculate_log_likelihood(&tree).unwrap();
    let actual = parallel.calculate_log_likelihood(&tree).unwrap();
    assert_eq!(expected.to_bits(), actual.to_bits());

    reference.set_use_scaling(true);
    parallel.set_use_scaling(true);
    let expected = reference.calculate_log_likelihood(&tree).unwrap();
    let actual = parallel.calculate_log_likelihood(&tree).unwrap();
    assert_eq!(expected.to_bits(), actual.to_bits());
  }

  #[test]
  fn worker_failures_abort_the_whole_evaluation() {
    use ndarray::Array1;

    struct NanModel {
      freqs: Array1<f64>,
    }
    impl SubstitutionModel for NanModel {
      fn n_states(&self) -> usize {
        4
      }
      fn frequencies(&self) -> &Array1<f64> {
        &self.freqs
      }
      fn transition_probabilities(&self, _: f64, _: f64, _: f64, out: &mut [f64]) -> Result<(), Report> {
        out.fill(f64::NAN);
        Ok(())
      }
    }

    let tree = Tree::from_newick("(a:0.1,b:0.2);").unwrap();
    let patterns =
      PatternStore::from_sequences(&Alphabet::nuc().unwrap(), &[("a", "AC"), ("b", "AG")], &PatternStoreParams::default())
        .unwrap();
    let mut parallel = ThreadedTreeLikelihood::new(
      &tree,
      patterns,
      Arc::new(NanModel {
        freqs: Array1::from_elem(4, 0.25),
      }),
      SiteModel::single_category(),
      StrictClock::default(),
      &TreeLikelihoodParams::default(),
      pool(),
      2,
    )
    .unwrap();
    assert!(parallel.calculate_log_likelihood(&tree).is_err());
  }
}
