//! Cache-aware, incremental Felsenstein-pruning engine for Bayesian phylogenetic MCMC.
//!
//! Given deduplicated alignment site patterns and a binary rooted tree, the engine evaluates
//! the log-likelihood of the data under a substitution model, recomputing only the partial
//! likelihoods invalidated since the previous evaluation. It is designed to sit inside an
//! external Metropolis-Hastings loop: the sampler proposes tree and parameter changes, asks
//! [`likelihood::tree_likelihood::TreeLikelihood`] (or its pattern-parallel counterpart
//! [`likelihood::threaded::ThreadedTreeLikelihood`]) for the resulting log-likelihood, and
//! drives the store/restore protocol on acceptance or rejection.

pub mod alphabet;
pub mod likelihood;
pub mod model;
pub mod pattern;
pub mod tree;
pub mod utils;
