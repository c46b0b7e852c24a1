use crate::likelihood::dirt::Dirt;
use crate::make_error;
use eyre::Report;
use itertools::Itertools;

/// Binary rooted tree over flat node arrays.
///
/// Node ids are stable for the lifetime of the tree and follow the contiguous-halves
/// convention required by the likelihood engine: leaves occupy `[0, n_leaves)` and internal
/// nodes occupy `[n_leaves, n_nodes)`, so per-node buffers can be indexed directly by id.
/// Node heights are owned here and mutated by MCMC operators; branch lengths are derived
/// as height differences.
#[derive(Clone, Debug)]
pub struct Tree {
  taxa: Vec<String>,
  parents: Vec<Option<usize>>,
  children: Vec<Option<(usize, usize)>>,
  heights: Vec<f64>,
  dirt: Vec<Dirt>,
  n_leaves: usize,
  root: usize,
}

impl Tree {
  pub fn new(taxa: Vec<String>, parents: Vec<Option<usize>>, heights: Vec<f64>) -> Result<Self, Report> {
    let n_nodes = parents.len();
    let n_leaves = taxa.len();

    if n_leaves < 2 {
      return make_error!("When building tree: at least 2 leaves are required, but found {n_leaves}");
    }
    if n_nodes != 2 * n_leaves - 1 {
      return make_error!(
        "When building tree: a binary rooted tree over {n_leaves} leaves has {} nodes, but found {n_nodes}",
        2 * n_leaves - 1
      );
    }
    if heights.len() != n_nodes {
      return make_error!(
        "When building tree: expected {n_nodes} node heights, but found {}",
        heights.len()
      );
    }
    if taxa.iter().unique().count() != taxa.len() {
      return make_error!("When building tree: taxon names are not unique");
    }

    let mut kids: Vec<Vec<usize>> = vec![vec![]; n_nodes];
    let mut root = None;
    for (node, parent) in parents.iter().enumerate() {
      match parent {
        Some(p) => {
          if *p >= n_nodes || *p == node {
            return make_error!("When building tree: node {node} has invalid parent {p}");
          }
          kids[*p].push(node);
        }
        None => {
          if root.replace(node).is_some() {
            return make_error!("When building tree: more than one root node");
          }
        }
      }
    }
    let Some(root) = root else {
      return make_error!("When building tree: no root node");
    };
    if root < n_leaves {
      return make_error!("When building tree: root must be an internal node");
    }

    let children = kids
      .iter()
      .enumerate()
      .map(|(node, kids)| match (node < n_leaves, kids.as_slice()) {
        (true, []) => Ok(None),
        (false, &[left, right]) => Ok(Some((left, right))),
        (is_leaf, kids) => make_error!(
          "When building tree: {} {node} has {} children",
          if is_leaf { "leaf" } else { "internal node" },
          kids.len()
        ),
      })
      .collect::<Result<Vec<_>, Report>>()?;

    let tree = Self {
      taxa,
      parents,
      children,
      heights,
      dirt: vec![Dirt::default(); n_nodes],
      n_leaves,
      root,
    };

    if tree.postorder().len() != n_nodes {
      return make_error!("When building tree: not all nodes are reachable from the root");
    }
    for node in 0..n_nodes {
      if tree.branch_length(node) < 0.0 {
        return make_error!(
          "When building tree: node {node} is higher than its parent (negative branch length {})",
          tree.branch_length(node)
        );
      }
    }

    Ok(tree)
  }

  pub fn from_newick(nwk: &str) -> Result<Self, Report> {
    crate::tree::newick::parse(nwk)
  }

  #[inline]
  pub fn n_nodes(&self) -> usize {
    self.parents.len()
  }

  #[inline]
  pub const fn n_leaves(&self) -> usize {
    self.n_leaves
  }

  #[inline]
  pub const fn root(&self) -> usize {
    self.root
  }

  #[inline]
  pub const fn is_leaf(&self, node: usize) -> bool {
    node < self.n_leaves
  }

  #[inline]
  pub fn parent(&self, node: usize) -> Option<usize> {
    self.parents[node]
  }

  #[inline]
  pub fn children_of(&self, node: usize) -> Option<(usize, usize)> {
    self.children[node]
  }

  #[inline]
  pub fn height(&self, node: usize) -> f64 {
    self.heights[node]
  }

  /// Length of the branch above a node; zero for the root
  pub fn branch_length(&self, node: usize) -> f64 {
    match self.parents[node] {
      Some(parent) => self.heights[parent] - self.heights[node],
      None => 0.0,
    }
  }

  pub fn taxon_name(&self, leaf: usize) -> &str {
    &self.taxa[leaf]
  }

  #[inline]
  pub fn taxa(&self) -> &[String] {
    &self.taxa
  }

  /// Move a node in time. Callers are expected to mark affected nodes dirty; the engine
  /// additionally detects branch-length changes by comparison against its stored lengths.
  pub fn set_height(&mut self, node: usize, height: f64) {
    self.heights[node] = height;
  }

  #[inline]
  pub fn node_dirt(&self, node: usize) -> Dirt {
    self.dirt[node]
  }

  pub fn mark_dirty(&mut self, node: usize) {
    self.dirt[node] = self.dirt[node].combine(Dirt::Dirty);
  }

  pub fn mark_filthy(&mut self, node: usize) {
    self.dirt[node] = Dirt::Filthy;
  }

  pub fn clean_all(&mut self) {
    self.dirt.fill(Dirt::Clean);
  }

  pub fn something_is_dirty(&self) -> bool {
    self.dirt.iter().any(|d| !d.is_clean())
  }

  /// Node ids in post-order (children before parents), starting from the root
  pub fn postorder(&self) -> Vec<usize> {
    let mut order = Vec::with_capacity(self.n_nodes());
    let mut stack = vec![(self.root, false)];
    while let Some((node, expanded)) = stack.pop() {
      if expanded || self.is_leaf(node) {
        order.push(node);
      } else {
        stack.push((node, true));
        if let Some((left, right)) = self.children[node] {
          stack.push((right, false));
          stack.push((left, false));
        }
      }
    }
    order
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn rejects_duplicate_taxa() {
    let result = Tree::new(
      vec!["a".to_owned(), "a".to_owned()],
      vec![Some(2), Some(2), None],
      vec![0.0, 0.0, 1.0],
    );
    assert!(result.is_err());
  }

  #[test]
  fn rejects_negative_branch_lengths() {
    let result = Tree::new(
      vec!["a".to_owned(), "b".to_owned()],
      vec![Some(2), Some(2), None],
      vec![0.0, 2.0, 1.0],
    );
    assert!(result.is_err());
  }

  #[test]
  fn postorder_visits_children_before_parents() {
    let tree = Tree::from_newick("((a:1,b:1):1,(c:1,d:1):1);").unwrap();
    let order = tree.postorder();
    assert_eq!(order.len(), tree.n_nodes());
    let position = |node: usize| order.iter().position(|&n| n == node).unwrap();
    for node in 0..tree.n_nodes() {
      if let Some(parent) = tree.parent(node) {
        assert!(position(node) < position(parent));
      }
    }
  }

  #[test]
  fn dirt_flags_combine_and_clear() {
    let mut tree = Tree::from_newick("(a:1,b:1);").unwrap();
    assert!(!tree.something_is_dirty());
    tree.mark_dirty(0);
    tree.mark_filthy(1);
    assert_eq!(tree.node_dirt(0), Dirt::Dirty);
    assert_eq!(tree.node_dirt(1), Dirt::Filthy);
    tree.mark_dirty(1);
    assert_eq!(tree.node_dirt(1), Dirt::Filthy);
    tree.clean_all();
    assert!(!tree.something_is_dirty());
  }
}
