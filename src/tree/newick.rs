use crate::make_error;
use crate::tree::tree::Tree;
use eyre::Report;

/// Parse a Newick string into a [`Tree`].
///
/// Leaf ids are assigned in order of appearance, internal ids in post-order starting at
/// `n_leaves`, which yields the contiguous id halves the engine requires (the root receives
/// the last id). Node heights are derived from root-to-node path lengths, anchored so that
/// the deepest node sits at height zero. Internal node labels and the root branch length
/// are ignored.
pub fn parse(nwk: &str) -> Result<Tree, Report> {
  let mut parser = Parser {
    bytes: nwk.trim().as_bytes(),
    pos: 0,
  };
  let root = parser.clade()?;
  parser.skip_whitespace();
  if !parser.consume(b';') {
    return make_error!("When parsing Newick: expected ';' at position {}", parser.pos);
  }
  parser.skip_whitespace();
  if parser.pos != parser.bytes.len() {
    return make_error!("When parsing Newick: trailing characters after ';'");
  }
  build(&root)
}

struct Clade {
  name: Option<String>,
  length: f64,
  children: Vec<Clade>,
}

struct Parser<'a> {
  bytes: &'a [u8],
  pos: usize,
}

impl Parser<'_> {
  fn peek(&self) -> Option<u8> {
    self.bytes.get(self.pos).copied()
  }

  fn consume(&mut self, expected: u8) -> bool {
    if self.peek() == Some(expected) {
      self.pos += 1;
      true
    } else {
      false
    }
  }

  fn skip_whitespace(&mut self) {
    while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
      self.pos += 1;
    }
  }

  fn clade(&mut self) -> Result<Clade, Report> {
    self.skip_whitespace();
    let children = if self.consume(b'(') {
      let mut children = vec![self.clade()?];
      while self.consume(b',') {
        children.push(self.clade()?);
      }
      if !self.consume(b')') {
        return make_error!("When parsing Newick: expected ')' or ',' at position {}", self.pos);
      }
      children
    } else {
      vec![]
    };

    let name = self.label();
    if children.is_empty() && name.is_none() {
      return make_error!("When parsing Newick: leaf without a name at position {}", self.pos);
    }

    let length = self.branch_length()?;
    Ok(Clade { name, length, children })
  }

  fn label(&mut self) -> Option<String> {
    let start = self.pos;
    while self
      .peek()
      .is_some_and(|b| !b.is_ascii_whitespace() && !matches!(b, b'(' | b')' | b',' | b':' | b';'))
    {
      self.pos += 1;
    }
    (self.pos > start).then(|| String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
  }

  fn branch_length(&mut self) -> Result<f64, Report> {
    self.skip_whitespace();
    if !self.consume(b':') {
      return Ok(0.0);
    }
    self.skip_whitespace();
    let start = self.pos;
    while self
      .peek()
      .is_some_and(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-'))
    {
      self.pos += 1;
    }
    let text = std::str::from_utf8(&self.bytes[start..self.pos]).expect("ASCII slice is valid UTF-8");
    match text.parse::<f64>() {
      Ok(length) if length >= 0.0 => Ok(length),
      Ok(length) => make_error!("When parsing Newick: negative branch length {length}"),
      Err(_) => make_error!("When parsing Newick: invalid branch length '{text}' at position {start}"),
    }
  }
}

fn count_leaves(clade: &Clade) -> usize {
  if clade.children.is_empty() {
    1
  } else {
    clade.children.iter().map(count_leaves).sum()
  }
}

fn build(root: &Clade) -> Result<Tree, Report> {
  let n_leaves = count_leaves(root);
  let n_nodes = 2 * n_leaves.max(1) - 1;

  let mut builder = TreeBuilder {
    taxa: vec![],
    parents: vec![None; n_nodes],
    depths: vec![0.0; n_nodes],
    next_internal: n_leaves,
  };
  builder.assign(root, 0.0)?;

  let max_depth = builder.depths.iter().copied().fold(0.0, f64::max);
  let heights = builder.depths.iter().map(|d| max_depth - d).collect();

  Tree::new(builder.taxa, builder.parents, heights)
}

struct TreeBuilder {
  taxa: Vec<String>,
  parents: Vec<Option<usize>>,
  depths: Vec<f64>,
  next_internal: usize,
}

impl TreeBuilder {
  /// Post-order id assignment; returns the id of the clade's node
  fn assign(&mut self, clade: &Clade, parent_depth: f64) -> Result<usize, Report> {
    let depth = parent_depth + clade.length;
    let node = match clade.children.as_slice() {
      [] => {
        let node = self.taxa.len();
        self
          .taxa
          .push(clade.name.clone().expect("leaf names are checked during parsing"));
        node
      }
      [left, right] => {
        let left = self.assign(left, depth)?;
        let right = self.assign(right, depth)?;
        let node = self.next_internal;
        self.next_internal += 1;
        if node >= self.parents.len() {
          return make_error!("When parsing Newick: malformed tree structure");
        }
        self.parents[left] = Some(node);
        self.parents[right] = Some(node);
        node
      }
      children => {
        return make_error!(
          "When parsing Newick: only binary trees are supported, but found a node with {} children",
          children.len()
        )
      }
    };
    self.depths[node] = depth;
    Ok(node)
  }
}
