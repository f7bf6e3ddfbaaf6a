use std::{cmp::Ordering, sync::Arc};

use bytes::Bytes;

use crate::data::value_descriptor::ValueDescriptor;

type Link = Option<Arc<Node>>;

#[derive(Clone)]
struct Node {
  key: Bytes,
  value: ValueDescriptor,
  left: Link,
  right: Link,
  height: u8,
  size: usize,
}

impl Node {
  fn leaf(key: Bytes, value: ValueDescriptor) -> Self {
    Node {
      key,
      value,
      left: None,
      right: None,
      height: 1,
      size: 1,
    }
  }

  fn update(&mut self) {
    self.height = 1 + height(&self.left).max(height(&self.right));
    self.size = 1 + size(&self.left) + size(&self.right);
  }
}

fn height(link: &Link) -> u8 {
  link.as_ref().map_or(0, |n| n.height)
}

fn size(link: &Link) -> usize {
  link.as_ref().map_or(0, |n| n.size)
}

/// Ordered map from byte-string keys to value descriptors.
///
/// Cloning is O(1): both copies share every node and a mutation copies only
/// the path it touches, so a committed tree is never changed by the
/// transaction that cloned it. Every node knows its subtree size, which makes
/// rank lookups logarithmic.
#[derive(Clone, Default)]
pub struct CowTree {
  root: Link,
}

impl CowTree {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    size(&self.root)
  }

  pub fn is_empty(&self) -> bool {
    self.root.is_none()
  }

  /// Number of keys for which `pred` holds; `pred` must be true for a prefix of the key order.
  pub fn partition_point<F>(&self, pred: F) -> usize
  where
    F: Fn(&[u8]) -> bool,
  {
    let mut count = 0;
    let mut link = &self.root;
    while let Some(node) = link {
      if pred(&node.key) {
        count += size(&node.left) + 1;
        link = &node.right;
      } else {
        link = &node.left;
      }
    }
    count
  }

  /// Rank of the first key not less than `key`.
  pub fn lower_bound(&self, key: &[u8]) -> usize {
    self.partition_point(|k| k < key)
  }

  /// Ranks `start..end` of the keys beginning with `prefix`.
  pub fn prefix_range(&self, prefix: &[u8]) -> (usize, usize) {
    let start = self.lower_bound(prefix);
    let end = self.partition_point(|k| k < prefix || k.starts_with(prefix));
    (start, end)
  }

  /// Rank of `key` if present.
  pub fn find_rank(&self, key: &[u8]) -> Option<usize> {
    let mut rank = 0;
    let mut link = &self.root;
    while let Some(node) = link {
      match key.cmp(&node.key) {
        Ordering::Less => link = &node.left,
        Ordering::Greater => {
          rank += size(&node.left) + 1;
          link = &node.right;
        }
        Ordering::Equal => return Some(rank + size(&node.left)),
      }
    }
    None
  }

  pub fn get(&self, key: &[u8]) -> Option<&ValueDescriptor> {
    let mut link = &self.root;
    while let Some(node) = link {
      match key.cmp(&node.key) {
        Ordering::Less => link = &node.left,
        Ordering::Greater => link = &node.right,
        Ordering::Equal => return Some(&node.value),
      }
    }
    None
  }

  pub fn get_by_rank(&self, mut rank: usize) -> Option<(&Bytes, &ValueDescriptor)> {
    let mut link = &self.root;
    while let Some(node) = link {
      let left = size(&node.left);
      match rank.cmp(&left) {
        Ordering::Less => link = &node.left,
        Ordering::Equal => return Some((&node.key, &node.value)),
        Ordering::Greater => {
          rank -= left + 1;
          link = &node.right;
        }
      }
    }
    None
  }

  /// Inserts or overwrites `key`, returning its rank and whether it is new.
  pub fn upsert(&mut self, key: Bytes, value: ValueDescriptor) -> (usize, bool) {
    insert(&mut self.root, key, value)
  }

  /// Overwrites the value at `rank`, returning false when out of range.
  pub fn set_value_at(&mut self, rank: usize, value: ValueDescriptor) -> bool {
    if rank >= self.len() {
      return false;
    }
    modify_at(&mut self.root, rank, &mut |node: &mut Node| node.value = value);
    true
  }

  /// Replaces the key at `rank`. The caller guarantees the new key sorts into the same slot.
  pub fn replace_key_at(&mut self, rank: usize, key: Bytes) -> bool {
    if rank >= self.len() {
      return false;
    }
    modify_at(&mut self.root, rank, &mut |node: &mut Node| {
      node.key = key.clone()
    });
    true
  }

  pub fn remove_at(&mut self, rank: usize) -> Option<(Bytes, ValueDescriptor)> {
    if rank >= self.len() {
      return None;
    }
    remove_at(&mut self.root, rank)
  }

  /// Removes ranks `first..=last`, returning how many entries went away.
  pub fn remove_range(&mut self, first: usize, last: usize) -> usize {
    let len = self.len();
    if first > last || first >= len {
      return 0;
    }
    let last = last.min(len - 1);
    for _ in first..=last {
      remove_at(&mut self.root, first);
    }
    last - first + 1
  }

  pub fn iter(&self) -> Iter<'_> {
    self.iter_from(0)
  }

  /// In-order iteration starting at `rank`.
  pub fn iter_from(&self, mut rank: usize) -> Iter<'_> {
    let mut stack = Vec::new();
    let mut link = &self.root;
    while let Some(node) = link {
      let left = size(&node.left);
      if rank <= left {
        stack.push(node.as_ref());
        if rank == left {
          break;
        }
        link = &node.left;
      } else {
        rank -= left + 1;
        link = &node.right;
      }
    }
    Iter { stack }
  }
}

pub struct Iter<'a> {
  stack: Vec<&'a Node>,
}

impl<'a> Iterator for Iter<'a> {
  type Item = (&'a Bytes, &'a ValueDescriptor);

  fn next(&mut self) -> Option<Self::Item> {
    let node = self.stack.pop()?;
    let mut link = &node.right;
    while let Some(child) = link {
      self.stack.push(child.as_ref());
      link = &child.left;
    }
    Some((&node.key, &node.value))
  }
}

fn insert(link: &mut Link, key: Bytes, value: ValueDescriptor) -> (usize, bool) {
  let node = match link {
    Some(arc) => Arc::make_mut(arc),
    None => {
      *link = Some(Arc::new(Node::leaf(key, value)));
      return (0, true);
    }
  };
  let result = match key.as_ref().cmp(node.key.as_ref()) {
    Ordering::Equal => {
      node.value = value;
      return (size(&node.left), false);
    }
    Ordering::Less => insert(&mut node.left, key, value),
    Ordering::Greater => {
      let left = size(&node.left);
      let (rank, inserted) = insert(&mut node.right, key, value);
      (rank + left + 1, inserted)
    }
  };
  if result.1 {
    rebalance(link);
  }
  result
}

fn modify_at(link: &mut Link, rank: usize, f: &mut dyn FnMut(&mut Node)) {
  if let Some(arc) = link {
    let node = Arc::make_mut(arc);
    let left = size(&node.left);
    match rank.cmp(&left) {
      Ordering::Less => modify_at(&mut node.left, rank, f),
      Ordering::Equal => f(node),
      Ordering::Greater => modify_at(&mut node.right, rank - left - 1, f),
    }
  }
}

fn remove_at(link: &mut Link, rank: usize) -> Option<(Bytes, ValueDescriptor)> {
  let arc = link.as_mut()?;
  let node = Arc::make_mut(arc);
  let left = size(&node.left);
  let removed = match rank.cmp(&left) {
    Ordering::Less => remove_at(&mut node.left, rank),
    Ordering::Greater => remove_at(&mut node.right, rank - left - 1),
    Ordering::Equal => match (node.left.take(), node.right.take()) {
      (None, None) => {
        let gone = link.take()?;
        return Some((gone.key.clone(), gone.value));
      }
      (Some(child), None) | (None, Some(child)) => {
        let key = node.key.clone();
        let value = node.value;
        *link = Some(child);
        return Some((key, value));
      }
      (Some(l), Some(r)) => {
        let mut right = Some(r);
        let (succ_key, succ_value) = remove_at(&mut right, 0)?;
        node.left = Some(l);
        node.right = right;
        let key = std::mem::replace(&mut node.key, succ_key);
        let value = std::mem::replace(&mut node.value, succ_value);
        Some((key, value))
      }
    },
  };
  rebalance(link);
  removed
}

fn rebalance(link: &mut Link) {
  let Some(arc) = link else {
    return;
  };
  let node = Arc::make_mut(arc);
  node.update();
  let balance = height(&node.left) as i16 - height(&node.right) as i16;
  if balance > 1 {
    let left_leans_right = node
      .left
      .as_ref()
      .is_some_and(|l| height(&l.left) < height(&l.right));
    if left_leans_right {
      rotate_left(&mut node.left);
    }
    rotate_right(link);
  } else if balance < -1 {
    let right_leans_left = node
      .right
      .as_ref()
      .is_some_and(|r| height(&r.right) < height(&r.left));
    if right_leans_left {
      rotate_right(&mut node.right);
    }
    rotate_left(link);
  }
}

fn rotate_right(link: &mut Link) {
  let Some(mut root) = link.take() else {
    return;
  };
  let r = Arc::make_mut(&mut root);
  let Some(mut pivot) = r.left.take() else {
    *link = Some(root);
    return;
  };
  let p = Arc::make_mut(&mut pivot);
  r.left = p.right.take();
  r.update();
  p.right = Some(root);
  p.update();
  *link = Some(pivot);
}

fn rotate_left(link: &mut Link) {
  let Some(mut root) = link.take() else {
    return;
  };
  let r = Arc::make_mut(&mut root);
  let Some(mut pivot) = r.right.take() else {
    *link = Some(root);
    return;
  };
  let p = Arc::make_mut(&mut pivot);
  r.right = p.left.take();
  r.update();
  p.left = Some(root);
  p.update();
  *link = Some(pivot);
}
