use std::{cell::RefCell, cmp::Ordering, rc::Rc};

use bytes::Bytes;

use crate::{
  errors::{Errors, Result},
  index::CowTree,
  transaction::TxInner,
};

/// Where [`Cursor::find`] left the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindResult {
  /// On the requested key.
  Exact,
  /// On the greatest key below the requested one.
  Previous,
  /// On the smallest key above the requested one, nothing smaller exists.
  Next,
  /// The keyspace is empty.
  NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKeySuffixResult {
  Updated,
  /// The stored key already equals the new one.
  NothingToDo,
  NotFound,
  /// More than one key starts with the given prefix.
  NotUniquePrefix,
}

/// Position of one cursor, kept in its transaction's slab.
#[derive(Debug, Clone, Default)]
pub(crate) struct CursorState {
  /// Rank in the transaction's tree, -1 when not positioned.
  key_index: i64,
  /// Key at `key_index`, or the erased key while `removed_current` is set.
  current_key: Option<Bytes>,
  /// Another cursor changed the key stored at our rank; reload it before use.
  modified_from_last_find: bool,
  /// Our key was erased by someone else; `key_index` is now the rank of its successor.
  removed_current: bool,
}

impl CursorState {
  fn unpositioned() -> Self {
    CursorState {
      key_index: -1,
      ..Default::default()
    }
  }

  fn is_positioned(&self) -> bool {
    self.key_index >= 0
  }

  fn rank(&self) -> Option<usize> {
    self.is_positioned().then_some(self.key_index as usize)
  }

  fn set(&mut self, rank: usize, key: Bytes) {
    self.key_index = rank as i64;
    self.current_key = Some(key);
    self.modified_from_last_find = false;
    self.removed_current = false;
  }

  fn invalidate(&mut self) {
    *self = CursorState::unpositioned();
  }

  /// Makes sure `current_key` matches the tree before the tree changes.
  fn resolve(&mut self, tree: &CowTree) {
    if self.removed_current || !self.is_positioned() {
      return;
    }
    if self.modified_from_last_find || self.current_key.is_none() {
      self.current_key = tree
        .get_by_rank(self.key_index as usize)
        .map(|(k, _)| k.clone());
      self.modified_from_last_find = false;
    }
  }
}

/// Slots for the cursors of one transaction, reused through a free list.
#[derive(Default)]
pub(crate) struct CursorSlab {
  slots: Vec<Option<CursorState>>,
  free: Vec<usize>,
}

impl CursorSlab {
  pub(crate) fn allocate(&mut self) -> usize {
    match self.free.pop() {
      Some(id) => {
        self.slots[id] = Some(CursorState::unpositioned());
        id
      }
      None => {
        self.slots.push(Some(CursorState::unpositioned()));
        self.slots.len() - 1
      }
    }
  }

  pub(crate) fn release(&mut self, id: usize) {
    if let Some(slot) = self.slots.get_mut(id) {
      if slot.take().is_some() {
        self.free.push(id);
      }
    }
  }

  pub(crate) fn get(&self, id: usize) -> Result<&CursorState> {
    self
      .slots
      .get(id)
      .and_then(|s| s.as_ref())
      .ok_or_else(|| Errors::InvalidOperation("cursor was disposed".into()))
  }

  pub(crate) fn get_mut(&mut self, id: usize) -> Result<&mut CursorState> {
    self
      .slots
      .get_mut(id)
      .and_then(|s| s.as_mut())
      .ok_or_else(|| Errors::InvalidOperation("cursor was disposed".into()))
  }

  pub(crate) fn invalidate_all(&mut self) {
    for state in self.slots.iter_mut().flatten() {
      state.invalidate();
    }
  }

  fn others(&mut self, origin: Option<usize>) -> impl Iterator<Item = &mut CursorState> {
    self
      .slots
      .iter_mut()
      .enumerate()
      .filter(move |(id, _)| Some(*id) != origin)
      .filter_map(|(_, s)| s.as_mut())
      .filter(|s| s.is_positioned())
  }

  /// Called before a structural change so every other cursor knows its key.
  pub(crate) fn pre_notify(&mut self, origin: Option<usize>, tree: &CowTree) {
    for state in self.others(origin) {
      state.resolve(tree);
    }
  }

  /// `key` was inserted at `rank`.
  pub(crate) fn after_insert(&mut self, origin: Option<usize>, rank: usize, key: &[u8]) {
    for state in self.others(origin) {
      let r = state.key_index as usize;
      if state.removed_current {
        if r > rank {
          state.key_index += 1;
        } else if r == rank {
          let removed = state.current_key.as_deref().unwrap_or_default();
          match key.cmp(removed) {
            Ordering::Equal => state.removed_current = false,
            Ordering::Less => state.key_index += 1,
            Ordering::Greater => {}
          }
        }
      } else if r >= rank {
        state.key_index += 1;
      }
    }
  }

  /// Ranks `first..=last` were erased.
  pub(crate) fn after_erase(&mut self, origin: Option<usize>, first: usize, last: usize) {
    let count = (last - first + 1) as i64;
    for state in self.others(origin) {
      let r = state.key_index as usize;
      if r > last {
        state.key_index -= count;
      } else if r >= first {
        state.key_index = first as i64;
        state.removed_current = true;
      }
    }
  }

  /// The key at `rank` was replaced by one sorting into the same slot.
  pub(crate) fn after_key_change(&mut self, origin: Option<usize>, rank: usize) {
    for state in self.others(origin) {
      if !state.removed_current && state.key_index as usize == rank {
        state.modified_from_last_find = true;
      }
    }
  }
}

/// A movable position over the keys of one transaction.
///
/// Cursors share their transaction's tree; a change made through one cursor
/// keeps the others on the same key without searching again. Like the
/// transaction itself, a cursor must stay on the thread that created it.
pub struct Cursor {
  tx: Rc<RefCell<TxInner>>,
  id: usize,
}

impl Cursor {
  pub(crate) fn new(tx: Rc<RefCell<TxInner>>, id: usize) -> Self {
    Cursor { tx, id }
  }

  /// Runs `f` with the tree and this cursor's state.
  fn with_state<T>(&self, f: impl FnOnce(&CowTree, &mut CursorState) -> T) -> Result<T> {
    let mut inner = self.tx.borrow_mut();
    let (tree, cursors) = inner.tree_and_cursors()?;
    Ok(f(tree, cursors.get_mut(self.id)?))
  }

  fn position(&self, rank: Option<usize>) -> Result<bool> {
    self.with_state(|tree, state| match rank.and_then(|r| tree.get_by_rank(r).map(|e| (r, e.0))) {
      Some((r, key)) => {
        state.set(r, key.clone());
        true
      }
      None => {
        state.invalidate();
        false
      }
    })
  }

  pub fn invalidate(&self) -> Result<()> {
    self.with_state(|_, state| state.invalidate())
  }

  pub fn find(&self, key: &[u8]) -> Result<FindResult> {
    self.with_state(|tree, state| {
      if let Some(rank) = tree.find_rank(key) {
        state.set(rank, Bytes::copy_from_slice(key));
        return FindResult::Exact;
      }
      let lower = tree.lower_bound(key);
      let (rank, result) = if lower > 0 {
        (lower - 1, FindResult::Previous)
      } else if !tree.is_empty() {
        (0, FindResult::Next)
      } else {
        state.invalidate();
        return FindResult::NotFound;
      };
      match tree.get_by_rank(rank) {
        Some((k, _)) => {
          state.set(rank, k.clone());
          result
        }
        None => {
          state.invalidate();
          FindResult::NotFound
        }
      }
    })
  }

  pub fn find_exact(&self, key: &[u8]) -> Result<bool> {
    Ok(self.find(key)? == FindResult::Exact)
  }

  /// Moves to the first key starting with `prefix`.
  pub fn find_first(&self, prefix: &[u8]) -> Result<bool> {
    let (start, end) = self.with_state(|tree, _| tree.prefix_range(prefix))?;
    self.position((start < end).then_some(start))
  }

  /// Moves to the last key starting with `prefix`.
  pub fn find_last(&self, prefix: &[u8]) -> Result<bool> {
    let (start, end) = self.with_state(|tree, _| tree.prefix_range(prefix))?;
    self.position((start < end).then(|| end - 1))
  }

  /// Moves to the following key if it still starts with `prefix`; an
  /// unpositioned cursor starts at the first such key.
  pub fn find_next(&self, prefix: &[u8]) -> Result<bool> {
    let next = self.with_state(|_, state| {
      state.rank().map(|r| if state.removed_current { r } else { r + 1 })
    })?;
    let Some(next) = next else {
      return self.find_first(prefix);
    };
    self.step_to(next, prefix)
  }

  /// Moves to the preceding key if it still starts with `prefix`; an
  /// unpositioned cursor starts at the last such key.
  pub fn find_previous(&self, prefix: &[u8]) -> Result<bool> {
    let previous = self.with_state(|_, state| state.rank())?;
    match previous {
      None => self.find_last(prefix),
      Some(0) => {
        self.invalidate()?;
        Ok(false)
      }
      Some(r) => self.step_to(r - 1, prefix),
    }
  }

  fn step_to(&self, rank: usize, prefix: &[u8]) -> Result<bool> {
    self.with_state(|tree, state| match tree.get_by_rank(rank) {
      Some((key, _)) if key.starts_with(prefix) => {
        state.set(rank, key.clone());
        true
      }
      _ => {
        state.invalidate();
        false
      }
    })
  }

  pub fn seek_index(&self, rank: usize) -> Result<bool> {
    self.position(Some(rank))
  }

  /// Rank of the current key, `None` when the cursor is not on a key.
  pub fn key_index(&self) -> Result<Option<usize>> {
    self.with_state(|_, state| if state.removed_current { None } else { state.rank() })
  }

  pub fn get_key(&self) -> Result<Bytes> {
    self.with_state(|tree, state| {
      if state.removed_current {
        return Err(Errors::CursorNotPositioned);
      }
      state.resolve(tree);
      state.current_key.clone().ok_or(Errors::CursorNotPositioned)
    })?
  }

  pub fn get_value(&self) -> Result<Bytes> {
    let key = self.get_key()?;
    let inner = self.tx.borrow();
    let value = inner
      .tree()?
      .get(&key)
      .copied()
      .ok_or(Errors::CursorNotPositioned)?;
    inner.read_value(&value)
  }

  /// Inserts or overwrites `key` and moves onto it. Returns true for a new key.
  pub fn create_or_update(&self, key: &[u8], value: &[u8]) -> Result<bool> {
    let (rank, created) = self.tx.borrow_mut().upsert(Some(self.id), key, value)?;
    self.with_state(|_, state| state.set(rank, Bytes::copy_from_slice(key)))?;
    Ok(created)
  }

  pub fn update_value(&self, value: &[u8]) -> Result<()> {
    let key = self.get_key()?;
    self.create_or_update(&key, value).map(|_| ())
  }

  /// Replaces the only key starting with `key[..prefix_len]` by `key`.
  pub fn update_key_suffix(&self, key: &[u8], prefix_len: usize) -> Result<UpdateKeySuffixResult> {
    let (result, rank) = self
      .tx
      .borrow_mut()
      .update_key_suffix(Some(self.id), key, prefix_len)?;
    match rank {
      Some(rank) => self.with_state(|_, state| state.set(rank, Bytes::copy_from_slice(key)))?,
      None => self.invalidate()?,
    }
    Ok(result)
  }

  /// Erases the current key; the cursor keeps pointing between its neighbours.
  pub fn erase_current(&self) -> Result<()> {
    let rank = self
      .key_index()?
      .ok_or(Errors::CursorNotPositioned)?;
    let key = self.get_key()?;
    self.tx.borrow_mut().erase_range(Some(self.id), rank, rank)?;
    self.with_state(|_, state| {
      state.key_index = rank as i64;
      state.current_key = Some(key);
      state.removed_current = true;
    })
  }

  /// Erases ranks `first..=last`, returning how many keys went away.
  pub fn erase_range(&self, first: usize, last: usize) -> Result<usize> {
    let removed = self.tx.borrow_mut().erase_range(Some(self.id), first, last)?;
    if removed > 0 {
      let last = first + removed - 1;
      self.with_state(|_, state| match state.rank() {
        Some(r) if r > last => state.key_index -= removed as i64,
        Some(r) if r >= first => state.invalidate(),
        _ => {}
      })?;
    }
    Ok(removed)
  }
}

impl Drop for Cursor {
  fn drop(&mut self) {
    if let Ok(mut inner) = self.tx.try_borrow_mut() {
      inner.cursors.release(self.id);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::data::value_descriptor::ValueDescriptor;

  fn tree(keys: &[&'static str]) -> CowTree {
    let mut tree = CowTree::new();
    for key in keys {
      tree.upsert(Bytes::from(*key), ValueDescriptor::inline(b"").unwrap());
    }
    tree
  }

  fn positioned(slab: &mut CursorSlab, rank: usize, tree: &CowTree) -> usize {
    let id = slab.allocate();
    let key = tree.get_by_rank(rank).unwrap().0.clone();
    slab.get_mut(id).unwrap().set(rank, key);
    id
  }

  #[test]
  fn test_slab_reuses_released_slots() {
    let mut slab = CursorSlab::default();
    let a = slab.allocate();
    let b = slab.allocate();
    slab.release(a);
    slab.release(a);
    assert_eq!(slab.allocate(), a);
    assert_ne!(a, b);
    assert!(slab.get(b).is_ok());
  }

  #[test]
  fn test_insert_shifts_following_cursors() {
    let t = tree(&["a", "c", "e"]);
    let mut slab = CursorSlab::default();
    let before = positioned(&mut slab, 0, &t);
    let after = positioned(&mut slab, 1, &t);
    slab.pre_notify(None, &t);
    slab.after_insert(None, 1, b"b");
    assert_eq!(slab.get(before).unwrap().key_index, 0);
    assert_eq!(slab.get(after).unwrap().key_index, 2);
    assert_eq!(slab.get(after).unwrap().current_key.as_deref(), Some(&b"c"[..]));
  }

  #[test]
  fn test_erase_clamps_and_shifts() {
    let t = tree(&["a", "b", "c", "d", "e"]);
    let mut slab = CursorSlab::default();
    let inside = positioned(&mut slab, 2, &t);
    let above = positioned(&mut slab, 4, &t);
    slab.pre_notify(None, &t);
    slab.after_erase(None, 1, 3);

    let inside = slab.get(inside).unwrap();
    assert_eq!(inside.key_index, 1);
    assert!(inside.removed_current);
    assert_eq!(inside.current_key.as_deref(), Some(&b"c"[..]));
    assert_eq!(slab.get(above).unwrap().key_index, 1);
  }

  #[test]
  fn test_reinserting_removed_key_restores_cursor() {
    let t = tree(&["a", "b", "c"]);
    let mut slab = CursorSlab::default();
    let id = positioned(&mut slab, 1, &t);
    slab.pre_notify(None, &t);
    slab.after_erase(None, 1, 1);
    slab.after_insert(None, 1, b"b");
    let state = slab.get(id).unwrap();
    assert!(!state.removed_current);
    assert_eq!(state.key_index, 1);

    slab.pre_notify(None, &t);
    slab.after_erase(None, 1, 1);
    slab.after_insert(None, 1, b"ab");
    assert_eq!(slab.get(id).unwrap().key_index, 2);
  }

  #[test]
  fn test_origin_is_not_notified() {
    let t = tree(&["a", "b"]);
    let mut slab = CursorSlab::default();
    let origin = positioned(&mut slab, 1, &t);
    slab.after_insert(Some(origin), 0, b"0");
    assert_eq!(slab.get(origin).unwrap().key_index, 1);
  }
}
