use std::{
  collections::VecDeque,
  ops::Deref,
  sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
  },
};

use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::index::CowTree;

/// Set in `refs` once a root has been swept; it can never be referenced again.
const DISPOSED: u32 = 1 << 31;

/// Immutable snapshot of the whole keyspace after one committed transaction.
pub struct RootNode {
  pub(crate) tree: CowTree,
  pub(crate) transaction_id: u64,
  pub(crate) commit_ulong: u64,
  pub(crate) ulongs: Vec<u64>,
  /// Log position at which the state of this root is fully durable.
  pub(crate) trlog_file_id: u32,
  pub(crate) trlog_offset: u64,
  refs: AtomicU32,
}

impl RootNode {
  pub(crate) fn new(
    tree: CowTree,
    transaction_id: u64,
    commit_ulong: u64,
    ulongs: Vec<u64>,
    trlog_position: (u32, u64),
  ) -> Self {
    RootNode {
      tree,
      transaction_id,
      commit_ulong,
      ulongs,
      trlog_file_id: trlog_position.0,
      trlog_offset: trlog_position.1,
      refs: AtomicU32::new(0),
    }
  }

  pub fn transaction_id(&self) -> u64 {
    self.transaction_id
  }

  pub fn commit_ulong(&self) -> u64 {
    self.commit_ulong
  }

  pub fn key_count(&self) -> usize {
    self.tree.len()
  }

  fn try_reference(&self) -> bool {
    let mut current = self.refs.load(Ordering::Acquire);
    loop {
      if current & DISPOSED != 0 {
        return false;
      }
      match self.refs.compare_exchange_weak(
        current,
        current + 1,
        Ordering::AcqRel,
        Ordering::Acquire,
      ) {
        Ok(_) => return true,
        Err(actual) => current = actual,
      }
    }
  }

  /// Returns true when this was the last reference.
  fn dereference(&self) -> bool {
    self.refs.fetch_sub(1, Ordering::AcqRel) == 1
  }

  fn try_dispose(&self) -> bool {
    self
      .refs
      .compare_exchange(0, DISPOSED, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  fn is_disposed(&self) -> bool {
    self.refs.load(Ordering::Acquire) & DISPOSED != 0
  }
}

/// Owns the committed root and every older root still referenced by a
/// transaction, newest first.
pub struct RootRegistry {
  last_committed: RwLock<Arc<RootNode>>,
  live: Mutex<VecDeque<Arc<RootNode>>>,
}

impl RootRegistry {
  pub(crate) fn new(initial: RootNode) -> Arc<Self> {
    let root = Arc::new(initial);
    Arc::new(RootRegistry {
      last_committed: RwLock::new(root.clone()),
      live: Mutex::new(VecDeque::from([root])),
    })
  }

  /// Cheap peek without taking a reference; only for comparisons and stats.
  pub(crate) fn last_committed(&self) -> Arc<RootNode> {
    self.last_committed.read().clone()
  }

  pub(crate) fn reference_and_get_last_committed(self: &Arc<Self>) -> RootRef {
    let last = self.last_committed.read();
    // The committed root is never swept, so this cannot fail.
    let referenced = last.try_reference();
    debug_assert!(referenced);
    RootRef {
      root: last.clone(),
      registry: self.clone(),
    }
  }

  pub(crate) fn reference_and_get_oldest_root(self: &Arc<Self>) -> RootRef {
    let live = self.live.lock();
    if let Some(root) = live.iter().rev().find(|r| r.try_reference()) {
      return RootRef {
        root: root.clone(),
        registry: self.clone(),
      };
    }
    drop(live);
    self.reference_and_get_last_committed()
  }

  /// Makes `root` the committed root and the head of the live list.
  pub(crate) fn publish(&self, root: RootNode) -> Arc<RootNode> {
    let root = Arc::new(root);
    {
      let mut live = self.live.lock();
      live.push_front(root.clone());
      *self.last_committed.write() = root.clone();
    }
    self.free_waiting_to_dispose();
    root
  }

  /// True when no transaction older than `transaction_id` is running.
  pub(crate) fn all_transactions_before_finished(&self, transaction_id: u64) -> bool {
    self.free_waiting_to_dispose();
    let live = self.live.lock();
    live
      .back()
      .map_or(true, |oldest| oldest.transaction_id >= transaction_id)
  }

  pub(crate) fn live_roots(&self) -> usize {
    self.live.lock().len()
  }

  fn free_waiting_to_dispose(&self) {
    let mut live = self.live.lock();
    let last = self.last_committed.read().clone();
    let before = live.len();
    live.retain(|root| Arc::ptr_eq(root, &last) || !root.try_dispose());
    if live.len() != before {
      debug!(
        "disposed {} roots, {} still live",
        before - live.len(),
        live.len()
      );
    }
  }
}

/// A counted reference to a root; dropping it may dispose older roots.
pub struct RootRef {
  root: Arc<RootNode>,
  registry: Arc<RootRegistry>,
}

impl RootRef {
  pub(crate) fn arc(&self) -> &Arc<RootNode> {
    &self.root
  }
}

impl Deref for RootRef {
  type Target = RootNode;

  fn deref(&self) -> &RootNode {
    &self.root
  }
}

impl Drop for RootRef {
  fn drop(&mut self) {
    debug_assert!(!self.root.is_disposed());
    if self.root.dereference() {
      self.registry.free_waiting_to_dispose();
    }
  }
}
