use std::{cell::RefCell, rc::Rc, sync::Arc};

use bytes::Bytes;
use log::{debug, error, warn};

use crate::{
  cursor::{Cursor, CursorSlab, UpdateKeySuffixResult},
  data::{
    trlog::{
      encode_commit, encode_create_or_update, encode_delta_ulongs, encode_erase_one,
      encode_erase_range, encode_marker, encode_transaction_start, encode_update_key_suffix,
      CommandType,
    },
    value_descriptor::{ValueDescriptor, MAX_STORED_VALUE_LEN},
  },
  db::DbInner,
  errors::{Errors, Result},
  index::CowTree,
  root::{RootNode, RootRef},
};

/// Replaces the only key starting with `key[..prefix_len]`; shared by live
/// transactions and log replay so both end up with the same tree.
pub(crate) fn apply_update_key_suffix(
  tree: &mut CowTree,
  key: &[u8],
  prefix_len: usize,
) -> (UpdateKeySuffixResult, Option<usize>) {
  let (start, end) = tree.prefix_range(&key[..prefix_len]);
  match end - start {
    0 => (UpdateKeySuffixResult::NotFound, None),
    1 => {
      let unchanged = tree
        .get_by_rank(start)
        .is_some_and(|(k, _)| k.as_ref() == key);
      if unchanged {
        return (UpdateKeySuffixResult::NothingToDo, Some(start));
      }
      tree.replace_key_at(start, Bytes::copy_from_slice(key));
      (UpdateKeySuffixResult::Updated, Some(start))
    }
    _ => (UpdateKeySuffixResult::NotUniquePrefix, None),
  }
}

/// Drops trailing zero counters so live and replayed roots compare equal.
pub(crate) fn trim_ulongs(ulongs: &mut Vec<u64>) {
  while ulongs.last() == Some(&0) {
    ulongs.pop();
  }
}

/// Private copy of the keyspace owned by the single writer.
struct WriteState {
  tree: CowTree,
  commit_ulong: u64,
  ulongs: Vec<u64>,
  /// `TransactionStart` is in the log.
  logged: bool,
}

impl WriteState {
  fn log(&mut self, db: &DbInner, record: &[u8]) -> Result<(u32, u64)> {
    if !self.logged {
      db.append_log(&encode_transaction_start())?;
      self.logged = true;
    }
    db.append_log(record)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxMode {
  /// Reads until the first write, then tries to become the writer.
  ReadWrite,
  ReadOnly,
  /// Admitted as writer at start.
  Writing,
}

pub(crate) struct TxInner {
  db: Arc<DbInner>,
  /// `None` once committed or rolled back.
  base: Option<RootRef>,
  mode: TxMode,
  write: Option<WriteState>,
  pub(crate) cursors: CursorSlab,
}

impl TxInner {
  fn base(&self) -> Result<&RootRef> {
    self.base.as_ref().ok_or(Errors::TransactionFinished)
  }

  pub(crate) fn tree(&self) -> Result<&CowTree> {
    match &self.write {
      Some(write) => Ok(&write.tree),
      None => Ok(&self.base()?.tree),
    }
  }

  pub(crate) fn tree_and_cursors(&mut self) -> Result<(&CowTree, &mut CursorSlab)> {
    let TxInner {
      base,
      write,
      cursors,
      ..
    } = self;
    let tree = match (write, base) {
      (Some(write), _) => &write.tree,
      (None, Some(base)) => &base.tree,
      (None, None) => return Err(Errors::TransactionFinished),
    };
    Ok((tree, cursors))
  }

  pub(crate) fn read_value(&self, value: &ValueDescriptor) -> Result<Bytes> {
    self.db.read_value(value, self.base()?)
  }

  fn make_writable(&mut self) -> Result<&mut WriteState> {
    if self.write.is_none() {
      if self.mode == TxMode::ReadOnly {
        return Err(Errors::ReadOnlyTransaction);
      }
      let base = self.base.as_ref().ok_or(Errors::TransactionFinished)?;
      self.db.try_make_writable(base.arc())?;
      debug!("transaction on root {} became writable", base.transaction_id);
      self.write = Some(WriteState {
        tree: base.tree.clone(),
        commit_ulong: base.commit_ulong,
        ulongs: base.ulongs.clone(),
        logged: false,
      });
    }
    match self.write.as_mut() {
      Some(write) => Ok(write),
      None => Err(Errors::TransactionFinished),
    }
  }

  pub(crate) fn upsert(
    &mut self,
    origin: Option<usize>,
    key: &[u8],
    value: &[u8],
  ) -> Result<(usize, bool)> {
    self.make_writable()?;
    let TxInner {
      db, write, cursors, ..
    } = self;
    let Some(write) = write.as_mut() else {
      return Err(Errors::TransactionFinished);
    };
    if value.len() > MAX_STORED_VALUE_LEN {
      return Err(Errors::ValueTooLarge(value.len()));
    }
    let record = encode_create_or_update(key, value, db.options.compression.as_ref());
    let (file_id, offset) = write.log(db, &record.data)?;
    let descriptor = match record.value {
      Some(stored) => ValueDescriptor::stored(
        file_id,
        (offset + stored.pos as u64) as u32,
        stored.len,
        stored.compressed,
      )?,
      None => ValueDescriptor::inline(value)
        .ok_or_else(|| Errors::InvalidOperation("inline value too long".into()))?,
    };

    cursors.pre_notify(origin, &write.tree);
    let (rank, inserted) = write.tree.upsert(Bytes::copy_from_slice(key), descriptor);
    if inserted {
      cursors.after_insert(origin, rank, key);
    }
    Ok((rank, inserted))
  }

  /// Erases ranks `first..=last` (clamped to the tree).
  pub(crate) fn erase_range(
    &mut self,
    origin: Option<usize>,
    first: usize,
    last: usize,
  ) -> Result<usize> {
    self.make_writable()?;
    let TxInner {
      db, write, cursors, ..
    } = self;
    let Some(write) = write.as_mut() else {
      return Err(Errors::TransactionFinished);
    };
    let len = write.tree.len();
    if first > last || first >= len {
      return Ok(0);
    }
    let last = last.min(len - 1);
    let first_key = match write.tree.get_by_rank(first) {
      Some((k, _)) => k.clone(),
      None => return Ok(0),
    };
    let compression = db.options.compression.as_ref();
    let record = if first == last {
      encode_erase_one(&first_key, compression)
    } else {
      let last_key = match write.tree.get_by_rank(last) {
        Some((k, _)) => k.clone(),
        None => return Ok(0),
      };
      encode_erase_range(&first_key, &last_key, compression)
    };
    write.log(db, &record)?;

    cursors.pre_notify(origin, &write.tree);
    let removed = write.tree.remove_range(first, last);
    cursors.after_erase(origin, first, last);
    Ok(removed)
  }

  pub(crate) fn update_key_suffix(
    &mut self,
    origin: Option<usize>,
    key: &[u8],
    prefix_len: usize,
  ) -> Result<(UpdateKeySuffixResult, Option<usize>)> {
    if prefix_len > key.len() {
      return Err(Errors::InvalidOperation(
        "prefix length exceeds key length".into(),
      ));
    }
    self.make_writable()?;
    let TxInner {
      db, write, cursors, ..
    } = self;
    let Some(write) = write.as_mut() else {
      return Err(Errors::TransactionFinished);
    };
    let mut tree = write.tree.clone();
    let (result, rank) = apply_update_key_suffix(&mut tree, key, prefix_len);
    if result == UpdateKeySuffixResult::Updated {
      let record = encode_update_key_suffix(prefix_len, key, db.options.compression.as_ref());
      write.log(db, &record)?;
      write.tree = tree;
      if let Some(rank) = rank {
        cursors.after_key_change(origin, rank);
      }
    }
    Ok((result, rank))
  }

  fn set_ulong(&mut self, index: usize, value: u64) -> Result<()> {
    let write = self.make_writable()?;
    if write.ulongs.len() <= index {
      write.ulongs.resize(index + 1, 0);
    }
    write.ulongs[index] = value;
    Ok(())
  }

  fn set_commit_ulong(&mut self, value: u64) -> Result<()> {
    self.make_writable()?.commit_ulong = value;
    Ok(())
  }

  fn commit(&mut self) -> Result<()> {
    let base = self.base.take().ok_or(Errors::TransactionFinished)?;
    self.cursors.invalidate_all();
    let Some(mut write) = self.write.take() else {
      return Ok(());
    };
    let result = self.commit_write(&base, &mut write);
    if let Err(e) = &result {
      error!("commit of transaction on root {} failed: {}", base.transaction_id, e);
      if write.logged {
        if let Err(e) = self.db.append_log(&encode_marker(CommandType::Rollback)) {
          warn!("failed to log rollback after failed commit: {}", e);
        }
      }
    }
    self.db.release_writer();
    result
  }

  fn commit_write(&self, base: &RootNode, write: &mut WriteState) -> Result<()> {
    let db = &self.db;
    trim_ulongs(&mut write.ulongs);
    let longest = write.ulongs.len().max(base.ulongs.len());
    for index in 0..longest {
      let old = base.ulongs.get(index).copied().unwrap_or(0);
      let new = write.ulongs.get(index).copied().unwrap_or(0);
      if old != new {
        write.log(db, &encode_delta_ulongs(index as u32, new.wrapping_sub(old)))?;
      }
    }
    let delta = write.commit_ulong.wrapping_sub(base.commit_ulong);
    if delta != 0 && !write.logged {
      db.append_log(&encode_transaction_start())?;
      write.logged = true;
    }
    if !write.logged {
      return Ok(());
    }
    db.append_log(&encode_commit(delta))?;
    let position = db.flush_log()?;
    db.publish(RootNode::new(
      std::mem::take(&mut write.tree),
      base.transaction_id + 1,
      write.commit_ulong,
      std::mem::take(&mut write.ulongs),
      position,
    ));
    Ok(())
  }

  fn rollback(&mut self) -> Result<()> {
    let Some(base) = self.base.take() else {
      return Ok(());
    };
    self.cursors.invalidate_all();
    let Some(write) = self.write.take() else {
      return Ok(());
    };
    let result = if write.logged {
      self
        .db
        .append_log(&encode_marker(CommandType::Rollback))
        .map(|_| ())
    } else {
      Ok(())
    };
    self.db.release_writer();
    debug!("transaction on root {} rolled back", base.transaction_id);
    result
  }
}

/// A snapshot of the keyspace, optionally turning into the single writer.
///
/// Readers never block: the snapshot a transaction starts from is immutable.
/// A transaction started with [`crate::db::KeyValueDb::start_transaction`]
/// becomes writable on its first change, failing with
/// [`Errors::TryAgain`] when another writer is active or its snapshot is no
/// longer the newest one. Dropping a transaction rolls it back.
pub struct Transaction {
  inner: Rc<RefCell<TxInner>>,
}

impl Transaction {
  pub(crate) fn new(db: Arc<DbInner>, base: RootRef, mode: TxMode) -> Self {
    let write = (mode == TxMode::Writing).then(|| WriteState {
      tree: base.tree.clone(),
      commit_ulong: base.commit_ulong,
      ulongs: base.ulongs.clone(),
      logged: false,
    });
    Transaction {
      inner: Rc::new(RefCell::new(TxInner {
        db,
        base: Some(base),
        mode,
        write,
        cursors: CursorSlab::default(),
      })),
    }
  }

  pub fn create_cursor(&self) -> Result<Cursor> {
    let mut inner = self.inner.borrow_mut();
    inner.base()?;
    let id = inner.cursors.allocate();
    Ok(Cursor::new(self.inner.clone(), id))
  }

  pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
    let inner = self.inner.borrow();
    match inner.tree()?.get(key).copied() {
      Some(value) => inner.read_value(&value).map(Some),
      None => Ok(None),
    }
  }

  /// Stores `value` under `key`, returning true when the key is new.
  pub fn put(&self, key: &[u8], value: &[u8]) -> Result<bool> {
    self
      .inner
      .borrow_mut()
      .upsert(None, key, value)
      .map(|(_, created)| created)
  }

  pub fn delete(&self, key: &[u8]) -> Result<bool> {
    let mut inner = self.inner.borrow_mut();
    let rank = inner.tree()?.find_rank(key);
    match rank {
      Some(rank) => Ok(inner.erase_range(None, rank, rank)? == 1),
      None => Ok(false),
    }
  }

  /// Erases every key, returning how many were removed.
  pub fn erase_all(&self) -> Result<usize> {
    let mut inner = self.inner.borrow_mut();
    let len = inner.tree()?.len();
    if len == 0 {
      return Ok(0);
    }
    inner.erase_range(None, 0, len - 1)
  }

  pub fn key_count(&self) -> Result<usize> {
    Ok(self.inner.borrow().tree()?.len())
  }

  pub fn is_writable(&self) -> bool {
    self.inner.borrow().write.is_some()
  }

  pub fn is_read_only(&self) -> bool {
    self.inner.borrow().mode == TxMode::ReadOnly
  }

  /// Id of the root this transaction reads, or of the root it will commit.
  pub fn transaction_number(&self) -> Result<u64> {
    let inner = self.inner.borrow();
    let base = inner.base()?.transaction_id;
    Ok(if inner.write.is_some() { base + 1 } else { base })
  }

  pub fn ulong(&self, index: usize) -> Result<u64> {
    let inner = self.inner.borrow();
    let ulongs = match &inner.write {
      Some(write) => &write.ulongs,
      None => &inner.base()?.ulongs,
    };
    Ok(ulongs.get(index).copied().unwrap_or(0))
  }

  pub fn set_ulong(&self, index: usize, value: u64) -> Result<()> {
    self.inner.borrow_mut().set_ulong(index, value)
  }

  /// Increments a counter and returns its new value.
  pub fn next_ulong(&self, index: usize) -> Result<u64> {
    let value = self.ulong(index)?.wrapping_add(1);
    self.set_ulong(index, value)?;
    Ok(value)
  }

  pub fn commit_ulong(&self) -> Result<u64> {
    let inner = self.inner.borrow();
    match &inner.write {
      Some(write) => Ok(write.commit_ulong),
      None => Ok(inner.base()?.commit_ulong),
    }
  }

  pub fn set_commit_ulong(&self, value: u64) -> Result<()> {
    self.inner.borrow_mut().set_commit_ulong(value)
  }

  pub fn commit(self) -> Result<()> {
    self.inner.borrow_mut().commit()
  }

  pub fn rollback(self) -> Result<()> {
    self.inner.borrow_mut().rollback()
  }
}

impl Drop for Transaction {
  fn drop(&mut self) {
    if let Ok(mut inner) = self.inner.try_borrow_mut() {
      if let Err(e) = inner.rollback() {
        error!("failed to roll back dropped transaction: {}", e);
      }
    }
  }
}
