use std::{
  collections::{BTreeMap, VecDeque},
  fmt,
  path::Path,
  sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
  },
  time::Duration,
};

use bytes::Bytes;
use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use log::{error, info, warn};
use parking_lot::Mutex;

use crate::{
  compactor::{CancellationToken, PendingDelete},
  data::{
    file_collection::FileCollection,
    file_header::FileDetail,
    key_index::{write_key_index, KeyIndexSnapshot},
    trlog::TrLogWriter,
    value_descriptor::ValueDescriptor,
  },
  errors::{Errors, Result},
  option::{IOManagerType, Options},
  recovery::{self, ResumePoint},
  root::{RootNode, RootRegistry},
  scheduler::{CompactorScheduler, SchedulerMessage},
  transaction::{Transaction, TxMode},
  util,
};

/// How often a cancellable writer request checks its token.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Newest key index written or loaded by this engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct KeyIndexMark {
  pub(crate) file_id: u32,
  pub(crate) transaction_id: u64,
  pub(crate) trlog_file_id: u32,
  pub(crate) trlog_offset: u64,
}

/// Writer admission: one active writer, the rest wait in FIFO order.
#[derive(Default)]
struct WriterSlot {
  active: bool,
  waiters: VecDeque<Sender<()>>,
}

/// Engine state shared by transactions, the compactor and its scheduler.
pub(crate) struct DbInner {
  pub(crate) options: Options,
  pub(crate) files: FileCollection,
  pub(crate) registry: Arc<RootRegistry>,
  writer: Mutex<WriterSlot>,
  pub(crate) trlog: Mutex<TrLogWriter>,
  pub(crate) last_kvi: Mutex<Option<KeyIndexMark>>,
  pub(crate) pending_deletes: Mutex<Vec<PendingDelete>>,
  pub(crate) compaction_lock: Mutex<()>,
  pub(crate) next_compaction_id: AtomicU64,
  /// Opened up to a commit ulong: the tail of the log was not applied, so nothing may be written.
  pub(crate) history_only: bool,
  pub(crate) closed: AtomicBool,
  advisor: Mutex<Option<Sender<SchedulerMessage>>>,
}

impl DbInner {
  pub(crate) fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  fn check_writes_allowed(&self) -> Result<()> {
    if self.is_closed() {
      return Err(Errors::DatabaseClosed);
    }
    if self.history_only {
      return Err(Errors::InvalidOperation(
        "database was opened up to a commit ulong and is read only".into(),
      ));
    }
    Ok(())
  }

  /// Blocks until this thread owns the writer slot.
  fn acquire_writer(&self) -> Result<()> {
    let receiver = {
      let mut slot = self.writer.lock();
      if !slot.active {
        slot.active = true;
        return Ok(());
      }
      let (sender, receiver) = bounded(1);
      slot.waiters.push_back(sender);
      receiver
    };
    receiver.recv().map_err(|_| Errors::DatabaseClosed)
  }

  /// Like [`DbInner::acquire_writer`], but gives up once `token` is cancelled.
  pub(crate) fn acquire_writer_or_cancel(&self, token: &CancellationToken) -> Result<bool> {
    let (sender, receiver) = bounded(1);
    {
      let mut slot = self.writer.lock();
      if !slot.active {
        slot.active = true;
        return Ok(true);
      }
      slot.waiters.push_back(sender.clone());
    }
    loop {
      match receiver.recv_timeout(CANCEL_POLL_INTERVAL) {
        Ok(()) => return Ok(true),
        Err(RecvTimeoutError::Timeout) if token.is_cancelled() => {
          let mut slot = self.writer.lock();
          if receiver.try_recv().is_ok() {
            drop(slot);
            self.release_writer();
          } else {
            slot.waiters.retain(|w| !w.same_channel(&sender));
          }
          return Ok(false);
        }
        Err(RecvTimeoutError::Timeout) => {}
        Err(RecvTimeoutError::Disconnected) => return Err(Errors::DatabaseClosed),
      }
    }
  }

  /// Admits a reading transaction as writer if its snapshot is still the newest one.
  pub(crate) fn try_make_writable(&self, base: &Arc<RootNode>) -> Result<()> {
    self.check_writes_allowed()?;
    let mut slot = self.writer.lock();
    if slot.active || !Arc::ptr_eq(&self.registry.last_committed(), base) {
      return Err(Errors::TryAgain);
    }
    slot.active = true;
    Ok(())
  }

  /// Hands the writer slot to the oldest waiter, or frees it.
  pub(crate) fn release_writer(&self) {
    let mut slot = self.writer.lock();
    while let Some(waiter) = slot.waiters.pop_front() {
      if waiter.send(()).is_ok() {
        return;
      }
    }
    slot.active = false;
  }

  pub(crate) fn append_log(&self, record: &[u8]) -> Result<(u32, u64)> {
    if self.is_closed() {
      return Err(Errors::DatabaseClosed);
    }
    let mut trlog = self.trlog.lock();
    let finished = trlog.finished_files();
    let position = trlog.append(&self.files, record)?;
    let rolled_over = trlog.finished_files() != finished;
    drop(trlog);
    if rolled_over {
      self.advise_compaction();
    }
    Ok(position)
  }

  /// Flushes the log as configured and returns the position after the last record.
  pub(crate) fn flush_log(&self) -> Result<(u32, u64)> {
    let mut trlog = self.trlog.lock();
    trlog.flush(false)?;
    Ok(trlog.position())
  }

  pub(crate) fn publish(&self, root: RootNode) -> Arc<RootNode> {
    self.registry.publish(root)
  }

  pub(crate) fn read_value(&self, value: &ValueDescriptor, root: &RootNode) -> Result<Bytes> {
    let (file_id, offset) = match *value {
      ValueDescriptor::Inline { len, bytes } => {
        return Ok(Bytes::copy_from_slice(&bytes[..len as usize]))
      }
      ValueDescriptor::Stored {
        file_id, offset, ..
      } => (file_id, offset),
    };
    let file = self
      .files
      .get_file(file_id)
      .ok_or(Errors::MissingValueFile {
        file_id,
        transaction_id: root.transaction_id,
        trlog_file_id: root.trlog_file_id,
        trlog_offset: root.trlog_offset,
        commit_ulong: root.commit_ulong,
      })?;
    let raw = file.read_vec(offset as u64, value.stored_len() as usize)?;
    if value.is_compressed() {
      return Ok(Bytes::from(self.options.compression.decompress(&raw)?));
    }
    Ok(Bytes::from(raw))
  }

  /// Writes a key index for the current committed root.
  pub(crate) fn write_kvi(&self) -> Result<u32> {
    let mut last_kvi = self.last_kvi.lock();
    let root = self.registry.reference_and_get_last_committed();
    let file_id = write_key_index(
      &self.files,
      &KeyIndexSnapshot {
        tree: &root.tree,
        trlog_file_id: root.trlog_file_id,
        trlog_offset: root.trlog_offset,
        commit_ulong: root.commit_ulong,
        ulongs: &root.ulongs,
        transaction_id: root.transaction_id,
      },
      self.options.kvi_compression_threshold,
    )?;
    self.files.sync_dir()?;
    *last_kvi = Some(KeyIndexMark {
      file_id,
      transaction_id: root.transaction_id,
      trlog_file_id: root.trlog_file_id,
      trlog_offset: root.trlog_offset,
    });
    Ok(file_id)
  }

  pub(crate) fn advise_compaction(&self) {
    if let Some(advisor) = self.advisor.lock().as_ref() {
      let _ = advisor.send(SchedulerMessage::Advise);
    }
  }

  fn close(&self) -> Result<()> {
    if self.closed.swap(true, Ordering::SeqCst) || self.history_only {
      return Ok(());
    }
    self.trlog.lock().close()
  }
}

/// Count and size of the files of one type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileTypeStats {
  pub count: usize,
  pub bytes: u64,
}

/// Snapshot of engine internals returned by [`KeyValueDb::calc_stats`].
#[derive(Debug, Clone)]
pub struct EngineStats {
  pub key_count: usize,
  pub live_roots: usize,
  pub last_transaction_id: u64,
  pub oldest_transaction_id: u64,
  pub commit_ulong: u64,
  pub trlog_file_id: u32,
  pub trlog_offset: u64,
  pub last_key_index: Option<u32>,
  pub files: BTreeMap<String, FileTypeStats>,
  pub disk_size: u64,
}

impl fmt::Display for EngineStats {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(
      f,
      "keys: {}, live roots: {}, transactions {}..={}, commit ulong: {}",
      self.key_count,
      self.live_roots,
      self.oldest_transaction_id,
      self.last_transaction_id,
      self.commit_ulong
    )?;
    write!(f, "trlog: {}:{}", self.trlog_file_id, self.trlog_offset)?;
    match self.last_key_index {
      Some(id) => writeln!(f, ", key index: {id}")?,
      None => writeln!(f, ", no key index")?,
    }
    for (file_type, stats) in &self.files {
      writeln!(
        f,
        "{}: {} files, {} bytes",
        file_type, stats.count, stats.bytes
      )?;
    }
    write!(f, "disk size: {} bytes", self.disk_size)
  }
}

/// Embedded transactional key/value engine.
pub struct KeyValueDb {
  pub(crate) inner: Arc<DbInner>,
  scheduler: Option<CompactorScheduler>,
}

impl KeyValueDb {
  /// Opens the database at `options.dir_path`, recovering it from its key
  /// index and transaction log files.
  pub fn open(options: Options) -> Result<Self> {
    options.validate()?;
    let files = FileCollection::open(&options)?;
    let recovered = recovery::recover(&files, &options)?;
    files.reset_io_type(IOManagerType::StandardFileIO)?;

    let mut trlog = TrLogWriter::new(
      recovered.resume.last_file_id(),
      options.file_split_size,
      options.sync_writes,
      options.bytes_per_sync,
    );
    if let ResumePoint::Append { file_id, offset } = recovered.resume {
      if !recovered.history_only {
        let file = files.get_file(file_id).ok_or_else(|| {
          Errors::UnrecoverableDatabase(format!("transaction log {file_id} disappeared"))
        })?;
        trlog.resume(file, offset)?;
      }
    }

    let next_compaction_id = files
      .file_infos()
      .iter()
      .filter_map(|(_, info)| match info.detail {
        FileDetail::PureValues { compaction_id } => compaction_id,
        _ => None,
      })
      .max()
      .map_or(1, |id| id + 1);

    info!(
      "opened database at {:?}: {} keys, transaction log at {}:{}",
      options.dir_path,
      recovered.root.key_count(),
      recovered.root.trlog_file_id,
      recovered.root.trlog_offset
    );
    let auto_compaction = options.auto_compaction && !recovered.history_only;
    let inner = Arc::new(DbInner {
      files,
      registry: RootRegistry::new(recovered.root),
      writer: Mutex::new(WriterSlot::default()),
      trlog: Mutex::new(trlog),
      last_kvi: Mutex::new(recovered.key_index),
      pending_deletes: Mutex::new(Vec::new()),
      compaction_lock: Mutex::new(()),
      next_compaction_id: AtomicU64::new(next_compaction_id),
      history_only: recovered.history_only,
      closed: AtomicBool::new(false),
      advisor: Mutex::new(None),
      options,
    });

    let scheduler = if auto_compaction {
      let scheduler = CompactorScheduler::start(
        Arc::downgrade(&inner),
        inner.options.compactor_wait_time,
        inner.options.compactor_interval,
      )?;
      *inner.advisor.lock() = Some(scheduler.advisor());
      Some(scheduler)
    } else {
      None
    };
    Ok(KeyValueDb { inner, scheduler })
  }

  pub fn dir_path(&self) -> &Path {
    self.inner.files.dir_path()
  }

  /// Starts a transaction on the last committed snapshot. It becomes the
  /// writer on its first change.
  pub fn start_transaction(&self) -> Result<Transaction> {
    if self.inner.is_closed() {
      return Err(Errors::DatabaseClosed);
    }
    let base = self.inner.registry.reference_and_get_last_committed();
    Ok(Transaction::new(self.inner.clone(), base, TxMode::ReadWrite))
  }

  pub fn start_read_only_transaction(&self) -> Result<Transaction> {
    if self.inner.is_closed() {
      return Err(Errors::DatabaseClosed);
    }
    let base = self.inner.registry.reference_and_get_last_committed();
    Ok(Transaction::new(self.inner.clone(), base, TxMode::ReadOnly))
  }

  /// Waits until no other writer is active and starts a writable transaction.
  pub fn start_writing_transaction(&self) -> Result<Transaction> {
    self.inner.check_writes_allowed()?;
    self.inner.acquire_writer()?;
    let base = self.inner.registry.reference_and_get_last_committed();
    Ok(Transaction::new(self.inner.clone(), base, TxMode::Writing))
  }

  /// Forces a key index file for the last committed snapshot.
  pub fn create_kvi(&self) -> Result<u32> {
    if self.inner.history_only {
      return Err(Errors::InvalidOperation(
        "database was opened up to a commit ulong and is read only".into(),
      ));
    }
    self.inner.write_kvi()
  }

  /// Runs one compaction pass now. Returns true when files were rewritten,
  /// deleted or a key index was written.
  pub fn compact(&self, token: &CancellationToken) -> Result<bool> {
    self.inner.compact(token)
  }

  /// Asks the background compactor to run after its debounce delay.
  pub fn advise_compaction(&self) {
    self.inner.advise_compaction();
  }

  pub fn calc_stats(&self) -> EngineStats {
    let inner = &self.inner;
    let last = inner.registry.last_committed();
    let oldest = inner.registry.reference_and_get_oldest_root();
    let (trlog_file_id, trlog_offset) = inner.trlog.lock().position();

    let mut files: BTreeMap<String, FileTypeStats> = BTreeMap::new();
    for (file_id, info) in inner.files.file_infos() {
      let size = inner.files.get_file(file_id).map_or(0, |f| f.file_size());
      let stats = files.entry(info.file_type.to_string()).or_default();
      stats.count += 1;
      stats.bytes += size;
    }

    EngineStats {
      key_count: last.key_count(),
      live_roots: inner.registry.live_roots(),
      last_transaction_id: last.transaction_id(),
      oldest_transaction_id: oldest.transaction_id(),
      commit_ulong: last.commit_ulong(),
      trlog_file_id,
      trlog_offset,
      last_key_index: inner.last_kvi.lock().map(|m| m.file_id),
      files,
      disk_size: util::file::dir_disk_size(inner.files.dir_path()),
    }
  }
}

impl Drop for KeyValueDb {
  fn drop(&mut self) {
    if let Some(mut scheduler) = self.scheduler.take() {
      scheduler.stop();
    }
    self.inner.advisor.lock().take();
    if let Err(e) = self.inner.close() {
      error!("failed to close transaction log: {}", e);
    }
    if Arc::strong_count(&self.inner) > 1 {
      warn!("database dropped while transactions are still open");
    }
  }
}
