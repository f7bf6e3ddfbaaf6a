use std::{
  cmp::Reverse,
  collections::{HashMap, HashSet},
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  thread,
  time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::{
  data::{
    data_file::DataFile,
    file_header::FileInfo,
    value_descriptor::ValueDescriptor,
  },
  db::DbInner,
  errors::{Errors, Result},
  recovery::trlog_chain,
  root::{RootNode, RootRef},
  util,
};

/// Longest single sleep of a rate limiter, so cancellation is noticed quickly.
const RATE_LIMIT_TICK: Duration = Duration::from_millis(100);

/// Cooperative cancellation flag shared with a running compaction.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

/// Throttles the bytes moved by the compactor to a steady rate.
struct RateLimiter {
  bytes_per_second: Option<u64>,
  started: Instant,
  consumed: u64,
}

impl RateLimiter {
  fn new(bytes_per_second: Option<u64>) -> Self {
    RateLimiter {
      bytes_per_second,
      started: Instant::now(),
      consumed: 0,
    }
  }

  /// Accounts `bytes`, sleeping while ahead of schedule. False when cancelled.
  fn consume(&mut self, bytes: u64, token: &CancellationToken) -> bool {
    let Some(limit) = self.bytes_per_second else {
      return !token.is_cancelled();
    };
    self.consumed += bytes;
    let due = Duration::from_secs_f64(self.consumed as f64 / limit as f64);
    loop {
      if token.is_cancelled() {
        return false;
      }
      let elapsed = self.started.elapsed();
      if elapsed >= due {
        return true;
      }
      thread::sleep((due - elapsed).min(RATE_LIMIT_TICK));
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct FileStat {
  total_len: u64,
  live_len: u64,
  forbid_to_delete: bool,
}

impl FileStat {
  fn waste(&self) -> u64 {
    self.total_len.saturating_sub(self.live_len)
  }

  fn is_useless(&self) -> bool {
    self.live_len == 0 && !self.forbid_to_delete
  }
}

/// Files emptied by a relocation, deleted once every transaction that could
/// still read them has finished.
#[derive(Debug, Clone)]
pub(crate) struct PendingDelete {
  file_ids: Vec<u32>,
  transaction_id: u64,
}

struct Usefulness {
  stats: HashMap<u32, FileStat>,
  /// Every file a live root or a protected key index points into.
  referenced: HashSet<u32>,
}

/// Values copied out of the selected files, keyed by their old location.
type Remap = HashMap<(u32, u32), ValueDescriptor>;

impl DbInner {
  /// One full compaction pass. Returns true when anything changed on disk.
  pub(crate) fn compact(&self, token: &CancellationToken) -> Result<bool> {
    if self.history_only || self.is_closed() {
      return Ok(false);
    }
    let Some(_running) = self.compaction_lock.try_lock() else {
      debug!("compaction already running");
      return Ok(false);
    };

    let mut worked = self.delete_finished_files()?;
    let mut read_limiter = RateLimiter::new(self.options.compactor_read_bytes_per_second);
    let mut write_limiter = RateLimiter::new(self.options.compactor_write_bytes_per_second);
    let threshold = self.options.compactor_waste_threshold();

    loop {
      if token.is_cancelled() {
        info!("compaction cancelled");
        break;
      }
      let mut usefulness = self.calculate_file_usefulness();
      worked |= self.delete_useless_files(&mut usefulness)?;

      let total_waste: u64 = usefulness.stats.values().map(FileStat::waste).sum();
      if total_waste < threshold {
        if self.key_index_is_stale() {
          self.write_kvi()?;
          worked = true;
        }
        break;
      }

      let selected = self.select_files(&usefulness.stats);
      if selected.is_empty() {
        debug!("waste of {total_waste} bytes is not reclaimable yet");
        break;
      }
      let live: u64 = selected
        .iter()
        .filter_map(|id| usefulness.stats.get(id))
        .map(|s| s.live_len)
        .sum();
      let available = util::file::available_disk_space(self.files.dir_path());
      if live > available {
        warn!("not enough disk space to move {live} bytes, compaction skipped");
        break;
      }

      info!(
        "compacting files {:?} ({} live bytes, {} total waste)",
        selected, live, total_waste
      );
      let Some(remap) = self.relocate(&selected, &mut read_limiter, &mut write_limiter, token)?
      else {
        break;
      };
      let Some(transaction_id) = self.apply_remap(&remap, token)? else {
        break;
      };
      self.pending_deletes.lock().push(PendingDelete {
        file_ids: selected,
        transaction_id,
      });
      worked = true;
    }

    worked |= self.delete_finished_files()?;
    worked |= self.delete_obsolete_key_indexes()?;
    Ok(worked)
  }

  /// Newest key index whose commit ulong is still inside the preserved history.
  fn pinned_key_index(&self, infos: &[(u32, FileInfo)]) -> Option<u32> {
    let limit = self.options.preserve_history_up_to_commit_ulong?;
    infos
      .iter()
      .filter(|(_, info)| {
        info
          .key_index_info()
          .is_some_and(|kvi| kvi.commit_ulong <= limit)
      })
      .max_by_key(|(_, info)| info.generation)
      .map(|(id, _)| *id)
  }

  /// Files recovery needs: the latest key index with its value files and the
  /// logs after it, plus the pinned key index with its files.
  fn protected_files(&self, infos: &[(u32, FileInfo)]) -> HashSet<u32> {
    let mut protected = HashSet::new();
    let chain = trlog_chain(infos);
    let info_of = |file_id: u32| {
      infos
        .iter()
        .find(|(id, _)| *id == file_id)
        .and_then(|(_, info)| info.key_index_info())
    };

    let latest = self.last_kvi.lock().map(|mark| mark.file_id);
    match latest.and_then(|id| info_of(id).map(|kvi| (id, kvi))) {
      Some((file_id, kvi)) => {
        protected.insert(file_id);
        protected.extend(kvi.used_files.iter().copied());
        let start = chain
          .iter()
          .position(|(id, _)| *id == kvi.trlog_file_id)
          .unwrap_or(0);
        protected.extend(chain[start..].iter().map(|(id, _)| *id));
      }
      None => protected.extend(chain.iter().map(|(id, _)| *id)),
    }

    if let Some(pinned) = self.pinned_key_index(infos) {
      protected.insert(pinned);
      if let Some(kvi) = info_of(pinned) {
        protected.extend(kvi.used_files.iter().copied());
        protected.insert(kvi.trlog_file_id);
      }
    }
    protected
  }

  /// Files of this generation or newer may still be written or needed for history.
  fn dont_touch_generation(&self, oldest: &RootNode, infos: &[(u32, FileInfo)]) -> u64 {
    let mut floor = self.files.generation(oldest.trlog_file_id).unwrap_or(u64::MAX);
    if let Some(generation) = self
      .pinned_key_index(infos)
      .and_then(|id| self.files.generation(id))
    {
      floor = floor.min(generation);
    }
    floor
  }

  fn calculate_file_usefulness(&self) -> Usefulness {
    let infos = self.files.file_infos();
    let oldest = self.registry.reference_and_get_oldest_root();
    let last = self.registry.reference_and_get_last_committed();
    let floor = self.dont_touch_generation(&oldest, &infos);
    let protected = self.protected_files(&infos);
    let pending: HashSet<u32> = self
      .pending_deletes
      .lock()
      .iter()
      .flat_map(|p| p.file_ids.iter().copied())
      .collect();

    let mut stats = HashMap::new();
    for (file_id, info) in &infos {
      if !info.file_type.holds_values() || info.generation >= floor || pending.contains(file_id) {
        continue;
      }
      let size = self.files.get_file(*file_id).map_or(0, |f| f.file_size());
      stats.insert(
        *file_id,
        FileStat {
          total_len: size.saturating_sub(info.header_len),
          live_len: 0,
          forbid_to_delete: protected.contains(file_id),
        },
      );
    }

    let mut referenced = protected;
    for (_, value) in last.tree.iter() {
      let file_id = value.file_id();
      if file_id == 0 {
        continue;
      }
      referenced.insert(file_id);
      if let Some(stat) = stats.get_mut(&file_id) {
        stat.live_len += value.stored_len();
      }
    }
    if !Arc::ptr_eq(oldest.arc(), last.arc()) {
      for (_, value) in oldest.tree.iter() {
        let file_id = value.file_id();
        if file_id == 0 {
          continue;
        }
        referenced.insert(file_id);
        if let Some(stat) = stats.get_mut(&file_id) {
          stat.forbid_to_delete = true;
        }
      }
    }
    Usefulness { stats, referenced }
  }

  /// Deletes value files nothing points into and unknown files nothing references.
  fn delete_useless_files(&self, usefulness: &mut Usefulness) -> Result<bool> {
    let useless: Vec<u32> = usefulness
      .stats
      .iter()
      .filter(|(_, stat)| stat.is_useless())
      .map(|(id, _)| *id)
      .collect();
    for file_id in &useless {
      usefulness.stats.remove(file_id);
      usefulness.referenced.remove(file_id);
      self.files.make_unknown(*file_id);
      debug!("file {file_id} holds no live values");
    }
    let deleted = self.files.delete_all_unknown_files(&usefulness.referenced)?;
    Ok(!deleted.is_empty())
  }

  /// Bytes of log written since the latest key index.
  fn log_distance_since_key_index(&self) -> u64 {
    let last = self.registry.last_committed();
    let (from_file, from_offset) = match *self.last_kvi.lock() {
      Some(mark) if mark.transaction_id == last.transaction_id => return 0,
      Some(mark) => (mark.trlog_file_id, mark.trlog_offset),
      None => (0, 0),
    };

    let mut distance = 0;
    let mut started = from_file == 0;
    for (file_id, info) in trlog_chain(&self.files.file_infos()) {
      started |= file_id == from_file;
      if !started {
        continue;
      }
      let begin = if file_id == from_file {
        from_offset.max(info.header_len)
      } else {
        info.header_len
      };
      let end = if file_id == last.trlog_file_id {
        last.trlog_offset
      } else {
        self.files.get_file(file_id).map_or(0, |f| f.file_size())
      };
      distance += end.saturating_sub(begin);
      if file_id == last.trlog_file_id {
        break;
      }
    }
    distance
  }

  fn key_index_is_stale(&self) -> bool {
    self.log_distance_since_key_index() > self.options.compactor_waste_threshold()
  }

  /// Most wasteful files first, as many as fit the RAM budget.
  fn select_files(&self, stats: &HashMap<u32, FileStat>) -> Vec<u32> {
    let budget = self.options.compactor_ram_limit_in_mb * 1024 * 1024;
    let mut candidates: Vec<(u32, FileStat)> = stats
      .iter()
      .filter(|(_, stat)| stat.live_len > 0 && stat.waste() > 0)
      .map(|(id, stat)| (*id, *stat))
      .collect();
    candidates.sort_by_key(|(id, stat)| (Reverse(stat.waste()), *id));

    let mut selected = Vec::new();
    let mut total = 0;
    for (file_id, stat) in candidates {
      if !selected.is_empty() && total + stat.live_len > budget {
        continue;
      }
      total += stat.live_len;
      selected.push(file_id);
      if total >= budget {
        break;
      }
    }
    selected
  }

  /// Copies the live values of `selected` into fresh value files.
  /// Returns `None` when cancelled; partial output is removed again.
  fn relocate(
    &self,
    selected: &[u32],
    read_limiter: &mut RateLimiter,
    write_limiter: &mut RateLimiter,
    token: &CancellationToken,
  ) -> Result<Option<Remap>> {
    let selected: HashSet<u32> = selected.iter().copied().collect();
    let mut values: Vec<(u32, u32, i32)> = {
      let last = self.registry.reference_and_get_last_committed();
      last
        .tree
        .iter()
        .filter_map(|(_, value)| match *value {
          ValueDescriptor::Stored {
            file_id,
            offset,
            size,
          } if selected.contains(&file_id) => Some((file_id, offset, size)),
          _ => None,
        })
        .collect()
    };
    values.sort_unstable();
    values.dedup();

    let compaction_id = self.next_compaction_id.fetch_add(1, Ordering::SeqCst);
    let mut created: Vec<u32> = Vec::new();
    let mut target: Option<(u32, Arc<DataFile>, u64)> = None;
    let mut remap = Remap::new();

    for (file_id, offset, size) in values {
      let len = size.unsigned_abs() as u64;
      if !read_limiter.consume(len, token) {
        self.discard_files(&created)?;
        return Ok(None);
      }
      let source = self.files.get_file(file_id).ok_or_else(|| {
        Errors::corrupted_file(file_id, "value file vanished during compaction")
      })?;
      let bytes = source.read_vec(offset as u64, len as usize)?;

      let full = target
        .as_ref()
        .is_some_and(|(_, _, used)| *used > 0 && used + len > self.options.file_split_size);
      if full || target.is_none() {
        if let Some((_, file, _)) = target.take() {
          file.sync()?;
        }
        let (id, file) = self.files.create_file(FileInfo::pure_values(compaction_id))?;
        created.push(id);
        target = Some((id, file, 0));
      }
      let Some((target_id, file, used)) = target.as_mut() else {
        continue;
      };

      if !write_limiter.consume(len, token) {
        self.discard_files(&created)?;
        return Ok(None);
      }
      let new_offset = file.append(&bytes)?;
      *used += len;
      remap.insert(
        (file_id, offset),
        ValueDescriptor::Stored {
          file_id: *target_id,
          offset: new_offset as u32,
          size,
        },
      );
    }
    if let Some((_, file, _)) = target {
      file.sync()?;
    }
    debug!("relocated {} values into files {:?}", remap.len(), created);
    Ok(Some(remap))
  }

  fn discard_files(&self, file_ids: &[u32]) -> Result<()> {
    for file_id in file_ids {
      self.files.delete_file(*file_id)?;
    }
    Ok(())
  }

  /// Points every relocated value at its copy in a commit of its own and
  /// writes a key index for it. Returns the id of that commit.
  fn apply_remap(&self, remap: &Remap, token: &CancellationToken) -> Result<Option<u64>> {
    if !self.acquire_writer_or_cancel(token)? {
      return Ok(None);
    }
    let result = self.commit_remap(remap);
    self.release_writer();
    result.map(Some)
  }

  fn commit_remap(&self, remap: &Remap) -> Result<u64> {
    let base: RootRef = self.registry.reference_and_get_last_committed();
    let updates: Vec<(usize, ValueDescriptor)> = base
      .tree
      .iter()
      .enumerate()
      .filter_map(|(rank, (_, value))| match *value {
        ValueDescriptor::Stored {
          file_id, offset, ..
        } => remap.get(&(file_id, offset)).map(|new| (rank, *new)),
        ValueDescriptor::Inline { .. } => None,
      })
      .collect();

    let mut tree = base.tree.clone();
    for (rank, value) in &updates {
      tree.set_value_at(*rank, *value);
    }
    let transaction_id = base.transaction_id + 1;
    self.publish(RootNode::new(
      tree,
      transaction_id,
      base.commit_ulong,
      base.ulongs.clone(),
      (base.trlog_file_id, base.trlog_offset),
    ));
    drop(base);
    let kvi = self.write_kvi()?;
    info!(
      "moved {} values, key index {} written for transaction {}",
      updates.len(),
      kvi,
      transaction_id
    );
    Ok(transaction_id)
  }

  fn delete_finished_files(&self) -> Result<bool> {
    let protected = self.protected_files(&self.files.file_infos());
    let ready: Vec<u32> = {
      let mut pending = self.pending_deletes.lock();
      let mut ready = Vec::new();
      pending.retain(|p| {
        let done = self.registry.all_transactions_before_finished(p.transaction_id)
          && p.file_ids.iter().all(|id| !protected.contains(id));
        if done {
          ready.extend(p.file_ids.iter().copied());
        }
        !done
      });
      ready
    };
    for file_id in &ready {
      self.files.delete_file(*file_id)?;
    }
    Ok(!ready.is_empty())
  }

  /// Removes key indexes superseded by the latest one, keeping the pinned one.
  fn delete_obsolete_key_indexes(&self) -> Result<bool> {
    let infos = self.files.file_infos();
    let Some(latest) = self.last_kvi.lock().map(|mark| mark.file_id) else {
      return Ok(false);
    };
    let latest_generation = self.files.generation(latest).unwrap_or(0);
    let pinned = self.pinned_key_index(&infos);
    let obsolete: Vec<u32> = infos
      .iter()
      .filter(|(id, info)| {
        info.file_type.is_key_index()
          && *id != latest
          && Some(*id) != pinned
          && info.generation < latest_generation
      })
      .map(|(id, _)| *id)
      .collect();
    for file_id in &obsolete {
      self.files.delete_file(*file_id)?;
    }
    Ok(!obsolete.is_empty())
  }
}
