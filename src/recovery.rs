use std::{cmp::Reverse, collections::HashMap};

use bytes::Bytes;
use log::{debug, info, warn};

use crate::{
  cursor::UpdateKeySuffixResult,
  data::{
    file_collection::FileCollection,
    file_header::FileInfo,
    key_index::{read_key_index, LoadedKeyIndex},
    trlog::{LogCommand, TrLogReader},
    value_descriptor::{ValueDescriptor, MAX_INLINE_VALUE_LEN},
  },
  db::KeyIndexMark,
  errors::{Errors, Result},
  index::CowTree,
  option::Options,
  root::RootNode,
  transaction::{apply_update_key_suffix, trim_ulongs},
};

/// Where the log writer continues after recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResumePoint {
  /// Start a fresh log linked to `previous_file_id` (0 for an empty chain).
  NewFile { previous_file_id: u32 },
  /// Truncate `file_id` at `offset` and keep appending to it.
  Append { file_id: u32, offset: u64 },
}

impl ResumePoint {
  pub(crate) fn last_file_id(&self) -> u32 {
    match *self {
      ResumePoint::NewFile { previous_file_id } => previous_file_id,
      ResumePoint::Append { file_id, .. } => file_id,
    }
  }
}

pub(crate) struct Recovered {
  pub(crate) root: RootNode,
  pub(crate) resume: ResumePoint,
  pub(crate) key_index: Option<KeyIndexMark>,
  /// Replay stopped at `open_up_to_commit_ulong` before the end of the log.
  pub(crate) history_only: bool,
}

/// Transaction logs linked from the newest one back to the first still present, oldest first.
pub(crate) fn trlog_chain(infos: &[(u32, FileInfo)]) -> Vec<(u32, FileInfo)> {
  let logs: HashMap<u32, &FileInfo> = infos
    .iter()
    .filter(|(_, info)| info.trlog_info().is_some())
    .map(|(id, info)| (*id, info))
    .collect();
  let Some(newest) = logs
    .iter()
    .max_by_key(|(_, info)| info.generation)
    .map(|(id, _)| *id)
  else {
    return Vec::new();
  };

  let mut chain = Vec::new();
  let mut current = newest;
  while let Some(info) = logs.get(&current) {
    chain.push((current, (*info).clone()));
    let previous = info.trlog_info().map_or(0, |t| t.previous_file_id);
    if previous == 0 || chain.len() > logs.len() {
      break;
    }
    current = previous;
  }
  chain.reverse();
  chain
}

/// Chain index and absolute file offset where replay begins.
#[derive(Debug, Clone, Copy)]
struct StartPoint {
  chain_index: usize,
  offset: u64,
}

fn load_key_index(
  files: &FileCollection,
  infos: &[(u32, FileInfo)],
  chain: &[(u32, FileInfo)],
  options: &Options,
) -> Option<(u32, LoadedKeyIndex, StartPoint)> {
  let mut candidates: Vec<&(u32, FileInfo)> = infos
    .iter()
    .filter(|(_, info)| info.file_type.is_key_index())
    .collect();
  candidates.sort_by_key(|(_, info)| Reverse(info.generation));

  let chain_starts_fresh = chain
    .first()
    .map_or(true, |(_, info)| info.trlog_info().map_or(0, |t| t.previous_file_id) == 0);

  for (file_id, info) in candidates {
    let Some(kvi) = info.key_index_info() else {
      continue;
    };
    if let Some(limit) = options.open_up_to_commit_ulong {
      if kvi.commit_ulong > limit {
        debug!("key index {file_id} is newer than commit ulong {limit}");
        continue;
      }
    }
    let start = if kvi.trlog_file_id == 0 {
      if !chain_starts_fresh {
        warn!("key index {file_id} predates the oldest transaction log, skipping it");
        continue;
      }
      StartPoint {
        chain_index: 0,
        offset: 0,
      }
    } else {
      match chain.iter().position(|(id, _)| *id == kvi.trlog_file_id) {
        Some(chain_index) => StartPoint {
          chain_index,
          offset: kvi.trlog_offset as u64,
        },
        None => {
          warn!(
            "key index {file_id} refers to transaction log {} outside the log chain, skipping it",
            kvi.trlog_file_id
          );
          continue;
        }
      }
    };
    if let Some(missing) = kvi.used_files.iter().find(|id| files.get_file(**id).is_none()) {
      warn!("key index {file_id} needs missing value file {missing}, skipping it");
      continue;
    }
    let Some(file) = files.get_file(*file_id) else {
      continue;
    };
    match read_key_index(*file_id, &file, info, options.lenient_open) {
      Ok(loaded) => return Some((*file_id, loaded, start)),
      Err(e) => warn!("failed to load key index {file_id}: {e}"),
    }
  }
  None
}

#[derive(Clone, Default)]
struct ReplayRoot {
  tree: CowTree,
  commit_ulong: u64,
  ulongs: Vec<u64>,
}

enum Step {
  Continue,
  /// A transaction finished; everything before this point is consistent.
  Boundary,
  EndOfFile,
  Closed,
  Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileEnd {
  EndOfFile,
  Closed,
  /// Data ended without a marker: crash, truncated tail or skipped damage.
  Open,
  /// Reached a commit past `open_up_to_commit_ulong`.
  Stopped,
}

struct Replay<'a> {
  options: &'a Options,
  committed: ReplayRoot,
  pending: Option<ReplayRoot>,
  transaction_id: u64,
}

impl<'a> Replay<'a> {
  fn new(options: &'a Options, committed: ReplayRoot, transaction_id: u64) -> Self {
    Replay {
      options,
      committed,
      pending: None,
      transaction_id,
    }
  }

  /// Replays one log body starting at absolute offset `body_start`.
  /// Returns how it ended and the offset right after its last finished transaction.
  fn replay_file(&mut self, file_id: u32, body_start: u64, data: &[u8]) -> Result<(FileEnd, u64)> {
    let mut reader = TrLogReader::new(data, self.options.compression.as_ref());
    let mut safe_end = body_start;
    loop {
      let (pos, command) = match reader.next_record() {
        Ok(Some(record)) => record,
        Ok(None) => return Ok((FileEnd::Open, safe_end)),
        Err(Errors::CorruptedTransactionLog { offset, reason, .. }) => {
          let offset = body_start + offset;
          if !self.options.lenient_open {
            return Err(Errors::CorruptedTransactionLog {
              file_id,
              offset,
              reason,
            });
          }
          warn!("transaction log {file_id} is damaged at {offset} ({reason}), ignoring the rest");
          return Ok((FileEnd::Open, safe_end));
        }
        Err(e) => return Err(e),
      };

      let record_offset = body_start + pos as u64;
      match self.apply(file_id, record_offset, command) {
        Ok(Step::Continue) => {}
        Ok(Step::Boundary) => safe_end = body_start + reader.position() as u64,
        Ok(Step::EndOfFile) => return Ok((FileEnd::EndOfFile, safe_end)),
        Ok(Step::Closed) => return Ok((FileEnd::Closed, safe_end)),
        Ok(Step::Stop) => return Ok((FileEnd::Stopped, safe_end)),
        Err(e) if self.options.lenient_open => {
          warn!("dropping transaction with damaged record at {file_id}:{record_offset}: {e}");
          self.pending = None;
        }
        Err(e) => return Err(e),
      }
    }
  }

  fn apply(&mut self, file_id: u32, record_offset: u64, command: LogCommand) -> Result<Step> {
    let damaged = |reason: &str| Errors::CorruptedTransactionLog {
      file_id,
      offset: record_offset,
      reason: reason.to_string(),
    };
    match command {
      LogCommand::TransactionStart => {
        if self.pending.is_some() {
          debug!("unfinished transaction replaced at {file_id}:{record_offset}");
        }
        self.pending = Some(self.committed.clone());
        Ok(Step::Continue)
      }
      LogCommand::Commit | LogCommand::CommitWithDeltaUlong { .. } => {
        let Some(mut next) = self.pending.take() else {
          return Err(damaged("commit outside of a transaction"));
        };
        if let LogCommand::CommitWithDeltaUlong { delta } = command {
          next.commit_ulong = next.commit_ulong.wrapping_add(delta);
        }
        if let Some(limit) = self.options.open_up_to_commit_ulong {
          if next.commit_ulong > limit {
            info!("stopping replay at commit ulong {} above {limit}", next.commit_ulong);
            return Ok(Step::Stop);
          }
        }
        trim_ulongs(&mut next.ulongs);
        self.committed = next;
        self.transaction_id += 1;
        Ok(Step::Boundary)
      }
      LogCommand::Rollback => {
        self.pending = None;
        Ok(Step::Boundary)
      }
      LogCommand::EndOfFile => Ok(Step::EndOfFile),
      LogCommand::TemporaryEndOfFile => Ok(Step::Closed),
      mutation => {
        let Some(next) = self.pending.as_mut() else {
          return Err(damaged("change outside of a transaction"));
        };
        apply_mutation(next, file_id, record_offset, mutation).map_err(|reason| damaged(reason))?;
        Ok(Step::Continue)
      }
    }
  }
}

fn apply_mutation(
  root: &mut ReplayRoot,
  file_id: u32,
  record_offset: u64,
  command: LogCommand,
) -> std::result::Result<(), &'static str> {
  match command {
    LogCommand::CreateOrUpdate {
      key,
      value,
      value_compressed,
      value_pos,
    } => {
      let descriptor = match ValueDescriptor::inline(&value) {
        Some(inline) if !value_compressed && value.len() <= MAX_INLINE_VALUE_LEN => inline,
        _ => {
          let offset = u32::try_from(record_offset + value_pos as u64)
            .map_err(|_| "value offset does not fit 32 bits")?;
          ValueDescriptor::stored(file_id, offset, value.len(), value_compressed)
            .map_err(|_| "value too large for a descriptor")?
        }
      };
      root.tree.upsert(Bytes::from(key), descriptor);
    }
    LogCommand::UpdateKeySuffix { prefix_len, key } => {
      if prefix_len > key.len() {
        return Err("key suffix prefix longer than the key");
      }
      let (result, _) = apply_update_key_suffix(&mut root.tree, &key, prefix_len);
      if !matches!(
        result,
        UpdateKeySuffixResult::Updated | UpdateKeySuffixResult::NothingToDo
      ) {
        return Err("key suffix update does not match a unique key");
      }
    }
    LogCommand::EraseOne { key } => {
      let rank = root.tree.find_rank(&key).ok_or("erased key does not exist")?;
      root.tree.remove_at(rank);
    }
    LogCommand::EraseRange {
      first_key,
      last_key,
    } => {
      let first = root.tree.find_rank(&first_key).ok_or("range start does not exist")?;
      let last = root.tree.find_rank(&last_key).ok_or("range end does not exist")?;
      if first > last {
        return Err("range ends before it starts");
      }
      root.tree.remove_range(first, last);
    }
    LogCommand::DeltaUlongs { index, delta } => {
      let index = index as usize;
      if root.ulongs.len() <= index {
        root.ulongs.resize(index + 1, 0);
      }
      root.ulongs[index] = root.ulongs[index].wrapping_add(delta);
    }
    _ => return Err("not a change record"),
  }
  Ok(())
}

/// Rebuilds the last committed state from the newest usable key index and
/// the transaction logs written after it.
pub(crate) fn recover(files: &FileCollection, options: &Options) -> Result<Recovered> {
  let infos = files.file_infos();
  let chain = trlog_chain(&infos);

  let (mut replay, start, key_index) = match load_key_index(files, &infos, &chain, options) {
    Some((file_id, loaded, start)) => {
      info!(
        "loaded key index {} with {} keys at commit ulong {}",
        file_id,
        loaded.tree.len(),
        loaded.info.commit_ulong
      );
      let mark = KeyIndexMark {
        file_id,
        transaction_id: loaded.info.transaction_id,
        trlog_file_id: loaded.info.trlog_file_id,
        trlog_offset: loaded.info.trlog_offset as u64,
      };
      let committed = ReplayRoot {
        tree: loaded.tree,
        commit_ulong: loaded.info.commit_ulong,
        ulongs: loaded.info.ulongs,
      };
      (Replay::new(options, committed, mark.transaction_id), start, Some(mark))
    }
    None => {
      if let Some((first, info)) = chain.first() {
        let previous = info.trlog_info().map_or(0, |t| t.previous_file_id);
        if previous != 0 {
          let msg = format!(
            "transaction log {first} continues missing log {previous} and no key index covers the gap"
          );
          if !options.lenient_open {
            return Err(Errors::UnrecoverableDatabase(msg));
          }
          warn!("{msg}, replaying what is left");
        }
      }
      let start = StartPoint {
        chain_index: 0,
        offset: 0,
      };
      (Replay::new(options, ReplayRoot::default(), 0), start, None)
    }
  };

  let mut position = key_index.map_or((0, 0), |m| (m.trlog_file_id, m.trlog_offset));
  let mut resume = ResumePoint::NewFile {
    previous_file_id: chain.last().map_or(0, |(id, _)| *id),
  };
  let mut history_only = false;

  for (index, (file_id, info)) in chain.iter().enumerate().skip(start.chain_index) {
    let file_id = *file_id;
    let is_last = index + 1 == chain.len();
    let file = files.get_file(file_id).ok_or_else(|| {
      Errors::UnrecoverableDatabase(format!("transaction log {file_id} disappeared"))
    })?;
    let body_start = if index == start.chain_index {
      start.offset.max(info.header_len)
    } else {
      info.header_len
    };
    let data = file.read_to_end(body_start)?;
    let (end, safe_end) = replay.replay_file(file_id, body_start, &data)?;
    position = (file_id, safe_end);
    debug!("replayed transaction log {file_id} up to {safe_end} ({end:?})");

    match end {
      FileEnd::Stopped => {
        history_only = true;
        break;
      }
      FileEnd::EndOfFile if is_last => {
        replay.pending = None;
        resume = ResumePoint::NewFile {
          previous_file_id: file_id,
        };
      }
      FileEnd::EndOfFile => {}
      _ if is_last => {
        replay.pending = None;
        resume = ResumePoint::Append {
          file_id,
          offset: safe_end,
        };
      }
      FileEnd::Closed => replay.pending = None,
      FileEnd::Open => {
        if !options.lenient_open {
          return Err(Errors::CorruptedTransactionLog {
            file_id,
            offset: safe_end,
            reason: "log ends before its end-of-file marker".into(),
          });
        }
        warn!("transaction log {file_id} ends without a marker, dropping its unfinished transaction");
        replay.pending = None;
      }
    }
  }

  let ReplayRoot {
    tree,
    commit_ulong,
    mut ulongs,
  } = replay.committed;
  trim_ulongs(&mut ulongs);
  info!(
    "recovered {} keys after replaying {} transactions",
    tree.len(),
    replay.transaction_id - key_index.map_or(0, |m| m.transaction_id)
  );
  Ok(Recovered {
    root: RootNode::new(tree, replay.transaction_id, commit_ulong, ulongs, position),
    resume,
    key_index,
    history_only,
  })
}
