use std::{
  collections::{HashMap, HashSet},
  fs::{self, File, OpenOptions},
  path::{Path, PathBuf},
  sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc,
  },
};

use crossbeam_skiplist::SkipMap;
use fs2::FileExt;
use log::{debug, error, info, warn};
use parking_lot::RwLock;

use crate::{
  data::{
    data_file::{get_data_file_name, parse_data_file_name, DataFile},
    file_header::{FileDetail, FileInfo, FileType},
  },
  errors::{Errors, Result},
  option::{IOManagerType, Options},
};

pub const FILE_LOCK_NAME: &str = "snapkv.lock";

/// Numbered files of one database directory together with their decoded headers.
pub struct FileCollection {
  dir_path: PathBuf,
  guid: Option<u128>,
  files: RwLock<HashMap<u32, Arc<DataFile>>>,
  infos: SkipMap<u32, FileInfo>,
  next_file_id: AtomicU32,
  next_generation: AtomicU64,
  lock_file: File,
}

impl FileCollection {
  pub fn open(options: &Options) -> Result<Self> {
    let dir_path = options.dir_path.clone();
    if !dir_path.is_dir() {
      if let Err(e) = fs::create_dir_all(&dir_path) {
        error!("create database directory err: {}", e);
        return Err(Errors::FailedToCreateDatabaseDir);
      }
    }

    let lock_file = match OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(dir_path.join(FILE_LOCK_NAME))
    {
      Ok(file) => file,
      Err(e) => {
        error!("failed to open lock file: {}", e);
        return Err(Errors::FailedToOpenDataFile);
      }
    };
    if lock_file.try_lock_exclusive().is_err() {
      return Err(Errors::DatabaseIsUsing);
    }

    let io_type = if options.mmap_at_startup {
      IOManagerType::MemoryMap
    } else {
      options.io_type
    };

    let mut files = HashMap::new();
    let mut decoded = Vec::new();
    for file_id in list_file_ids(&dir_path)? {
      let data_file = DataFile::new(&dir_path, file_id, io_type)?;
      let header = read_header(&data_file);
      if let Err(e) = &header {
        warn!("file {file_id} has an unreadable header and is marked unknown: {e}");
      }
      decoded.push((file_id, header.ok()));
      files.insert(file_id, Arc::new(data_file));
    }

    let guid = if options.with_collection_guid {
      let existing = decoded
        .iter()
        .filter_map(|(_, h)| h.as_ref())
        .filter(|(_, guid)| guid.is_some())
        .max_by_key(|(info, _)| info.generation)
        .and_then(|(_, guid)| *guid);
      Some(existing.unwrap_or_else(rand::random::<u128>))
    } else {
      None
    };

    let infos = SkipMap::new();
    let mut max_generation = 0;
    let mut max_file_id = 0;
    for (file_id, header) in decoded {
      max_file_id = max_file_id.max(file_id);
      let info = match header {
        Some((info, file_guid)) => {
          max_generation = max_generation.max(info.generation);
          if guid.is_some() && file_guid.is_some() && file_guid != guid {
            warn!("file {file_id} belongs to another collection and is marked unknown");
            let mut info = info;
            info.mark_unknown();
            info
          } else {
            info
          }
        }
        None => FileInfo::unknown(),
      };
      infos.insert(file_id, info);
    }

    let collection = FileCollection {
      dir_path,
      guid,
      files: RwLock::new(files),
      infos,
      next_file_id: AtomicU32::new(max_file_id + 1),
      next_generation: AtomicU64::new(max_generation + 1),
      lock_file,
    };
    collection.link_trlog_chain();
    debug!(
      "opened file collection at {:?} with {} files",
      collection.dir_path,
      collection.infos.len()
    );
    Ok(collection)
  }

  fn link_trlog_chain(&self) {
    let links: Vec<(u32, u32)> = self
      .infos
      .iter()
      .filter_map(|e| {
        e.value()
          .trlog_info()
          .map(|t| (t.previous_file_id, *e.key()))
      })
      .filter(|(previous, _)| *previous != 0)
      .collect();
    for (previous, next) in links {
      self.update_info(previous, |info| {
        if let FileDetail::TransactionLog(t) = &mut info.detail {
          t.next_file_id = Some(next);
        }
      });
    }
  }

  pub fn dir_path(&self) -> &Path {
    &self.dir_path
  }

  pub fn guid(&self) -> Option<u128> {
    self.guid
  }

  /// Reopens every file with the given I/O backend, used once recovery is done.
  pub fn reset_io_type(&self, io_type: IOManagerType) -> Result<()> {
    let mut files = self.files.write();
    for (file_id, data_file) in files.iter_mut() {
      *data_file = Arc::new(DataFile::new(&self.dir_path, *file_id, io_type)?);
    }
    Ok(())
  }

  /// Creates the next numbered file, assigns it the next generation and writes its header.
  pub fn create_file(&self, mut info: FileInfo) -> Result<(u32, Arc<DataFile>)> {
    let file_id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
    info.generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
    let header = info.encode_header(self.guid);
    info.header_len = header.len() as u64;

    let data_file = Arc::new(DataFile::new(
      &self.dir_path,
      file_id,
      IOManagerType::StandardFileIO,
    )?);
    data_file.append(&header)?;

    if let Some(previous) = info.trlog_info().map(|t| t.previous_file_id) {
      if previous != 0 {
        self.update_info(previous, |prev| {
          if let FileDetail::TransactionLog(t) = &mut prev.detail {
            t.next_file_id = Some(file_id);
          }
        });
      }
    }

    info!(
      "created {} file {} (generation {})",
      info.file_type, file_id, info.generation
    );
    self.infos.insert(file_id, info);
    self.files.write().insert(file_id, data_file.clone());
    Ok((file_id, data_file))
  }

  pub fn get_file(&self, file_id: u32) -> Option<Arc<DataFile>> {
    self.files.read().get(&file_id).cloned()
  }

  pub fn file_info(&self, file_id: u32) -> Option<FileInfo> {
    self.infos.get(&file_id).map(|e| e.value().clone())
  }

  pub fn generation(&self, file_id: u32) -> Option<u64> {
    self.infos.get(&file_id).map(|e| e.value().generation)
  }

  /// Snapshot of all registered files ordered by id.
  pub fn file_infos(&self) -> Vec<(u32, FileInfo)> {
    self
      .infos
      .iter()
      .map(|e| (*e.key(), e.value().clone()))
      .collect()
  }

  /// Replaces the entry of `file_id` with an updated copy.
  pub fn update_info<F>(&self, file_id: u32, f: F)
  where
    F: FnOnce(&mut FileInfo),
  {
    if let Some(entry) = self.infos.get(&file_id) {
      let mut info = entry.value().clone();
      f(&mut info);
      self.infos.insert(file_id, info);
    }
  }

  pub fn make_unknown(&self, file_id: u32) {
    self.update_info(file_id, |info| info.mark_unknown());
  }

  /// Physically removes every file flagged `Unknown` except those in `keep`.
  pub fn delete_all_unknown_files(&self, keep: &HashSet<u32>) -> Result<Vec<u32>> {
    let unknown: Vec<u32> = self
      .infos
      .iter()
      .filter(|e| e.value().file_type == FileType::Unknown && !keep.contains(e.key()))
      .map(|e| *e.key())
      .collect();
    for file_id in unknown.iter() {
      self.delete_file(*file_id)?;
    }
    Ok(unknown)
  }

  /// Forgets `file_id` and removes it from disk. Readers holding the file keep their handle.
  pub fn delete_file(&self, file_id: u32) -> Result<()> {
    self.files.write().remove(&file_id);
    self.infos.remove(&file_id);
    let path = get_data_file_name(&self.dir_path, file_id);
    if let Err(e) = fs::remove_file(&path) {
      error!("failed to remove file {:?}: {}", path, e);
      return Err(Errors::FailedToRemoveDataFile);
    }
    info!("deleted file {}", file_id);
    Ok(())
  }

  pub fn sync_dir(&self) -> Result<()> {
    match File::open(&self.dir_path).and_then(|dir| dir.sync_all()) {
      Ok(()) => Ok(()),
      Err(e) => {
        error!("failed to sync database directory: {}", e);
        Err(Errors::FailedToSyncDataFile)
      }
    }
  }
}

impl Drop for FileCollection {
  fn drop(&mut self) {
    if let Err(e) = FileExt::unlock(&self.lock_file) {
      error!("failed to unlock database directory: {}", e);
    }
  }
}

fn list_file_ids(dir_path: &Path) -> Result<Vec<u32>> {
  let dir = match fs::read_dir(dir_path) {
    Ok(dir) => dir,
    Err(e) => {
      error!("failed to read database directory: {}", e);
      return Err(Errors::FailedToReadDatabaseDir);
    }
  };
  let mut ids: Vec<u32> = dir
    .flatten()
    .filter_map(|entry| entry.file_name().to_str().and_then(parse_data_file_name))
    .filter(|id| *id != 0)
    .collect();
  ids.sort_unstable();
  Ok(ids)
}

fn read_header(data_file: &DataFile) -> Result<(FileInfo, Option<u128>)> {
  let file_id = data_file.get_file_id();
  let size = data_file.file_size();
  let prefix = data_file.read_vec(0, FileInfo::header_prefix_len(size))?;
  let header_len = FileInfo::header_len_from_prefix(file_id, &prefix)?;
  if header_len as u64 > size {
    return Err(Errors::corrupted_file(file_id, "truncated header"));
  }
  FileInfo::decode_header(file_id, &data_file.read_vec(0, header_len)?)
}
