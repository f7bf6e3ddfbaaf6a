use lazy_static::lazy_static;
use std::{path::PathBuf, sync::Arc, time::Duration};

use crate::{
  compression::{CompressionStrategy, SnappyCompression},
  errors::{Errors, Result},
};

lazy_static! {
  pub static ref DEFAULT_DIR_PATH: PathBuf = std::env::temp_dir().join("snapkv");
}

/// Smallest split size accepted; headers and a handful of records must fit.
const MIN_FILE_SPLIT_SIZE: u64 = 4 * 1024;

#[derive(Debug, Clone)]
pub struct Options {
  pub dir_path: PathBuf,

  /// Maximum size of a transaction log or pure values file before a new one is started.
  pub file_split_size: u64,

  /// Hard flush the transaction log on every commit.
  pub sync_writes: bool,

  /// When `sync_writes` is off, sync the log after this many appended bytes (0 = never).
  pub bytes_per_sync: usize,

  pub io_type: IOManagerType,

  /// Read files through memory maps while recovering.
  pub mmap_at_startup: bool,

  /// Salvage readable prefixes of damaged logs and key index files instead of failing.
  pub lenient_open: bool,

  pub compression: Arc<dyn CompressionStrategy>,

  /// Key index files with fewer keys than this are written uncompressed.
  pub kvi_compression_threshold: u64,

  pub compactor_ram_limit_in_mb: u64,

  pub compactor_read_bytes_per_second: Option<u64>,

  pub compactor_write_bytes_per_second: Option<u64>,

  /// Run the compactor in a background thread owned by the engine.
  pub auto_compaction: bool,

  /// Debounce delay between a compaction request and the actual run.
  pub compactor_wait_time: Duration,

  /// Periodic compaction even without requests.
  pub compactor_interval: Option<Duration>,

  /// Keep the newest key index with commit ulong at or below this value.
  pub preserve_history_up_to_commit_ulong: Option<u64>,

  pub with_collection_guid: bool,

  /// Stop recovery after the last commit whose commit ulong does not exceed this.
  pub open_up_to_commit_ulong: Option<u64>,
}

impl Default for Options {
  fn default() -> Self {
    Self {
      dir_path: DEFAULT_DIR_PATH.clone(),
      file_split_size: 64 * 1024 * 1024, // 64MB
      sync_writes: false,
      bytes_per_sync: 0,
      io_type: IOManagerType::StandardFileIO,
      mmap_at_startup: true,
      lenient_open: false,
      compression: Arc::new(SnappyCompression::default()),
      kvi_compression_threshold: 1000,
      compactor_ram_limit_in_mb: 200,
      compactor_read_bytes_per_second: None,
      compactor_write_bytes_per_second: None,
      auto_compaction: true,
      compactor_wait_time: Duration::from_secs(1),
      compactor_interval: Some(Duration::from_secs(10 * 60)),
      preserve_history_up_to_commit_ulong: None,
      with_collection_guid: true,
      open_up_to_commit_ulong: None,
    }
  }
}

impl Options {
  pub fn validate(&self) -> Result<()> {
    if self.dir_path.as_os_str().is_empty() {
      return Err(Errors::InvalidOptions("dir_path is empty".into()));
    }
    if self.file_split_size < MIN_FILE_SPLIT_SIZE {
      return Err(Errors::InvalidOptions(format!(
        "file_split_size must be at least {MIN_FILE_SPLIT_SIZE}"
      )));
    }
    if self.file_split_size > u32::MAX as u64 {
      return Err(Errors::InvalidOptions(
        "file_split_size must fit into 32 bit offsets".into(),
      ));
    }
    if self.compactor_ram_limit_in_mb == 0 {
      return Err(Errors::InvalidOptions(
        "compactor_ram_limit_in_mb must be positive".into(),
      ));
    }
    if matches!(self.compactor_read_bytes_per_second, Some(0))
      || matches!(self.compactor_write_bytes_per_second, Some(0))
    {
      return Err(Errors::InvalidOptions(
        "compactor rate limits must be positive".into(),
      ));
    }
    Ok(())
  }

  /// Total waste below which the compactor does not move any data.
  pub(crate) fn compactor_waste_threshold(&self) -> u64 {
    self.file_split_size / 4
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IOManagerType {
  StandardFileIO,

  MemoryMap,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_options_are_valid() {
    assert!(Options::default().validate().is_ok());
  }

  #[test]
  fn test_validate_rejects_tiny_split_size() {
    let mut opts = Options::default();
    opts.file_split_size = 100;
    assert!(matches!(opts.validate(), Err(Errors::InvalidOptions(_))));
  }

  #[test]
  fn test_validate_rejects_zero_rate() {
    let mut opts = Options::default();
    opts.compactor_write_bytes_per_second = Some(0);
    assert!(opts.validate().is_err());
  }
}
