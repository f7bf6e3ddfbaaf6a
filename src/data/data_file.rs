use std::{
  path::{Path, PathBuf},
  sync::atomic::{AtomicU64, Ordering},
};

use crate::{
  errors::Result,
  fio::{new_io_manager, IOManager},
  option::IOManagerType,
};

pub const DATA_FILE_NAME_SUFFIX: &str = ".data";

/// One numbered file of the collection.
pub struct DataFile {
  file_id: u32,
  write_off: AtomicU64,
  io_manager: Box<dyn IOManager>,
}

impl DataFile {
  pub fn new<P>(dir_path: P, file_id: u32, io_type: IOManagerType) -> Result<DataFile>
  where
    P: AsRef<Path>,
  {
    let file_name = get_data_file_name(dir_path, file_id);
    let io_manager = new_io_manager(&file_name, io_type)?;
    Ok(DataFile {
      file_id,
      write_off: AtomicU64::new(io_manager.size()),
      io_manager,
    })
  }

  pub fn get_file_id(&self) -> u32 {
    self.file_id
  }

  /// Logical end of the file, where the next append lands.
  pub fn get_write_off(&self) -> u64 {
    self.write_off.load(Ordering::SeqCst)
  }

  pub fn file_size(&self) -> u64 {
    self.io_manager.size()
  }

  /// Appends `buf`, returning the offset it was written at.
  pub fn append(&self, buf: &[u8]) -> Result<u64> {
    let offset = self.write_off.load(Ordering::SeqCst);
    let n_bytes = self.io_manager.write(buf)?;
    self.write_off.fetch_add(n_bytes as u64, Ordering::SeqCst);
    Ok(offset)
  }

  pub fn read_vec(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    if len > 0 {
      self.io_manager.read(&mut buf, offset)?;
    }
    Ok(buf)
  }

  /// Everything from `offset` up to the end of the file.
  pub fn read_to_end(&self, offset: u64) -> Result<Vec<u8>> {
    let size = self.io_manager.size();
    if offset >= size {
      return Ok(Vec::new());
    }
    self.read_vec(offset, (size - offset) as usize)
  }

  pub fn sync(&self) -> Result<()> {
    self.io_manager.sync()
  }

  pub fn truncate(&self, len: u64) -> Result<()> {
    self.io_manager.truncate(len)?;
    self.write_off.store(len, Ordering::SeqCst);
    Ok(())
  }
}

pub fn get_data_file_name<P>(dir_path: P, file_id: u32) -> PathBuf
where
  P: AsRef<Path>,
{
  let name = std::format!("{:09}", file_id) + DATA_FILE_NAME_SUFFIX;
  dir_path.as_ref().join(name)
}

/// Parses `000000012.data` into 12.
pub fn parse_data_file_name(file_name: &str) -> Option<u32> {
  file_name
    .strip_suffix(DATA_FILE_NAME_SUFFIX)
    .and_then(|id| id.parse::<u32>().ok())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_new_data_file() {
    let dir = tempfile::tempdir().unwrap();
    let data_file = DataFile::new(dir.path(), 1, IOManagerType::StandardFileIO).unwrap();
    assert_eq!(data_file.get_file_id(), 1);
    assert_eq!(data_file.get_write_off(), 0);
    assert!(get_data_file_name(dir.path(), 1).is_file());
  }

  #[test]
  fn test_data_file_append_and_read() {
    let dir = tempfile::tempdir().unwrap();
    let data_file = DataFile::new(dir.path(), 2, IOManagerType::StandardFileIO).unwrap();

    assert_eq!(data_file.append(b"aaa").unwrap(), 0);
    assert_eq!(data_file.append(b"bbbb").unwrap(), 3);
    assert_eq!(data_file.get_write_off(), 7);
    assert_eq!(data_file.read_vec(3, 4).unwrap(), b"bbbb");
    assert_eq!(data_file.read_to_end(5).unwrap(), b"bb");
    assert!(data_file.read_to_end(7).unwrap().is_empty());

    data_file.truncate(3).unwrap();
    assert_eq!(data_file.get_write_off(), 3);
    assert_eq!(data_file.append(b"c").unwrap(), 3);
  }

  #[test]
  fn test_parse_data_file_name() {
    assert_eq!(parse_data_file_name("000000012.data"), Some(12));
    assert_eq!(parse_data_file_name("snapkv.lock"), None);
    assert_eq!(parse_data_file_name("abc.data"), None);
  }
}
