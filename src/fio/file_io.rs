use std::{
  fs::{File, OpenOptions},
  io::Write,
  os::unix::prelude::FileExt,
  path::Path,
  sync::Arc,
};

use log::error;
use parking_lot::RwLock;

use crate::errors::{Errors, Result};

use super::IOManager;

/// Standard system file I/O; writes always land at the end of the file.
pub struct FileIO {
  fd: Arc<RwLock<File>>,
}

impl FileIO {
  pub fn new<P>(file_name: P) -> Result<Self>
  where
    P: AsRef<Path>,
  {
    match OpenOptions::new()
      .create(true)
      .read(true)
      .append(true)
      .open(file_name)
    {
      Ok(file) => Ok(FileIO {
        fd: Arc::new(RwLock::new(file)),
      }),
      Err(e) => {
        error!("failed to open data file error: {}", e);
        Err(Errors::FailedToOpenDataFile)
      }
    }
  }
}

impl IOManager for FileIO {
  fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
    let read_guard = self.fd.read();
    let mut done = 0;
    while done < buf.len() {
      match read_guard.read_at(&mut buf[done..], offset + done as u64) {
        Ok(0) => return Err(Errors::ReadDataFileEOF),
        Ok(n) => done += n,
        Err(e) => {
          error!("read from data file err: {}", e);
          return Err(Errors::FailedToReadFromDataFile);
        }
      }
    }
    Ok(done)
  }

  fn write(&self, buf: &[u8]) -> Result<usize> {
    let mut write_guard = self.fd.write();
    match write_guard.write_all(buf) {
      Ok(()) => Ok(buf.len()),
      Err(e) => {
        error!("write to data file err: {}", e);
        Err(Errors::FailedToWriteToDataFile)
      }
    }
  }

  fn sync(&self) -> Result<()> {
    let read_guard = self.fd.read();
    if let Err(e) = read_guard.sync_data() {
      error!("failed to sync data file: {}", e);
      return Err(Errors::FailedToSyncDataFile);
    }
    Ok(())
  }

  fn size(&self) -> u64 {
    let read_guard = self.fd.read();
    match read_guard.metadata() {
      Ok(metadata) => metadata.len(),
      Err(e) => {
        error!("failed to stat data file: {}", e);
        0
      }
    }
  }

  fn truncate(&self, len: u64) -> Result<()> {
    let write_guard = self.fd.write();
    if let Err(e) = write_guard.set_len(len) {
      error!("failed to truncate data file: {}", e);
      return Err(Errors::FailedToTruncateDataFile);
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_file_io_write_and_read() {
    let dir = tempfile::tempdir().unwrap();
    let fio = FileIO::new(dir.path().join("a.data")).unwrap();

    assert_eq!(fio.write(b"key-a").unwrap(), 5);
    assert_eq!(fio.write(b"key-bc").unwrap(), 6);
    assert_eq!(fio.size(), 11);

    let mut buf = [0u8; 6];
    fio.read(&mut buf, 5).unwrap();
    assert_eq!(&buf, b"key-bc");
  }

  #[test]
  fn test_file_io_read_past_end() {
    let dir = tempfile::tempdir().unwrap();
    let fio = FileIO::new(dir.path().join("b.data")).unwrap();
    fio.write(b"abc").unwrap();

    let mut buf = [0u8; 4];
    assert_eq!(fio.read(&mut buf, 0), Err(Errors::ReadDataFileEOF));
  }

  #[test]
  fn test_file_io_truncate_then_append() {
    let dir = tempfile::tempdir().unwrap();
    let fio = FileIO::new(dir.path().join("c.data")).unwrap();
    fio.write(b"hello world").unwrap();
    fio.truncate(5).unwrap();
    assert_eq!(fio.size(), 5);

    fio.write(b"!").unwrap();
    fio.sync().unwrap();
    let mut buf = [0u8; 6];
    fio.read(&mut buf, 0).unwrap();
    assert_eq!(&buf, b"hello!");
  }
}
