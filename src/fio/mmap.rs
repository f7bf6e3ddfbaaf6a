use std::{fs::OpenOptions, path::Path};

use log::error;
use memmap2::Mmap;

use crate::errors::{Errors, Result};

use super::IOManager;

/// Read-only memory mapped view of a data file.
///
/// Recovery scans whole files front to back, which the page cache serves far
/// better than one positioned read per record. The mapping is fixed at open,
/// so bytes appended afterwards are only visible after the collection swaps
/// back to [`super::file_io::FileIO`].
pub struct MMapIO {
  map: Mmap,
}

impl MMapIO {
  pub fn new<P>(file_name: P) -> Result<Self>
  where
    P: AsRef<Path>,
  {
    let file = OpenOptions::new()
      .create(true)
      .read(true)
      .append(true)
      .open(file_name)
      .map_err(|e| {
        error!("failed to open data file error: {}", e);
        Errors::FailedToOpenDataFile
      })?;
    let map = unsafe { Mmap::map(&file) }.map_err(|e| {
      error!("failed to map data file: {}", e);
      Errors::FailedToOpenDataFile
    })?;
    Ok(MMapIO { map })
  }
}

impl IOManager for MMapIO {
  fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
    let start = offset as usize;
    let bytes = start
      .checked_add(buf.len())
      .and_then(|end| self.map.get(start..end))
      .ok_or(Errors::ReadDataFileEOF)?;
    buf.copy_from_slice(bytes);
    Ok(bytes.len())
  }

  fn write(&self, _buf: &[u8]) -> Result<usize> {
    Err(Errors::ReadOnlyDataFile)
  }

  fn sync(&self) -> Result<()> {
    Ok(())
  }

  fn size(&self) -> u64 {
    self.map.len() as u64
  }

  fn truncate(&self, _len: u64) -> Result<()> {
    Err(Errors::ReadOnlyDataFile)
  }
}

#[cfg(test)]
mod tests {
  use crate::fio::file_io::FileIO;

  use super::*;

  #[test]
  fn test_mmap_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mmap-test.data");

    // file is empty
    let mmap_io1 = MMapIO::new(&path).unwrap();
    assert_eq!(mmap_io1.size(), 0);
    let mut buf1 = [0u8; 10];
    assert_eq!(mmap_io1.read(&mut buf1, 0), Err(Errors::ReadDataFileEOF));

    let fio = FileIO::new(&path).unwrap();
    fio.write(b"hello world").unwrap();
    fio.write(b"good morning").unwrap();
    fio.sync().unwrap();

    let mmap_io2 = MMapIO::new(&path).unwrap();
    assert_eq!(mmap_io2.size(), 23);
    let mut buf2 = [0u8; 12];
    mmap_io2.read(&mut buf2, 11).unwrap();
    assert_eq!(&buf2, b"good morning");
  }

  #[test]
  fn test_mmap_is_read_only() {
    let dir = tempfile::tempdir().unwrap();
    let mmap_io = MMapIO::new(dir.path().join("ro.data")).unwrap();
    assert_eq!(mmap_io.write(b"x"), Err(Errors::ReadOnlyDataFile));
    assert_eq!(mmap_io.truncate(0), Err(Errors::ReadOnlyDataFile));
  }
}
