pub mod file_io;
pub mod mmap;

use std::path::Path;

use crate::{errors::Result, option::IOManagerType};

use self::{file_io::FileIO, mmap::MMapIO};

/// Abstract I/O management interface for different I/O implementations.
pub trait IOManager: Sync + Send {
  fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

  /// Appends `buf` at the end of the file.
  fn write(&self, buf: &[u8]) -> Result<usize>;

  fn sync(&self) -> Result<()>;

  fn size(&self) -> u64;

  fn truncate(&self, len: u64) -> Result<()>;
}

pub fn new_io_manager(filename: &Path, io_type: IOManagerType) -> Result<Box<dyn IOManager>> {
  Ok(match io_type {
    IOManagerType::StandardFileIO => Box::new(FileIO::new(filename)?),
    IOManagerType::MemoryMap => Box::new(MMapIO::new(filename)?),
  })
}
