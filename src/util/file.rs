use std::path::Path;

use log::warn;

/// Total size in bytes of everything below `dir_path`.
pub fn dir_disk_size<P: AsRef<Path>>(dir_path: P) -> u64 {
  match fs_extra::dir::get_size(dir_path.as_ref()) {
    Ok(size) => size,
    Err(e) => {
      warn!("failed to measure {:?}: {}", dir_path.as_ref(), e);
      0
    }
  }
}

/// Free space left on the file system holding `dir_path`.
pub fn available_disk_space<P: AsRef<Path>>(dir_path: P) -> u64 {
  match fs2::available_space(dir_path.as_ref()) {
    Ok(size) => size,
    Err(e) => {
      warn!("failed to query free space of {:?}: {}", dir_path.as_ref(), e);
      u64::MAX
    }
  }
}
