use std::fmt::Debug;

use log::error;

use crate::errors::{Errors, Result};

/// Pluggable value/key compression used by the transaction log.
pub trait CompressionStrategy: Debug + Send + Sync {
  /// Returns `None` when the data should be stored as is.
  fn compress(&self, data: &[u8]) -> Option<Vec<u8>>;

  fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Never compresses anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompression;

impl CompressionStrategy for NoCompression {
  fn compress(&self, _data: &[u8]) -> Option<Vec<u8>> {
    None
  }

  fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
    Ok(data.to_vec())
  }
}

/// Snappy block compression, applied only when it saves at least 1/8 of the input.
#[derive(Debug, Clone, Copy)]
pub struct SnappyCompression {
  pub min_len: usize,
}

impl Default for SnappyCompression {
  fn default() -> Self {
    Self { min_len: 512 }
  }
}

impl CompressionStrategy for SnappyCompression {
  fn compress(&self, data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < self.min_len {
      return None;
    }
    let compressed = snap::raw::Encoder::new().compress_vec(data).ok()?;
    if compressed.len() + data.len() / 8 > data.len() {
      return None;
    }
    Some(compressed)
  }

  fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
    snap::raw::Decoder::new().decompress_vec(data).map_err(|e| {
      error!("failed to decompress snappy block: {e}");
      Errors::FailedToDecompress
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_snappy_skips_short_input() {
    let c = SnappyCompression::default();
    assert!(c.compress(b"short").is_none());
  }

  #[test]
  fn test_snappy_compresses_repetitive_input() {
    let c = SnappyCompression { min_len: 16 };
    let data = vec![b'x'; 4096];
    let packed = c.compress(&data).expect("repetitive data should compress");
    assert!(packed.len() < data.len());
    assert_eq!(c.decompress(&packed).unwrap(), data);
  }

  #[test]
  fn test_snappy_rejects_garbage() {
    let c = SnappyCompression::default();
    assert_eq!(
      c.decompress(&[0xff, 0xff, 0xff, 0xff, 0xff, 0x01]),
      Err(Errors::FailedToDecompress)
    );
  }
}
