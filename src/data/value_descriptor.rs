use bytes::{Buf, BufMut};

use crate::errors::{Errors, Result};

/// Encoded size of a [`ValueDescriptor`].
pub const VALUE_DESCRIPTOR_SIZE: usize = 12;

/// Values up to this length live inside the descriptor itself.
pub const MAX_INLINE_VALUE_LEN: usize = 7;

/// Stored sizes are signed 32 bit, the sign marks compression.
pub const MAX_STORED_VALUE_LEN: usize = i32::MAX as usize;

/// Location of a value, as stored in the index.
///
/// On disk both variants occupy 12 bytes. `file_id == 0` marks an inline
/// value: one length byte followed by up to seven value bytes. Otherwise the
/// layout is `file_id`, `offset`, `size`, all little endian, where a negative
/// size means the stored bytes are compressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueDescriptor {
  Inline {
    len: u8,
    bytes: [u8; MAX_INLINE_VALUE_LEN],
  },
  Stored {
    file_id: u32,
    offset: u32,
    size: i32,
  },
}

impl ValueDescriptor {
  pub fn inline(value: &[u8]) -> Option<Self> {
    if value.len() > MAX_INLINE_VALUE_LEN {
      return None;
    }
    let mut bytes = [0u8; MAX_INLINE_VALUE_LEN];
    bytes[..value.len()].copy_from_slice(value);
    Some(ValueDescriptor::Inline {
      len: value.len() as u8,
      bytes,
    })
  }

  pub fn stored(file_id: u32, offset: u32, len: usize, compressed: bool) -> Result<Self> {
    let size = i32::try_from(len).map_err(|_| Errors::ValueTooLarge(len))?;
    Ok(ValueDescriptor::Stored {
      file_id,
      offset,
      size: if compressed { -size } else { size },
    })
  }

  /// Id of the file holding the value, 0 for inline values.
  pub fn file_id(&self) -> u32 {
    match *self {
      ValueDescriptor::Inline { .. } => 0,
      ValueDescriptor::Stored { file_id, .. } => file_id,
    }
  }

  /// Number of bytes the value occupies in its file.
  pub fn stored_len(&self) -> u64 {
    match *self {
      ValueDescriptor::Inline { .. } => 0,
      ValueDescriptor::Stored { size, .. } => size.unsigned_abs() as u64,
    }
  }

  pub fn is_compressed(&self) -> bool {
    matches!(*self, ValueDescriptor::Stored { size, .. } if size < 0)
  }

  pub fn inline_bytes(&self) -> Option<&[u8]> {
    match self {
      ValueDescriptor::Inline { len, bytes } => Some(&bytes[..*len as usize]),
      ValueDescriptor::Stored { .. } => None,
    }
  }

  pub fn encode(&self) -> [u8; VALUE_DESCRIPTOR_SIZE] {
    let mut out = [0u8; VALUE_DESCRIPTOR_SIZE];
    let mut buf = &mut out[..];
    match *self {
      ValueDescriptor::Inline { len, bytes } => {
        buf.put_u32_le(0);
        buf.put_u8(len);
        buf.put_slice(&bytes);
      }
      ValueDescriptor::Stored {
        file_id,
        offset,
        size,
      } => {
        buf.put_u32_le(file_id);
        buf.put_u32_le(offset);
        buf.put_i32_le(size);
      }
    }
    out
  }

  pub fn decode(mut raw: &[u8]) -> Result<Self> {
    if raw.len() < VALUE_DESCRIPTOR_SIZE {
      return Err(Errors::InvalidOperation(format!(
        "value descriptor needs {VALUE_DESCRIPTOR_SIZE} bytes, got {}",
        raw.len()
      )));
    }
    let file_id = raw.get_u32_le();
    if file_id == 0 {
      let len = raw.get_u8();
      if len as usize > MAX_INLINE_VALUE_LEN {
        return Err(Errors::InvalidOperation(format!(
          "inline value length {len} out of range"
        )));
      }
      let mut bytes = [0u8; MAX_INLINE_VALUE_LEN];
      raw.copy_to_slice(&mut bytes);
      return Ok(ValueDescriptor::Inline { len, bytes });
    }
    let offset = raw.get_u32_le();
    let size = raw.get_i32_le();
    Ok(ValueDescriptor::Stored {
      file_id,
      offset,
      size,
    })
  }
}
