use bytes::{Buf, BufMut, BytesMut};
use derive_more::Display;

use crate::errors::{Errors, Result};

/// Magic bytes opening every file of a collection, including the format version.
pub const FILE_MAGIC: &[u8; 8] = b"snapkv01";

const FLAG_HAS_GUID: u8 = 1;

/// magic + flags + guid + type + generation + sub db + payload length
const MAX_FIXED_HEADER_LEN: usize = 8 + 1 + 16 + 1 + 8 + 4 + 4;
const CRC_LEN: usize = 4;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
  #[display("TransactionLog")]
  TransactionLog,
  #[display("KeyIndex")]
  KeyIndex,
  #[display("KeyIndexWithCommitUlong")]
  KeyIndexWithCommitUlong,
  #[display("ModernKeyIndex")]
  ModernKeyIndex,
  #[display("ModernKeyIndexWithUlongs")]
  ModernKeyIndexWithUlongs,
  #[display("PureValues")]
  PureValues,
  #[display("PureValuesWithId")]
  PureValuesWithId,
  #[display("HashKeyIndex")]
  HashKeyIndex,
  #[display("Unknown")]
  Unknown,
}

impl FileType {
  fn tag(self) -> u8 {
    match self {
      FileType::TransactionLog => 1,
      FileType::KeyIndex => 2,
      FileType::KeyIndexWithCommitUlong => 3,
      FileType::ModernKeyIndex => 4,
      FileType::ModernKeyIndexWithUlongs => 5,
      FileType::PureValues => 6,
      FileType::PureValuesWithId => 7,
      FileType::HashKeyIndex => 8,
      FileType::Unknown => 0,
    }
  }

  fn from_tag(tag: u8) -> Option<Self> {
    Some(match tag {
      1 => FileType::TransactionLog,
      2 => FileType::KeyIndex,
      3 => FileType::KeyIndexWithCommitUlong,
      4 => FileType::ModernKeyIndex,
      5 => FileType::ModernKeyIndexWithUlongs,
      6 => FileType::PureValues,
      7 => FileType::PureValuesWithId,
      8 => FileType::HashKeyIndex,
      _ => return None,
    })
  }

  pub fn is_key_index(self) -> bool {
    matches!(
      self,
      FileType::KeyIndex
        | FileType::KeyIndexWithCommitUlong
        | FileType::ModernKeyIndex
        | FileType::ModernKeyIndexWithUlongs
    )
  }

  /// Files that values can point into.
  pub fn holds_values(self) -> bool {
    matches!(
      self,
      FileType::TransactionLog | FileType::PureValues | FileType::PureValuesWithId
    )
  }
}

/// How the body of a key index file is stored.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum KeyIndexCompression {
  #[display("none")]
  None,
  #[display("snappy")]
  Snappy,
}

impl KeyIndexCompression {
  fn tag(self) -> u8 {
    match self {
      KeyIndexCompression::None => 0,
      KeyIndexCompression::Snappy => 1,
    }
  }

  fn from_tag(tag: u8) -> Option<Self> {
    match tag {
      0 => Some(KeyIndexCompression::None),
      1 => Some(KeyIndexCompression::Snappy),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrLogInfo {
  /// 0 when this is the first log of the chain.
  pub previous_file_id: u32,
  /// Filled in memory once the following log is known.
  pub next_file_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyIndexInfo {
  pub trlog_file_id: u32,
  pub trlog_offset: u32,
  pub key_count: u64,
  pub commit_ulong: u64,
  pub compression: KeyIndexCompression,
  pub ulongs: Vec<u64>,
  /// Value files of older generations the snapshot points into.
  pub used_files: Vec<u32>,
  /// Transaction id of the snapshotted root, 0 for formats without ulongs.
  pub transaction_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileDetail {
  TransactionLog(TrLogInfo),
  KeyIndex(KeyIndexInfo),
  PureValues { compaction_id: Option<u64> },
  HashKeyIndex { key_len: u32 },
  Unknown,
}

/// Metadata of one file of the collection, decoded from its header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
  pub file_type: FileType,
  pub generation: u64,
  pub sub_db_id: u32,
  /// Bytes occupied by the header, the file body starts right after it.
  pub header_len: u64,
  pub detail: FileDetail,
}

impl FileInfo {
  pub fn unknown() -> Self {
    FileInfo {
      file_type: FileType::Unknown,
      generation: 0,
      sub_db_id: 0,
      header_len: 0,
      detail: FileDetail::Unknown,
    }
  }

  pub fn trlog(previous_file_id: u32) -> Self {
    Self::with_detail(
      FileType::TransactionLog,
      FileDetail::TransactionLog(TrLogInfo {
        previous_file_id,
        next_file_id: None,
      }),
    )
  }

  pub fn pure_values(compaction_id: u64) -> Self {
    Self::with_detail(
      FileType::PureValuesWithId,
      FileDetail::PureValues {
        compaction_id: Some(compaction_id),
      },
    )
  }

  pub fn key_index(info: KeyIndexInfo) -> Self {
    Self::with_detail(FileType::ModernKeyIndexWithUlongs, FileDetail::KeyIndex(info))
  }

  pub fn with_detail(file_type: FileType, detail: FileDetail) -> Self {
    FileInfo {
      file_type,
      generation: 0,
      sub_db_id: 0,
      header_len: 0,
      detail,
    }
  }

  pub fn trlog_info(&self) -> Option<&TrLogInfo> {
    match &self.detail {
      FileDetail::TransactionLog(info) => Some(info),
      _ => None,
    }
  }

  pub fn key_index_info(&self) -> Option<&KeyIndexInfo> {
    match &self.detail {
      FileDetail::KeyIndex(info) => Some(info),
      _ => None,
    }
  }

  /// Degrades the entry to `Unknown`, keeping the generation for ordering.
  pub fn mark_unknown(&mut self) {
    self.file_type = FileType::Unknown;
    self.detail = FileDetail::Unknown;
  }

  pub fn encode_header(&self, guid: Option<u128>) -> BytesMut {
    let mut payload = BytesMut::new();
    match &self.detail {
      FileDetail::TransactionLog(info) => payload.put_u32_le(info.previous_file_id),
      FileDetail::KeyIndex(info) => {
        payload.put_u32_le(info.trlog_file_id);
        payload.put_u32_le(info.trlog_offset);
        payload.put_u64_le(info.key_count);
        if self.file_type != FileType::KeyIndex {
          payload.put_u64_le(info.commit_ulong);
        }
        if matches!(
          self.file_type,
          FileType::ModernKeyIndex | FileType::ModernKeyIndexWithUlongs
        ) {
          payload.put_u8(info.compression.tag());
          payload.put_u32_le(info.used_files.len() as u32);
          for id in &info.used_files {
            payload.put_u32_le(*id);
          }
        }
        if self.file_type == FileType::ModernKeyIndexWithUlongs {
          payload.put_u32_le(info.ulongs.len() as u32);
          for v in &info.ulongs {
            payload.put_u64_le(*v);
          }
          payload.put_u64_le(info.transaction_id);
        }
      }
      FileDetail::PureValues { compaction_id } => {
        if let (FileType::PureValuesWithId, Some(id)) = (self.file_type, compaction_id) {
          payload.put_u64_le(*id);
        }
      }
      FileDetail::HashKeyIndex { key_len } => payload.put_u32_le(*key_len),
      FileDetail::Unknown => {}
    }

    let mut buf = BytesMut::with_capacity(MAX_FIXED_HEADER_LEN + payload.len() + CRC_LEN);
    buf.put_slice(FILE_MAGIC);
    buf.put_u8(if guid.is_some() { FLAG_HAS_GUID } else { 0 });
    if let Some(guid) = guid {
      buf.put_u128_le(guid);
    }
    buf.put_u8(self.file_type.tag());
    buf.put_u64_le(self.generation);
    buf.put_u32_le(self.sub_db_id);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&payload);
    let crc = crc32fast::hash(&buf);
    buf.put_u32_le(crc);
    buf
  }

  /// Number of bytes needed before [`FileInfo::header_len_from_prefix`] can answer.
  pub fn header_prefix_len(file_len: u64) -> usize {
    (file_len as usize).min(MAX_FIXED_HEADER_LEN)
  }

  /// Full header length, derived from its fixed prefix.
  pub fn header_len_from_prefix(file_id: u32, mut raw: &[u8]) -> Result<usize> {
    let fixed_len = Self::fixed_len(file_id, raw)?;
    raw.advance(fixed_len - 4);
    Ok(fixed_len + raw.get_u32_le() as usize + CRC_LEN)
  }

  fn fixed_len(file_id: u32, raw: &[u8]) -> Result<usize> {
    if raw.len() < 9 || &raw[..8] != FILE_MAGIC {
      return Err(Errors::corrupted_file(file_id, "bad magic"));
    }
    let fixed_len = if raw[8] & FLAG_HAS_GUID != 0 {
      MAX_FIXED_HEADER_LEN
    } else {
      MAX_FIXED_HEADER_LEN - 16
    };
    if raw.len() < fixed_len {
      return Err(Errors::corrupted_file(file_id, "truncated header"));
    }
    Ok(fixed_len)
  }

  /// Decodes a complete header, returning the info and the collection guid it carries.
  pub fn decode_header(file_id: u32, raw: &[u8]) -> Result<(FileInfo, Option<u128>)> {
    let total = Self::header_len_from_prefix(file_id, raw)?;
    if raw.len() < total {
      return Err(Errors::corrupted_file(file_id, "truncated header"));
    }
    let (body, mut crc) = raw[..total].split_at(total - CRC_LEN);
    if crc.get_u32_le() != crc32fast::hash(body) {
      return Err(Errors::corrupted_file(file_id, "header checksum mismatch"));
    }

    let mut buf = &body[8..];
    let flags = buf.get_u8();
    let guid = if flags & FLAG_HAS_GUID != 0 {
      Some(buf.get_u128_le())
    } else {
      None
    };
    let file_type = FileType::from_tag(buf.get_u8())
      .ok_or_else(|| Errors::corrupted_file(file_id, "unknown file type"))?;
    let generation = buf.get_u64_le();
    let sub_db_id = buf.get_u32_le();
    let payload_len = buf.get_u32_le() as usize;
    let mut payload = &buf[..payload_len];

    let detail = decode_detail(file_id, file_type, &mut payload)?;
    if payload.has_remaining() {
      return Err(Errors::corrupted_file(file_id, "trailing bytes in header"));
    }
    Ok((
      FileInfo {
        file_type,
        generation,
        sub_db_id,
        header_len: total as u64,
        detail,
      },
      guid,
    ))
  }
}

fn need(file_id: u32, buf: &[u8], len: usize) -> Result<()> {
  if buf.remaining() < len {
    return Err(Errors::corrupted_file(file_id, "header payload too short"));
  }
  Ok(())
}

fn decode_detail(file_id: u32, file_type: FileType, buf: &mut &[u8]) -> Result<FileDetail> {
  Ok(match file_type {
    FileType::TransactionLog => {
      need(file_id, buf, 4)?;
      FileDetail::TransactionLog(TrLogInfo {
        previous_file_id: buf.get_u32_le(),
        next_file_id: None,
      })
    }
    FileType::KeyIndex
    | FileType::KeyIndexWithCommitUlong
    | FileType::ModernKeyIndex
    | FileType::ModernKeyIndexWithUlongs => {
      need(file_id, buf, 16)?;
      let mut info = KeyIndexInfo {
        trlog_file_id: buf.get_u32_le(),
        trlog_offset: buf.get_u32_le(),
        key_count: buf.get_u64_le(),
        commit_ulong: 0,
        compression: KeyIndexCompression::None,
        ulongs: Vec::new(),
        used_files: Vec::new(),
        transaction_id: 0,
      };
      if file_type != FileType::KeyIndex {
        need(file_id, buf, 8)?;
        info.commit_ulong = buf.get_u64_le();
      }
      if matches!(
        file_type,
        FileType::ModernKeyIndex | FileType::ModernKeyIndexWithUlongs
      ) {
        need(file_id, buf, 5)?;
        info.compression = KeyIndexCompression::from_tag(buf.get_u8())
          .ok_or_else(|| Errors::corrupted_file(file_id, "unknown key index compression"))?;
        let count = buf.get_u32_le() as usize;
        need(file_id, buf, count * 4)?;
        info.used_files = (0..count).map(|_| buf.get_u32_le()).collect();
      }
      if file_type == FileType::ModernKeyIndexWithUlongs {
        need(file_id, buf, 4)?;
        let count = buf.get_u32_le() as usize;
        need(file_id, buf, count * 8)?;
        info.ulongs = (0..count).map(|_| buf.get_u64_le()).collect();
        need(file_id, buf, 8)?;
        info.transaction_id = buf.get_u64_le();
      }
      FileDetail::KeyIndex(info)
    }
    FileType::PureValues => FileDetail::PureValues { compaction_id: None },
    FileType::PureValuesWithId => {
      need(file_id, buf, 8)?;
      FileDetail::PureValues {
        compaction_id: Some(buf.get_u64_le()),
      }
    }
    FileType::HashKeyIndex => {
      need(file_id, buf, 4)?;
      FileDetail::HashKeyIndex {
        key_len: buf.get_u32_le(),
      }
    }
    FileType::Unknown => FileDetail::Unknown,
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample_kvi() -> KeyIndexInfo {
    KeyIndexInfo {
      trlog_file_id: 3,
      trlog_offset: 4096,
      key_count: 10,
      commit_ulong: 77,
      compression: KeyIndexCompression::Snappy,
      ulongs: vec![1, 2, 3],
      used_files: vec![1, 3],
      transaction_id: 21,
    }
  }

  #[test]
  fn test_trlog_header_with_guid() {
    let mut info = FileInfo::trlog(5);
    info.generation = 42;
    let raw = info.encode_header(Some(0xdead_beef));

    let prefix_len = FileInfo::header_prefix_len(raw.len() as u64);
    assert_eq!(
      FileInfo::header_len_from_prefix(1, &raw[..prefix_len]).unwrap(),
      raw.len()
    );

    let (decoded, guid) = FileInfo::decode_header(1, &raw).unwrap();
    assert_eq!(guid, Some(0xdead_beef));
    assert_eq!(decoded.generation, 42);
    assert_eq!(decoded.header_len, raw.len() as u64);
    assert_eq!(decoded.trlog_info().unwrap().previous_file_id, 5);
  }

  #[test]
  fn test_modern_key_index_header() {
    let mut info = FileInfo::key_index(sample_kvi());
    info.generation = 9;
    let raw = info.encode_header(None);
    let (decoded, guid) = FileInfo::decode_header(2, &raw).unwrap();
    assert_eq!(guid, None);
    assert_eq!(decoded.file_type, FileType::ModernKeyIndexWithUlongs);
    assert_eq!(decoded.key_index_info().unwrap(), &sample_kvi());
  }

  #[test]
  fn test_legacy_key_index_drops_newer_fields() {
    let mut info = FileInfo::with_detail(FileType::KeyIndex, FileDetail::KeyIndex(sample_kvi()));
    info.generation = 1;
    let raw = info.encode_header(None);
    let (decoded, _) = FileInfo::decode_header(2, &raw).unwrap();
    let kvi = decoded.key_index_info().unwrap();
    assert_eq!(kvi.key_count, 10);
    assert_eq!(kvi.commit_ulong, 0);
    assert!(kvi.used_files.is_empty());
    assert!(kvi.ulongs.is_empty());
    assert_eq!(kvi.transaction_id, 0);
  }

  #[test]
  fn test_corrupted_header_is_rejected() {
    let mut raw = FileInfo::pure_values(4).encode_header(None);
    let last = raw.len() - 6;
    raw[last] ^= 0xff;
    assert!(matches!(
      FileInfo::decode_header(8, &raw),
      Err(Errors::CorruptedFile { file_id: 8, .. })
    ));

    assert!(FileInfo::decode_header(8, b"not a snapkv file at all!!!!!!!!!!!").is_err());
  }
}
