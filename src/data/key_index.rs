use std::{
  collections::BTreeSet,
  io::{Read, Write},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{error, info, warn};
use prost::encoding::{decode_varint, encode_varint};

use crate::{
  data::{
    data_file::DataFile,
    file_collection::FileCollection,
    file_header::{FileInfo, KeyIndexCompression, KeyIndexInfo},
    value_descriptor::{ValueDescriptor, VALUE_DESCRIPTOR_SIZE},
  },
  errors::{Errors, Result},
  index::CowTree,
};

/// Last four bytes of every complete key index file.
pub const KEY_INDEX_FOOTER_MAGIC: u32 = 0x6b76_6921;

/// body length + crc32 of the body + magic
const FOOTER_LEN: usize = 8 + 4 + 4;

/// State captured by a key index file.
pub struct KeyIndexSnapshot<'a> {
  pub tree: &'a CowTree,
  pub trlog_file_id: u32,
  pub trlog_offset: u64,
  pub commit_ulong: u64,
  pub ulongs: &'a [u64],
  pub transaction_id: u64,
}

pub struct LoadedKeyIndex {
  pub tree: CowTree,
  pub info: KeyIndexInfo,
}

/// Distinct value files referenced by `tree`.
pub fn used_files(tree: &CowTree) -> Vec<u32> {
  let ids: BTreeSet<u32> = tree
    .iter()
    .map(|(_, v)| v.file_id())
    .filter(|id| *id != 0)
    .collect();
  ids.into_iter().collect()
}

fn write_entries<W: Write>(tree: &CowTree, out: &mut W) -> std::io::Result<()> {
  let mut prev: &[u8] = &[];
  let mut entry = BytesMut::new();
  for (key, value) in tree.iter() {
    let common = prev
      .iter()
      .zip(key.iter())
      .take_while(|(a, b)| a == b)
      .count();
    entry.clear();
    encode_varint(common as u64, &mut entry);
    encode_varint((key.len() - common) as u64, &mut entry);
    entry.put_slice(&key[common..]);
    entry.put_slice(&value.encode());
    out.write_all(&entry)?;
    prev = key;
  }
  Ok(())
}

/// Writes a new key index file for `snapshot` and returns its id.
pub fn write_key_index(
  files: &FileCollection,
  snapshot: &KeyIndexSnapshot,
  compression_threshold: u64,
) -> Result<u32> {
  let key_count = snapshot.tree.len() as u64;
  let compression = if key_count >= compression_threshold {
    KeyIndexCompression::Snappy
  } else {
    KeyIndexCompression::None
  };

  let mut body = Vec::new();
  let written = match compression {
    KeyIndexCompression::None => write_entries(snapshot.tree, &mut body),
    KeyIndexCompression::Snappy => {
      let mut encoder = snap::write::FrameEncoder::new(&mut body);
      write_entries(snapshot.tree, &mut encoder).and_then(|_| encoder.flush())
    }
  };
  if let Err(e) = written {
    error!("failed to encode key index: {}", e);
    return Err(Errors::FailedToWriteToDataFile);
  }

  let info = KeyIndexInfo {
    trlog_file_id: snapshot.trlog_file_id,
    trlog_offset: snapshot.trlog_offset as u32,
    key_count,
    commit_ulong: snapshot.commit_ulong,
    compression,
    ulongs: snapshot.ulongs.to_vec(),
    used_files: used_files(snapshot.tree),
    transaction_id: snapshot.transaction_id,
  };
  let (file_id, file) = files.create_file(FileInfo::key_index(info))?;

  let mut footer = BytesMut::with_capacity(FOOTER_LEN);
  footer.put_u64_le(body.len() as u64);
  footer.put_u32_le(crc32fast::hash(&body));
  footer.put_u32_le(KEY_INDEX_FOOTER_MAGIC);
  file.append(&body)?;
  file.append(&footer)?;
  file.sync()?;
  info!(
    "key index {} written with {} keys at trlog {}:{}",
    file_id, key_count, snapshot.trlog_file_id, snapshot.trlog_offset
  );
  Ok(file_id)
}

/// Finds the body of a key index, `data` starting right after the header.
fn locate_body(file_id: u32, data: &[u8], lenient: bool) -> Result<&[u8]> {
  let footer_at = |end: usize| -> Option<&[u8]> {
    if end < FOOTER_LEN {
      return None;
    }
    let mut footer = &data[end - FOOTER_LEN..end];
    let body_len = footer.get_u64_le() as usize;
    let crc = footer.get_u32_le();
    let magic = footer.get_u32_le();
    if magic != KEY_INDEX_FOOTER_MAGIC || body_len != end - FOOTER_LEN {
      return None;
    }
    let body = &data[..body_len];
    (crc32fast::hash(body) == crc).then_some(body)
  };

  if let Some(body) = footer_at(data.len()) {
    return Ok(body);
  }
  if lenient {
    for end in (FOOTER_LEN..data.len()).rev() {
      if let Some(body) = footer_at(end) {
        warn!(
          "key index {} has {} bytes of trailing garbage",
          file_id,
          data.len() - end
        );
        return Ok(body);
      }
    }
  }
  Err(Errors::corrupted_file(file_id, "missing or damaged footer"))
}

pub fn read_key_index(
  file_id: u32,
  file: &DataFile,
  file_info: &FileInfo,
  lenient: bool,
) -> Result<LoadedKeyIndex> {
  let info = file_info
    .key_index_info()
    .ok_or_else(|| Errors::corrupted_file(file_id, "not a key index"))?
    .clone();
  let data = file.read_to_end(file_info.header_len)?;
  let body = locate_body(file_id, &data, lenient)?;

  let decoded;
  let mut entries: &[u8] = match info.compression {
    KeyIndexCompression::None => body,
    KeyIndexCompression::Snappy => {
      let mut out = Vec::new();
      if let Err(e) = snap::read::FrameDecoder::new(body).read_to_end(&mut out) {
        error!("failed to decompress key index {}: {}", file_id, e);
        return Err(Errors::corrupted_file(file_id, "damaged compressed body"));
      }
      decoded = out;
      &decoded
    }
  };

  let damaged = |reason: &str| Errors::corrupted_file(file_id, reason.to_string());
  let mut tree = CowTree::new();
  let mut key = Vec::new();
  for _ in 0..info.key_count {
    let common = decode_varint(&mut entries).map_err(|_| damaged("bad prefix length"))? as usize;
    let suffix = decode_varint(&mut entries).map_err(|_| damaged("bad suffix length"))? as usize;
    if common > key.len() || entries.remaining() < suffix + VALUE_DESCRIPTOR_SIZE {
      return Err(damaged("entry out of bounds"));
    }
    key.truncate(common);
    key.extend_from_slice(&entries[..suffix]);
    entries.advance(suffix);
    let value = ValueDescriptor::decode(&entries[..VALUE_DESCRIPTOR_SIZE])
      .map_err(|_| damaged("bad value descriptor"))?;
    entries.advance(VALUE_DESCRIPTOR_SIZE);
    tree.upsert(Bytes::copy_from_slice(&key), value);
  }
  if entries.has_remaining() {
    return Err(damaged("more entries than the header announces"));
  }
  if tree.len() as u64 != info.key_count {
    return Err(damaged("keys are not strictly ordered"));
  }
  Ok(LoadedKeyIndex { tree, info })
}
