use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use log::{debug, info};
use prost::encoding::{decode_varint, encode_varint};

use crate::{
  compression::CompressionStrategy,
  data::{
    data_file::DataFile, file_collection::FileCollection, file_header::FileInfo,
    value_descriptor::MAX_INLINE_VALUE_LEN,
  },
  errors::{Errors, Result},
};

/// Operand of every `TransactionStart` record.
pub const TRANSACTION_START_MAGIC: u32 = 0x7472_6e73;

const FIRST_PARAM_COMPRESSED: u8 = 0x80;
const SECOND_PARAM_COMPRESSED: u8 = 0x40;
const COMMAND_MASK: u8 = 0x3f;

/// Keys shorter than this are never compressed in the log.
const MIN_COMPRESSED_KEY_LEN: usize = 32;

const MAX_VARINT_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandType {
  CreateOrUpdate = 1,
  UpdateKeySuffix = 2,
  EraseOne = 3,
  EraseRange = 4,
  DeltaUlongs = 5,
  TransactionStart = 6,
  Commit = 7,
  CommitWithDeltaUlong = 8,
  Rollback = 9,
  EndOfFile = 10,
  TemporaryEndOfFile = 11,
}

impl CommandType {
  fn from_u8(v: u8) -> Option<Self> {
    Some(match v {
      1 => CommandType::CreateOrUpdate,
      2 => CommandType::UpdateKeySuffix,
      3 => CommandType::EraseOne,
      4 => CommandType::EraseRange,
      5 => CommandType::DeltaUlongs,
      6 => CommandType::TransactionStart,
      7 => CommandType::Commit,
      8 => CommandType::CommitWithDeltaUlong,
      9 => CommandType::Rollback,
      10 => CommandType::EndOfFile,
      11 => CommandType::TemporaryEndOfFile,
      _ => return None,
    })
  }
}

/// A decoded log command. Keys are always decompressed; a stored value keeps
/// its on-disk bytes and position so replay can point a descriptor at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogCommand {
  CreateOrUpdate {
    key: Vec<u8>,
    value: Vec<u8>,
    value_compressed: bool,
    /// Offset of the value bytes from the record start.
    value_pos: usize,
  },
  UpdateKeySuffix {
    prefix_len: usize,
    key: Vec<u8>,
  },
  EraseOne {
    key: Vec<u8>,
  },
  EraseRange {
    first_key: Vec<u8>,
    last_key: Vec<u8>,
  },
  DeltaUlongs {
    index: u32,
    delta: u64,
  },
  TransactionStart,
  Commit,
  CommitWithDeltaUlong {
    delta: u64,
  },
  Rollback,
  EndOfFile,
  TemporaryEndOfFile,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParsedRecord {
  Complete { command: LogCommand, len: usize },
  /// The buffer ends inside the record.
  Truncated,
  Invalid(String),
}

/// Where the value of an encoded `CreateOrUpdate` record sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredValue {
  pub pos: usize,
  pub len: usize,
  pub compressed: bool,
}

pub struct EncodedRecord {
  pub data: BytesMut,
  /// Set only for values too long to live inline.
  pub value: Option<StoredValue>,
}

fn maybe_compress_key(key: &[u8], compression: &dyn CompressionStrategy) -> Option<Vec<u8>> {
  if key.len() < MIN_COMPRESSED_KEY_LEN {
    return None;
  }
  compression.compress(key)
}

pub fn encode_create_or_update(
  key: &[u8],
  value: &[u8],
  compression: &dyn CompressionStrategy,
) -> EncodedRecord {
  let packed_key = maybe_compress_key(key, compression);
  let packed_value = if value.len() > MAX_INLINE_VALUE_LEN {
    compression.compress(value)
  } else {
    None
  };
  let mut opcode = CommandType::CreateOrUpdate as u8;
  if packed_key.is_some() {
    opcode |= FIRST_PARAM_COMPRESSED;
  }
  if packed_value.is_some() {
    opcode |= SECOND_PARAM_COMPRESSED;
  }
  let key = packed_key.as_deref().unwrap_or(key);
  let stored = packed_value.as_deref().unwrap_or(value);

  let mut data = BytesMut::with_capacity(1 + 2 * MAX_VARINT_LEN + key.len() + stored.len());
  data.put_u8(opcode);
  encode_varint(key.len() as u64, &mut data);
  encode_varint(stored.len() as u64, &mut data);
  data.put_slice(key);
  let pos = data.len();
  data.put_slice(stored);

  let value = (value.len() > MAX_INLINE_VALUE_LEN).then_some(StoredValue {
    pos,
    len: stored.len(),
    compressed: packed_value.is_some(),
  });
  EncodedRecord { data, value }
}

pub fn encode_update_key_suffix(
  prefix_len: usize,
  key: &[u8],
  compression: &dyn CompressionStrategy,
) -> BytesMut {
  let packed_key = maybe_compress_key(key, compression);
  let mut opcode = CommandType::UpdateKeySuffix as u8;
  if packed_key.is_some() {
    opcode |= SECOND_PARAM_COMPRESSED;
  }
  let key = packed_key.as_deref().unwrap_or(key);
  let mut data = BytesMut::with_capacity(1 + 2 * MAX_VARINT_LEN + key.len());
  data.put_u8(opcode);
  encode_varint(prefix_len as u64, &mut data);
  encode_varint(key.len() as u64, &mut data);
  data.put_slice(key);
  data
}

pub fn encode_erase_one(key: &[u8], compression: &dyn CompressionStrategy) -> BytesMut {
  let packed_key = maybe_compress_key(key, compression);
  let mut opcode = CommandType::EraseOne as u8;
  if packed_key.is_some() {
    opcode |= FIRST_PARAM_COMPRESSED;
  }
  let key = packed_key.as_deref().unwrap_or(key);
  let mut data = BytesMut::with_capacity(1 + MAX_VARINT_LEN + key.len());
  data.put_u8(opcode);
  encode_varint(key.len() as u64, &mut data);
  data.put_slice(key);
  data
}

pub fn encode_erase_range(
  first_key: &[u8],
  last_key: &[u8],
  compression: &dyn CompressionStrategy,
) -> BytesMut {
  let packed_first = maybe_compress_key(first_key, compression);
  let packed_last = maybe_compress_key(last_key, compression);
  let mut opcode = CommandType::EraseRange as u8;
  if packed_first.is_some() {
    opcode |= FIRST_PARAM_COMPRESSED;
  }
  if packed_last.is_some() {
    opcode |= SECOND_PARAM_COMPRESSED;
  }
  let first_key = packed_first.as_deref().unwrap_or(first_key);
  let last_key = packed_last.as_deref().unwrap_or(last_key);
  let mut data =
    BytesMut::with_capacity(1 + 2 * MAX_VARINT_LEN + first_key.len() + last_key.len());
  data.put_u8(opcode);
  encode_varint(first_key.len() as u64, &mut data);
  encode_varint(last_key.len() as u64, &mut data);
  data.put_slice(first_key);
  data.put_slice(last_key);
  data
}

pub fn encode_delta_ulongs(index: u32, delta: u64) -> BytesMut {
  let mut data = BytesMut::with_capacity(1 + 2 * MAX_VARINT_LEN);
  data.put_u8(CommandType::DeltaUlongs as u8);
  encode_varint(index as u64, &mut data);
  encode_varint(delta, &mut data);
  data
}

pub fn encode_transaction_start() -> BytesMut {
  let mut data = BytesMut::with_capacity(5);
  data.put_u8(CommandType::TransactionStart as u8);
  data.put_u32_le(TRANSACTION_START_MAGIC);
  data
}

/// `Commit`, or `CommitWithDeltaUlong` when the commit ulong moved.
pub fn encode_commit(commit_ulong_delta: u64) -> BytesMut {
  let mut data = BytesMut::with_capacity(1 + MAX_VARINT_LEN);
  if commit_ulong_delta == 0 {
    data.put_u8(CommandType::Commit as u8);
  } else {
    data.put_u8(CommandType::CommitWithDeltaUlong as u8);
    encode_varint(commit_ulong_delta, &mut data);
  }
  data
}

pub fn encode_marker(command: CommandType) -> BytesMut {
  let mut data = BytesMut::with_capacity(1);
  data.put_u8(command as u8);
  data
}

enum Operand {
  Value(u64),
  Truncated,
}

fn read_varint(buf: &mut &[u8]) -> std::result::Result<Operand, String> {
  let has_end = buf.iter().take(MAX_VARINT_LEN).any(|b| b & 0x80 == 0);
  if !has_end {
    if buf.len() < MAX_VARINT_LEN {
      return Ok(Operand::Truncated);
    }
    return Err("varint too long".into());
  }
  decode_varint(buf)
    .map(Operand::Value)
    .map_err(|e| e.to_string())
}

macro_rules! operand {
  ($buf:expr) => {
    match read_varint($buf) {
      Ok(Operand::Value(v)) => v,
      Ok(Operand::Truncated) => return ParsedRecord::Truncated,
      Err(e) => return ParsedRecord::Invalid(e),
    }
  };
}

fn take_bytes(
  buf: &mut &[u8],
  len: u64,
  compressed: bool,
  compression: &dyn CompressionStrategy,
) -> Option<std::result::Result<Vec<u8>, String>> {
  let len = len as usize;
  if buf.len() < len {
    return None;
  }
  let raw = &buf[..len];
  buf.advance(len);
  Some(if compressed {
    compression
      .decompress(raw)
      .map_err(|_| "compressed key is damaged".to_string())
  } else {
    Ok(raw.to_vec())
  })
}

macro_rules! bytes_operand {
  ($buf:expr, $len:expr, $compressed:expr, $compression:expr) => {
    match take_bytes($buf, $len, $compressed, $compression) {
      None => return ParsedRecord::Truncated,
      Some(Err(e)) => return ParsedRecord::Invalid(e),
      Some(Ok(v)) => v,
    }
  };
}

/// Decodes the record at the start of `data`.
pub fn parse_record(data: &[u8], compression: &dyn CompressionStrategy) -> ParsedRecord {
  let Some(&opcode) = data.first() else {
    return ParsedRecord::Truncated;
  };
  let first_compressed = opcode & FIRST_PARAM_COMPRESSED != 0;
  let second_compressed = opcode & SECOND_PARAM_COMPRESSED != 0;
  let Some(command_type) = CommandType::from_u8(opcode & COMMAND_MASK) else {
    return ParsedRecord::Invalid(format!("unknown opcode {opcode:#x}"));
  };
  let mut buf = &data[1..];
  let command = match command_type {
    CommandType::CreateOrUpdate => {
      let key_len = operand!(&mut buf);
      let value_len = operand!(&mut buf);
      let key = bytes_operand!(&mut buf, key_len, first_compressed, compression);
      let value_pos = data.len() - buf.len();
      if (buf.len() as u64) < value_len {
        return ParsedRecord::Truncated;
      }
      let value = buf[..value_len as usize].to_vec();
      buf.advance(value_len as usize);
      LogCommand::CreateOrUpdate {
        key,
        value,
        value_compressed: second_compressed,
        value_pos,
      }
    }
    CommandType::UpdateKeySuffix => {
      let prefix_len = operand!(&mut buf);
      let key_len = operand!(&mut buf);
      let key = bytes_operand!(&mut buf, key_len, second_compressed, compression);
      if prefix_len as usize > key.len() {
        return ParsedRecord::Invalid("key suffix prefix longer than key".into());
      }
      LogCommand::UpdateKeySuffix {
        prefix_len: prefix_len as usize,
        key,
      }
    }
    CommandType::EraseOne => {
      let key_len = operand!(&mut buf);
      let key = bytes_operand!(&mut buf, key_len, first_compressed, compression);
      LogCommand::EraseOne { key }
    }
    CommandType::EraseRange => {
      let first_len = operand!(&mut buf);
      let last_len = operand!(&mut buf);
      let first_key = bytes_operand!(&mut buf, first_len, first_compressed, compression);
      let last_key = bytes_operand!(&mut buf, last_len, second_compressed, compression);
      LogCommand::EraseRange {
        first_key,
        last_key,
      }
    }
    CommandType::DeltaUlongs => {
      let index = operand!(&mut buf);
      let delta = operand!(&mut buf);
      if index > u32::MAX as u64 {
        return ParsedRecord::Invalid("ulong index out of range".into());
      }
      LogCommand::DeltaUlongs {
        index: index as u32,
        delta,
      }
    }
    CommandType::TransactionStart => {
      if buf.len() < 4 {
        return ParsedRecord::Truncated;
      }
      if buf.get_u32_le() != TRANSACTION_START_MAGIC {
        return ParsedRecord::Invalid("bad transaction start magic".into());
      }
      LogCommand::TransactionStart
    }
    CommandType::Commit => LogCommand::Commit,
    CommandType::CommitWithDeltaUlong => LogCommand::CommitWithDeltaUlong {
      delta: operand!(&mut buf),
    },
    CommandType::Rollback => LogCommand::Rollback,
    CommandType::EndOfFile => LogCommand::EndOfFile,
    CommandType::TemporaryEndOfFile => LogCommand::TemporaryEndOfFile,
  };
  ParsedRecord::Complete {
    command,
    len: data.len() - buf.len(),
  }
}

/// Appends records to the newest transaction log, starting a new file when
/// the current one would grow past the split size.
pub struct TrLogWriter {
  file: Option<Arc<DataFile>>,
  /// Last log of the chain, also when no file is open for writing yet.
  last_file_id: u32,
  split_size: u64,
  sync_writes: bool,
  bytes_per_sync: usize,
  unsynced: usize,
  finished_files: u64,
}

impl TrLogWriter {
  pub fn new(last_file_id: u32, split_size: u64, sync_writes: bool, bytes_per_sync: usize) -> Self {
    TrLogWriter {
      file: None,
      last_file_id,
      split_size,
      sync_writes,
      bytes_per_sync,
      unsynced: 0,
      finished_files: 0,
    }
  }

  /// Continues appending to an existing log at `offset`, dropping anything after it.
  pub fn resume(&mut self, file: Arc<DataFile>, offset: u64) -> Result<()> {
    file.truncate(offset)?;
    self.last_file_id = file.get_file_id();
    self.file = Some(file);
    Ok(())
  }

  /// File id and offset right after the last appended record.
  pub fn position(&self) -> (u32, u64) {
    match &self.file {
      Some(file) => (file.get_file_id(), file.get_write_off()),
      None => (self.last_file_id, 0),
    }
  }

  pub fn last_file_id(&self) -> u32 {
    self.last_file_id
  }

  /// Number of log files completed by this writer.
  pub fn finished_files(&self) -> u64 {
    self.finished_files
  }

  /// Appends one record and returns the file id and offset it landed at.
  pub fn append(&mut self, files: &FileCollection, record: &[u8]) -> Result<(u32, u64)> {
    let file = self.file_for(files, record.len() as u64)?;
    let offset = file.append(record)?;
    self.unsynced += record.len();
    Ok((file.get_file_id(), offset))
  }

  fn file_for(&mut self, files: &FileCollection, len: u64) -> Result<Arc<DataFile>> {
    if let Some(file) = &self.file {
      let header_len = files
        .file_info(file.get_file_id())
        .map_or(0, |info| info.header_len);
      let used = file.get_write_off();
      if used + len <= self.split_size || used <= header_len {
        return Ok(file.clone());
      }
      self.finish_current()?;
    }
    let (file_id, file) = files.create_file(FileInfo::trlog(self.last_file_id))?;
    debug!("transaction log continues in file {file_id}");
    self.last_file_id = file_id;
    self.file = Some(file.clone());
    Ok(file)
  }

  fn finish_current(&mut self) -> Result<()> {
    if let Some(file) = self.file.take() {
      file.append(&encode_marker(CommandType::EndOfFile))?;
      file.sync()?;
      file.truncate(file.get_write_off())?;
      self.unsynced = 0;
      self.finished_files += 1;
      info!("transaction log {} is full", file.get_file_id());
    }
    Ok(())
  }

  /// Makes the appended records durable as configured; `force` always hard flushes.
  pub fn flush(&mut self, force: bool) -> Result<()> {
    let Some(file) = &self.file else {
      return Ok(());
    };
    let due = self.bytes_per_sync > 0 && self.unsynced >= self.bytes_per_sync;
    if force || self.sync_writes || due {
      file.sync()?;
      self.unsynced = 0;
    }
    Ok(())
  }

  /// Writes the clean-close marker; the file may be resumed on the next open.
  pub fn close(&mut self) -> Result<()> {
    if let Some(file) = self.file.take() {
      file.append(&encode_marker(CommandType::TemporaryEndOfFile))?;
      file.sync()?;
    }
    Ok(())
  }
}

/// Reads the complete records of one log body.
pub struct TrLogReader<'a> {
  data: &'a [u8],
  pos: usize,
  compression: &'a dyn CompressionStrategy,
}

impl<'a> TrLogReader<'a> {
  pub fn new(data: &'a [u8], compression: &'a dyn CompressionStrategy) -> Self {
    TrLogReader {
      data,
      pos: 0,
      compression,
    }
  }

  /// Offset of the next unread byte.
  pub fn position(&self) -> usize {
    self.pos
  }

  pub fn next_record(&mut self) -> Result<Option<(usize, LogCommand)>> {
    if self.pos >= self.data.len() {
      return Ok(None);
    }
    match parse_record(&self.data[self.pos..], self.compression) {
      ParsedRecord::Complete { command, len } => {
        let start = self.pos;
        self.pos += len;
        Ok(Some((start, command)))
      }
      ParsedRecord::Truncated => Ok(None),
      ParsedRecord::Invalid(reason) => Err(Errors::CorruptedTransactionLog {
        file_id: 0,
        offset: self.pos as u64,
        reason,
      }),
    }
  }
}
