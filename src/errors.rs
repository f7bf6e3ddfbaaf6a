use std::result;

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum Errors {
  #[error("failed to read from data file")]
  FailedToReadFromDataFile,

  #[error("failed to write to data file")]
  FailedToWriteToDataFile,

  #[error("failed to sync data file")]
  FailedToSyncDataFile,

  #[error("failed to open data file")]
  FailedToOpenDataFile,

  #[error("failed to truncate data file")]
  FailedToTruncateDataFile,

  #[error("failed to remove data file")]
  FailedToRemoveDataFile,

  #[error("data file is opened read only")]
  ReadOnlyDataFile,

  #[error("failed to create the database directory")]
  FailedToCreateDatabaseDir,

  #[error("failed to read the database directory")]
  FailedToReadDatabaseDir,

  #[error("the database directory is used by another process")]
  DatabaseIsUsing,

  #[error("the database is closed")]
  DatabaseClosed,

  #[error("read data file eof")]
  ReadDataFileEOF,

  #[error("invalid options: {0}")]
  InvalidOptions(String),

  #[error("another transaction is writing or the snapshot is stale, try again")]
  TryAgain,

  #[error("file {file_id} is corrupted: {reason}")]
  CorruptedFile { file_id: u32, reason: String },

  #[error("transaction log {file_id} is corrupted at offset {offset}: {reason}")]
  CorruptedTransactionLog {
    file_id: u32,
    offset: u64,
    reason: String,
  },

  #[error("database cannot be recovered: {0}")]
  UnrecoverableDatabase(String),

  #[error("failed to decompress value")]
  FailedToDecompress,

  #[error("transaction is read only")]
  ReadOnlyTransaction,

  #[error("transaction is already finished")]
  TransactionFinished,

  #[error("cursor is not positioned on a key")]
  CursorNotPositioned,

  #[error("invalid operation: {0}")]
  InvalidOperation(String),

  #[error("value of {0} bytes is too large to store")]
  ValueTooLarge(usize),

  #[error(
    "value file {file_id} is missing (transaction {transaction_id}, trlog {trlog_file_id}:{trlog_offset}, commit ulong {commit_ulong})"
  )]
  MissingValueFile {
    file_id: u32,
    transaction_id: u64,
    trlog_file_id: u32,
    trlog_offset: u64,
    commit_ulong: u64,
  },
}

impl Errors {
  /// True for contention failures where the caller should restart its
  /// read-modify-write attempt.
  pub fn is_retryable(&self) -> bool {
    matches!(self, Errors::TryAgain)
  }

  pub(crate) fn corrupted_file(file_id: u32, reason: impl Into<String>) -> Self {
    Errors::CorruptedFile {
      file_id,
      reason: reason.into(),
    }
  }
}

pub type Result<T> = result::Result<T, Errors>;
