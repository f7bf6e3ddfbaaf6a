use std::{
  fs::OpenOptions,
  io::{Seek, SeekFrom, Write},
  path::Path,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  thread,
  time::Duration,
};

use bytes::Bytes;

use crate::{
  compactor::CancellationToken,
  cursor::{FindResult, UpdateKeySuffixResult},
  data::data_file::get_data_file_name,
  db::KeyValueDb,
  errors::Errors,
  option::Options,
  util::rand_kv::{get_test_key, get_test_value},
};

fn init_logger() {
  let _ = env_logger::builder().is_test(true).try_init();
}

fn test_options(dir: &Path) -> Options {
  init_logger();
  let mut opts = Options::default();
  opts.dir_path = dir.to_path_buf();
  opts.auto_compaction = false;
  opts
}

fn value_of(i: usize, round: usize) -> Vec<u8> {
  format!("{round}-{i:06}-{}", "x".repeat(190)).into_bytes()
}

fn put_one(db: &KeyValueDb, key: &[u8], value: &[u8]) {
  let tx = db.start_writing_transaction().unwrap();
  tx.put(key, value).unwrap();
  tx.commit().unwrap();
}

fn get_one(db: &KeyValueDb, key: &[u8]) -> Option<Bytes> {
  db.start_read_only_transaction().unwrap().get(key).unwrap()
}

fn log_file_count(db: &KeyValueDb) -> usize {
  db.calc_stats()
    .files
    .get("TransactionLog")
    .map_or(0, |s| s.count)
}

#[test]
fn test_put_get_and_reopen() {
  let dir = tempfile::tempdir().unwrap();
  let opts = test_options(dir.path());
  {
    let db = KeyValueDb::open(opts.clone()).unwrap();
    let tx = db.start_transaction().unwrap();
    assert!(tx.put(b"small", b"xyz").unwrap());
    assert!(tx.put(b"large", &value_of(1, 0)).unwrap());
    assert!(!tx.put(b"small", b"abc").unwrap());
    assert_eq!(tx.get(b"small").unwrap(), Some(Bytes::from_static(b"abc")));
    tx.commit().unwrap();
  }

  let db = KeyValueDb::open(opts).unwrap();
  assert_eq!(get_one(&db, b"small"), Some(Bytes::from_static(b"abc")));
  assert_eq!(get_one(&db, b"large"), Some(Bytes::from(value_of(1, 0))));
  assert_eq!(get_one(&db, b"missing"), None);
  let tx = db.start_read_only_transaction().unwrap();
  assert_eq!(tx.key_count().unwrap(), 2);
  assert_eq!(tx.transaction_number().unwrap(), 1);
}

#[test]
fn test_short_values_are_inline() {
  let dir = tempfile::tempdir().unwrap();
  let db = KeyValueDb::open(test_options(dir.path())).unwrap();
  put_one(&db, b"k", b"xyz");
  put_one(&db, b"long", b"eight!!!");

  let root = db.inner.registry.last_committed();
  assert_eq!(root.tree.get(b"k").unwrap().file_id(), 0);
  assert_ne!(root.tree.get(b"long").unwrap().file_id(), 0);
  assert_eq!(get_one(&db, b"k"), Some(Bytes::from_static(b"xyz")));
}

#[test]
fn test_snapshot_isolation() {
  let dir = tempfile::tempdir().unwrap();
  let db = KeyValueDb::open(test_options(dir.path())).unwrap();
  put_one(&db, b"key", b"old");

  let reader = db.start_read_only_transaction().unwrap();
  assert!(reader.is_read_only());
  put_one(&db, b"key", b"new");
  put_one(&db, b"other", b"value");

  assert_eq!(reader.get(b"key").unwrap(), Some(Bytes::from_static(b"old")));
  assert_eq!(reader.get(b"other").unwrap(), None);
  assert_eq!(get_one(&db, b"key"), Some(Bytes::from_static(b"new")));
  assert!(matches!(
    reader.put(b"key", b"x"),
    Err(Errors::ReadOnlyTransaction)
  ));
}

#[test]
fn test_rollback_and_drop_discard_changes() {
  let dir = tempfile::tempdir().unwrap();
  let opts = test_options(dir.path());
  {
    let db = KeyValueDb::open(opts.clone()).unwrap();
    put_one(&db, b"kept", b"1");

    let tx = db.start_writing_transaction().unwrap();
    tx.put(b"rolled-back", &value_of(1, 0)).unwrap();
    tx.rollback().unwrap();

    let tx = db.start_writing_transaction().unwrap();
    tx.put(b"dropped", b"2").unwrap();
    drop(tx);

    assert_eq!(get_one(&db, b"rolled-back"), None);
    assert_eq!(get_one(&db, b"dropped"), None);
    put_one(&db, b"after", b"3");
  }

  let db = KeyValueDb::open(opts).unwrap();
  let tx = db.start_read_only_transaction().unwrap();
  assert_eq!(tx.key_count().unwrap(), 2);
  assert_eq!(tx.get(b"rolled-back").unwrap(), None);
  assert_eq!(tx.get(b"after").unwrap(), Some(Bytes::from_static(b"3")));
}

#[test]
fn test_second_writer_gets_try_again() {
  let dir = tempfile::tempdir().unwrap();
  let db = KeyValueDb::open(test_options(dir.path())).unwrap();

  let first = db.start_transaction().unwrap();
  let second = db.start_transaction().unwrap();
  first.put(b"a", b"1").unwrap();
  assert!(first.is_writable());

  let err = second.put(b"b", b"2").unwrap_err();
  assert_eq!(err, Errors::TryAgain);
  assert!(err.is_retryable());

  first.commit().unwrap();
  // the snapshot of `second` is stale now
  assert_eq!(second.put(b"b", b"2"), Err(Errors::TryAgain));
  drop(second);

  let third = db.start_transaction().unwrap();
  third.put(b"b", b"2").unwrap();
  third.commit().unwrap();
  assert_eq!(get_one(&db, b"b"), Some(Bytes::from_static(b"2")));
}

#[test]
fn test_writing_transactions_are_serialized() {
  let dir = tempfile::tempdir().unwrap();
  let db = Arc::new(KeyValueDb::open(test_options(dir.path())).unwrap());

  let tx = db.start_writing_transaction().unwrap();
  tx.put(b"counter", b"1").unwrap();

  let admitted = Arc::new(AtomicBool::new(false));
  let handle = {
    let db = db.clone();
    let admitted = admitted.clone();
    thread::spawn(move || {
      let tx = db.start_writing_transaction().unwrap();
      admitted.store(true, Ordering::SeqCst);
      let seen = tx.get(b"counter").unwrap();
      tx.put(b"counter", b"2").unwrap();
      tx.commit().unwrap();
      seen
    })
  };

  thread::sleep(Duration::from_millis(100));
  assert!(!admitted.load(Ordering::SeqCst));
  tx.commit().unwrap();

  let seen = handle.join().unwrap();
  assert_eq!(seen, Some(Bytes::from_static(b"1")));
  assert_eq!(get_one(&db, b"counter"), Some(Bytes::from_static(b"2")));
}

#[test]
fn test_concurrent_writers_with_retry() {
  let dir = tempfile::tempdir().unwrap();
  let db = Arc::new(KeyValueDb::open(test_options(dir.path())).unwrap());
  put_one(&db, b"counter", &0u64.to_le_bytes());

  let handles: Vec<_> = (0..4)
    .map(|_| {
      let db = db.clone();
      thread::spawn(move || {
        for _ in 0..25 {
          loop {
            let tx = db.start_transaction().unwrap();
            let current = tx.get(b"counter").unwrap().unwrap();
            let next = u64::from_le_bytes(current.as_ref().try_into().unwrap()) + 1;
            match tx.put(b"counter", &next.to_le_bytes()) {
              Ok(_) => {
                tx.commit().unwrap();
                break;
              }
              Err(e) if e.is_retryable() => thread::yield_now(),
              Err(e) => panic!("unexpected error {e}"),
            }
          }
        }
      })
    })
    .collect();
  for handle in handles {
    handle.join().unwrap();
  }

  let value = get_one(&db, b"counter").unwrap();
  assert_eq!(u64::from_le_bytes(value.as_ref().try_into().unwrap()), 100);
}

#[test]
fn test_replay_is_idempotent() {
  let dir = tempfile::tempdir().unwrap();
  let opts = test_options(dir.path());
  {
    let db = KeyValueDb::open(opts.clone()).unwrap();
    for i in 0..50 {
      put_one(&db, &get_test_key(i), &get_test_value(i));
    }
    let tx = db.start_writing_transaction().unwrap();
    tx.delete(&get_test_key(3)).unwrap();
    tx.set_ulong(2, 40).unwrap();
    tx.next_ulong(0).unwrap();
    tx.set_commit_ulong(9).unwrap();
    tx.commit().unwrap();
  }

  let snapshot = |db: &KeyValueDb| {
    let tx = db.start_read_only_transaction().unwrap();
    let cursor = tx.create_cursor().unwrap();
    let mut entries = Vec::new();
    while cursor.find_next(b"").unwrap() {
      entries.push((cursor.get_key().unwrap(), cursor.get_value().unwrap()));
    }
    let ulongs = (0..3).map(|i| tx.ulong(i).unwrap()).collect::<Vec<_>>();
    (entries, ulongs, tx.commit_ulong().unwrap())
  };

  let first = snapshot(&KeyValueDb::open(opts.clone()).unwrap());
  let second = snapshot(&KeyValueDb::open(opts).unwrap());
  assert_eq!(first, second);
  assert_eq!(first.0.len(), 49);
  assert_eq!(first.1, vec![1, 0, 40]);
  assert_eq!(first.2, 9);
}

#[test]
fn test_rollover_chain_replay() {
  let dir = tempfile::tempdir().unwrap();
  let mut opts = test_options(dir.path());
  opts.file_split_size = 4096;
  {
    let db = KeyValueDb::open(opts.clone()).unwrap();
    for i in 0..200 {
      put_one(&db, &get_test_key(i), &value_of(i, 0));
    }
    assert!(log_file_count(&db) > 5);
  }

  let db = KeyValueDb::open(opts).unwrap();
  let tx = db.start_read_only_transaction().unwrap();
  assert_eq!(tx.key_count().unwrap(), 200);
  for i in (0..200).step_by(17) {
    assert_eq!(tx.get(&get_test_key(i)).unwrap(), Some(Bytes::from(value_of(i, 0))));
  }
}

#[test]
fn test_transaction_spanning_log_files() {
  let dir = tempfile::tempdir().unwrap();
  let mut opts = test_options(dir.path());
  opts.file_split_size = 4096;
  {
    let db = KeyValueDb::open(opts.clone()).unwrap();
    let tx = db.start_writing_transaction().unwrap();
    for i in 0..100 {
      tx.put(&get_test_key(i), &value_of(i, 0)).unwrap();
    }
    tx.commit().unwrap();
    let committed_logs = log_file_count(&db);
    assert!(committed_logs > 3);

    let tx = db.start_writing_transaction().unwrap();
    for i in 0..100 {
      tx.put(&get_test_key(i), &value_of(i, 1)).unwrap();
    }
    tx.put(b"rolled-back", &value_of(0, 1)).unwrap();
    tx.rollback().unwrap();
    assert!(log_file_count(&db) > committed_logs);
    assert_eq!(get_one(&db, b"rolled-back"), None);
  }

  let db = KeyValueDb::open(opts).unwrap();
  let tx = db.start_read_only_transaction().unwrap();
  assert_eq!(tx.key_count().unwrap(), 100);
  assert_eq!(tx.get(b"rolled-back").unwrap(), None);
  for i in 0..100 {
    assert_eq!(tx.get(&get_test_key(i)).unwrap(), Some(Bytes::from(value_of(i, 0))));
  }
  assert_eq!(db.calc_stats().last_transaction_id, 1);
}

#[test]
fn test_failed_commit_releases_the_writer() {
  let dir = tempfile::tempdir().unwrap();
  let opts = test_options(dir.path());
  {
    let db = KeyValueDb::open(opts.clone()).unwrap();
    put_one(&db, b"kept", &value_of(1, 0));

    let tx = db.start_writing_transaction().unwrap();
    tx.put(b"lost", &value_of(2, 0)).unwrap();
    db.inner.closed.store(true, Ordering::SeqCst);
    assert_eq!(tx.commit(), Err(Errors::DatabaseClosed));
    db.inner.closed.store(false, Ordering::SeqCst);

    let tx = db.start_writing_transaction().unwrap();
    assert_eq!(tx.get(b"lost").unwrap(), None);
    tx.put(b"after", &value_of(3, 0)).unwrap();
    tx.commit().unwrap();
  }

  let db = KeyValueDb::open(opts).unwrap();
  assert_eq!(get_one(&db, b"lost"), None);
  assert_eq!(get_one(&db, b"kept"), Some(Bytes::from(value_of(1, 0))));
  assert_eq!(get_one(&db, b"after"), Some(Bytes::from(value_of(3, 0))));
}

#[test]
fn test_clean_close_resumes_the_same_log() {
  let dir = tempfile::tempdir().unwrap();
  let opts = test_options(dir.path());
  for round in 0..3 {
    let db = KeyValueDb::open(opts.clone()).unwrap();
    put_one(&db, format!("key-{round}").as_bytes(), &value_of(round, round));
  }
  let db = KeyValueDb::open(opts).unwrap();
  assert_eq!(log_file_count(&db), 1);
  assert_eq!(db.start_read_only_transaction().unwrap().key_count().unwrap(), 3);
}

#[test]
fn test_key_index_round_trip() {
  let dir = tempfile::tempdir().unwrap();
  let opts = test_options(dir.path());
  {
    let db = KeyValueDb::open(opts.clone()).unwrap();
    for i in 0..30 {
      put_one(&db, &get_test_key(i), &value_of(i, 0));
    }
    db.create_kvi().unwrap();
    for i in 30..40 {
      put_one(&db, &get_test_key(i), &value_of(i, 0));
    }
    assert_eq!(db.calc_stats().last_transaction_id, 40);
  }

  let db = KeyValueDb::open(opts).unwrap();
  let stats = db.calc_stats();
  assert!(stats.last_key_index.is_some());
  assert_eq!(stats.key_count, 40);
  assert_eq!(stats.last_transaction_id, 40);
  let tx = db.start_read_only_transaction().unwrap();
  assert_eq!(tx.get(&get_test_key(35)).unwrap(), Some(Bytes::from(value_of(35, 0))));
  assert_eq!(tx.get(&get_test_key(5)).unwrap(), Some(Bytes::from(value_of(5, 0))));
}

#[test]
fn test_compaction_keeps_snapshots_readable() {
  let dir = tempfile::tempdir().unwrap();
  let mut opts = test_options(dir.path());
  opts.file_split_size = 4096;
  let token = CancellationToken::new();
  {
    let db = KeyValueDb::open(opts.clone()).unwrap();
    for i in 0..100 {
      put_one(&db, &get_test_key(i), &value_of(i, 0));
    }
    let reader = db.start_read_only_transaction().unwrap();
    for i in 0..100 {
      put_one(&db, &get_test_key(i), &value_of(i, 1));
    }
    let before = log_file_count(&db);

    db.compact(&token).unwrap();
    for i in (0..100).step_by(9) {
      assert_eq!(reader.get(&get_test_key(i)).unwrap(), Some(Bytes::from(value_of(i, 0))));
    }
    drop(reader);

    assert!(db.compact(&token).unwrap());
    assert!(log_file_count(&db) < before);
    for i in 0..100 {
      assert_eq!(get_one(&db, &get_test_key(i)), Some(Bytes::from(value_of(i, 1))));
    }
  }

  let db = KeyValueDb::open(opts).unwrap();
  let tx = db.start_read_only_transaction().unwrap();
  assert_eq!(tx.key_count().unwrap(), 100);
  for i in 0..100 {
    assert_eq!(tx.get(&get_test_key(i)).unwrap(), Some(Bytes::from(value_of(i, 1))));
  }
}

#[test]
fn test_cancelled_compaction_does_nothing() {
  let dir = tempfile::tempdir().unwrap();
  let mut opts = test_options(dir.path());
  opts.file_split_size = 4096;
  let db = KeyValueDb::open(opts).unwrap();
  for i in 0..50 {
    put_one(&db, &get_test_key(i), &value_of(i, 0));
  }
  let token = CancellationToken::new();
  token.cancel();
  assert!(!db.compact(&token).unwrap());
  assert_eq!(get_one(&db, &get_test_key(7)), Some(Bytes::from(value_of(7, 0))));
}

#[test]
fn test_cursor_follows_erase_by_another_cursor() {
  let dir = tempfile::tempdir().unwrap();
  let db = KeyValueDb::open(test_options(dir.path())).unwrap();
  let tx = db.start_writing_transaction().unwrap();
  for key in [b"a", b"b", b"c"] {
    tx.put(key, b"v").unwrap();
  }

  let first = tx.create_cursor().unwrap();
  let second = tx.create_cursor().unwrap();
  assert!(first.find_first(b"").unwrap());
  assert_eq!(first.get_key().unwrap(), Bytes::from_static(b"a"));

  assert!(second.find_exact(b"b").unwrap());
  second.erase_current().unwrap();
  assert!(matches!(second.get_key(), Err(Errors::CursorNotPositioned)));

  assert!(first.find_next(b"").unwrap());
  assert_eq!(first.get_key().unwrap(), Bytes::from_static(b"c"));
  assert!(second.find_next(b"").unwrap());
  assert_eq!(second.get_key().unwrap(), Bytes::from_static(b"c"));
  tx.commit().unwrap();
}

#[test]
fn test_cursor_find_and_key_suffix() {
  let dir = tempfile::tempdir().unwrap();
  let opts = test_options(dir.path());
  {
    let db = KeyValueDb::open(opts.clone()).unwrap();
    let tx = db.start_writing_transaction().unwrap();
    tx.put(b"user/1/name", b"ann").unwrap();
    tx.put(b"user/2/name", b"bob").unwrap();
    tx.put(b"zzz", b"last").unwrap();

    let cursor = tx.create_cursor().unwrap();
    assert_eq!(cursor.find(b"user/1/zzz").unwrap(), FindResult::Previous);
    assert_eq!(cursor.get_key().unwrap(), Bytes::from_static(b"user/1/name"));
    assert_eq!(cursor.find(b"a").unwrap(), FindResult::Next);
    assert_eq!(cursor.key_index().unwrap(), Some(0));

    assert!(cursor.find_last(b"user/").unwrap());
    assert_eq!(cursor.get_value().unwrap(), Bytes::from_static(b"bob"));
    assert!(!cursor.find_next(b"user/").unwrap());
    assert!(cursor.find_previous(b"user/").unwrap());
    assert_eq!(cursor.get_key().unwrap(), Bytes::from_static(b"user/2/name"));
    assert!(cursor.find_previous(b"user/").unwrap());
    assert!(!cursor.find_previous(b"user/").unwrap());

    assert!(cursor.seek_index(2).unwrap());
    cursor.update_value(b"updated").unwrap();
    assert_eq!(tx.get(b"zzz").unwrap(), Some(Bytes::from_static(b"updated")));
    assert!(!cursor.seek_index(3).unwrap());
    assert!(matches!(cursor.get_key(), Err(Errors::CursorNotPositioned)));

    assert_eq!(
      cursor.update_key_suffix(b"user/2/nick", 7).unwrap(),
      UpdateKeySuffixResult::Updated
    );
    assert_eq!(
      cursor.update_key_suffix(b"user/x", 5).unwrap(),
      UpdateKeySuffixResult::NotUniquePrefix
    );
    assert_eq!(tx.erase_all().unwrap(), 3);
    tx.put(b"user/2/nick", b"bobby").unwrap();
    tx.put(b"user/3/name", b"cy").unwrap();
    tx.commit().unwrap();

    let tx = db.start_writing_transaction().unwrap();
    let cursor = tx.create_cursor().unwrap();
    assert_eq!(
      cursor.update_key_suffix(b"user/3/nick", 7).unwrap(),
      UpdateKeySuffixResult::Updated
    );
    tx.commit().unwrap();
  }

  let db = KeyValueDb::open(opts).unwrap();
  let tx = db.start_read_only_transaction().unwrap();
  assert_eq!(tx.key_count().unwrap(), 2);
  assert_eq!(tx.get(b"user/3/nick").unwrap(), Some(Bytes::from_static(b"cy")));
  assert_eq!(tx.get(b"user/3/name").unwrap(), None);
}

#[test]
fn test_damaged_log_tail_needs_lenient_open() {
  let dir = tempfile::tempdir().unwrap();
  let mut opts = test_options(dir.path());
  {
    let db = KeyValueDb::open(opts.clone()).unwrap();
    for i in 0..3 {
      put_one(&db, &get_test_key(i), &value_of(i, 0));
    }
  }

  // overwrite the close marker of the only log with garbage
  let path = get_data_file_name(dir.path(), 1);
  let mut file = OpenOptions::new().write(true).open(&path).unwrap();
  file.seek(SeekFrom::End(-1)).unwrap();
  file.write_all(&[0xff, 0xff]).unwrap();
  drop(file);

  assert!(matches!(
    KeyValueDb::open(opts.clone()),
    Err(Errors::CorruptedTransactionLog { file_id: 1, .. })
  ));

  opts.lenient_open = true;
  {
    let db = KeyValueDb::open(opts.clone()).unwrap();
    assert_eq!(db.calc_stats().key_count, 3);
    put_one(&db, b"after-repair", b"ok");
  }

  opts.lenient_open = false;
  let db = KeyValueDb::open(opts).unwrap();
  assert_eq!(db.calc_stats().key_count, 4);
}

#[test]
fn test_open_up_to_commit_ulong_is_read_only() {
  let dir = tempfile::tempdir().unwrap();
  let mut opts = test_options(dir.path());
  {
    let db = KeyValueDb::open(opts.clone()).unwrap();
    for i in 1..=3u64 {
      let tx = db.start_writing_transaction().unwrap();
      tx.put(&get_test_key(i as usize), b"v").unwrap();
      tx.set_commit_ulong(i).unwrap();
      tx.commit().unwrap();
    }
  }

  opts.open_up_to_commit_ulong = Some(2);
  {
    let db = KeyValueDb::open(opts.clone()).unwrap();
    let tx = db.start_read_only_transaction().unwrap();
    assert_eq!(tx.key_count().unwrap(), 2);
    assert_eq!(tx.commit_ulong().unwrap(), 2);
    assert!(matches!(
      db.start_writing_transaction(),
      Err(Errors::InvalidOperation(_))
    ));
  }

  opts.open_up_to_commit_ulong = None;
  let db = KeyValueDb::open(opts).unwrap();
  assert_eq!(db.calc_stats().key_count, 3);
}

#[test]
fn test_directory_is_locked_while_open() {
  let dir = tempfile::tempdir().unwrap();
  let opts = test_options(dir.path());
  let _db = KeyValueDb::open(opts.clone()).unwrap();
  assert!(matches!(KeyValueDb::open(opts), Err(Errors::DatabaseIsUsing)));
}

#[test]
fn test_background_compactor_starts_and_stops() {
  let dir = tempfile::tempdir().unwrap();
  let mut opts = test_options(dir.path());
  opts.file_split_size = 4096;
  opts.auto_compaction = true;
  opts.compactor_wait_time = Duration::from_millis(10);
  {
    let db = KeyValueDb::open(opts.clone()).unwrap();
    for round in 0..3 {
      for i in 0..40 {
        put_one(&db, &get_test_key(i), &value_of(i, round));
      }
    }
    db.advise_compaction();
    thread::sleep(Duration::from_millis(200));
    let stats = db.calc_stats();
    assert_eq!(stats.key_count, 40);
    assert!(stats.to_string().contains("keys: 40"));
  }

  let db = KeyValueDb::open(opts).unwrap();
  for i in 0..40 {
    assert_eq!(get_one(&db, &get_test_key(i)), Some(Bytes::from(value_of(i, 2))));
  }
}
