use criterion::{criterion_group, criterion_main, Criterion};
use rand::Rng;
use snapkv::{
  compactor::CancellationToken,
  db::KeyValueDb,
  option::Options,
  util::rand_kv::{get_test_key, get_test_value},
};
use std::path::PathBuf;

const PRELOADED_KEYS: usize = 100000;

fn open_bench_db(name: &str) -> KeyValueDb {
  let _ = env_logger::builder().is_test(true).try_init();
  let mut option = Options::default();
  option.dir_path = PathBuf::from("/tmp/snapkv-bench").join(name);
  option.auto_compaction = false;
  if option.dir_path.is_dir() {
    std::fs::remove_dir_all(&option.dir_path).unwrap();
  }
  std::fs::create_dir_all(&option.dir_path).unwrap();
  KeyValueDb::open(option).unwrap()
}

fn preload(db: &KeyValueDb) {
  let tx = db.start_writing_transaction().unwrap();
  for i in 0..PRELOADED_KEYS {
    tx.put(&get_test_key(i), &get_test_value(i)).unwrap();
  }
  tx.commit().unwrap();
}

fn bench_put(c: &mut Criterion) {
  let db = open_bench_db("put-bench");
  let mut rnd = rand::rng();

  c.bench_function("snapkv-put-bench", |b| {
    b.iter(|| {
      let i = rnd.random_range(0..u32::MAX) as usize;
      let tx = db.start_writing_transaction().unwrap();
      tx.put(&get_test_key(i), &get_test_value(i)).unwrap();
      assert!(tx.commit().is_ok());
    })
  });

  drop(db);
  std::fs::remove_dir_all("/tmp/snapkv-bench/put-bench").unwrap();
}

fn bench_batch_put(c: &mut Criterion) {
  let db = open_bench_db("batch-put-bench");
  let mut rnd = rand::rng();

  c.bench_function("snapkv-batch-put-bench", |b| {
    b.iter(|| {
      let tx = db.start_writing_transaction().unwrap();
      for _ in 0..100 {
        let i = rnd.random_range(0..u32::MAX) as usize;
        tx.put(&get_test_key(i), &get_test_value(i)).unwrap();
      }
      assert!(tx.commit().is_ok());
    })
  });

  drop(db);
  std::fs::remove_dir_all("/tmp/snapkv-bench/batch-put-bench").unwrap();
}

fn bench_get(c: &mut Criterion) {
  let db = open_bench_db("get-bench");
  preload(&db);
  let tx = db.start_read_only_transaction().unwrap();
  let mut rnd = rand::rng();

  c.bench_function("snapkv-get-bench", |b| {
    b.iter(|| {
      let i = rnd.random_range(0..u32::MAX) as usize;
      let res = tx.get(&get_test_key(i)).unwrap();
      assert_eq!(res.is_some(), i < PRELOADED_KEYS);
    })
  });

  drop(tx);
  drop(db);
  std::fs::remove_dir_all("/tmp/snapkv-bench/get-bench").unwrap();
}

fn bench_delete(c: &mut Criterion) {
  let db = open_bench_db("delete-bench");
  preload(&db);
  let mut rnd = rand::rng();

  c.bench_function("snapkv-delete-bench", |b| {
    b.iter(|| {
      let i = rnd.random_range(0..PRELOADED_KEYS);
      let tx = db.start_writing_transaction().unwrap();
      tx.delete(&get_test_key(i)).unwrap();
      assert!(tx.commit().is_ok());
    })
  });

  drop(db);
  std::fs::remove_dir_all("/tmp/snapkv-bench/delete-bench").unwrap();
}

fn bench_cursor_scan(c: &mut Criterion) {
  let db = open_bench_db("scan-bench");
  preload(&db);
  let tx = db.start_read_only_transaction().unwrap();

  c.bench_function("snapkv-scan-bench", |b| {
    b.iter(|| {
      let cursor = tx.create_cursor().unwrap();
      let mut count = 0;
      while cursor.find_next(b"snapkv-key-").unwrap() {
        count += 1;
      }
      assert_eq!(count, PRELOADED_KEYS);
    })
  });

  drop(tx);
  drop(db);
  std::fs::remove_dir_all("/tmp/snapkv-bench/scan-bench").unwrap();
}

fn bench_compact(c: &mut Criterion) {
  let db = open_bench_db("compact-bench");
  preload(&db);
  let token = CancellationToken::new();

  c.bench_function("snapkv-compact-bench", |b| {
    b.iter(|| {
      let tx = db.start_writing_transaction().unwrap();
      for i in (0..PRELOADED_KEYS).step_by(10) {
        tx.put(&get_test_key(i), &get_test_value(i)).unwrap();
      }
      tx.commit().unwrap();
      assert!(db.compact(&token).is_ok());
    })
  });

  drop(db);
  std::fs::remove_dir_all("/tmp/snapkv-bench/compact-bench").unwrap();
}

fn bench_stat(c: &mut Criterion) {
  let db = open_bench_db("stat-bench");
  preload(&db);

  c.bench_function("snapkv-stat-bench", |b| {
    b.iter(|| {
      let stats = db.calc_stats();
      assert_eq!(stats.key_count, PRELOADED_KEYS);
    })
  });

  drop(db);
  std::fs::remove_dir_all("/tmp/snapkv-bench/stat-bench").unwrap();
}

criterion_group!(
  benches,
  bench_get,
  bench_put,
  bench_batch_put,
  bench_delete,
  bench_cursor_scan,
  bench_compact,
  bench_stat
);
criterion_main!(benches);
