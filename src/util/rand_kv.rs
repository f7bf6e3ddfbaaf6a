use bytes::Bytes;
use rand::{distr::Alphanumeric, Rng};

/// Zero padded keys keep numeric and byte order the same.
pub fn get_test_key(i: usize) -> Bytes {
  Bytes::from(format!("snapkv-key-{:09}", i))
}

pub fn get_test_value(i: usize) -> Bytes {
  let suffix: String = rand::rng()
    .sample_iter(&Alphanumeric)
    .take(24)
    .map(char::from)
    .collect();
  Bytes::from(format!("snapkv-value-{:09}-{}", i, suffix))
}
