//! In-memory key/value store.
//!
//! One process-wide map guarded by a single mutex, which is adequate for
//! the command mix. Keys and values are raw byte strings; a value is a
//! tagged variant over the string, list, and hash families. Cross-type
//! operations fail with `WrongType`. No expiration.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::info;

/// A stored value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(Vec<u8>),
    List(VecDeque<Vec<u8>>),
    Hash(HashMap<Vec<u8>, Vec<u8>>),
}

/// Operation against a key holding the wrong kind of value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrongType;

pub type StoreResult<T> = Result<T, WrongType>;

/// Thread-safe in-memory store shared by every connection.
pub struct Store {
    data: Mutex<HashMap<Vec<u8>, Value>>,
}

impl Store {
    pub fn new() -> Arc<Self> {
        info!("initializing key/value store");
        Arc::new(Store {
            data: Mutex::new(HashMap::new()),
        })
    }

    /// Store a string value, overwriting any previous value of any type.
    pub fn set(&self, key: &[u8], value: Vec<u8>) {
        let mut data = self.data.lock().unwrap();
        data.insert(key.to_vec(), Value::Str(value));
    }

    /// Fetch a string value. `Ok(None)` when the key is absent.
    pub fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let data = self.data.lock().unwrap();
        match data.get(key) {
            None => Ok(None),
            Some(Value::Str(v)) => Ok(Some(v.clone())),
            Some(_) => Err(WrongType),
        }
    }

    /// Delete a key of any type. Returns whether it existed.
    pub fn del(&self, key: &[u8]) -> bool {
        let mut data = self.data.lock().unwrap();
        data.remove(key).is_some()
    }

    /// Every key in the store, in no particular order.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        let data = self.data.lock().unwrap();
        data.keys().cloned().collect()
    }

    /// Push values onto the head of a list, creating it if absent.
    /// Returns the list length afterwards.
    pub fn lpush(&self, key: &[u8], values: Vec<Vec<u8>>) -> StoreResult<usize> {
        let mut data = self.data.lock().unwrap();
        let entry = data
            .entry(key.to_vec())
            .or_insert_with(|| Value::List(VecDeque::new()));
        match entry {
            Value::List(list) => {
                for value in values {
                    list.push_front(value);
                }
                Ok(list.len())
            }
            _ => Err(WrongType),
        }
    }

    /// Pop the head of a list. An emptied list is removed.
    pub fn lpop(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let mut data = self.data.lock().unwrap();
        match data.get_mut(key) {
            None => Ok(None),
            Some(Value::List(list)) => {
                let popped = list.pop_front();
                if list.is_empty() {
                    data.remove(key);
                }
                Ok(popped)
            }
            Some(_) => Err(WrongType),
        }
    }

    /// List slice with Redis index semantics: negative indices count from
    /// the tail, out-of-range bounds clamp, inverted ranges are empty.
    pub fn lrange(&self, key: &[u8], start: i64, stop: i64) -> StoreResult<Vec<Vec<u8>>> {
        let data = self.data.lock().unwrap();
        match data.get(key) {
            None => Ok(Vec::new()),
            Some(Value::List(list)) => {
                let len = list.len() as i64;
                let mut start = if start < 0 { start + len } else { start };
                let mut stop = if stop < 0 { stop + len } else { stop };
                start = start.max(0);
                stop = stop.min(len - 1);
                if start > stop || start >= len {
                    return Ok(Vec::new());
                }
                Ok(list
                    .iter()
                    .skip(start as usize)
                    .take((stop - start + 1) as usize)
                    .cloned()
                    .collect())
            }
            Some(_) => Err(WrongType),
        }
    }

    /// Set a hash field, creating the hash if absent. Returns true when
    /// the field is new.
    pub fn hset(&self, key: &[u8], field: &[u8], value: Vec<u8>) -> StoreResult<bool> {
        let mut data = self.data.lock().unwrap();
        let entry = data
            .entry(key.to_vec())
            .or_insert_with(|| Value::Hash(HashMap::new()));
        match entry {
            Value::Hash(hash) => Ok(hash.insert(field.to_vec(), value).is_none()),
            _ => Err(WrongType),
        }
    }

    /// Fetch a hash field.
    pub fn hget(&self, key: &[u8], field: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let data = self.data.lock().unwrap();
        match data.get(key) {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(_) => Err(WrongType),
        }
    }

    /// Field names of a hash.
    pub fn hkeys(&self, key: &[u8]) -> StoreResult<Vec<Vec<u8>>> {
        let data = self.data.lock().unwrap();
        match data.get(key) {
            None => Ok(Vec::new()),
            Some(Value::Hash(hash)) => Ok(hash.keys().cloned().collect()),
            Some(_) => Err(WrongType),
        }
    }

    /// Number of keys, for logging and tests.
    pub fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }
}
