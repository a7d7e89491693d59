//! in-process store
//!
//! records every `put` call and can be told to fail specific keys, which is
//! how the engines' partial-failure behaviour is exercised.

use std::collections::{BTreeMap, HashSet};
use std::io::{Cursor, Read};
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, IoResultExt, Result};
use crate::hash::digest_bytes;
use crate::store::{ObjectReader, ObjectStore, Payload, StoreKey};

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Vec<u8>>,
    put_calls: Vec<String>,
    failing_puts: HashSet<String>,
    failing_reads: HashSet<String>,
    unreachable: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// insert raw bytes under `key`, bypassing digest verification
    pub fn insert(&self, key: &StoreKey, bytes: impl Into<Vec<u8>>) {
        self.lock().entries.insert(key.remote_key(), bytes.into());
    }

    /// drop an entry
    pub fn remove(&self, key: &StoreKey) -> bool {
        self.lock().entries.remove(&key.remote_key()).is_some()
    }

    pub fn contains(&self, key: &StoreKey) -> bool {
        self.lock().entries.contains_key(&key.remote_key())
    }

    /// raw bytes stored under `key`
    pub fn bytes(&self, key: &StoreKey) -> Option<Vec<u8>> {
        self.lock().entries.get(&key.remote_key()).cloned()
    }

    /// number of stored entries (objects and manifests)
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// every key passed to `put`, in call order
    pub fn put_calls(&self) -> Vec<String> {
        self.lock().put_calls.clone()
    }

    /// make `put` fail for `key`
    pub fn fail_puts_for(&self, key: &StoreKey) {
        self.lock().failing_puts.insert(key.remote_key());
    }

    /// make `exists` and `get` fail (not "not found") for `key`
    pub fn fail_reads_for(&self, key: &StoreKey) {
        self.lock().failing_reads.insert(key.remote_key());
    }

    /// make every operation fail, including the access check
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    fn injected(key: &str) -> Error {
        Error::Remote {
            status: 503,
            key: key.to_string(),
            message: "injected failure".to_string(),
        }
    }
}

impl ObjectStore for MemoryStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn check_access(&self) -> Result<()> {
        if self.lock().unreachable {
            return Err(Self::injected("<store>"));
        }
        Ok(())
    }

    fn exists(&self, key: &StoreKey) -> Result<bool> {
        let name = key.remote_key();
        let inner = self.lock();
        if inner.unreachable || inner.failing_reads.contains(&name) {
            return Err(Self::injected(&name));
        }
        Ok(inner.entries.contains_key(&name))
    }

    fn put(&self, key: &StoreKey, payload: &Payload) -> Result<()> {
        let name = key.remote_key();
        {
            let mut inner = self.lock();
            inner.put_calls.push(name.clone());
            if inner.unreachable || inner.failing_puts.contains(&name) {
                return Err(Self::injected(&name));
            }
        }

        let mut bytes = Vec::with_capacity(payload.len() as usize);
        payload.open()?.read_to_end(&mut bytes).with_path(&name)?;

        if let Some(expected) = key.digest() {
            let actual = digest_bytes(&bytes);
            if *expected != actual {
                return Err(Error::DigestMismatch {
                    expected: *expected,
                    actual,
                });
            }
        }

        self.lock().entries.insert(name, bytes);
        Ok(())
    }

    fn get(&self, key: &StoreKey) -> Result<Option<ObjectReader>> {
        let name = key.remote_key();
        let inner = self.lock();
        if inner.unreachable || inner.failing_reads.contains(&name) {
            return Err(Self::injected(&name));
        }
        Ok(inner
            .entries
            .get(&name)
            .map(|bytes| Box::new(Cursor::new(bytes.clone())) as ObjectReader))
    }
}
