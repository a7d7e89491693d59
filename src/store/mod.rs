//! object stores: digest-addressed content plus published manifests
//!
//! every backend implements [`ObjectStore`]. "not found" is an ordinary
//! outcome (`Ok(false)` / `Ok(None)`), never an error, because callers branch
//! on it: a scan uses it as the dedup decision, a rebuild as the cache-miss
//! signal.

mod local;
mod memory;
mod s3;
pub mod sigv4;

use std::fmt;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use crate::error::{IoResultExt, Result};
use crate::hash::Digest;
use crate::lookup::LookupKey;
use crate::manifest::manifest_object_key;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use s3::{S3Options, S3Store};

/// a readable object body returned by [`ObjectStore::get`]
pub type ObjectReader = Box<dyn Read + Send>;

/// address of an entry in a store
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum StoreKey {
    /// file content, addressed by its digest
    Object(Digest),
    /// a manifest published under a lookup key
    Manifest(LookupKey),
}

impl StoreKey {
    /// key as used by remote backends: `<hex>` or `manifests/<key>.json`
    pub fn remote_key(&self) -> String {
        match self {
            StoreKey::Object(digest) => digest.to_hex(),
            StoreKey::Manifest(key) => manifest_object_key(key),
        }
    }

    /// the digest this key addresses, if it is a content object
    pub fn digest(&self) -> Option<&Digest> {
        match self {
            StoreKey::Object(digest) => Some(digest),
            StoreKey::Manifest(_) => None,
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.remote_key())
    }
}

/// re-openable byte source for an upload
///
/// a payload can be opened more than once, so a retried upload restarts the
/// stream from the beginning instead of buffering it.
#[derive(Clone, Debug)]
pub enum Payload {
    File { path: PathBuf, len: u64 },
    Bytes(Vec<u8>),
}

impl Payload {
    /// payload backed by a file on disk
    pub fn file(path: &Path) -> Result<Self> {
        let len = std::fs::metadata(path).with_path(path)?.len();
        Ok(Payload::File {
            path: path.to_path_buf(),
            len,
        })
    }

    pub fn len(&self) -> u64 {
        match self {
            Payload::File { len, .. } => *len,
            Payload::Bytes(bytes) => bytes.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// open a fresh reader over the whole payload
    pub fn open(&self) -> Result<ObjectReader> {
        match self {
            Payload::File { path, .. } => {
                let file = File::open(path).with_path(path)?;
                Ok(Box::new(file))
            }
            Payload::Bytes(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
        }
    }
}

/// key-value storage for content objects and manifests
///
/// object entries are immutable: writing a digest that already exists is a
/// no-op, and a failed write must never leave a partial object behind.
pub trait ObjectStore: Send + Sync {
    /// short human-readable description, used in logs
    fn describe(&self) -> String;

    /// verify the store is reachable and usable at all
    ///
    /// failure here is fatal for a run; per-key failures are not.
    fn check_access(&self) -> Result<()> {
        Ok(())
    }

    /// metadata-only existence check; never mutates
    fn exists(&self, key: &StoreKey) -> Result<bool>;

    /// store a payload under `key`
    fn put(&self, key: &StoreKey, payload: &Payload) -> Result<()>;

    /// open an entry for reading; `Ok(None)` when it does not exist
    fn get(&self, key: &StoreKey) -> Result<Option<ObjectReader>>;
}

impl<S: ObjectStore + ?Sized> ObjectStore for Box<S> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn check_access(&self) -> Result<()> {
        (**self).check_access()
    }

    fn exists(&self, key: &StoreKey) -> Result<bool> {
        (**self).exists(key)
    }

    fn put(&self, key: &StoreKey, payload: &Payload) -> Result<()> {
        (**self).put(key, payload)
    }

    fn get(&self, key: &StoreKey) -> Result<Option<ObjectReader>> {
        (**self).get(key)
    }
}
