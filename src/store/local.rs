//! on-disk store rooted at a cache directory
//!
//! layout:
//!
//! ```text
//! <root>/objects/<hex[0..2]>/<hex[2..]>
//! <root>/manifests/<lookup-key>.json
//! <root>/tmp/                      staging for atomic writes
//! ```

use std::fs::{self, File};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, IoResultExt, Result};
use crate::fs::fsync_dir;
use crate::hash::{Digest, HashingReader};
use crate::manifest::MANIFEST_PREFIX;
use crate::store::{ObjectReader, ObjectStore, Payload, StoreKey};

pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// open a store at `root`, creating its directory structure if missing
    pub fn open(root: &Path) -> Result<Self> {
        let store = Self {
            root: root.to_path_buf(),
        };
        fs::create_dir_all(store.objects_path()).with_path(store.objects_path())?;
        fs::create_dir_all(store.manifests_path()).with_path(store.manifests_path())?;
        fs::create_dir_all(store.tmp_path()).with_path(store.tmp_path())?;
        Ok(store)
    }

    /// store root path
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// path to objects directory
    pub fn objects_path(&self) -> PathBuf {
        self.root.join("objects")
    }

    /// path to manifests directory
    pub fn manifests_path(&self) -> PathBuf {
        self.root.join(MANIFEST_PREFIX)
    }

    /// path to tmp directory (for atomic writes)
    pub fn tmp_path(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// filesystem path backing `key`
    pub fn path_for(&self, key: &StoreKey) -> PathBuf {
        match key {
            StoreKey::Object(digest) => {
                let (dir, file) = digest.to_path_components();
                self.objects_path().join(dir).join(file)
            }
            StoreKey::Manifest(lookup) => self.manifests_path().join(format!("{lookup}.json")),
        }
    }

    /// copy the payload into a temp file, returning the digest of what was written
    fn write_temp(&self, tmp: &Path, payload: &Payload) -> Result<Digest> {
        let mut reader = HashingReader::new(payload.open()?);
        let mut file = File::create(tmp).with_path(tmp)?;
        io::copy(&mut reader, &mut file).with_path(tmp)?;
        file.sync_all().with_path(tmp)?;
        Ok(reader.finalize())
    }
}

impl ObjectStore for LocalStore {
    fn describe(&self) -> String {
        format!("local:{}", self.root.display())
    }

    fn check_access(&self) -> Result<()> {
        let objects = self.objects_path();
        let meta = fs::metadata(&objects).with_path(&objects)?;
        if !meta.is_dir() {
            return Err(Error::Io {
                path: objects,
                source: io::Error::new(ErrorKind::NotFound, "objects path is not a directory"),
            });
        }
        Ok(())
    }

    fn exists(&self, key: &StoreKey) -> Result<bool> {
        let path = self.path_for(key);
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(Error::Io { path, source }),
        }
    }

    fn put(&self, key: &StoreKey, payload: &Payload) -> Result<()> {
        // objects are immutable: an existing digest is never rewritten
        if matches!(key, StoreKey::Object(_)) && self.exists(key)? {
            debug!(%key, "object already stored");
            return Ok(());
        }

        let dest = self.path_for(key);
        let parent = dest.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent).with_path(&parent)?;

        // atomic write: temp file -> fsync -> verify -> rename
        let tmp = self.tmp_path().join(uuid::Uuid::new_v4().to_string());
        let actual = match self.write_temp(&tmp, payload) {
            Ok(digest) => digest,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(e);
            }
        };

        if let Some(expected) = key.digest() {
            if *expected != actual {
                let _ = fs::remove_file(&tmp);
                return Err(Error::DigestMismatch {
                    expected: *expected,
                    actual,
                });
            }
        }

        fs::rename(&tmp, &dest).with_path(&dest)?;
        fsync_dir(&parent)?;
        Ok(())
    }

    fn get(&self, key: &StoreKey) -> Result<Option<ObjectReader>> {
        let path = self.path_for(key);
        match File::open(&path) {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(Error::Io { path, source }),
        }
    }
}
