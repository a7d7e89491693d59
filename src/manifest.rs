//! manifest: the description of one dependency-tree snapshot
//!
//! a manifest maps project-relative file paths (always `/`-separated) to the
//! digest of their content. it is created fresh by every scan, published once,
//! and consumed read-only by a rebuild.
//!
//! # JSON format
//!
//! ```json
//! {
//!   "files": {
//!     "left-pad/index.js": "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
//!   },
//!   "nativeModulePaths": ["fsevents/fsevents.node"]
//! }
//! ```
//!
//! a bare `{path: digest}` object (older manifest files) is accepted on read.
//! those record paths including the scanned root directory
//! (`node_modules/left-pad/index.js`); [`Manifest::for_root`] strips it.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash::Digest;
use crate::lookup::LookupKey;

/// prefix under which manifests live in an object store
pub const MANIFEST_PREFIX: &str = "manifests";

/// remote object key for the manifest published under `key`
pub fn manifest_object_key(key: &LookupKey) -> String {
    format!("{}/{}.json", MANIFEST_PREFIX, key)
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Manifest {
    /// relative path -> content digest
    pub files: BTreeMap<String, Digest>,
    /// paths holding platform-specific native artifacts
    ///
    /// recorded for consumers; sync treats them like any other file.
    #[serde(rename = "nativeModulePaths")]
    pub native_paths: Vec<String>,
    /// read from a flat map whose paths still carry the root directory
    #[serde(skip)]
    legacy: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ManifestRepr {
    Current {
        files: BTreeMap<String, Digest>,
        #[serde(rename = "nativeModulePaths", default)]
        native_paths: Option<Vec<String>>,
    },
    Legacy(BTreeMap<String, Digest>),
}

impl<'de> Deserialize<'de> for Manifest {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(match ManifestRepr::deserialize(deserializer)? {
            ManifestRepr::Current {
                files,
                native_paths,
            } => Manifest {
                files,
                native_paths: native_paths.unwrap_or_default(),
                legacy: false,
            },
            ManifestRepr::Legacy(files) => Manifest {
                files,
                native_paths: Vec::new(),
                legacy: true,
            },
        })
    }
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// record a file entry
    pub fn insert(&mut self, path: impl Into<String>, digest: Digest) {
        self.files.insert(path.into(), digest);
    }

    /// mark a path as a native artifact
    pub fn mark_native(&mut self, path: impl Into<String>) {
        let path = path.into();
        if !self.native_paths.contains(&path) {
            self.native_paths.push(path);
            self.native_paths.sort();
        }
    }

    pub fn get(&self, path: &str) -> Option<&Digest> {
        self.files.get(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &Digest)> {
        self.files.iter()
    }

    /// true when this manifest was read from the older flat format
    pub fn is_legacy(&self) -> bool {
        self.legacy
    }

    /// entries relative to `root`, ready to be joined onto it
    ///
    /// current manifests are returned as they are. legacy entries are
    /// prefixed with the directory that was scanned, so the longest trailing
    /// part of `root` that prefixes every entry is stripped. a legacy
    /// manifest with no such prefix is rejected rather than rebuilt into the
    /// wrong place.
    pub fn for_root(&self, root: &Path) -> Result<Cow<'_, Manifest>> {
        if !self.legacy {
            return Ok(Cow::Borrowed(self));
        }

        let parts: Vec<&str> = root
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect();

        let prefix = (0..parts.len())
            .map(|start| format!("{}/", parts[start..].join("/")))
            .find(|prefix| {
                self.files
                    .keys()
                    .all(|path| path.trim_start_matches('/').starts_with(prefix.as_str()))
            })
            .ok_or_else(|| Error::LegacyManifestRoot(root.to_path_buf()))?;

        let files = self
            .files
            .iter()
            .map(|(path, digest)| {
                let rel = &path.trim_start_matches('/')[prefix.len()..];
                (rel.to_string(), *digest)
            })
            .collect();
        Ok(Cow::Owned(Manifest {
            files,
            native_paths: Vec::new(),
            legacy: false,
        }))
    }

    /// canonical JSON encoding (sorted keys, two-space indent)
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(Error::ManifestSerialize)
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(Error::ManifestParse)
    }
}

/// convert a manifest entry into a path safe to join onto the rebuild root
///
/// rejects absolute paths and any `..` component so a manifest can never
/// write outside the destination tree.
pub fn safe_relative_path(entry: &str) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(entry).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::UnsafePath(entry.to_string()));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(Error::UnsafePath(entry.to_string()));
    }
    Ok(out)
}

/// `/`-separated path of `path` relative to `root`, as stored in a manifest
///
/// `None` when `path` is outside `root` or any component is not valid UTF-8;
/// a lossy conversion would let distinct files collide on one entry.
pub fn manifest_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<&str> = rel
        .components()
        .map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Option<_>>()?;
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}
