//! devport - content-addressed dependency cache
//!
//! snapshots a dependency tree (typically `node_modules`) into a deduplicated
//! object store and rebuilds it anywhere from a small manifest.
//!
//! # Core concepts
//!
//! - **Digest**: SHA-256 of a file's full content, its only address
//! - **Manifest**: relative path -> digest, one per tree snapshot
//! - **Object store**: digest -> content, local directory or S3-compatible bucket
//! - **Lookup key**: lockfile digest or git revision a manifest is published under
//!
//! identical files are stored once no matter how many paths, projects or
//! machines reference them.
//!
//! # Example usage
//!
//! ```no_run
//! use devport::ops::{ManifestSource, ManifestTarget, RebuildOptions, Rebuilder, ScanOptions, Scanner};
//! use devport::{LocalStore, LookupKey};
//! use std::path::Path;
//!
//! let store = LocalStore::open(Path::new(".devport_cache")).unwrap();
//! let key = LookupKey::from_lockfile(Path::new("package-lock.json")).unwrap();
//!
//! // snapshot the tree and publish its manifest
//! Scanner::new(&store, ScanOptions::default())
//!     .publish(Path::new("node_modules"), &ManifestTarget::Store(key.clone()))
//!     .unwrap();
//!
//! // rebuild it elsewhere
//! let out = Rebuilder::new(&store, RebuildOptions::default())
//!     .rebuild(&ManifestSource::Store(key), Path::new("/tmp/node_modules"))
//!     .unwrap();
//! assert!(out.report.is_complete());
//! ```

mod config;
mod error;
mod hash;
mod lookup;
mod manifest;

pub mod fs;
pub mod logging;
pub mod ops;
pub mod store;

pub use config::{Backend, Config, LookupMode, S3Config, PROJECT_CONFIG, SECRET_CONFIG};
pub use error::{Error, IoResultExt, Result};
pub use hash::{digest_bytes, digest_reader, Digest, HashingReader};
pub use lookup::LookupKey;
pub use manifest::{manifest_object_key, manifest_path, safe_relative_path, Manifest, MANIFEST_PREFIX};
pub use store::{LocalStore, MemoryStore, ObjectReader, ObjectStore, Payload, S3Options, S3Store, StoreKey};
