//! manifest availability check
//!
//! answers "would a rebuild from this manifest succeed?" without touching the
//! filesystem: every distinct digest is checked once, and in deep mode fetched
//! and re-hashed.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, info, warn};

use crate::error::Error;
use crate::hash::{digest_reader, Digest};
use crate::manifest::Manifest;
use crate::ops::exec::{run_all, CancelToken, Strategy};
use crate::store::{ObjectStore, StoreKey};

/// check options
#[derive(Clone, Debug, Default)]
pub struct CheckOptions {
    pub strategy: Strategy,
    /// fetch and re-hash every object instead of probing existence
    pub deep: bool,
}

/// an object the manifest needs but the store cannot provide
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingObject {
    pub digest: Digest,
    /// manifest paths referencing this digest
    pub paths: Vec<String>,
}

#[derive(Debug, Default)]
pub struct CheckReport {
    pub objects_checked: usize,
    pub missing: Vec<MissingObject>,
    /// objects whose content does not hash to their key (deep mode only)
    pub corrupt: Vec<MissingObject>,
    /// objects that could not be checked at all
    pub errors: Vec<(Digest, Error)>,
}

impl CheckReport {
    pub fn is_ok(&self) -> bool {
        self.missing.is_empty() && self.corrupt.is_empty() && self.errors.is_empty()
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (label, objects) in [("missing", &self.missing), ("corrupt", &self.corrupt)] {
            for object in objects {
                writeln!(f, "{label} {}", object.digest)?;
                for path in &object.paths {
                    writeln!(f, "  {path}")?;
                }
            }
        }
        for (digest, e) in &self.errors {
            writeln!(f, "error {digest}: {e}")?;
        }
        Ok(())
    }
}

enum Status {
    Present,
    Missing,
    Corrupt(Digest),
    Failed(Error),
}

/// check that every object referenced by `manifest` is available
pub fn check(store: &dyn ObjectStore, manifest: &Manifest, options: &CheckOptions) -> CheckReport {
    let mut paths_by_digest: BTreeMap<Digest, Vec<String>> = BTreeMap::new();
    for (path, digest) in manifest.entries() {
        paths_by_digest.entry(*digest).or_default().push(path.clone());
    }

    let digests: Vec<Digest> = paths_by_digest.keys().copied().collect();
    let statuses = run_all(
        options.strategy,
        digests,
        &CancelToken::new(),
        |digest| (digest, inspect(store, &digest, options.deep)),
        |digest| (digest, Status::Failed(Error::Cancelled)),
    );

    let mut report = CheckReport {
        objects_checked: statuses.len(),
        ..Default::default()
    };
    for (digest, status) in statuses {
        let paths = paths_by_digest.remove(&digest).unwrap_or_default();
        match status {
            Status::Present => {}
            Status::Missing => report.missing.push(MissingObject { digest, paths }),
            Status::Corrupt(actual) => {
                warn!(%digest, %actual, "stored object does not match its digest");
                report.corrupt.push(MissingObject { digest, paths });
            }
            Status::Failed(e) => {
                warn!(%digest, error = %e, "could not check object");
                report.errors.push((digest, e));
            }
        }
    }
    report.missing.sort_by_key(|m| m.digest);
    report.corrupt.sort_by_key(|m| m.digest);
    report.errors.sort_by_key(|(d, _)| *d);

    info!(
        objects = report.objects_checked,
        missing = report.missing.len(),
        corrupt = report.corrupt.len(),
        errors = report.errors.len(),
        "check complete"
    );
    report
}

fn inspect(store: &dyn ObjectStore, digest: &Digest, deep: bool) -> Status {
    let key = StoreKey::Object(*digest);
    if !deep {
        return match store.exists(&key) {
            Ok(true) => Status::Present,
            Ok(false) => Status::Missing,
            Err(e) => Status::Failed(e),
        };
    }

    let mut reader = match store.get(&key) {
        Ok(Some(reader)) => reader,
        Ok(None) => return Status::Missing,
        Err(e) => return Status::Failed(e),
    };
    match digest_reader(&mut reader) {
        Ok(actual) if actual == *digest => {
            debug!(%digest, "verified");
            Status::Present
        }
        Ok(actual) => Status::Corrupt(actual),
        Err(source) => Status::Failed(Error::Io {
            path: key.remote_key().into(),
            source,
        }),
    }
}
