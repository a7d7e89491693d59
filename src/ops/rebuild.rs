//! rebuild engine
//!
//! resolves a manifest, then reconstructs the tree it describes from the
//! store. the manifest is fully resolved before anything on disk changes, so
//! a cache miss never touches the destination.
//!
//! in-place mode clears the destination first and restores into it; a failure
//! partway leaves a partial tree that a second rebuild fixes. staged mode
//! restores into a sibling directory and swaps it in only if every entry
//! succeeded.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::error::{Error, IoResultExt, Result};
use crate::fs::{remove_tree, temp_sibling};
use crate::hash::{Digest, HashingReader};
use crate::lookup::LookupKey;
use crate::manifest::{manifest_object_key, safe_relative_path, Manifest};
use crate::ops::exec::{run_all, CancelToken, Strategy};
use crate::ops::report::{FileReport, Outcome, RunReport, Transfer};
use crate::store::{ObjectReader, ObjectStore, StoreKey};

/// where a rebuild reads its manifest from
#[derive(Clone, Debug)]
pub enum ManifestSource {
    File(PathBuf),
    Store(LookupKey),
}

/// load a manifest without side effects
///
/// a missing manifest is reported as [`Error::ManifestNotFound`] (file) or
/// [`Error::CacheMiss`] (store), never as a generic error.
pub fn resolve_manifest(store: &dyn ObjectStore, source: &ManifestSource) -> Result<Manifest> {
    match source {
        ManifestSource::File(path) => match fs::read(path) {
            Ok(bytes) => Manifest::from_json(&bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::ManifestNotFound(path.clone()))
            }
            Err(source) => Err(Error::Io {
                path: path.clone(),
                source,
            }),
        },
        ManifestSource::Store(key) => {
            let mut reader = store
                .get(&StoreKey::Manifest(key.clone()))?
                .ok_or_else(|| Error::CacheMiss {
                    key: key.to_string(),
                })?;
            let mut bytes = Vec::new();
            reader
                .read_to_end(&mut bytes)
                .with_path(manifest_object_key(key))?;
            Manifest::from_json(&bytes)
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RebuildMode {
    /// remove the destination, then restore into it
    #[default]
    InPlace,
    /// restore beside the destination and swap in on full success
    Staged,
}

/// rebuild options
#[derive(Clone, Debug, Default)]
pub struct RebuildOptions {
    pub strategy: Strategy,
    pub mode: RebuildMode,
    /// re-hash restored content and reject files that do not match
    pub verify: bool,
    pub cancel: CancelToken,
}

#[derive(Debug)]
pub struct RebuildOutput {
    pub report: RunReport,
    /// false when a staged rebuild was discarded and the destination left as it was
    pub applied: bool,
}

/// Rebuild engine bound to one store
pub struct Rebuilder<'a> {
    store: &'a dyn ObjectStore,
    options: RebuildOptions,
}

impl<'a> Rebuilder<'a> {
    pub fn new(store: &'a dyn ObjectStore, options: RebuildOptions) -> Self {
        Self { store, options }
    }

    /// resolve the manifest from `source` and rebuild `root` from it
    pub fn rebuild(&self, source: &ManifestSource, root: &Path) -> Result<RebuildOutput> {
        let manifest = resolve_manifest(self.store, source)?;
        self.rebuild_from(&manifest, root)
    }

    /// rebuild `root` from an already resolved manifest
    pub fn rebuild_from(&self, manifest: &Manifest, root: &Path) -> Result<RebuildOutput> {
        let manifest = manifest.for_root(root)?;
        let manifest = manifest.as_ref();
        self.store.check_access()?;

        info!(
            root = %root.display(),
            files = manifest.len(),
            store = %self.store.describe(),
            mode = ?self.options.mode,
            "rebuilding"
        );

        let output = match self.options.mode {
            RebuildMode::InPlace => {
                remove_tree(root)?;
                fs::create_dir_all(root).with_path(root)?;
                RebuildOutput {
                    report: self.restore_all(manifest, root)?,
                    applied: true,
                }
            }
            RebuildMode::Staged => self.rebuild_staged(manifest, root)?,
        };

        let report = &output.report;
        info!(
            restored = report.restored(),
            skipped = report.skipped().count(),
            bytes = report.bytes_transferred(),
            applied = output.applied,
            "rebuild complete"
        );
        Ok(output)
    }

    fn rebuild_staged(&self, manifest: &Manifest, root: &Path) -> Result<RebuildOutput> {
        let staging = temp_sibling(root, "staging");
        fs::create_dir_all(&staging).with_path(&staging)?;

        let report = match self.restore_all(manifest, &staging) {
            Ok(report) => report,
            Err(e) => {
                discard(&staging);
                return Err(e);
            }
        };

        if !report.is_complete() {
            warn!(
                root = %root.display(),
                skipped = report.skipped().count(),
                "incomplete rebuild discarded, destination left unchanged"
            );
            discard(&staging);
            return Ok(RebuildOutput {
                report,
                applied: false,
            });
        }

        swap_into_place(&staging, root)?;
        Ok(RebuildOutput {
            report,
            applied: true,
        })
    }

    /// restore every manifest entry under `root`
    ///
    /// stops issuing work at the first fatal outcome and returns it.
    fn restore_all(&self, manifest: &Manifest, root: &Path) -> Result<RunReport> {
        let halt = self.options.cancel.child();
        let entries: Vec<(String, Digest)> = manifest
            .entries()
            .map(|(path, digest)| (path.clone(), *digest))
            .collect();

        let reports = run_all(
            self.options.strategy,
            entries,
            &halt,
            |(path, digest)| {
                let report = self.restore_entry(root, path, digest);
                if matches!(report.outcome, Outcome::Fatal(_)) {
                    halt.cancel();
                }
                report
            },
            |(path, digest)| FileReport::new(path, Some(digest), Outcome::Skipped(Error::Cancelled)),
        );

        let mut report = RunReport::new(reports);
        if let Some((path, e)) = report.take_fatal() {
            error!(%path, error = %e, "rebuild aborted");
            return Err(e);
        }
        if self.options.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(report)
    }

    fn restore_entry(&self, root: &Path, path: String, digest: Digest) -> FileReport {
        let rel = match safe_relative_path(&path) {
            Ok(rel) => rel,
            Err(e) => {
                warn!(%path, error = %e, "skipping entry");
                return FileReport::new(path, Some(digest), Outcome::Skipped(e));
            }
        };
        let dest = root.join(rel);

        if let Some(parent) = dest.parent() {
            if let Err(e) = fs::create_dir_all(parent).with_path(parent) {
                return FileReport::new(path, Some(digest), Outcome::Fatal(e));
            }
        }

        let reader = match self.store.get(&StoreKey::Object(digest)) {
            Ok(Some(reader)) => reader,
            Ok(None) => {
                warn!(%path, %digest, "object missing from store, skipping");
                return FileReport::new(path, Some(digest), Outcome::Skipped(Error::ObjectNotFound(digest)));
            }
            Err(e) => {
                warn!(%path, %digest, error = %e, "fetch failed, skipping");
                return FileReport::new(path, Some(digest), Outcome::Skipped(e));
            }
        };

        let outcome = match self.write_entry(reader, &dest, &digest) {
            Ok(bytes) => {
                debug!(%path, %digest, bytes, "restored");
                Outcome::Success(Transfer::Restored { bytes })
            }
            Err(e) => {
                warn!(%path, %digest, error = %e, "write failed, skipping");
                Outcome::Skipped(e)
            }
        };
        FileReport::new(path, Some(digest), outcome)
    }

    /// stream an object into `dest` via a temp file, so a failure or
    /// cancellation never leaves a half-written file at `dest`
    fn write_entry(&self, reader: ObjectReader, dest: &Path, digest: &Digest) -> Result<u64> {
        let tmp = temp_sibling(dest, "tmp");

        let written = (|| -> Result<(u64, Digest)> {
            let mut reader = HashingReader::new(reader);
            let mut file = File::create(&tmp).with_path(&tmp)?;
            io::copy(&mut reader, &mut file).with_path(&tmp)?;
            Ok((reader.bytes_read(), reader.finalize()))
        })();

        let bytes = match written {
            Ok((_, actual)) if self.options.verify && actual != *digest => {
                let _ = fs::remove_file(&tmp);
                return Err(Error::DigestMismatch {
                    expected: *digest,
                    actual,
                });
            }
            Ok((bytes, _)) => bytes,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(e);
            }
        };

        if let Err(source) = fs::rename(&tmp, dest) {
            let _ = fs::remove_file(&tmp);
            return Err(Error::Io {
                path: dest.to_path_buf(),
                source,
            });
        }
        Ok(bytes)
    }
}

/// replace `root` with `staging`, restoring the old tree if the final rename fails
fn swap_into_place(staging: &Path, root: &Path) -> Result<()> {
    let backup = match fs::symlink_metadata(root) {
        Ok(_) => {
            let backup = temp_sibling(root, "backup");
            fs::rename(root, &backup).with_path(root)?;
            Some(backup)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(source) => {
            return Err(Error::Io {
                path: root.to_path_buf(),
                source,
            })
        }
    };

    if let Err(source) = fs::rename(staging, root) {
        if let Some(backup) = &backup {
            let _ = fs::rename(backup, root);
        }
        discard(staging);
        return Err(Error::Io {
            path: root.to_path_buf(),
            source,
        });
    }

    if let Some(backup) = backup {
        if let Err(e) = remove_tree(&backup) {
            warn!(path = %backup.display(), error = %e, "failed to remove previous tree");
        }
    }
    Ok(())
}

fn discard(staging: &Path) {
    if let Err(e) = remove_tree(staging) {
        warn!(path = %staging.display(), error = %e, "failed to remove staging directory");
    }
}
