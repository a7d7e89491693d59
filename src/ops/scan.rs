//! scan/publish engine
//!
//! walks a tree, hashes every regular file, uploads content the store does
//! not already hold, and publishes the resulting manifest. per-file failures
//! are recorded and skipped; only failing to reach the store or to publish
//! the manifest stops a run.

use std::fs::File;
use std::path::{Path, PathBuf};

use glob::Pattern;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{Error, IoResultExt, Result};
use crate::fs::write_atomic;
use crate::hash::{digest_reader, Digest};
use crate::lookup::LookupKey;
use crate::manifest::{manifest_path, Manifest};
use crate::ops::exec::{run_all, CancelToken, Strategy};
use crate::ops::report::{FileReport, Outcome, RunReport, Transfer};
use crate::store::{ObjectStore, Payload, StoreKey};

/// scan options
#[derive(Clone, Debug, Default)]
pub struct ScanOptions {
    pub strategy: Strategy,
    /// paths matching any of these are listed as native in the manifest
    pub native_patterns: Vec<Pattern>,
    pub cancel: CancelToken,
}

/// compile glob patterns for native path tagging
pub fn compile_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p.as_ref()).map_err(|source| Error::Pattern {
                pattern: p.as_ref().to_string(),
                source,
            })
        })
        .collect()
}

/// where a scan publishes its manifest
#[derive(Clone, Debug)]
pub enum ManifestTarget {
    /// a JSON file on disk
    File(PathBuf),
    /// the store, under `manifests/<key>.json`
    Store(LookupKey),
}

#[derive(Debug)]
pub struct ScanOutput {
    pub manifest: Manifest,
    pub report: RunReport,
}

/// Scan/Publish engine bound to one store
pub struct Scanner<'a> {
    store: &'a dyn ObjectStore,
    options: ScanOptions,
}

impl<'a> Scanner<'a> {
    pub fn new(store: &'a dyn ObjectStore, options: ScanOptions) -> Self {
        Self { store, options }
    }

    /// scan `root` and publish the manifest to `target`
    pub fn publish(&self, root: &Path, target: &ManifestTarget) -> Result<ScanOutput> {
        let output = self.scan(root)?;
        publish_manifest(self.store, &output.manifest, target)?;
        Ok(output)
    }

    /// scan `root` into the store and build its manifest, without publishing
    pub fn scan(&self, root: &Path) -> Result<ScanOutput> {
        if !root.is_dir() {
            return Err(Error::RootNotFound(root.to_path_buf()));
        }
        self.store.check_access()?;

        info!(root = %root.display(), store = %self.store.describe(), "scanning");

        let mut reports = Vec::new();
        let mut files = Vec::new();

        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            match entry {
                Ok(entry) if entry.file_type().is_file() => {
                    match manifest_path(root, entry.path()) {
                        Some(rel) => files.push((rel, entry.into_path())),
                        None => {
                            let path = entry.into_path();
                            let shown = path
                                .strip_prefix(root)
                                .unwrap_or(path.as_path())
                                .to_string_lossy()
                                .into_owned();
                            warn!(path = %shown, "skipping non-utf8 path");
                            reports.push(FileReport::new(
                                shown,
                                None,
                                Outcome::Skipped(Error::NonUtf8Path(path)),
                            ));
                        }
                    }
                }
                Ok(_) => {}
                // the root itself being unreadable is not a per-file problem
                Err(e) if e.depth() == 0 => {
                    return Err(walk_error(root, e));
                }
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                    let rel = manifest_path(root, &path)
                        .unwrap_or_else(|| path.display().to_string());
                    let err = walk_error(&path, e);
                    warn!(path = %rel, error = %err, "skipping unreadable entry");
                    reports.push(FileReport::new(rel, None, Outcome::Skipped(err)));
                }
            }
        }

        debug!(files = files.len(), "walk complete");

        reports.extend(run_all(
            self.options.strategy,
            files,
            &self.options.cancel,
            |(rel, path)| self.scan_file(rel, &path),
            |(rel, _)| FileReport::new(rel, None, Outcome::Skipped(Error::Cancelled)),
        ));

        // a partial manifest must never be published
        if self.options.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let report = RunReport::new(reports);
        let mut manifest = Manifest::new();
        for file in &report.files {
            let Some(digest) = file.digest else { continue };
            manifest.insert(file.path.clone(), digest);
            if self.is_native(&file.path) {
                manifest.mark_native(file.path.clone());
            }
        }

        info!(
            files = manifest.len(),
            uploaded = report.uploaded(),
            deduplicated = report.deduplicated(),
            skipped = report.skipped().count(),
            bytes = report.bytes_transferred(),
            "scan complete"
        );

        Ok(ScanOutput { manifest, report })
    }

    fn is_native(&self, path: &str) -> bool {
        self.options.native_patterns.iter().any(|p| p.matches(path))
    }

    /// hash one file and upload it unless the store already has it
    fn scan_file(&self, rel: String, path: &Path) -> FileReport {
        let digest = match hash_file(path) {
            Ok(digest) => digest,
            Err(e) => {
                warn!(path = %rel, error = %e, "failed to hash file, skipping");
                return FileReport::new(rel, None, Outcome::Skipped(e));
            }
        };

        let key = StoreKey::Object(digest);
        match self.store.exists(&key) {
            Ok(true) => {
                debug!(path = %rel, %digest, "already stored");
                return FileReport::new(rel, Some(digest), Outcome::Success(Transfer::Deduplicated));
            }
            Ok(false) => {}
            // treat as absent: uploading an existing digest is harmless
            Err(e) => warn!(path = %rel, %digest, error = %e, "existence check failed, uploading"),
        }

        let outcome = match Payload::file(path).and_then(|p| {
            self.store.put(&key, &p)?;
            Ok(p.len())
        }) {
            Ok(bytes) => {
                debug!(path = %rel, %digest, bytes, "uploaded");
                Outcome::Success(Transfer::Uploaded { bytes })
            }
            Err(e) => {
                warn!(path = %rel, %digest, error = %e, "upload failed, skipping");
                Outcome::Skipped(e)
            }
        };
        // the entry stays in the manifest even when the upload failed
        FileReport::new(rel, Some(digest), outcome)
    }
}

/// publish a manifest; any failure here is fatal for the run
pub fn publish_manifest(
    store: &dyn ObjectStore,
    manifest: &Manifest,
    target: &ManifestTarget,
) -> Result<()> {
    let json = manifest.to_json()?;
    match target {
        ManifestTarget::File(path) => {
            write_atomic(path, &json)?;
            info!(path = %path.display(), files = manifest.len(), "manifest written");
        }
        ManifestTarget::Store(key) => {
            store.put(&StoreKey::Manifest(key.clone()), &Payload::Bytes(json))?;
            info!(%key, files = manifest.len(), "manifest published");
        }
    }
    Ok(())
}

fn hash_file(path: &Path) -> Result<Digest> {
    let mut file = File::open(path).with_path(path)?;
    digest_reader(&mut file).with_path(path)
}

fn walk_error(path: &Path, e: walkdir::Error) -> Error {
    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| path.to_path_buf());
    match e.into_io_error() {
        Some(source) => Error::Io { path, source },
        None => Error::Walk {
            path,
            message: "filesystem loop".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::digest_bytes;
    use crate::store::MemoryStore;
    use std::fs;
    use tempfile::tempdir;

    fn tree(files: &[(&str, &[u8])]) -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        for (path, content) in files {
            let path = dir.path().join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        dir
    }

    #[test]
    fn test_identical_files_stored_once() {
        let dir = tree(&[("a.txt", b"hello"), ("b.txt", b"hello")]);
        let store = MemoryStore::new();

        let out = Scanner::new(&store, ScanOptions::default())
            .scan(dir.path())
            .unwrap();

        let h = digest_bytes(b"hello");
        assert_eq!(out.manifest.len(), 2);
        assert_eq!(out.manifest.get("a.txt"), Some(&h));
        assert_eq!(out.manifest.get("b.txt"), Some(&h));
        assert_eq!(store.put_calls(), vec![h.to_hex()]);
        assert_eq!(out.report.uploaded(), 1);
        assert_eq!(out.report.deduplicated(), 1);
        assert!(out.report.is_complete());
    }

    #[test]
    fn test_rescan_uploads_nothing() {
        let dir = tree(&[("pkg/index.js", b"module.exports = 1"), ("pkg/package.json", b"{}")]);
        let store = MemoryStore::new();
        let scanner = Scanner::new(&store, ScanOptions::default());

        scanner.scan(dir.path()).unwrap();
        let calls = store.put_calls().len();

        let out = scanner.scan(dir.path()).unwrap();
        assert_eq!(store.put_calls().len(), calls);
        assert_eq!(out.report.deduplicated(), 2);
    }

    #[test]
    fn test_nested_paths_use_forward_slashes() {
        let dir = tree(&[("a/b/c.js", b"c")]);
        let store = MemoryStore::new();
        let out = Scanner::new(&store, ScanOptions::default())
            .scan(dir.path())
            .unwrap();
        assert!(out.manifest.get("a/b/c.js").is_some());
    }

    #[test]
    fn test_upload_failure_is_skipped_but_kept_in_manifest() {
        let dir = tree(&[("ok.js", b"ok"), ("bad.js", b"bad")]);
        let store = MemoryStore::new();
        let bad = digest_bytes(b"bad");
        store.fail_puts_for(&StoreKey::Object(bad));

        let out = Scanner::new(&store, ScanOptions::default())
            .scan(dir.path())
            .unwrap();

        assert_eq!(out.manifest.get("bad.js"), Some(&bad));
        assert_eq!(out.report.skipped_paths(), vec!["bad.js"]);
        assert!(store.contains(&StoreKey::Object(digest_bytes(b"ok"))));
    }

    #[test]
    fn test_unreadable_file_is_skipped() {
        let dir = tree(&[("a.js", b"a")]);
        let store = MemoryStore::new();
        let scanner = Scanner::new(&store, ScanOptions::default());

        // the file vanished between the walk and hashing
        let report = scanner.scan_file("gone.js".to_string(), &dir.path().join("gone.js"));
        assert_eq!(report.path, "gone.js");
        assert!(report.digest.is_none());
        assert!(matches!(report.outcome, Outcome::Skipped(Error::Io { .. })));
        assert!(store.put_calls().is_empty());

        let out = scanner.scan(dir.path()).unwrap();
        assert!(out.report.is_complete());
    }

    #[test]
    fn test_exists_failure_falls_back_to_upload() {
        let dir = tree(&[("a.js", b"a")]);
        let store = MemoryStore::new();
        let d = digest_bytes(b"a");
        store.fail_reads_for(&StoreKey::Object(d));

        let out = Scanner::new(&store, ScanOptions::default())
            .scan(dir.path())
            .unwrap();
        assert_eq!(out.report.uploaded(), 1);
        assert_eq!(store.put_calls(), vec![d.to_hex()]);
    }

    #[test]
    fn test_missing_root() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new();
        let err = Scanner::new(&store, ScanOptions::default())
            .scan(&dir.path().join("node_modules"))
            .unwrap_err();
        assert!(matches!(err, Error::RootNotFound(_)));
    }

    #[test]
    fn test_unreachable_store_is_fatal() {
        let dir = tree(&[("a.js", b"a")]);
        let store = MemoryStore::new();
        store.set_unreachable(true);
        assert!(Scanner::new(&store, ScanOptions::default())
            .scan(dir.path())
            .is_err());
        assert!(store.put_calls().is_empty());
    }

    #[test]
    fn test_native_paths_tagged() {
        let dir = tree(&[("x/build/Release/addon.node", b"elf"), ("x/index.js", b"js")]);
        let store = MemoryStore::new();
        let options = ScanOptions {
            native_patterns: compile_patterns(&["**/*.node"]).unwrap(),
            ..Default::default()
        };
        let out = Scanner::new(&store, options).scan(dir.path()).unwrap();
        assert_eq!(out.manifest.native_paths, vec!["x/build/Release/addon.node"]);
        assert_eq!(out.manifest.len(), 2);
    }

    #[test]
    fn test_bad_pattern() {
        assert!(matches!(
            compile_patterns(&["a/**b"]),
            Err(Error::Pattern { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_not_recorded() {
        let dir = tree(&[("real.js", b"x")]);
        std::os::unix::fs::symlink(dir.path().join("real.js"), dir.path().join("link.js")).unwrap();
        let store = MemoryStore::new();
        let out = Scanner::new(&store, ScanOptions::default())
            .scan(dir.path())
            .unwrap();
        assert_eq!(out.manifest.len(), 1);
        assert!(out.manifest.get("link.js").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_names_are_skipped_not_merged() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tree(&[("ok.js", b"ok")]);
        fs::write(dir.path().join(OsStr::from_bytes(b"a\xff")), "one").unwrap();
        fs::write(dir.path().join(OsStr::from_bytes(b"a\xfe")), "two").unwrap();
        let store = MemoryStore::new();

        let out = Scanner::new(&store, ScanOptions::default())
            .scan(dir.path())
            .unwrap();

        assert_eq!(out.manifest.len(), 1);
        assert!(out.manifest.get("ok.js").is_some());
        assert_eq!(out.report.len(), 3);
        assert_eq!(out.report.skipped().count(), 2);
        assert!(!out.report.is_complete());
        assert!(out
            .report
            .skipped()
            .all(|f| matches!(f.outcome, Outcome::Skipped(Error::NonUtf8Path(_)))));
        assert_eq!(store.put_calls(), vec![digest_bytes(b"ok").to_hex()]);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let files: Vec<(String, Vec<u8>)> = (0..40)
            .map(|i| (format!("pkg{}/f{}.js", i % 5, i), format!("c{}", i % 7).into_bytes()))
            .collect();
        let refs: Vec<(&str, &[u8])> = files.iter().map(|(p, c)| (p.as_str(), c.as_slice())).collect();
        let dir = tree(&refs);

        let seq_store = MemoryStore::new();
        let seq = Scanner::new(&seq_store, ScanOptions::default())
            .scan(dir.path())
            .unwrap();

        let par_store = MemoryStore::new();
        let options = ScanOptions {
            strategy: Strategy::with_workers(4),
            ..Default::default()
        };
        let par = Scanner::new(&par_store, options).scan(dir.path()).unwrap();

        assert_eq!(seq.manifest, par.manifest);
        assert_eq!(par_store.len(), 7);
        assert!(par.report.is_complete());
    }

    #[test]
    fn test_cancelled_scan_does_not_publish() {
        let dir = tree(&[("a.js", b"a"), ("b.js", b"b")]);
        let store = MemoryStore::new();
        let options = ScanOptions::default();
        options.cancel.cancel();

        let key = LookupKey::new("k").unwrap();
        let err = Scanner::new(&store, options)
            .publish(dir.path(), &ManifestTarget::Store(key.clone()))
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(!store.contains(&StoreKey::Manifest(key)));
        assert!(store.put_calls().is_empty());
    }

    #[test]
    fn test_publish_to_file_and_store() {
        let dir = tree(&[("a.js", b"a")]);
        let out_dir = tempdir().unwrap();
        let store = MemoryStore::new();
        let scanner = Scanner::new(&store, ScanOptions::default());

        let path = out_dir.path().join("nested/manifest.json");
        let out = scanner
            .publish(dir.path(), &ManifestTarget::File(path.clone()))
            .unwrap();
        let written = Manifest::from_json(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(written, out.manifest);

        let key = LookupKey::new("abc123").unwrap();
        scanner
            .publish(dir.path(), &ManifestTarget::Store(key.clone()))
            .unwrap();
        let stored = store.bytes(&StoreKey::Manifest(key)).unwrap();
        assert_eq!(Manifest::from_json(&stored).unwrap(), out.manifest);
    }

    #[test]
    fn test_manifest_publish_failure_is_fatal() {
        let dir = tree(&[("a.js", b"a")]);
        let store = MemoryStore::new();
        let key = LookupKey::new("k").unwrap();
        store.fail_puts_for(&StoreKey::Manifest(key.clone()));

        let result = Scanner::new(&store, ScanOptions::default())
            .publish(dir.path(), &ManifestTarget::Store(key));
        assert!(result.is_err());
    }
}
