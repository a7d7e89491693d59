//! lookup keys: the opaque partition a manifest is published under

use std::fmt;
use std::fs::File;
use std::path::Path;
use std::process::Command;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::digest_reader;

/// identifier used to locate one published manifest
///
/// restricted to `[A-Za-z0-9._-]` so it can be embedded in an object key
/// or file name without escaping.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LookupKey(String);

impl LookupKey {
    /// validate and wrap a key
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        let valid = !key.is_empty()
            && key.len() <= 200
            && key != "."
            && key != ".."
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !valid {
            return Err(Error::InvalidLookupKey(key));
        }
        Ok(Self(key))
    }

    /// dependency signature: digest of the lockfile content
    pub fn from_lockfile(path: &Path) -> Result<Self> {
        let mut file = File::open(path).with_path(path)?;
        let digest = digest_reader(&mut file).with_path(path)?;
        Ok(Self(digest.to_hex()))
    }

    /// history point: current `git rev-parse HEAD` in `dir`
    pub fn from_git_revision(dir: &Path) -> Result<Self> {
        let output = Command::new("git")
            .arg("rev-parse")
            .arg("HEAD")
            .current_dir(dir)
            .output()
            .with_path(dir)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not a git repository") {
                return Err(Error::NotGitRepo);
            }
            return Err(Error::Git(stderr.trim().to_string()));
        }

        let rev = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Self::new(rev)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
