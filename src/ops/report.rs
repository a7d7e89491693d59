//! typed per-file results and the run-level report built from them

use std::fmt;

use crate::error::Error;
use crate::hash::Digest;

/// what happened to a file that was handled successfully
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// content was new and got written to the store
    Uploaded { bytes: u64 },
    /// store already held the digest; nothing was written
    Deduplicated,
    /// file was reconstructed from the store
    Restored { bytes: u64 },
}

/// per-file outcome
#[derive(Debug)]
pub enum Outcome {
    Success(Transfer),
    /// recoverable: logged, recorded, and the run continues
    Skipped(Error),
    /// unrecoverable: the run stops
    Fatal(Error),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }
}

#[derive(Debug)]
pub struct FileReport {
    /// manifest path (relative, `/`-separated)
    pub path: String,
    /// content digest, when one is known
    pub digest: Option<Digest>,
    pub outcome: Outcome,
}

impl FileReport {
    pub fn new(path: impl Into<String>, digest: Option<Digest>, outcome: Outcome) -> Self {
        Self {
            path: path.into(),
            digest,
            outcome,
        }
    }
}

/// results of one scan or rebuild run, sorted by path
#[derive(Debug, Default)]
pub struct RunReport {
    pub files: Vec<FileReport>,
}

impl RunReport {
    pub fn new(mut files: Vec<FileReport>) -> Self {
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Self { files }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// true when every file succeeded
    pub fn is_complete(&self) -> bool {
        self.files.iter().all(|f| f.outcome.is_success())
    }

    pub fn skipped(&self) -> impl Iterator<Item = &FileReport> {
        self.files
            .iter()
            .filter(|f| matches!(f.outcome, Outcome::Skipped(_)))
    }

    /// paths that were not handled, in order
    pub fn skipped_paths(&self) -> Vec<&str> {
        self.skipped().map(|f| f.path.as_str()).collect()
    }

    pub fn count(&self, kind: fn(&Transfer) -> bool) -> usize {
        self.files
            .iter()
            .filter(|f| matches!(&f.outcome, Outcome::Success(t) if kind(t)))
            .count()
    }

    pub fn uploaded(&self) -> usize {
        self.count(|t| matches!(t, Transfer::Uploaded { .. }))
    }

    pub fn deduplicated(&self) -> usize {
        self.count(|t| matches!(t, Transfer::Deduplicated))
    }

    pub fn restored(&self) -> usize {
        self.count(|t| matches!(t, Transfer::Restored { .. }))
    }

    /// bytes written to the store or to disk
    pub fn bytes_transferred(&self) -> u64 {
        self.files
            .iter()
            .map(|f| match f.outcome {
                Outcome::Success(Transfer::Uploaded { bytes })
                | Outcome::Success(Transfer::Restored { bytes }) => bytes,
                _ => 0,
            })
            .sum()
    }

    /// remove and return the first fatal outcome
    pub(crate) fn take_fatal(&mut self) -> Option<(String, Error)> {
        let idx = self
            .files
            .iter()
            .position(|f| matches!(f.outcome, Outcome::Fatal(_)))?;
        let file = self.files.remove(idx);
        match file.outcome {
            Outcome::Fatal(e) => Some((file.path, e)),
            _ => None,
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for file in self.skipped() {
            if let Outcome::Skipped(e) = &file.outcome {
                writeln!(f, "  {}: {}", file.path, e)?;
            }
        }
        Ok(())
    }
}
