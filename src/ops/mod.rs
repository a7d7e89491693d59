//! high-level operations: scan/publish, rebuild, check

mod check;
mod exec;
mod rebuild;
mod report;
mod scan;

pub use check::{check, CheckOptions, CheckReport, MissingObject};
pub use exec::{CancelToken, Strategy};
pub use rebuild::{
    resolve_manifest, ManifestSource, RebuildMode, RebuildOptions, RebuildOutput, Rebuilder,
};
pub use report::{FileReport, Outcome, RunReport, Transfer};
pub use scan::{compile_patterns, publish_manifest, ManifestTarget, ScanOptions, ScanOutput, Scanner};
