use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use glob::Pattern;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, IoResultExt, Result};
use crate::ops::{compile_patterns, Strategy};
use crate::store::sigv4::Credentials;
use crate::store::S3Options;

/// project config file, looked up in the working directory
pub const PROJECT_CONFIG: &str = ".devport.toml";
/// credentials overlay, merged over whichever config file was loaded
pub const SECRET_CONFIG: &str = ".devport.secret.toml";

/// per-request timeout for the remote store
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// which store push/pull talk to
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    S3,
    Local,
}

/// how the lookup key for push/pull is derived
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LookupMode {
    /// digest of the lockfile: trees are shared across machines by dependency signature
    #[default]
    Lockfile,
    /// current git revision
    Commit,
}

/// devport configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// tree to scan and rebuild
    pub root_directory: PathBuf,
    /// local object store used by scan/rebuild and the local backend
    pub cache_directory: PathBuf,
    /// manifest file written by scan and read by rebuild
    pub manifest_file: PathBuf,
    pub lockfile: PathBuf,
    pub lookup: LookupMode,
    pub backend: Backend,
    /// per-file workers; 1 runs sequentially
    pub workers: usize,
    /// how long transient store failures are retried
    pub retry_seconds: u64,
    /// globs (relative to the root) tagged as native artifacts in manifests
    pub native_patterns: Vec<String>,
    pub s3: S3Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_directory: PathBuf::from("node_modules"),
            cache_directory: PathBuf::from(".devport_cache"),
            manifest_file: PathBuf::from("manifest.json"),
            lockfile: PathBuf::from("package-lock.json"),
            lookup: LookupMode::default(),
            backend: Backend::default(),
            workers: 1,
            retry_seconds: 30,
            native_patterns: vec!["**/*.node".to_string()],
            s3: S3Config::default(),
        }
    }
}

/// S3-compatible endpoint settings
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub path_style: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:9000".to_string(),
            bucket: "devport-cache".to_string(),
            region: "us-east-1".to_string(),
            access_key_id: "devport-admin".to_string(),
            secret_access_key: "devport-password".to_string(),
            path_style: true,
        }
    }
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("path_style", &self.path_style)
            .finish()
    }
}

impl Config {
    /// load config from a single file
    pub fn load(path: &Path) -> Result<Self> {
        let table = read_table(path)?;
        Ok(toml::Value::Table(table).try_into()?)
    }

    /// parse config from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// resolve the effective config for a run
    ///
    /// file lookup order: `explicit`, then `<cwd>/.devport.toml`, then
    /// `<home>/.devport/config.toml`, else defaults. `<cwd>/.devport.secret.toml`
    /// is merged on top, then environment overrides are applied.
    pub fn resolve<F>(
        explicit: Option<&Path>,
        cwd: &Path,
        home: Option<&Path>,
        env: F,
    ) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let candidates = [
            Some(cwd.join(PROJECT_CONFIG)),
            home.map(|h| h.join(".devport").join("config.toml")),
        ];

        let mut table = match explicit {
            Some(path) => read_table(path)?,
            None => match candidates.into_iter().flatten().find(|p| p.is_file()) {
                Some(path) => {
                    debug!(path = %path.display(), "loading config");
                    read_table(&path)?
                }
                None => toml::Table::new(),
            },
        };

        let secret = cwd.join(SECRET_CONFIG);
        if secret.is_file() {
            debug!(path = %secret.display(), "merging secret config");
            merge_tables(&mut table, read_table(&secret)?);
        }

        let mut config: Config = toml::Value::Table(table).try_into()?;
        config.apply_env(env);
        config.validate(cwd)?;
        Ok(config)
    }

    /// [`Config::resolve`] against the real process environment
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        let cwd = std::env::current_dir().with_path(".")?;
        let home = dirs::home_dir();
        Self::resolve(explicit, &cwd, home.as_deref(), |key| std::env::var(key).ok())
    }

    /// apply `DEVPORT_*` environment overrides
    pub fn apply_env<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let paths = [
            ("DEVPORT_ROOT_DIRECTORY", &mut self.root_directory),
            ("DEVPORT_CACHE_DIRECTORY", &mut self.cache_directory),
            ("DEVPORT_MANIFEST_FILE", &mut self.manifest_file),
        ];
        for (key, field) in paths {
            if let Some(value) = env(key) {
                *field = PathBuf::from(value);
            }
        }

        let strings = [
            ("DEVPORT_S3_ENDPOINT", &mut self.s3.endpoint),
            ("DEVPORT_S3_BUCKET", &mut self.s3.bucket),
            ("DEVPORT_S3_REGION", &mut self.s3.region),
            ("DEVPORT_S3_ACCESS_KEY_ID", &mut self.s3.access_key_id),
            ("DEVPORT_S3_SECRET_ACCESS_KEY", &mut self.s3.secret_access_key),
        ];
        for (key, field) in strings {
            if let Some(value) = env(key) {
                *field = value;
            }
        }
    }

    /// reject values a run cannot safely use
    ///
    /// an in-place rebuild deletes the root directory first, so the root
    /// must not contain the working directory, the cache or the manifest file.
    fn validate(&self, cwd: &Path) -> Result<()> {
        if self.root_directory.as_os_str().is_empty() {
            return Err(Error::ConfigValue {
                key: "root_directory".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        let root = normalize(&cwd.join(&self.root_directory));
        if normalize(cwd).starts_with(&root) {
            return Err(Error::ConfigValue {
                key: "root_directory".to_string(),
                message: format!("{} contains the working directory", root.display()),
            });
        }
        let inside = [
            ("cache_directory", &self.cache_directory),
            ("manifest_file", &self.manifest_file),
        ];
        for (key, path) in inside {
            if normalize(&cwd.join(path)).starts_with(&root) {
                return Err(Error::ConfigValue {
                    key: key.to_string(),
                    message: format!("must not be inside root_directory {}", root.display()),
                });
            }
        }

        if self.s3.bucket.is_empty() {
            return Err(Error::ConfigValue {
                key: "s3.bucket".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn strategy(&self) -> Strategy {
        Strategy::with_workers(self.workers)
    }

    pub fn native_patterns(&self) -> Result<Vec<Pattern>> {
        compile_patterns(self.native_patterns.as_slice())
    }

    pub fn s3_options(&self) -> S3Options {
        S3Options {
            endpoint: self.s3.endpoint.clone(),
            bucket: self.s3.bucket.clone(),
            region: self.s3.region.clone(),
            credentials: Credentials {
                access_key_id: self.s3.access_key_id.clone(),
                secret_access_key: self.s3.secret_access_key.clone(),
            },
            path_style: self.s3.path_style,
            retry_window: Duration::from_secs(self.retry_seconds),
            timeout: REQUEST_TIMEOUT,
        }
    }
}

/// lexically resolve `.` and `..` components
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

fn read_table(path: &Path) -> Result<toml::Table> {
    let content = std::fs::read_to_string(path).with_path(path)?;
    Ok(toml::from_str(&content)?)
}

/// merge `overlay` into `base`; nested tables merge key by key, anything else replaces
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
