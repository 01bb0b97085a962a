use facevote_core::{DEFAULT_DESCRIPTOR_DIM, DEFAULT_MATCH_THRESHOLD};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration: an optional TOML file overlaid by environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite gallery database.
    pub db_path: PathBuf,
    /// Maximum Euclidean distance for a positive match (inclusive).
    pub match_threshold: f32,
    /// Length of every descriptor produced by the extractor.
    pub descriptor_dim: usize,
    /// Number of photos required to enroll one voter.
    pub enroll_images: usize,
    /// External descriptor extractor command line.
    pub extractor_cmd: Option<String>,
    /// Worker threads running extraction concurrently.
    pub extract_workers: usize,
    /// Pending extraction requests accepted before callers wait.
    pub extract_queue: usize,
    /// Upper bound on a single extraction, queueing included.
    pub extract_timeout_secs: u64,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_data_dir(|key| std::env::var(key).ok()).join("gallery.db"),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            descriptor_dim: DEFAULT_DESCRIPTOR_DIM,
            enroll_images: 3,
            extractor_cmd: None,
            extract_workers: 2,
            extract_queue: 8,
            extract_timeout_secs: 30,
            bus: BusKind::Session,
        }
    }
}

impl Config {
    /// Load configuration from `FACEVOTE_CONFIG` (if set) and `FACEVOTE_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = match lookup("FACEVOTE_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self {
                db_path: default_data_dir(&lookup).join("gallery.db"),
                ..Self::default()
            },
        };

        if let Some(v) = lookup("FACEVOTE_DB_PATH") {
            cfg.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEVOTE_MATCH_THRESHOLD") {
            cfg.match_threshold = parse("FACEVOTE_MATCH_THRESHOLD", v)?;
        }
        if let Some(v) = lookup("FACEVOTE_DESCRIPTOR_DIM") {
            cfg.descriptor_dim = parse("FACEVOTE_DESCRIPTOR_DIM", v)?;
        }
        if let Some(v) = lookup("FACEVOTE_ENROLL_IMAGES") {
            cfg.enroll_images = parse("FACEVOTE_ENROLL_IMAGES", v)?;
        }
        if let Some(v) = lookup("FACEVOTE_EXTRACTOR_CMD") {
            cfg.extractor_cmd = Some(v).filter(|c| !c.trim().is_empty());
        }
        if let Some(v) = lookup("FACEVOTE_EXTRACT_WORKERS") {
            cfg.extract_workers = parse("FACEVOTE_EXTRACT_WORKERS", v)?;
        }
        if let Some(v) = lookup("FACEVOTE_EXTRACT_QUEUE") {
            cfg.extract_queue = parse("FACEVOTE_EXTRACT_QUEUE", v)?;
        }
        if let Some(v) = lookup("FACEVOTE_EXTRACT_TIMEOUT_SECS") {
            cfg.extract_timeout_secs = parse("FACEVOTE_EXTRACT_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("FACEVOTE_BUS") {
            cfg.bus = match v.as_str() {
                "session" => BusKind::Session,
                "system" => BusKind::System,
                _ => return Err(invalid("FACEVOTE_BUS", v)),
            };
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Read a TOML config file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.match_threshold.is_finite() || self.match_threshold < 0.0 {
            return Err(invalid("match_threshold", self.match_threshold.to_string()));
        }
        if self.descriptor_dim == 0 {
            return Err(invalid("descriptor_dim", "0".into()));
        }
        if self.enroll_images == 0 {
            return Err(invalid("enroll_images", "0".into()));
        }
        if self.extract_workers == 0 {
            return Err(invalid("extract_workers", "0".into()));
        }
        if self.extract_queue == 0 {
            return Err(invalid("extract_queue", "0".into()));
        }
        if self.extract_timeout_secs == 0 {
            return Err(invalid("extract_timeout_secs", "0".into()));
        }
        Ok(())
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs)
    }
}

/// `$XDG_DATA_HOME/facevote`, falling back to `~/.local/share/facevote`.
fn default_data_dir(lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
    lookup("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facevote")
}

fn parse<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

fn invalid(key: &'static str, value: String) -> ConfigError {
    ConfigError::InvalidValue { key, value }
}
