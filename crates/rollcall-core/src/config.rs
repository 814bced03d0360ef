use crate::category::{CategorySet, CategorySetError};
use crate::matcher::DEFAULT_MATCH_THRESHOLD;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Embedding length used by the default 128-d face encoder.
pub const DEFAULT_EMBEDDING_DIM: usize = 128;
const DEFAULT_EXTRACTION_TIMEOUT_MS: u64 = 5_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read category file {path}: {source}")]
    CategoryFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse category file {path}: {source}")]
    CategoryParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid category set: {0}")]
    Categories(#[from] CategorySetError),
}

/// `categories = [...]` in a TOML category file.
#[derive(Debug, Deserialize)]
struct CategoryFile {
    categories: Vec<String>,
}

/// Runtime configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for roster and gallery files.
    pub data_dir: PathBuf,
    /// Directory holding one ledger file per day.
    pub records_dir: PathBuf,
    /// Directory of `<identity>.jpg|png` reference photos.
    pub known_faces_dir: PathBuf,
    /// Euclidean distance below which a probe is accepted.
    pub match_threshold: f32,
    /// Fixed embedding dimension of the store.
    pub embedding_dim: usize,
    /// Deadline for one embedding extraction.
    pub extraction_timeout: Duration,
    pub categories: CategorySet,
}

impl Config {
    /// Configuration rooted at `data_dir` with default settings.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            records_dir: data_dir.join("attendance_records"),
            known_faces_dir: data_dir.join("known_faces"),
            data_dir,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            extraction_timeout: Duration::from_millis(DEFAULT_EXTRACTION_TIMEOUT_MS),
            categories: CategorySet::default(),
        }
    }

    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = std::env::var("ROLLCALL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());

        let mut config = Self::with_data_dir(data_dir);

        if let Ok(dir) = std::env::var("ROLLCALL_RECORDS_DIR") {
            config.records_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("ROLLCALL_KNOWN_FACES_DIR") {
            config.known_faces_dir = PathBuf::from(dir);
        }
        config.match_threshold = env_f32("ROLLCALL_MATCH_THRESHOLD", DEFAULT_MATCH_THRESHOLD);
        config.embedding_dim = env_usize("ROLLCALL_EMBEDDING_DIM", DEFAULT_EMBEDDING_DIM);
        config.extraction_timeout = Duration::from_millis(env_u64(
            "ROLLCALL_EXTRACTION_TIMEOUT_MS",
            DEFAULT_EXTRACTION_TIMEOUT_MS,
        ));

        if let Ok(list) = std::env::var("ROLLCALL_CATEGORIES") {
            config.categories = CategorySet::new(list.split(','))?;
        } else if let Ok(path) = std::env::var("ROLLCALL_CATEGORIES_FILE") {
            config.categories = load_category_file(Path::new(&path))?;
        }

        Ok(config)
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

/// Read a category set from a TOML file of the form `categories = ["..."]`.
pub fn load_category_file(path: &Path) -> Result<CategorySet, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::CategoryFile {
        path: path.to_path_buf(),
        source,
    })?;
    let file: CategoryFile = toml::from_str(&text).map_err(|source| ConfigError::CategoryParse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(CategorySet::new(file.categories)?)
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_data_dir_defaults() {
        let config = Config::with_data_dir("/srv/rollcall");
        assert_eq!(config.records_dir, PathBuf::from("/srv/rollcall/attendance_records"));
        assert_eq!(config.known_faces_dir, PathBuf::from("/srv/rollcall/known_faces"));
        assert_eq!(config.match_threshold, 0.5);
        assert_eq!(config.embedding_dim, 128);
        assert_eq!(config.categories.len(), 8);
    }

    #[test]
    fn test_load_category_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("categories.toml");
        std::fs::write(&path, "categories = [\"Art\", \"Music\"]\n").unwrap();
        let set = load_category_file(&path).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains("Music"));
    }

    #[test]
    fn test_load_category_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = load_category_file(&dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(ConfigError::CategoryFile { .. })));

        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "categories = 7").unwrap();
        assert!(matches!(load_category_file(&path), Err(ConfigError::CategoryParse { .. })));

        std::fs::write(&path, "categories = []").unwrap();
        assert!(matches!(
            load_category_file(&path),
            Err(ConfigError::Categories(CategorySetError::Empty))
        ));
    }
}
