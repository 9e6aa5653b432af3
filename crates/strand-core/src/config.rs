//! Store configuration

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for a [`GraphStore`](crate::GraphStore)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the record stores, WAL and catalog
    pub data_dir: PathBuf,
    /// Maximum number of relationship records read per chain page
    pub chain_batch_size: usize,
    /// Initial size of each record store file in bytes
    pub initial_store_size: usize,
    /// fsync the WAL when a transaction is prepared and committed
    pub sync_on_prepare: bool,
    /// How long prepare waits for a chain lock before giving up
    pub lock_timeout_ms: u64,
    /// LMDB map size for the catalog environment
    pub catalog_map_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            chain_batch_size: 100,
            initial_store_size: 1024 * 1024,
            sync_on_prepare: true,
            lock_timeout_ms: 5_000,
            catalog_map_size: 10 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Configuration rooted at `data_dir` with every other setting defaulted
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str::<StoreConfig>(&content)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;
        tracing::info!("Loaded store configuration from {:?}", path);
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables and an optional file
    ///
    /// Priority: environment variables > `STRAND_CONFIG` file > defaults
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `var`
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match var("STRAND_CONFIG") {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Some(dir) = var("STRAND_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(size) = var("STRAND_CHAIN_BATCH_SIZE") {
            config.chain_batch_size = parse_env("STRAND_CHAIN_BATCH_SIZE", &size)?;
        }
        if let Some(timeout) = var("STRAND_LOCK_TIMEOUT_MS") {
            config.lock_timeout_ms = parse_env("STRAND_LOCK_TIMEOUT_MS", &timeout)?;
        }
        if let Some(sync) = var("STRAND_SYNC_ON_PREPARE") {
            config.sync_on_prepare = parse_env("STRAND_SYNC_ON_PREPARE", &sync)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the store cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.chain_batch_size == 0 {
            return Err(Error::config("chain_batch_size must be at least 1"));
        }
        if self.initial_store_size == 0 {
            return Err(Error::config("initial_store_size must be non-zero"));
        }
        Ok(())
    }

    /// Lock timeout as a [`Duration`]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| Error::config(format!("{} has invalid value '{}'", name, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.chain_batch_size, 100);
        assert!(config.sync_on_prepare);
        assert_eq!(config.lock_timeout(), Duration::from_secs(5));
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "data_dir = \"/tmp/strand\"").unwrap();
        writeln!(file, "chain_batch_size = 7").unwrap();

        let config = StoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/strand"));
        assert_eq!(config.chain_batch_size, 7);
        assert_eq!(config.lock_timeout_ms, 5_000);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "chain_batch_size = 0").unwrap();

        let err = StoreConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_env_overrides_file_and_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "chain_batch_size = 7").unwrap();
        writeln!(file, "lock_timeout_ms = 900").unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let config = StoreConfig::from_vars(vars(&[
            ("STRAND_CONFIG", path.as_str()),
            ("STRAND_CHAIN_BATCH_SIZE", "25"),
            ("STRAND_SYNC_ON_PREPARE", "false"),
            ("STRAND_DATA_DIR", "/var/lib/strand"),
        ]))
        .unwrap();
        // Environment beats the file
        assert_eq!(config.chain_batch_size, 25);
        // File beats the default when no variable is set
        assert_eq!(config.lock_timeout_ms, 900);
        // Environment beats the default
        assert!(!config.sync_on_prepare);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/strand"));
        assert_eq!(config.initial_store_size, StoreConfig::default().initial_store_size);
    }

    #[test]
    fn test_no_variables_gives_defaults() {
        let config = StoreConfig::from_vars(vars(&[])).unwrap();
        assert_eq!(config.chain_batch_size, 100);
        assert_eq!(config.data_dir, PathBuf::from("./data"));
    }

    #[test]
    fn test_unparsable_variable_is_config_error() {
        for (name, raw) in [
            ("STRAND_CHAIN_BATCH_SIZE", "many"),
            ("STRAND_LOCK_TIMEOUT_MS", "-1"),
            ("STRAND_SYNC_ON_PREPARE", "maybe"),
        ] {
            let err = StoreConfig::from_vars(vars(&[(name, raw)])).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{}: {:?}", name, err);
            assert!(err.to_string().contains(name));
        }
    }

    #[test]
    fn test_zero_batch_size_from_env_rejected() {
        let err = StoreConfig::from_vars(vars(&[("STRAND_CHAIN_BATCH_SIZE", "0")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_parse_env_value() {
        assert_eq!(parse_env::<u64>("X", " 42 ").unwrap(), 42);
        assert!(parse_env::<bool>("X", "maybe").is_err());
    }
}
