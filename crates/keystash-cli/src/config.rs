use std::{
    fs,
    path::{Path, PathBuf},
};

use color_eyre::Result;
use dirs::config_dir;
use serde::{Deserialize, Serialize};

use crate::cli::BackendKind;

pub const DEFAULT_KEYRING_SERVICE: &str = "keystash";
pub const DEFAULT_KEYRING_ACCOUNT: &str = "data-key";
pub const DEFAULT_DURABLE_FILE: &str = "store.json";

/// User-level configuration loaded from `~/.config/keystash/config.toml` (platform-specific).
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct Config {
    /// Override for the data directory (secure blobs and the durable file).
    pub data_dir: Option<PathBuf>,
    /// Backend used when `--backend` is not given.
    pub backend: Option<BackendKind>,
    /// Where the secure backend's data key is kept.
    pub keyring: Option<KeyringConfig>,
    /// File name of the durable map inside the data directory.
    pub durable_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct KeyringConfig {
    pub service: Option<String>,
    pub account: Option<String>,
}

impl Config {
    pub fn backend(&self) -> BackendKind {
        self.backend.unwrap_or_default()
    }

    pub fn keyring_service(&self) -> &str {
        self.keyring
            .as_ref()
            .and_then(|k| k.service.as_deref())
            .unwrap_or(DEFAULT_KEYRING_SERVICE)
    }

    pub fn keyring_account(&self) -> &str {
        self.keyring
            .as_ref()
            .and_then(|k| k.account.as_deref())
            .unwrap_or(DEFAULT_KEYRING_ACCOUNT)
    }

    pub fn durable_file(&self) -> &str {
        self.durable_file.as_deref().unwrap_or(DEFAULT_DURABLE_FILE)
    }
}

/// Load config from the default path; if missing, return defaults.
pub fn load() -> Result<Config> {
    let path = default_path()?;
    load_from_path(path)
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = toml::from_str(&contents)?;
    Ok(cfg)
}

/// Resolve the default config path (platform aware).
pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| color_eyre::eyre::eyre!("no config dir available"))?;
    Ok(base.join("keystash").join("config.toml"))
}

/// Write the config to the default path unless a file is already there.
pub fn write_default_if_missing(config: &Config) -> Result<PathBuf> {
    write_if_missing(config, &default_path()?)
}

/// Never clobbers an existing file; returns the path either way.
pub fn write_if_missing(config: &Config, path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_default_when_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = load_from_path(dir.path().join("config.toml")).expect("load");
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.backend(), BackendKind::Secure);
        assert_eq!(cfg.keyring_service(), DEFAULT_KEYRING_SERVICE);
        assert_eq!(cfg.durable_file(), DEFAULT_DURABLE_FILE);
    }

    #[test]
    fn empty_file_is_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "  \n").expect("write");
        assert_eq!(load_from_path(&path).expect("load"), Config::default());
    }

    #[test]
    fn parses_custom_config() {
        let contents = r#"
            data_dir = "/tmp/keystash-data"
            backend = "durable"
            durable_file = "prefs.json"
            [keyring]
            service = "my-app"
            account = "primary"
        "#;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, contents).expect("write temp config");

        let cfg = load_from_path(&path).expect("load");
        assert_eq!(
            cfg,
            Config {
                data_dir: Some(PathBuf::from("/tmp/keystash-data")),
                backend: Some(BackendKind::Durable),
                keyring: Some(KeyringConfig {
                    service: Some("my-app".into()),
                    account: Some("primary".into()),
                }),
                durable_file: Some("prefs.json".into()),
            }
        );
        assert_eq!(cfg.keyring_account(), "primary");
        assert_eq!(cfg.durable_file(), "prefs.json");
    }

    #[test]
    fn rejects_unknown_backend_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        fs::write(&path, r#"backend = "cloud""#).expect("write");
        assert!(load_from_path(&path).is_err());
    }

    #[test]
    fn write_default_creates_file_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");
        let cfg = Config {
            data_dir: Some(PathBuf::from("/tmp/keystash-data")),
            backend: Some(BackendKind::Memory),
            ..Config::default()
        };

        write_if_missing(&cfg, &path).expect("write should succeed");
        let other = Config::default();
        let second = write_if_missing(&other, &path).expect("second write ok");
        assert_eq!(second, path);
        let loaded = load_from_path(&path).expect("load");
        assert_eq!(loaded, cfg);
    }
}
