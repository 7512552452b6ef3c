//! Configuration loader and validator for the book-collection service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub isbn: Isbn,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub bind_addr: String,
    pub api_key: String,
    pub upload_dir: String,
}

/// ISBN metadata lookup service settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Isbn {
    pub base_url: String,
    pub key: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` and
    /// `app.upload_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if !self.app.data_dir.trim().is_empty() {
            fs::create_dir_all(&self.app.data_dir)?;
        }
        if !self.app.upload_dir.trim().is_empty() {
            fs::create_dir_all(&self.app.upload_dir)?;
        }
        Ok(())
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.bind_addr.trim().is_empty() {
        return Err(ConfigError::Invalid("app.bind_addr must be non-empty"));
    }
    if cfg.app.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("app.api_key must be non-empty"));
    }
    if cfg.app.upload_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.upload_dir must be non-empty"));
    }

    if cfg.isbn.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("isbn.base_url must be non-empty"));
    }
    if cfg.isbn.key.trim().is_empty() {
        return Err(ConfigError::Invalid("isbn.key must be non-empty"));
    }

    Ok(())
}

/// Example YAML configuration, kept in sync with the struct schema.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  bind_addr: "0.0.0.0:5000"
  api_key: "CHANGE_ME"
  upload_dir: "./data/uploads"

isbn:
  base_url: "https://api2.isbndb.com/"
  key: "YOUR_ISBN_API_KEY"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
    }

    #[test]
    fn invalid_api_key() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.api_key = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("app.api_key")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_isbn_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.isbn.base_url = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("isbn.base_url")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.isbn.key = "".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ensure_dirs_creates_data_and_upload_dirs() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let upload_path = td.path().join("uploads");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.app.upload_dir = upload_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
        assert!(upload_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.app.bind_addr, "0.0.0.0:5000");
    }
}
