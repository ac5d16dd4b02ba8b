//! Runtime configuration.
//!
//! Values come from an optional `gavel.toml`, then `GAVEL_*` environment
//! variables; command-line flags override both.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

const DEFAULT_CONFIG_FILE: &str = "gavel.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store_dir: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    pub num_cores: Option<u32>,
    /// Address a worker or client connects to.
    pub server: Option<String>,
    /// Address the server listens on.
    pub listen: Option<String>,
    pub worker_name: Option<String>,
}

impl Config {
    /// Loads the configuration file (the given path, or `gavel.toml` in
    /// the working directory when present) and applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::parse_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.is_file() {
                    Self::parse_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env();
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    fn apply_env(&mut self) {
        if let Ok(value) = std::env::var("GAVEL_STORE_DIR") {
            self.store_dir = Some(value.into());
        }
        if let Ok(value) = std::env::var("GAVEL_TEMP_DIR") {
            self.temp_dir = Some(value.into());
        }
        if let Ok(value) = std::env::var("GAVEL_NUM_CORES") {
            if let Ok(cores) = value.parse() {
                self.num_cores = Some(cores);
            }
        }
        if let Ok(value) = std::env::var("GAVEL_SERVER") {
            self.server = Some(value);
        }
        if let Ok(value) = std::env::var("GAVEL_LISTEN") {
            self.listen = Some(value);
        }
        if let Ok(value) = std::env::var("GAVEL_WORKER_NAME") {
            self.worker_name = Some(value);
        }
    }

    pub fn store_dir(&self) -> PathBuf {
        self.store_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("gavel").join("store"))
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("gavel").join("sandbox"))
    }

    pub fn num_cores(&self) -> u32 {
        self.num_cores.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1)
        })
    }

    pub fn listen(&self) -> String {
        self.listen.clone().unwrap_or_else(|| "0.0.0.0:7070".into())
    }

    pub fn server(&self) -> String {
        self.server
            .clone()
            .unwrap_or_else(|| "127.0.0.1:7070".into())
    }

    pub fn worker_name(&self) -> String {
        self.worker_name
            .clone()
            .unwrap_or_else(|| "unnamed_worker".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_file() {
        let config: Config = toml::from_str(
            r#"
store_dir = "/data/store"
temp_dir = "/data/tmp"
num_cores = 8
server = "judge.example.org:7070"
worker_name = "rack-3"
"#,
        )
        .unwrap();
        assert_eq!(config.store_dir(), PathBuf::from("/data/store"));
        assert_eq!(config.num_cores(), 8);
        assert_eq!(config.server(), "judge.example.org:7070");
        assert_eq!(config.worker_name(), "rack-3");
        // Unset fields fall back to defaults.
        assert_eq!(config.listen(), "0.0.0.0:7070");
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.num_cores() >= 1);
        assert!(config.store_dir().ends_with("gavel/store"));
        assert_eq!(config.worker_name(), "unnamed_worker");
    }
}
