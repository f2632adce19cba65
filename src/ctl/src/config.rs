use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, ErrorKind};
use std::path::PathBuf;

const CONFIG_FILE: &str = ".rewindrc";

/// Default target node, persisted by `rewind-ctl use`
#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl Config {
    /// Get the path to the config file (~/.rewindrc)
    pub fn path() -> io::Result<PathBuf> {
        dirs::home_dir()
            .map(|h| h.join(CONFIG_FILE))
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, "Could not find home directory"))
    }

    /// Load config from ~/.rewindrc
    pub fn load() -> io::Result<Self> {
        let path = Self::path()?;
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(&path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> io::Result<Self> {
        toml::from_str(content).map_err(|e| io::Error::new(ErrorKind::InvalidData, e.to_string()))
    }

    /// Save config to ~/.rewindrc
    pub fn save(&self) -> io::Result<()> {
        let path = Self::path()?;
        let content = toml::to_string_pretty(self)
            .map_err(|e| io::Error::new(ErrorKind::InvalidData, e.to_string()))?;
        fs::write(&path, content)
    }

    /// Delete the config file
    pub fn delete() -> io::Result<()> {
        let path = Self::path()?;
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
