use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use anyhow::Context;
use tracing::debug;
use crate::error::AppError;

/// Process-level configuration, read once at startup
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub images_path: PathBuf,
    pub thumbnails_path: PathBuf,
    pub settings_path: PathBuf,
    pub port: u16,
    pub reduce_memory: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            images_path: PathBuf::from("images"),
            thumbnails_path: PathBuf::from("thumbnails"),
            settings_path: PathBuf::from("settings.json"),
            port: 8000,
            reduce_memory: true,
        }
    }
}

impl AppConfig {
    /// Read `.env` from the working directory if there is one, then the
    /// process environment
    pub fn load() -> anyhow::Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => debug!(path = %path.display(), "Loaded .env"),
            Err(e) if e.not_found() => {}
            Err(e) => return Err(e).context("Failed to read .env"),
        }

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup, falling back to defaults for missing keys
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            images_path: lookup("IMAGES_PATH").map(PathBuf::from).unwrap_or(defaults.images_path),
            thumbnails_path: lookup("THUMBNAILS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.thumbnails_path),
            settings_path: lookup("SETTINGS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.settings_path),
            port: parse_var(&lookup, "PORT", defaults.port)?,
            reduce_memory: parse_var(&lookup, "REDUCE_MEMORY", defaults.reduce_memory)?,
        })
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, AppError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{} has invalid value '{}'", key, raw))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.port, 8000);
        assert!(config.reduce_memory);
    }

    #[test]
    fn test_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("IMAGES_PATH", "/data/images"),
            ("PORT", "9001"),
            ("REDUCE_MEMORY", "false"),
        ]))
        .unwrap();

        assert_eq!(config.images_path, PathBuf::from("/data/images"));
        assert_eq!(config.thumbnails_path, PathBuf::from("thumbnails"));
        assert_eq!(config.port, 9001);
        assert!(!config.reduce_memory);
    }

    #[test]
    fn test_malformed_values() {
        assert!(AppConfig::from_lookup(lookup(&[("PORT", "eighty")])).is_err());
        assert!(AppConfig::from_lookup(lookup(&[("REDUCE_MEMORY", "maybe")])).is_err());
    }
}
