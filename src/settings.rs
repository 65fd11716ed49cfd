//! Runtime settings, read from an optional `efaps.toml` and `EFAPS_*` environment variables.
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{EfapsError, Result};

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// SQLite file, or `:memory:`
    pub database: String,
    pub bind: String,
    /// JSON model installed at startup
    pub model: Option<String>,
    pub locale: String,
    /// person id used when a request names no actor
    pub actor: i64,
    pub log: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database: ":memory:".to_string(),
            bind: "127.0.0.1:8080".to_string(),
            model: None,
            locale: "en".to_string(),
            actor: 1,
            log: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Settings> {
        Self::load_from("efaps")
    }
    /// `name` is a config file without extension; a missing file is not an error.
    pub fn load_from(name: &str) -> Result<Settings> {
        let defaults = Settings::default();
        Config::builder()
            .set_default("database", defaults.database)
            .and_then(|b| b.set_default("bind", defaults.bind))
            .and_then(|b| b.set_default("locale", defaults.locale))
            .and_then(|b| b.set_default("actor", defaults.actor))
            .and_then(|b| b.set_default("log", defaults.log))
            .map_err(|e| EfapsError::Config(e.to_string()))?
            .add_source(File::with_name(name).required(false))
            .add_source(Environment::with_prefix("EFAPS"))
            .build()
            .and_then(|c| c.try_deserialize::<Settings>())
            .map_err(|e| EfapsError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let settings = Settings::load_from("no-such-efaps-settings").unwrap();
        assert_eq!(settings.bind, Settings::default().bind);
        assert_eq!(settings.actor, 1);
        assert!(settings.model.is_none());
    }
}
