use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "peerassessd.toml";
pub const ENV_TABLE_PREFIX: &str = "PEERASSESSD_TABLE_PREFIX";
pub const ENV_ACADEMIC_YEAR_START_MONTH: &str = "PEERASSESSD_ACADEMIC_YEAR_START_MONTH";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("academic_year_start_month must be between 1 and 12, got {0}")]
    StartMonth(i64),

    #[error("table_prefix may only contain ASCII letters, digits and '_', got {0:?}")]
    TablePrefix(String),

    #[error("{name} is not a valid integer: {value:?}")]
    EnvInteger { name: &'static str, value: String },
}

/// Process-wide settings consumed by the result queries.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Prepended to every table name (`pa2_assessment`, `pa2_user_mark`, ...).
    pub table_prefix: String,
    pub academic_year_start_month: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            table_prefix: "pa2_".to_string(),
            academic_year_start_month: 9,
        }
    }
}

impl Config {
    /// Reads `<workspace>/peerassessd.toml` when present, then applies
    /// environment overrides and validates the result.
    pub fn load(workspace: &Path) -> Result<Self, ConfigError> {
        let path = workspace.join(CONFIG_FILE_NAME);
        let mut cfg = if path.is_file() {
            let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?
        } else {
            Self::default()
        };
        cfg.apply_overrides(|name| std::env::var(name).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(prefix) = lookup(ENV_TABLE_PREFIX) {
            self.table_prefix = prefix;
        }
        if let Some(raw) = lookup(ENV_ACADEMIC_YEAR_START_MONTH) {
            let month = raw.trim().parse::<i64>().map_err(|_| ConfigError::EnvInteger {
                name: ENV_ACADEMIC_YEAR_START_MONTH,
                value: raw.clone(),
            })?;
            self.academic_year_start_month = month;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=12).contains(&self.academic_year_start_month) {
            return Err(ConfigError::StartMonth(self.academic_year_start_month));
        }
        // The prefix is spliced into SQL identifiers; values never are.
        if !self
            .table_prefix
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            return Err(ConfigError::TablePrefix(self.table_prefix.clone()));
        }
        Ok(())
    }

    /// Start month as `u32`, valid once `validate` has passed.
    pub fn start_month(&self) -> u32 {
        u32::try_from(self.academic_year_start_month).unwrap_or(9)
    }
}
