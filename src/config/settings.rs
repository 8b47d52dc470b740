use crate::core::{MiningConfig, DEFAULT_DIFFICULTY};
use crate::error::{LedgerError, Result};
use crate::wallet::WALLET_FILE;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_PATH_KEY: &str = "LEDGER_CONFIG";
const DATA_DIR_KEY: &str = "LEDGER_DATA_DIR";
const WALLET_FILE_KEY: &str = "LEDGER_WALLET_FILE";
const DIFFICULTY_KEY: &str = "LEDGER_DIFFICULTY";
const MINING_WORKERS_KEY: &str = "LEDGER_MINING_WORKERS";
const LOG_LEVEL_KEY: &str = "LEDGER_LOG_LEVEL";

/// Runtime settings: defaults, then an optional TOML file, then environment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub wallet_file: PathBuf,
    pub difficulty: u32,
    pub mining_workers: usize,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            data_dir: PathBuf::from("data"),
            wallet_file: PathBuf::from(WALLET_FILE),
            difficulty: DEFAULT_DIFFICULTY,
            mining_workers: 1,
            log_level: String::from("info"),
        }
    }
}

impl Settings {
    /// Resolves settings for this process. `config_path` wins over the
    /// `LEDGER_CONFIG` variable.
    pub fn load(config_path: Option<&Path>) -> Result<Settings> {
        let file = config_path
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(CONFIG_PATH_KEY).map(PathBuf::from));

        let mut settings = match file {
            Some(path) => Self::from_file(&path)?,
            None => Settings::default(),
        };
        settings.apply_overrides(|key| env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Settings> {
        let text = fs::read_to_string(path).map_err(|e| {
            LedgerError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Settings> {
        Ok(toml::from_str(text)?)
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(DATA_DIR_KEY) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(file) = lookup(WALLET_FILE_KEY) {
            self.wallet_file = PathBuf::from(file);
        }
        if let Some(value) = lookup(DIFFICULTY_KEY) {
            self.difficulty = parse_number(DIFFICULTY_KEY, &value)?;
        }
        if let Some(value) = lookup(MINING_WORKERS_KEY) {
            self.mining_workers = parse_number(MINING_WORKERS_KEY, &value)?;
        }
        if let Some(level) = lookup(LOG_LEVEL_KEY) {
            self.log_level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.mining_config()?;
        if self.log_level.parse::<log::LevelFilter>().is_err() {
            return Err(LedgerError::Config(format!(
                "Unknown log level '{}'",
                self.log_level
            )));
        }
        Ok(())
    }

    pub fn mining_config(&self) -> Result<MiningConfig> {
        MiningConfig::new(self.difficulty, self.mining_workers)
    }

    /// Where the wallet file lives; relative paths are taken as given.
    pub fn wallet_path(&self) -> &Path {
        &self.wallet_file
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| LedgerError::Config(format!("{key} must be a number, got '{value}'")))
}
