//! Mirror agent configuration
//!
//! Layered configuration: a YAML file provides structure, environment
//! variables (prefixed `MIRROR_`, `__`-separated for nesting) override
//! secrets and per-deployment values. `.env` files are loaded first via
//! `dotenvy` for local development.

use crate::error::{Error, Result};
use config::{Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapSettings {
    /// `host:port`; transport is always implicit TLS.
    pub addr: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSettings {
    pub state_dir: String,
    #[serde(default = "default_state_file")]
    pub state_file: String,
    #[serde(default)]
    pub last_message_offset: u32,
}

fn default_state_file() -> String {
    ".state.json".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSettings {
    pub backup_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FilterSettings {
    /// Directory of rule files consumed by the shipped reference filter.
    /// Absent or missing => the filter plugin is not installed.
    pub scripts_dir: Option<String>,
    #[serde(default = "default_quarantine_folder")]
    pub quarantine_folder: String,
}

fn default_quarantine_folder() -> String {
    "Spam.Shit".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub imap: ImapSettings,
    pub state: StateSettings,
    pub backup: BackupSettings,
    #[serde(default)]
    pub filter: FilterSettings,
    /// Seconds between sweeps; `None` or `0` means "run once then exit".
    #[serde(default)]
    pub run_period_secs: Option<u64>,
}

impl Settings {
    /// Load configuration from an optional YAML file plus environment
    /// overrides (`MIRROR_IMAP__ADDR`, `MIRROR_IMAP__PASSWORD`, …).
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let builder = config::Config::builder()
            .set_default("filter.quarantine_folder", "Spam.Shit")?
            .set_default("state.state_file", ".state.json")?
            .add_source(File::with_name(config_path.unwrap_or("config.yml")).required(config_path.is_some()))
            .add_source(Environment::with_prefix("MIRROR").separator("__"));

        let settings: Self = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.imap.addr.is_empty() {
            return Err(Error::Config("imap.addr must not be empty".into()));
        }
        if self.state.state_dir.is_empty() {
            return Err(Error::Config("state.state_dir must not be empty".into()));
        }
        if self.backup.backup_dir.is_empty() {
            return Err(Error::Config("backup.backup_dir must not be empty".into()));
        }
        Ok(())
    }

    /// A complete, documented default configuration, for `print-default-config`.
    #[must_use]
    pub fn example() -> Self {
        Self {
            imap: ImapSettings {
                addr: "imap.example.com:993".to_string(),
                username: "user".to_string(),
                password: "password".to_string(),
            },
            state: StateSettings {
                state_dir: "state".to_string(),
                state_file: default_state_file(),
                last_message_offset: 0,
            },
            backup: BackupSettings {
                backup_dir: "backup".to_string(),
            },
            filter: FilterSettings {
                scripts_dir: Some("rules".to_string()),
                quarantine_folder: default_quarantine_folder(),
            },
            run_period_secs: Some(120),
        }
    }
}
