use serde::Deserialize;

use std::path::{Path, PathBuf};

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub(crate) struct Config {
    /// Control port, bound on 127.0.0.1.
    pub(crate) control_port: u16,

    /// Shared secret the processor must present on the control port.
    pub(crate) control_password: String,

    /// Path of the append-only event journal.
    pub(crate) journal_file: PathBuf,
}

impl Config {
    /// Returns error descriptions.
    pub(crate) fn validate(&self) -> Vec<String> {
        let mut errors = vec![];
        if self.control_port == 0 {
            errors.push("'control-port' can't be 0".to_owned());
        }
        if self.control_password.is_empty() {
            errors.push("'control-password' can't be empty".to_owned());
        }
        if self.journal_file.as_os_str().is_empty() {
            errors.push("'journal-file' can't be empty".to_owned());
        }
        errors
    }
}

pub(crate) fn parse_config(config_path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(config_path)?;
    Ok(serde_json::from_str(&contents)?)
}
