use serde::Deserialize;

use std::path::{Path, PathBuf};

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub(crate) struct Config {
    /// Control port of the connector, on 127.0.0.1.
    pub(crate) connector_port: u16,

    /// Shared secret for the connector's control port.
    pub(crate) control_password: String,

    /// Port of the web API, bound on 127.0.0.1.
    pub(crate) http_port: u16,

    /// Password the web UI logs in with.
    pub(crate) web_password: String,

    /// Path of the user profiles JSON file.
    pub(crate) profiles_file: PathBuf,
}

impl Config {
    /// Returns error descriptions.
    pub(crate) fn validate(&self) -> Vec<String> {
        let mut errors = vec![];
        if self.connector_port == 0 {
            errors.push("'connector-port' can't be 0".to_owned());
        }
        if self.http_port == 0 {
            errors.push("'http-port' can't be 0".to_owned());
        }
        if self.control_password.is_empty() {
            errors.push("'control-password' can't be empty".to_owned());
        }
        if self.web_password.is_empty() {
            errors.push("'web-password' can't be empty".to_owned());
        }
        if self.profiles_file.as_os_str().is_empty() {
            errors.push("'profiles-file' can't be empty".to_owned());
        }
        errors
    }
}

pub(crate) fn parse_config(config_path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(config_path)?;
    Ok(serde_json::from_str(&contents)?)
}
