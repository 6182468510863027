//! User profiles ("IRC networks") and their JSON file.
//!
//! The file is rewritten atomically (temp file + rename) on every `set-profiles` action; it also
//! stores the initial-window preference.

use serde::{Deserialize, Serialize};
use serde_json::json;

use std::fs;
use std::io::Write;
use std::path::Path;

/// One IRC network: where to connect and how to register.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub(crate) struct Profile {
    pub(crate) name: String,

    /// Keep a connection to this network open?
    #[serde(default)]
    pub(crate) connect: bool,

    /// Servers to try, in order. The reconnect controller rotates through them.
    pub(crate) servers: Vec<Server>,

    /// Nicks to try when registering, in order.
    pub(crate) nicknames: Vec<String>,

    pub(crate) username: String,

    pub(crate) realname: String,

    /// Sent to NickServ once per session, right after registration.
    #[serde(default)]
    pub(crate) nickserv_password: Option<String>,

    /// Channels to join automatically after registration.
    #[serde(default)]
    pub(crate) channels: Vec<Channel>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub(crate) struct Server {
    pub(crate) host: String,
    pub(crate) port: u16,
    #[serde(default)]
    pub(crate) ssl: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub(crate) struct Channel {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) key: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub(crate) struct ProfilesFile {
    #[serde(default)]
    pub(crate) profiles: Vec<Profile>,

    /// `[profile, party]` the web UI opens first, or null.
    #[serde(default)]
    pub(crate) initial_window: Option<(String, String)>,
}

impl Profile {
    /// Placeholder for connections whose profile is unknown (e.g. removed from the file while the
    /// connector kept the connection alive).
    pub(crate) fn unknown(name: &str) -> Profile {
        Profile {
            name: name.to_owned(),
            connect: false,
            servers: Vec::new(),
            nicknames: Vec::new(),
            username: String::new(),
            realname: String::new(),
            nickserv_password: None,
            channels: Vec::new(),
        }
    }

    /// The API never returns stored passwords.
    pub(crate) fn redacted(&self) -> serde_json::Value {
        json!({
            "name": self.name,
            "connect": self.connect,
            "servers": self.servers,
            "nicknames": self.nicknames,
            "username": self.username,
            "realname": self.realname,
            "nickserv-password": serde_json::Value::Null,
            "channels": self.channels,
        })
    }
}

impl ProfilesFile {
    pub(crate) fn get(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    /// Returns error descriptions.
    pub(crate) fn validate(&self) -> Vec<String> {
        let mut errors = vec![];
        for profile in &self.profiles {
            if profile.name.is_empty() {
                errors.push("Profile names can't be empty".to_owned());
            }
            if self
                .profiles
                .iter()
                .filter(|p| p.name == profile.name)
                .count()
                > 1
            {
                errors.push(format!("Duplicate profile name '{}'", profile.name));
            }
            if profile.connect {
                if profile.servers.is_empty() {
                    errors.push(format!(
                        "Profile '{}' has connect enabled but no servers",
                        profile.name
                    ));
                }
                if profile.nicknames.iter().all(|n| n.is_empty()) {
                    errors.push(format!(
                        "Profile '{}' has connect enabled but no nicknames",
                        profile.name
                    ));
                }
            }
            for nick in &profile.nicknames {
                if nick.is_empty() {
                    errors.push(format!("Profile '{}' has an empty nickname", profile.name));
                }
            }
        }
        errors
    }
}

/// A missing file is an empty profile list, not an error; the UI creates profiles later.
pub(crate) fn load(path: &Path) -> anyhow::Result<ProfilesFile> {
    if !path.exists() {
        return Ok(ProfilesFile::default());
    }
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

pub(crate) fn save_atomic(path: &Path, file: &ProfilesFile) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(file)?;
    let tmp_path = path.with_extension("tmp");
    {
        let mut tmp = fs::File::create(&tmp_path)?;
        tmp.write_all(json.as_bytes())?;
        tmp.write_all(b"\n")?;
        tmp.sync_data()?;
    }
    fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ProfilesFile {
        ProfilesFile {
            profiles: vec![Profile {
                name: "libera".to_owned(),
                connect: true,
                servers: vec![Server {
                    host: "irc.libera.chat".to_owned(),
                    port: 6697,
                    ssl: true,
                }],
                nicknames: vec!["alice".to_owned(), "alice_".to_owned()],
                username: "alice".to_owned(),
                realname: "Alice".to_owned(),
                nickserv_password: Some("hunter2".to_owned()),
                channels: vec![Channel {
                    name: "#rust".to_owned(),
                    key: None,
                }],
            }],
            initial_window: Some(("libera".to_owned(), "#rust".to_owned())),
        }
    }

    #[test]
    fn file_roundtrip() {
        let mut path = std::env::temp_dir();
        path.push("mamirc_profiles_roundtrip.json");
        let _ = fs::remove_file(&path);

        let file = sample();
        save_atomic(&path, &file).unwrap();
        assert_eq!(load(&path).unwrap(), file);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_is_empty() {
        let mut path = std::env::temp_dir();
        path.push("mamirc_profiles_does_not_exist.json");
        let _ = fs::remove_file(&path);
        assert_eq!(load(&path).unwrap(), ProfilesFile::default());
    }

    #[test]
    fn redaction_nulls_password() {
        let file = sample();
        let value = file.profiles[0].redacted();
        assert_eq!(value["nickserv-password"], serde_json::Value::Null);
        assert_eq!(value["name"], "libera");
    }

    #[test]
    fn validation_catches_connectable_without_servers() {
        let mut file = sample();
        file.profiles[0].servers.clear();
        assert_eq!(file.validate().len(), 1);
    }

    #[test]
    fn kebab_case_field_names() {
        let json = r##"{
            "profiles": [{
                "name": "n",
                "connect": false,
                "servers": [],
                "nicknames": ["x"],
                "username": "u",
                "realname": "r",
                "nickserv-password": "pw",
                "channels": [{"name": "#c", "key": "k"}]
            }],
            "initial-window": ["n", ""]
        }"##;
        let file: ProfilesFile = serde_json::from_str(json).unwrap();
        assert_eq!(file.profiles[0].nickserv_password.as_deref(), Some("pw"));
        assert_eq!(
            file.initial_window,
            Some(("n".to_owned(), "".to_owned()))
        );
    }
}
