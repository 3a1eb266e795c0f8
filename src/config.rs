//! Configuration loading and management
//!
//! The CLI keeps two connection profiles, `local` and `remote`, in a TOML
//! file under the user configuration directory. Credentials left out of
//! the file fall back to the `VC_MONGO_USER` / `VC_MONGO_PASSWORD`
//! environment variables; explicit values always win.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment fallback for the connection username.
pub const ENV_USER: &str = "VC_MONGO_USER";
/// Environment fallback for the connection password.
pub const ENV_PASSWORD: &str = "VC_MONGO_PASSWORD";

/// Override for the configuration file location.
pub const ENV_CONFIG: &str = "VC_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection profile for the working collection
    #[serde(default)]
    pub local: Profile,

    /// Connection profile for the synchronisation counterpart
    #[serde(default)]
    pub remote: Profile,
}

/// One database connection profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Database selected with `vc use`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Collection selected with `vc use`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    27017
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: None,
            password: None,
            database: None,
            collection: None,
        }
    }
}

impl Profile {
    /// Credentials with the environment fallback applied.
    pub fn credentials(&self) -> (Option<String>, Option<String>) {
        resolve_credentials(
            self.username.clone(),
            self.password.clone(),
            std::env::var(ENV_USER).ok(),
            std::env::var(ENV_PASSWORD).ok(),
        )
    }

    /// The connection string for this profile.
    pub fn connection_uri(&self) -> String {
        let (username, password) = self.credentials();
        match (username, password) {
            (Some(user), Some(pass)) => {
                format!("mongodb://{user}:{pass}@{}:{}", self.host, self.port)
            }
            (Some(user), None) => format!("mongodb://{user}@{}:{}", self.host, self.port),
            _ => format!("mongodb://{}:{}", self.host, self.port),
        }
    }

    /// Key identifying the server, used for lock ordering.
    pub fn origin(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn require_database(&self) -> Result<&str> {
        self.database
            .as_deref()
            .ok_or_else(|| Error::InvalidConfig("no database selected; run `vc use` first".into()))
    }

    pub fn require_collection(&self) -> Result<&str> {
        self.collection.as_deref().ok_or_else(|| {
            Error::InvalidConfig("no collection selected; run `vc use` first".into())
        })
    }
}

/// Explicit credentials take priority over the environment.
pub fn resolve_credentials(
    username: Option<String>,
    password: Option<String>,
    env_username: Option<String>,
    env_password: Option<String>,
) -> (Option<String>, Option<String>) {
    (username.or(env_username), password.or(env_password))
}

impl Config {
    /// The configuration file location, honoring `VC_CONFIG`.
    pub fn path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(ENV_CONFIG) {
            return Ok(PathBuf::from(path));
        }
        let home = std::env::var("HOME")
            .map_err(|_| Error::InvalidConfig("cannot locate the home directory".into()))?;
        Ok(PathBuf::from(home).join(".config").join("vc").join("config.toml"))
    }

    pub fn load() -> Result<Config> {
        Self::load_from(&Self::path()?)
    }

    pub fn load_from(path: &Path) -> Result<Config> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn profile(&self, remote: bool) -> &Profile {
        if remote {
            &self.remote
        } else {
            &self.local
        }
    }

    pub fn profile_mut(&mut self, remote: bool) -> &mut Profile {
        if remote {
            &mut self.remote
        } else {
            &mut self.local
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_point_at_localhost() {
        let profile = Profile::default();
        assert_eq!(profile.host, "localhost");
        assert_eq!(profile.port, 27017);
        assert!(profile.require_database().is_err());
    }

    #[test]
    fn parses_partial_profiles() {
        let config: Config = toml::from_str(
            r#"
            [local]
            database = "app"
            collection = "users"

            [remote]
            host = "db.example.com"
            port = 27018
            "#,
        )
        .unwrap();
        assert_eq!(config.local.require_database().unwrap(), "app");
        assert_eq!(config.local.require_collection().unwrap(), "users");
        assert_eq!(config.remote.host, "db.example.com");
        assert_eq!(config.remote.port, 27018);
    }

    #[test]
    fn explicit_credentials_beat_the_environment() {
        let (user, pass) = resolve_credentials(
            Some("alice".into()),
            None,
            Some("env-user".into()),
            Some("env-pass".into()),
        );
        assert_eq!(user.as_deref(), Some("alice"));
        assert_eq!(pass.as_deref(), Some("env-pass"));
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.local.database = Some("app".into());
        config.remote.host = "remote-host".into();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.local.database.as_deref(), Some("app"));
        assert_eq!(loaded.remote.host, "remote-host");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("nope.toml")).unwrap();
        assert!(config.local.database.is_none());
    }
}
