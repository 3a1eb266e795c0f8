//! Connection configuration commands: `vc config` and `vc use`.

use crate::config::Config;
use crate::error::Result;
use crate::output::{emit_success, OutputOptions};

#[allow(clippy::too_many_arguments)]
pub fn config(
    options: OutputOptions,
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    remote: bool,
    show: bool,
) -> Result<()> {
    let mut config = Config::load()?;

    if show {
        let mut lines = Vec::new();
        for (label, profile) in [("local", &config.local), ("remote", &config.remote)] {
            lines.push(format!(
                "{label}: {}:{} database={} collection={}",
                profile.host,
                profile.port,
                profile.database.as_deref().unwrap_or("-"),
                profile.collection.as_deref().unwrap_or("-"),
            ));
        }
        return emit_success(options, "config", &config, &lines);
    }

    let profile = config.profile_mut(remote);
    if let Some(host) = host {
        profile.host = host;
    }
    if let Some(port) = port {
        profile.port = port;
    }
    if username.is_some() {
        profile.username = username;
    }
    if password.is_some() {
        profile.password = password;
    }
    config.save()?;

    let target = if remote { "remote" } else { "local" };
    emit_success(
        options,
        "config",
        &config.profile(remote),
        &[format!("updated {target} connection profile")],
    )
}

pub fn select(
    options: OutputOptions,
    database: String,
    collection: String,
    remote: bool,
) -> Result<()> {
    let mut config = Config::load()?;
    let profile = config.profile_mut(remote);
    profile.database = Some(database.clone());
    profile.collection = Some(collection.clone());
    config.save()?;

    let target = if remote { "remote" } else { "local" };
    emit_success(
        options,
        "use",
        &config.profile(remote),
        &[format!("{target} profile now uses {database}.{collection}")],
    )
}
