//! Versioning commands operating on the local collection.

use std::collections::HashMap;

use serde::Serialize;

use crate::config::Config;
use crate::delta::{display_path, Change, Delta};
use crate::error::Result;
use crate::output::{emit_success, OutputOptions};
use crate::tree::VersionId;
use crate::value::Value;

use super::{open_collection, StashAction};

pub async fn status(options: OutputOptions) -> Result<()> {
    let config = Config::load()?;
    let collection = open_collection(&config.local).await?;
    let status = collection.status().await?;
    collection.close().await;

    let lines = if status.tracked {
        vec![
            format!(
                "version:   ({}, {})",
                status.version.unwrap_or(-1),
                status.branch.as_deref().unwrap_or("-")
            ),
            format!("detached:  {}", status.detached),
            format!("changed:   {}", status.changed),
            format!("stash:     {}", status.has_stash),
            format!("conflicts: {}", status.has_conflicts),
        ]
    } else {
        vec!["collection is not tracked; run `vc init`".to_string()]
    };
    emit_success(options, "status", &status, &lines)
}

pub async fn init(options: OutputOptions, message: Option<&str>) -> Result<()> {
    let config = Config::load()?;
    let mut collection = open_collection(&config.local).await?;
    let created = collection.init(message).await?;
    collection.close().await;

    let line = if created {
        "initialised versioning at (0, main)".to_string()
    } else {
        "collection is already initialised".to_string()
    };
    emit_success(options, "init", &created, &[line])
}

pub async fn create_branch(options: OutputOptions, name: &str) -> Result<()> {
    let config = Config::load()?;
    let mut collection = open_collection(&config.local).await?;
    let base = collection.create_branch(name).await?;
    collection.close().await;

    emit_success(
        options,
        "create_branch",
        &base,
        &[format!("created branch '{name}' at {base}")],
    )
}

pub async fn register(
    options: OutputOptions,
    message: &str,
    branch: Option<&str>,
) -> Result<()> {
    let config = Config::load()?;
    let mut collection = open_collection(&config.local).await?;
    let registered = collection.register(message, branch).await?;
    collection.close().await;

    let line = match &registered {
        Some(version) => format!("registered version {version}"),
        None => "nothing to register".to_string(),
    };
    emit_success(options, "register", &registered, &[line])
}

pub async fn checkout(
    options: OutputOptions,
    version: Option<i64>,
    branch: Option<&str>,
) -> Result<()> {
    let config = Config::load()?;
    let mut collection = open_collection(&config.local).await?;
    let landed = collection.checkout(version, branch).await?;
    collection.close().await;

    emit_success(
        options,
        "checkout",
        &landed,
        &[format!("checked out {landed}")],
    )
}

pub async fn log(options: OutputOptions, branch: Option<&str>) -> Result<()> {
    let config = Config::load()?;
    let mut collection = open_collection(&config.local).await?;
    let entries = collection.log(branch).await?;
    collection.close().await;

    let mut lines = Vec::new();
    for entry in &entries {
        lines.push(format!("* ({}, {})", entry.n, entry.branch));
        lines.push(format!("    message:   {}", entry.message));
        lines.push(format!("    timestamp: {}", entry.timestamp.to_rfc3339()));
    }
    emit_success(options, "log", &entries, &lines)
}

pub async fn branches(options: OutputOptions) -> Result<()> {
    let config = Config::load()?;
    let collection = open_collection(&config.local).await?;
    let names = collection.branches().await?;
    collection.close().await;
    emit_success(options, "branches", &names, &names)
}

pub async fn diff(
    options: OutputOptions,
    version: Option<i64>,
    branch: Option<&str>,
) -> Result<()> {
    let config = Config::load()?;
    let mut collection = open_collection(&config.local).await?;

    let other = match (version, branch) {
        (None, None) => None,
        (Some(n), branch) => {
            let branch = match branch {
                Some(branch) => branch.to_string(),
                None => collection.current().await?.branch,
            };
            Some(VersionId::new(n, branch))
        }
        (None, Some(branch)) => Some(collection.resolve_unborn(branch).await?),
    };

    let diffs = collection.diff(other).await?;
    collection.close().await;

    let lines = render_diffs(&diffs);
    let printable: HashMap<String, Vec<RenderedChange>> = diffs
        .iter()
        .map(|(id, delta)| (id.to_string(), rendered_changes(delta)))
        .collect();
    emit_success(options, "diff", &printable, &lines)
}

#[derive(Serialize)]
struct RenderedChange {
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    old: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    new: Option<String>,
}

fn rendered_changes(delta: &Delta) -> Vec<RenderedChange> {
    delta
        .changes()
        .map(|(path, change)| {
            let (old, new) = match change {
                Change::Insert(new) => (None, Some(new.to_string())),
                Change::Remove(old) => (Some(old.to_string()), None),
                Change::Replace(old, new) => (Some(old.to_string()), Some(new.to_string())),
            };
            RenderedChange {
                path: display_path(path),
                old,
                new,
            }
        })
        .collect()
}

fn render_diffs(diffs: &HashMap<Value, Delta>) -> Vec<String> {
    if diffs.is_empty() {
        return vec!["no differences".to_string()];
    }
    let mut ids: Vec<&Value> = diffs.keys().collect();
    ids.sort_by_key(|id| id.to_string());

    let mut lines = Vec::new();
    for id in ids {
        lines.push(format!("document {id}"));
        for change in rendered_changes(&diffs[id]) {
            let from = change.old.as_deref().unwrap_or("<absent>");
            let to = change.new.as_deref().unwrap_or("<absent>");
            lines.push(format!("  {}: {from} -> {to}", change.path));
        }
    }
    lines
}

pub async fn discard_changes(options: OutputOptions) -> Result<()> {
    let config = Config::load()?;
    let mut collection = open_collection(&config.local).await?;
    let discarded = collection.discard_changes().await?;
    collection.close().await;

    let line = if discarded {
        "discarded unregistered changes".to_string()
    } else {
        "no changes to discard".to_string()
    };
    emit_success(options, "discard_changes", &discarded, &[line])
}

pub async fn stash(
    options: OutputOptions,
    action: Option<StashAction>,
    overwrite: bool,
) -> Result<()> {
    let config = Config::load()?;
    let mut collection = open_collection(&config.local).await?;

    let (command, done, line) = match action {
        None => {
            let stashed = collection.stash(overwrite).await?;
            let line = if stashed {
                "stashed working changes"
            } else {
                "nothing to stash"
            };
            ("stash", stashed, line)
        }
        Some(StashAction::Apply) => {
            let applied = collection.stash_apply().await?;
            let line = if applied {
                "applied the stash"
            } else {
                "no stash to apply"
            };
            ("stash_apply", applied, line)
        }
        Some(StashAction::Discard) => {
            let dropped = collection.stash_discard().await?;
            let line = if dropped {
                "dropped the stash"
            } else {
                "no stash to drop"
            };
            ("stash_discard", dropped, line)
        }
    };
    collection.close().await;
    emit_success(options, command, &done, &[line.to_string()])
}

pub async fn delete_version(
    options: OutputOptions,
    version: i64,
    branch: Option<&str>,
) -> Result<()> {
    let config = Config::load()?;
    let mut collection = open_collection(&config.local).await?;
    collection.delete_version_subtree(version, branch).await?;
    collection.close().await;

    emit_success(
        options,
        "delete_version",
        &version,
        &[format!("deleted version {version} and its descendants")],
    )
}
