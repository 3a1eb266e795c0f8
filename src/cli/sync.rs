//! Synchronisation commands: push, pull, conflict resolution, and the
//! standalone listener.

use tracing::info;

use crate::config::Config;
use crate::error::Result;
use crate::output::{emit_success, OutputOptions};
use crate::resolver::MergeTool;

use super::open_collection;

pub async fn push(options: OutputOptions, branch: Option<&str>) -> Result<()> {
    let config = Config::load()?;
    let mut local = open_collection(&config.local).await?;
    let mut remote = open_collection(&config.remote).await?;

    let result = local.push(&mut remote, branch).await;
    local.close().await;
    remote.close().await;
    let pushed = result?;

    let line = if pushed == 0 {
        "remote is up to date".to_string()
    } else {
        format!("pushed {pushed} version(s)")
    };
    emit_success(options, "push", &pushed, &[line])
}

pub async fn pull(options: OutputOptions, branch: Option<&str>) -> Result<()> {
    let config = Config::load()?;
    let mut local = open_collection(&config.local).await?;
    let mut remote = open_collection(&config.remote).await?;

    let result = local.pull(&mut remote, branch).await;
    local.close().await;
    remote.close().await;
    let pulled = result?;

    let line = if pulled == 0 {
        "already up to date".to_string()
    } else {
        format!("pulled {pulled} version(s)")
    };
    emit_success(options, "pull", &pulled, &[line])
}

pub async fn resolve_conflicts(
    options: OutputOptions,
    discard_local_changes: bool,
    tool: &str,
) -> Result<()> {
    let config = Config::load()?;
    let mut local = open_collection(&config.local).await?;

    let resolver = if tool == "meld" {
        MergeTool::meld()
    } else {
        MergeTool::new(tool)
    };
    let result = local
        .resolve_conflicts(&resolver, discard_local_changes)
        .await;
    local.close().await;
    let resolved = result?;

    let line = if resolved {
        "all conflicts resolved; register the merged version".to_string()
    } else {
        "conflicts remain; run resolve-conflicts again".to_string()
    };
    emit_success(options, "resolve_conflicts", &resolved, &[line])
}

/// Run the change listener in the foreground until Ctrl-C.
pub async fn listen(options: OutputOptions) -> Result<()> {
    let config = Config::load()?;
    let collection = open_collection(&config.local).await?;
    collection.ensure_tracked()?;

    info!(collection = %collection.name(), "listening for changes");
    if !options.quiet && !options.json {
        println!("listening; press Ctrl-C to stop");
    }
    tokio::signal::ctrl_c().await?;
    collection.close().await;
    emit_success(options, "listen", &(), &["listener stopped".to_string()])
}
