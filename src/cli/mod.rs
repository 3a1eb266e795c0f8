//! Command-line interface for vc
//!
//! This module defines the CLI structure using clap derive macros.
//! Command implementations live in the submodules: connection setup in
//! `setup`, versioning operations in `versioning`, synchronisation in
//! `sync`.

use clap::{Parser, Subcommand};

use crate::error::Result;
use crate::output::OutputOptions;

mod setup;
mod sync;
mod versioning;

/// vc - collection versioning
///
/// Git-like version control for MongoDB collections: register versions,
/// branch, check out, stash, diff, and synchronise collections with
/// push/pull and conflict resolution.
#[derive(Parser, Debug)]
#[command(name = "vc")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Set or show connection details
    Config {
        /// Database host
        #[arg(long)]
        host: Option<String>,

        /// Database port
        #[arg(long)]
        port: Option<u16>,

        /// Username (falls back to VC_MONGO_USER)
        #[arg(long)]
        username: Option<String>,

        /// Password (falls back to VC_MONGO_PASSWORD)
        #[arg(long)]
        password: Option<String>,

        /// Configure the remote profile instead of the local one
        #[arg(long)]
        remote: bool,

        /// Print the current configuration
        #[arg(long)]
        show: bool,
    },

    /// Select the database and collection to work on
    Use {
        /// Database name
        database: String,

        /// Collection name
        collection: String,

        /// Select for the remote profile instead of the local one
        #[arg(long)]
        remote: bool,
    },

    /// Show the tracking status of the collection
    Status,

    /// Initialise the collection for versioning
    Init {
        /// Message describing the initial version
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Create a branch at the current version and switch to it
    CreateBranch {
        /// Name of the new branch
        name: String,
    },

    /// Register the working state as a new version
    Register {
        /// Message describing the version
        #[arg(short, long)]
        message: String,

        /// Branch to start when the head is detached
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// Check out a registered version
    #[command(disable_version_flag = true)]
    Checkout {
        /// Version number on the selected branch
        #[arg(short = 'n', long)]
        version: Option<i64>,

        /// Branch to check out
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// Show the version history of a branch
    Log {
        /// Branch name (defaults to the current branch)
        branch: Option<String>,
    },

    /// List branches
    Branches,

    /// Show per-document differences
    #[command(disable_version_flag = true)]
    Diff {
        /// Compare against this version instead of the working state
        #[arg(short = 'n', long)]
        version: Option<i64>,

        /// Branch of the version to compare against
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// Discard the unregistered changes
    DiscardChanges,

    /// Stash the unregistered changes, or manage the stash
    Stash {
        #[command(subcommand)]
        action: Option<StashAction>,

        /// Replace an existing stash
        #[arg(long)]
        overwrite: bool,
    },

    /// Delete a version and everything registered after it
    #[command(disable_version_flag = true)]
    DeleteVersion {
        /// Version number
        version: i64,

        /// Branch of the version (defaults to the current branch)
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// Push a branch to the remote collection
    Push {
        /// Branch to push (defaults to the current branch)
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// Pull a branch from the remote collection
    Pull {
        /// Branch to pull (defaults to the current branch)
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// Resolve recorded merge conflicts with the merge tool
    ResolveConflicts {
        /// Abandon the merge attempt and keep the local state
        #[arg(long)]
        discard_local_changes: bool,

        /// Merge tool program to invoke
        #[arg(long, default_value = "meld")]
        tool: String,
    },

    /// Run the change listener until interrupted
    Listen,
}

#[derive(Subcommand, Debug)]
pub enum StashAction {
    /// Apply the stashed changes and drop the stash
    Apply,
    /// Drop the stash without applying it
    Discard,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let options = OutputOptions {
            json: self.json,
            quiet: self.quiet,
        };

        match self.command {
            Commands::Config {
                host,
                port,
                username,
                password,
                remote,
                show,
            } => setup::config(options, host, port, username, password, remote, show),
            Commands::Use {
                database,
                collection,
                remote,
            } => setup::select(options, database, collection, remote),
            Commands::Status => versioning::status(options).await,
            Commands::Init { message } => versioning::init(options, message.as_deref()).await,
            Commands::CreateBranch { name } => versioning::create_branch(options, &name).await,
            Commands::Register { message, branch } => {
                versioning::register(options, &message, branch.as_deref()).await
            }
            Commands::Checkout { version, branch } => {
                versioning::checkout(options, version, branch.as_deref()).await
            }
            Commands::Log { branch } => versioning::log(options, branch.as_deref()).await,
            Commands::Branches => versioning::branches(options).await,
            Commands::Diff { version, branch } => {
                versioning::diff(options, version, branch.as_deref()).await
            }
            Commands::DiscardChanges => versioning::discard_changes(options).await,
            Commands::Stash { action, overwrite } => {
                versioning::stash(options, action, overwrite).await
            }
            Commands::DeleteVersion { version, branch } => {
                versioning::delete_version(options, version, branch.as_deref()).await
            }
            Commands::Push { branch } => sync::push(options, branch.as_deref()).await,
            Commands::Pull { branch } => sync::pull(options, branch.as_deref()).await,
            Commands::ResolveConflicts {
                discard_local_changes,
                tool,
            } => sync::resolve_conflicts(options, discard_local_changes, &tool).await,
            Commands::Listen => sync::listen(options).await,
        }
    }
}

/// Open the collection selected by a configuration profile.
pub(crate) async fn open_collection(
    profile: &crate::config::Profile,
) -> Result<crate::collection::VersionedCollection> {
    let client = mongodb::Client::with_uri_str(profile.connection_uri()).await?;
    crate::collection::VersionedCollection::open(
        client,
        profile.require_database()?,
        profile.require_collection()?,
        profile.origin(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_structure_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_register_with_branch() {
        let cli = Cli::parse_from(["vc", "register", "-m", "v1", "--branch", "b"]);
        match cli.command {
            Commands::Register { message, branch } => {
                assert_eq!(message, "v1");
                assert_eq!(branch.as_deref(), Some("b"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_stash_subcommands() {
        let cli = Cli::parse_from(["vc", "stash", "apply"]);
        assert!(matches!(
            cli.command,
            Commands::Stash {
                action: Some(StashAction::Apply),
                ..
            }
        ));
    }
}
