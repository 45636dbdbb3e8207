//! Commands for operating a repository by hand.
//!
//! The same grammar backs [`Repository::admin`] text lines and the `poolctl`
//! command line:
//!
//! ```text
//! info
//! set max-diskspace <size>|infinity
//! set gap <size>
//! rep ls [id...]
//! rep rm <id> [--force]
//! rep set precious|cached|broken <id>
//! rep set sticky <id> on|off [--owner o] [--lifetime ms]
//! rep sticky ls <id>
//! ```

use std::fmt::Write as _;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use clap::error::ErrorKind;
use clap::{Parser, Subcommand, ValueEnum};
use pool_config::DiskSpace;

use crate::error::{RepositoryError, Result};
use crate::id::ReplicaId;
use crate::repository::Repository;
use crate::state::ReplicaState;

/// Owner of sticky flags set without `--owner`
pub const DEFAULT_STICKY_OWNER: &str = "system";

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum AdminCommand {
    /// Show repository state and space usage
    Info,

    /// Change the space settings of the pool
    Set {
        #[command(subcommand)]
        command: SetCommand,
    },

    /// Replica commands
    Rep {
        #[command(subcommand)]
        command: RepCommand,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum SetCommand {
    /// Set the pool size, persisted across restarts ("infinity" restores the configured size)
    MaxDiskspace {
        #[arg(value_name = "SIZE")]
        size: DiskSpace,
    },

    /// Set the space reported as always removable
    Gap {
        #[arg(value_name = "SIZE", value_parser = finite_size)]
        size: DiskSpace,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum RepCommand {
    /// List replicas
    Ls {
        #[arg(value_name = "ID")]
        ids: Vec<ReplicaId>,
    },

    /// Remove a replica (only unpinned cached replicas unless forced)
    Rm {
        id: ReplicaId,

        #[arg(long)]
        force: bool,
    },

    /// Change the state or the sticky flags of a replica
    Set {
        #[command(subcommand)]
        command: RepSetCommand,
    },

    /// Inspect sticky flags
    Sticky {
        #[command(subcommand)]
        command: StickyCommand,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum RepSetCommand {
    /// Mark a replica precious
    Precious { id: ReplicaId },

    /// Mark a replica cached
    Cached { id: ReplicaId },

    /// Mark a replica broken
    Broken { id: ReplicaId },

    /// Set or clear a sticky flag
    Sticky {
        id: ReplicaId,

        #[arg(value_enum)]
        mode: StickyMode,

        #[arg(short, long, default_value = DEFAULT_STICKY_OWNER)]
        owner: String,

        /// Lifetime in milliseconds; pinned forever if omitted
        #[arg(short, long, value_name = "MS")]
        lifetime: Option<u64>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum StickyCommand {
    /// List the sticky flags of a replica
    Ls { id: ReplicaId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StickyMode {
    On,
    Off,
}

fn finite_size(s: &str) -> std::result::Result<DiskSpace, String> {
    let size: DiskSpace = s.parse().map_err(|e| format!("{}", e))?;
    if size.is_infinite() {
        return Err("gap must be a finite size".to_string());
    }
    Ok(size)
}

/// One admin text line.
#[derive(Debug, Parser)]
#[command(name = "admin", no_binary_name = true, disable_version_flag = true)]
struct AdminLine {
    #[command(subcommand)]
    command: AdminCommand,
}

impl FromStr for AdminCommand {
    type Err = clap::Error;

    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        AdminLine::try_parse_from(line.split_whitespace()).map(|parsed| parsed.command)
    }
}

impl AdminCommand {
    /// Run the command and return its output.
    pub fn execute(&self, repo: &Repository) -> Result<String> {
        match self {
            AdminCommand::Info => Ok(repo.info().to_string()),
            AdminCommand::Set { command } => {
                match command {
                    SetCommand::MaxDiskspace { size } => repo.set_max_disk_space(*size)?,
                    SetCommand::Gap { size } => repo.set_gap(*size)?,
                }
                Ok(String::new())
            }
            AdminCommand::Rep { command } => command.execute(repo),
        }
    }
}

impl RepCommand {
    fn execute(&self, repo: &Repository) -> Result<String> {
        match self {
            RepCommand::Ls { ids } => {
                let ids = if ids.is_empty() { repo.list()? } else { ids.clone() };
                let mut out = String::new();
                for id in ids {
                    match repo.get_entry(&id) {
                        Ok(entry) => {
                            let _ = writeln!(out, "{}", entry);
                        }
                        Err(RepositoryError::FileNotInCache { .. }) => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(out)
            }
            RepCommand::Rm { id, force } => {
                if !force {
                    let entry = repo.get_entry(id)?;
                    if entry.state != ReplicaState::Cached || entry.is_sticky() {
                        return Err(RepositoryError::IllegalState(format!(
                            "Replica {} is not removable without --force",
                            id
                        )));
                    }
                }
                repo.set_state(id, ReplicaState::Removed)?;
                Ok(format!("Removed {}", id))
            }
            RepCommand::Set { command } => {
                match command {
                    RepSetCommand::Precious { id } => repo.set_state(id, ReplicaState::Precious)?,
                    RepSetCommand::Cached { id } => repo.set_state(id, ReplicaState::Cached)?,
                    RepSetCommand::Broken { id } => repo.set_state(id, ReplicaState::Broken)?,
                    RepSetCommand::Sticky {
                        id,
                        mode,
                        owner,
                        lifetime,
                    } => {
                        let expires_at = match (mode, lifetime) {
                            (StickyMode::Off, _) => Some(SystemTime::now()),
                            (StickyMode::On, None) => None,
                            (StickyMode::On, Some(ms)) => {
                                Some(SystemTime::now() + Duration::from_millis(*ms))
                            }
                        };
                        repo.set_sticky(id, owner, expires_at, true)?;
                    }
                }
                Ok(String::new())
            }
            RepCommand::Sticky {
                command: StickyCommand::Ls { id },
            } => {
                let entry = repo.get_entry(id)?;
                let mut out = String::new();
                for record in entry.sticky.iter().filter(|r| r.is_valid()) {
                    let _ = writeln!(out, "{}", record);
                }
                Ok(out)
            }
        }
    }
}

/// First line of a clap error without its `error: ` prefix.
fn syntax_error(e: &clap::Error) -> String {
    let rendered = e.render().to_string();
    let first = rendered.lines().next().unwrap_or_default();
    format!("Syntax error: {}", first.trim_start_matches("error: "))
}

impl Repository {
    /// Parse and run one admin command line. Rejections are returned as the
    /// command output.
    pub fn admin(&self, line: &str) -> String {
        let command = match line.parse::<AdminCommand>() {
            Ok(command) => command,
            Err(e) => {
                return match e.kind() {
                    ErrorKind::DisplayHelp | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                        e.render().to_string()
                    }
                    _ => syntax_error(&e),
                }
            }
        };
        match command.execute(self) {
            Ok(output) => output,
            Err(e) => format!("Rejected: {}", e),
        }
    }
}
