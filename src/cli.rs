use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::types::{ChecksumAlgorithm, HealthState};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "mirror-recon",
    version,
    about = "Reconcile a local media mirror against its library catalog"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// JSON configuration file; command-line values take precedence
    #[arg(long = "config", value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Checksum cache database (SQLite)
    #[arg(long = "cache", value_name = "FILE", global = true)]
    pub cache: Option<PathBuf>,

    /// Append-only operation journal (JSON lines)
    #[arg(long = "journal", value_name = "FILE", global = true)]
    pub journal: Option<PathBuf>,

    /// Media file extension to include (repeatable, replaces the defaults)
    #[arg(long = "extension", value_name = "EXT", action = ArgAction::Append, global = true)]
    pub extensions: Vec<String>,

    /// Glob of paths to skip, relative to the root (repeatable)
    #[arg(long = "exclude", value_name = "GLOB", action = ArgAction::Append, global = true)]
    pub exclude: Vec<String>,

    /// Checksum algorithm
    #[arg(long = "algorithm", value_enum, global = true)]
    pub algorithm: Option<ChecksumAlgorithm>,

    /// Worker threads for the directory walk
    #[arg(long = "scan-threads", value_name = "N", global = true)]
    pub scan_threads: Option<usize>,

    /// Worker threads for checksum computation
    #[arg(long = "hash-threads", value_name = "N", global = true)]
    pub hash_threads: Option<usize>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors, hide progress bars
    #[arg(short = 'q', long = "quiet", action = ArgAction::Count, global = true)]
    pub quiet: u8,
}

#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Mirror root directory
    #[arg(long = "root", value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Library catalog (JSON array of entries)
    #[arg(long = "catalog", value_name = "FILE")]
    pub catalog: Option<PathBuf>,

    /// Print machine-readable JSON instead of a summary
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Scan the mirror and classify every media file
    Scan {
        #[command(flatten)]
        target: TargetArgs,

        /// Compute checksums during the scan
        #[arg(long = "verify")]
        verify: bool,
    },
    /// Scan with checksum verification enabled
    Verify {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Group duplicate and redundant copies
    Duplicates {
        #[command(flatten)]
        target: TargetArgs,

        /// Delete every non-keeper in exact-checksum groups
        #[arg(long = "delete-redundant")]
        delete_redundant: bool,

        /// Show what would be deleted without touching the mirror
        #[arg(long = "dry-run")]
        dry_run: bool,
    },
    /// Delete, move or copy files in the given health states
    Clean {
        #[command(flatten)]
        target: TargetArgs,

        /// Health states to act on (repeatable)
        #[arg(long = "health", value_enum, action = ArgAction::Append, required = true)]
        health: Vec<HealthArg>,

        #[arg(long = "mode", value_enum, default_value_t = CleanMode::Delete)]
        mode: CleanMode,

        /// Destination directory for move/copy
        #[arg(long = "to", value_name = "DIR")]
        to: Option<PathBuf>,

        #[arg(long = "dry-run")]
        dry_run: bool,
    },
    /// Integrity manifests for a directory
    Manifest {
        #[command(subcommand)]
        action: ManifestCommand,
    },
    /// Print the operation journal
    Journal {
        #[arg(long = "json")]
        json: bool,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ManifestCommand {
    /// Hash every media file under the root and write a manifest
    Create {
        #[arg(long = "root", value_name = "DIR")]
        root: Option<PathBuf>,
        #[arg(long = "manifest", value_name = "FILE")]
        manifest: PathBuf,
    },
    /// Compare the root against a saved manifest
    Check {
        #[arg(long = "root", value_name = "DIR")]
        root: Option<PathBuf>,
        #[arg(long = "manifest", value_name = "FILE")]
        manifest: PathBuf,
        #[arg(long = "json")]
        json: bool,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthArg {
    Complete,
    Partial,
    Corrupted,
    Orphaned,
    Modified,
    Unknown,
}

impl From<HealthArg> for HealthState {
    fn from(value: HealthArg) -> Self {
        match value {
            HealthArg::Complete => HealthState::Complete,
            HealthArg::Partial => HealthState::Partial,
            HealthArg::Corrupted => HealthState::Corrupted,
            HealthArg::Orphaned => HealthState::Orphaned,
            HealthArg::Modified => HealthState::Modified,
            HealthArg::Unknown => HealthState::Unknown,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanMode {
    Delete,
    Move,
    Copy,
}

impl Command {
    pub fn target(&self) -> Option<&TargetArgs> {
        match self {
            Command::Scan { target, .. }
            | Command::Verify { target }
            | Command::Duplicates { target, .. }
            | Command::Clean { target, .. } => Some(target),
            Command::Manifest { .. } | Command::Journal { .. } => None,
        }
    }

    pub fn manifest_root(&self) -> Option<&PathBuf> {
        match self {
            Command::Manifest {
                action: ManifestCommand::Create { root, .. } | ManifestCommand::Check { root, .. },
            } => root.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "mirror-recon",
            "scan",
            "--root",
            "/mnt/mirror",
            "--catalog",
            "lib.json",
            "--verify",
            "-vv",
            "--algorithm",
            "md5",
        ]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.algorithm, Some(ChecksumAlgorithm::Md5));
        match cli.command {
            Command::Scan { target, verify } => {
                assert!(verify);
                assert_eq!(target.root, Some(PathBuf::from("/mnt/mirror")));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn clean_requires_health() {
        assert!(Cli::try_parse_from(["mirror-recon", "clean", "--root", "/m"]).is_err());
        let cli = Cli::try_parse_from([
            "mirror-recon",
            "clean",
            "--health",
            "orphaned",
            "--health",
            "partial",
            "--mode",
            "move",
            "--to",
            "/quarantine",
        ])
        .unwrap();
        match cli.command {
            Command::Clean { health, mode, .. } => {
                assert_eq!(health, vec![HealthArg::Orphaned, HealthArg::Partial]);
                assert_eq!(mode, CleanMode::Move);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
