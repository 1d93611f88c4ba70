//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Acquire hash-addressed artifacts from quota-limited and fallback sources.
///
/// Records live in a local SQLite database; every command reads and writes the
/// same store, so `run` can pick up work left by an interrupted `fetch`.
#[derive(Parser, Debug)]
#[command(name = "hashfetch")]
#[command(author, version, about)]
pub struct Cli {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: $XDG_CONFIG_HOME/hashfetch/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Database file, overriding [paths].database
    #[arg(long, global = true, value_name = "PATH")]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Request hashes and download them now
    Fetch(FetchArgs),

    /// Resume interrupted downloads, re-queue due records and process the queue
    Run(RunArgs),

    /// Show download records
    Status(StatusArgs),

    /// Cancel a download
    Cancel {
        #[arg(value_parser = parse_hash)]
        hash: String,
    },

    /// Queue a cancelled or failed download again
    Reactivate {
        #[arg(value_parser = parse_hash)]
        hash: String,
    },

    /// Re-run the post-download steps for a finished download
    Pipeline {
        #[arg(value_parser = parse_hash)]
        hash: String,
    },

    /// Show the most recently observed primary quota
    Quota,
}

#[derive(Args, Debug)]
pub struct FetchArgs {
    /// Content hashes (32 hex characters)
    #[arg(required = true, value_parser = parse_hash)]
    pub hashes: Vec<String>,

    /// Title recorded for the download
    #[arg(long)]
    pub title: Option<String>,

    /// Author recorded for the download
    #[arg(long)]
    pub author: Option<String>,

    /// Expected file format, used as the extension fallback (e.g. pdf, epub)
    #[arg(long)]
    pub format: Option<String>,

    /// Declared size in bytes; a large mismatch is logged
    #[arg(long)]
    pub size: Option<i64>,

    /// Maximum concurrent downloads (1-100), overriding [engine].concurrency
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: Option<u8>,

    /// Disable the progress spinner
    #[arg(long)]
    pub no_progress: bool,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Maximum concurrent downloads (1-100), overriding [engine].concurrency
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: Option<u8>,

    /// Disable the progress spinner
    #[arg(long)]
    pub no_progress: bool,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Show a single record
    #[arg(value_parser = parse_hash)]
    pub hash: Option<String>,

    /// Number of recent records to list
    #[arg(short = 'n', long, default_value_t = 20)]
    pub limit: i64,

    /// Print records as JSON
    #[arg(long)]
    pub json: bool,
}

/// Accepts a 32-character hex digest, normalized to lowercase.
fn parse_hash(value: &str) -> Result<String, String> {
    let trimmed = value.trim();
    if trimmed.len() == 32 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(trimmed.to_ascii_lowercase())
    } else {
        Err(format!("'{value}' is not a 32-character hex hash"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "0123456789ABCDEF0123456789abcdef";

    #[test]
    fn test_cli_fetch_parses_hashes_lowercased() {
        let cli = Cli::try_parse_from(["hashfetch", "fetch", HASH]).unwrap();
        let Command::Fetch(args) = cli.command else {
            panic!("expected fetch");
        };
        assert_eq!(args.hashes, vec![HASH.to_ascii_lowercase()]);
        assert!(args.concurrency.is_none());
    }

    #[test]
    fn test_cli_fetch_requires_a_hash() {
        let err = Cli::try_parse_from(["hashfetch", "fetch"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_cli_rejects_malformed_hash() {
        let err = Cli::try_parse_from(["hashfetch", "cancel", "not-a-hash"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let cli =
            Cli::try_parse_from(["hashfetch", "run", "-vv", "--db", "/tmp/x.db", "-c", "7"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/x.db")));
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.concurrency, Some(7));
    }

    #[test]
    fn test_cli_concurrency_range_enforced() {
        let err = Cli::try_parse_from(["hashfetch", "run", "-c", "0"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
        let err = Cli::try_parse_from(["hashfetch", "run", "-c", "101"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn test_cli_status_defaults() {
        let cli = Cli::try_parse_from(["hashfetch", "status"]).unwrap();
        let Command::Status(args) = cli.command else {
            panic!("expected status");
        };
        assert!(args.hash.is_none());
        assert_eq!(args.limit, 20);
        assert!(!args.json);
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["hashfetch"]).is_err());
    }

    #[test]
    fn test_cli_version_flag_shows_version() {
        let err = Cli::try_parse_from(["hashfetch", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }
}
