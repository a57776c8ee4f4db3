use std::path::PathBuf;

use blockship_ledger::ConfigOverrides;
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "blockship")]
#[command(about = "Resumable block transfers with an on-disk session ledger", long_about = None)]
pub struct Cli {
    /// Session root, overriding the config file and BLOCKSHIP_HOME
    #[arg(long, global = true, value_name = "DIR")]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start a new session copying SOURCE into the TARGET directory
    Upload(UploadArgs),
    /// Continue an interrupted session (the latest one when SID is omitted)
    Resume {
        sid: Option<String>,
        #[arg(long)]
        threads: Option<usize>,
        #[arg(long)]
        discard_bad_records: bool,
    },
    /// Show the most recent sessions, oldest first
    History {
        #[arg(short = 'n', default_value_t = 20)]
        n: usize,
    },
    /// Delete sessions older than DAYS days
    Purge { days: u32 },
    /// Delete one session
    Delete { sid: String },
    /// Print the blocks a session still has to transfer
    Pending { sid: Option<String> },
}

#[derive(Debug, Args)]
pub struct UploadArgs {
    pub source: PathBuf,
    pub target: PathBuf,
    #[arg(long)]
    pub threads: Option<usize>,
    /// Block size in bytes when SOURCE is a single file
    #[arg(long)]
    pub block_size: Option<u64>,
    #[arg(long)]
    pub field_delimiter: Option<String>,
    #[arg(long)]
    pub record_delimiter: Option<String>,
    #[arg(long)]
    pub discard_bad_records: bool,
    #[arg(long)]
    pub max_bad_records: Option<u64>,
    #[arg(long)]
    pub charset: Option<String>,
    /// Use this id instead of generating one
    #[arg(long)]
    pub session_id: Option<String>,
}

impl UploadArgs {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            threads: self.threads,
            block_size: self.block_size,
            field_delimiter: self.field_delimiter.clone(),
            record_delimiter: self.record_delimiter.clone(),
            discard_bad_records: self.discard_bad_records.then_some(true),
            max_bad_records: self.max_bad_records,
            charset: self.charset.clone(),
            block_retries: None,
        }
    }
}

/// Overrides for `resume`; unset flags keep the saved values.
pub fn resume_overrides(threads: Option<usize>, discard_bad_records: bool) -> ConfigOverrides {
    ConfigOverrides {
        threads,
        discard_bad_records: discard_bad_records.then_some(true),
        ..ConfigOverrides::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_flags_become_overrides() {
        let cli = Cli::parse_from([
            "blockship",
            "upload",
            "data.csv",
            "out",
            "--threads",
            "4",
            "--block-size",
            "1024",
            "--discard-bad-records",
        ]);
        let Commands::Upload(args) = cli.command else {
            panic!("expected upload");
        };
        assert_eq!(args.source, PathBuf::from("data.csv"));
        let overrides = args.overrides();
        assert_eq!(overrides.threads, Some(4));
        assert_eq!(overrides.block_size, Some(1024));
        assert_eq!(overrides.discard_bad_records, Some(true));
        assert_eq!(overrides.charset, None);
    }

    #[test]
    fn resume_without_flags_keeps_saved_values() {
        let cli = Cli::parse_from(["blockship", "resume"]);
        let Commands::Resume {
            sid,
            threads,
            discard_bad_records,
        } = cli.command
        else {
            panic!("expected resume");
        };
        assert!(sid.is_none());
        assert!(resume_overrides(threads, discard_bad_records).is_empty());
    }

    #[test]
    fn history_defaults_to_twenty() {
        let cli = Cli::parse_from(["blockship", "--root", "/tmp/bs", "history"]);
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/bs")));
        assert!(matches!(cli.command, Commands::History { n: 20 }));
    }

    #[test]
    fn global_root_after_subcommand() {
        let cli = Cli::parse_from(["blockship", "purge", "30", "--root", "/var/bs"]);
        assert_eq!(cli.root, Some(PathBuf::from("/var/bs")));
        assert!(matches!(cli.command, Commands::Purge { days: 30 }));
    }
}
