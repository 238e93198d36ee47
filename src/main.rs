mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use commands::{DuplicatesArgs, SearchArgs, TagArgs};

#[derive(Parser, Debug)]
#[command(name = "taggy", version, about = "Group, tag and search images by content")]
struct Cli {
    /// Config file (default: ./taggy.toml, then the user config folder)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Group near-duplicate images and optionally pick the best of each group
    Duplicates(DuplicatesArgs),

    /// Tag images with the closest labels
    Tag(TagArgs),

    /// Find the images closest to a text query
    Search(SearchArgs),

    /// Work with move history
    History {
        #[command(subcommand)]
        command: HistoryCmd,
    },
}

#[derive(Subcommand, Debug)]
enum HistoryCmd {
    /// List all move history records
    List {
        /// Output folder the files were moved into
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
    },

    /// Move files back to where they came from
    Restore {
        /// Output folder the files were moved into
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        /// Restore a specific record index
        #[arg(long, conflicts_with = "all")]
        record: Option<usize>,
        /// Restore all records
        #[arg(long, conflicts_with = "record")]
        all: bool,
    },
}

fn verbosity_to_log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(verbosity_to_log_level(cli.verbose)),
    )
    .init();

    let config = taggy::config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Duplicates(args) => commands::run_duplicates(args, &config),
        Commands::Tag(args) => commands::run_tag(args, &config),
        Commands::Search(args) => commands::run_search(args, &config),
        Commands::History { command } => match command {
            HistoryCmd::List { path } => commands::run_history_list(&path),
            HistoryCmd::Restore { path, record, all } => {
                commands::run_history_restore(&path, record, all)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taggy::core::organize::FileOperation;
    use taggy::core::scoring::ScoringMethod;

    fn parse_args(args: &[&str]) -> Result<Cli, clap::Error> {
        let mut full = vec!["taggy"];
        full.extend_from_slice(args);
        Cli::try_parse_from(full)
    }

    #[test]
    fn test_duplicates_flags() {
        let cli = parse_args(&[
            "-vv",
            "duplicates",
            "-i",
            "photos",
            "-l",
            "cat,dog",
            "--operation",
            "move",
            "-t",
            "0.95",
            "-b",
            "--best-method",
            "laplacian",
            "--dry-run",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Duplicates(args) => {
                assert_eq!(args.images_path, PathBuf::from("photos"));
                assert_eq!(args.labels, vec!["cat,dog"]);
                assert_eq!(args.operation, Some(FileOperation::Move));
                assert_eq!(args.similarity_threshold, Some(0.95));
                assert!(args.propose_best);
                assert_eq!(args.best_method, Some(ScoringMethod::Laplacian));
                assert!(args.dry_run);
                assert!(!args.yes);
            }
            other => panic!("Expected duplicates, got {:?}", other),
        }
    }

    #[test]
    fn test_tag_rejects_move() {
        assert!(parse_args(&["tag", "-i", "photos", "--operation", "move"]).is_err());
        let cli = parse_args(&["tag", "-i", "photos", "-k", "3", "-j"]).unwrap();
        match cli.command {
            Commands::Tag(args) => {
                assert_eq!(args.top_k, Some(3));
                assert!(args.create_many_output_jsons);
                assert_eq!(args.operation, commands::LinkOperation::Symlink);
            }
            other => panic!("Expected tag, got {:?}", other),
        }
    }

    #[test]
    fn test_search_defaults_to_copy() {
        let cli = parse_args(&["search", "-i", "photos", "-q", "a red car"]).unwrap();
        match cli.command {
            Commands::Search(args) => {
                assert_eq!(args.query, "a red car");
                assert_eq!(args.operation, FileOperation::Copy);
                assert_eq!(args.top_k, None);
            }
            other => panic!("Expected search, got {:?}", other),
        }
    }

    #[test]
    fn test_history_restore_record_conflicts_with_all() {
        assert!(parse_args(&["history", "restore", "-p", "out", "--record", "1", "--all"]).is_err());
        assert!(parse_args(&["history", "restore", "-p", "out", "--record", "1"]).is_ok());
    }

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(verbosity_to_log_level(0), "warn");
        assert_eq!(verbosity_to_log_level(1), "info");
        assert_eq!(verbosity_to_log_level(5), "trace");
    }
}
