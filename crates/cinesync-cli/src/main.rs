use chrono::NaiveDate;
use cinesync_core::BatchType;
use clap::{ArgAction, Parser, Subcommand};
use commands::run::FetchTarget;
use commands::{clear, config, history, run, search, GlobalOpts};
use std::path::PathBuf;

mod commands;
mod logging;
mod output;

#[derive(Parser)]
#[command(name = "cinesync")]
#[command(about = "CineSync - Reconcile MovieLens and TMDB into one movie database")]
#[command(version)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Output format
    #[arg(long, global = true, default_value = "human", value_enum)]
    output: output::OutputFormat,

    /// Config file (default: config.toml in the platform config directory)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write logs to a daily-rotated file instead of stderr
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Records per upsert transaction (overrides [pipeline] batch_size)
    #[arg(long, global = true, value_name = "N")]
    batch_size: Option<usize>,

    /// Concurrent catalog lookups (overrides [pipeline] max_workers)
    #[arg(long, global = true, value_name = "N")]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initial load from the MovieLens dataset
    #[command(long_about = "Load MovieLens titles released between --start-year and --end-year into the store. Titles linked to TMDB are stored under their TMDB id. With --enrich, catalog details, credits and keywords are fetched for each linked title.")]
    Init {
        #[arg(long, default_value_t = 1900)]
        start_year: i32,

        /// Defaults to the newest year in the dataset
        #[arg(long)]
        end_year: Option<i32>,

        /// Fetch catalog details for linked titles
        #[arg(long, action = ArgAction::SetTrue)]
        enrich: bool,
    },
    /// Re-sync movies changed in the catalog recently
    Changes {
        #[arg(long, default_value_t = 1)]
        days: u32,
    },
    /// Re-sync one movie by TMDB id
    Update { tmdb_id: u64 },
    /// Add catalog movies that are not in the store yet
    #[command(long_about = "Discover catalog movies released after --after-date (default: the newest release date already stored) and insert the ones the store does not have. With --end-year, discovery walks each year up to it instead of the recent-releases listing.")]
    Missing {
        /// YYYY-MM-DD
        #[arg(long, value_parser = parse_date)]
        after_date: Option<NaiveDate>,

        #[arg(long)]
        end_year: Option<i32>,
    },
    /// Search the catalog
    Search {
        /// Title text, or a numeric TMDB id
        query: String,
    },
    /// Empty the movie store
    Clear {
        /// Skip the confirmation prompt
        #[arg(long, action = ArgAction::SetTrue)]
        force: bool,
    },
    /// Fetch only: write records to a YAML batch file
    Fetch {
        #[command(subcommand)]
        kind: FetchCommands,
    },
    /// Load only: upsert unprocessed batch files
    Load {
        /// A single batch file instead of every unprocessed one
        #[arg(long, value_name = "PATH")]
        file: Option<PathBuf>,

        /// Only files of this type (initial, missing, changes)
        #[arg(long)]
        batch_type: Option<BatchType>,
    },
    /// Show recent create and update records
    History {
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// Show or write configuration and credentials
    Config {
        #[command(subcommand)]
        cmd: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum FetchCommands {
    /// MovieLens titles for a year range
    Initial {
        #[arg(long, default_value_t = 1900)]
        start_year: i32,

        #[arg(long)]
        end_year: Option<i32>,

        #[arg(long, action = ArgAction::SetTrue)]
        enrich: bool,
    },
    /// Catalog movies not in the store yet
    Missing {
        #[arg(long, value_parser = parse_date)]
        after_date: Option<NaiveDate>,

        #[arg(long)]
        end_year: Option<i32>,
    },
    /// Catalog movies changed recently
    Changes {
        #[arg(long, default_value_t = 1)]
        days: u32,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration (credentials masked)
    Show,
    /// Write a default config.toml
    Init {
        #[arg(long, action = ArgAction::SetTrue)]
        force: bool,
    },
    /// Store TMDB credentials (prompts when no flag is given)
    Credentials {
        #[arg(long)]
        api_key: Option<String>,

        #[arg(long)]
        bearer_token: Option<String>,
    },
}

fn parse_date(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {}", e))
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    logging::init_logging(cli.verbose, cli.quiet, cli.log_file.as_deref())
        .map_err(|e| color_eyre::eyre::eyre!("{:#}", e))?;

    let output = output::Output::new(cli.output, cli.quiet);
    let opts = GlobalOpts {
        config: cli.config,
        batch_size: cli.batch_size,
        workers: cli.workers,
    };

    match cli.command {
        Commands::Init {
            start_year,
            end_year,
            enrich,
        } => run::run_init(start_year, end_year, enrich, &opts, &output).await,
        Commands::Changes { days } => run::run_changes(days, &opts, &output).await,
        Commands::Update { tmdb_id } => run::run_update(tmdb_id, &opts, &output).await,
        Commands::Missing { after_date, end_year } => run::run_missing(after_date, end_year, &opts, &output).await,
        Commands::Search { query } => search::run_search(&query, &opts, &output).await,
        Commands::Clear { force } => clear::run_clear(force, &opts, &output).await,
        Commands::Fetch { kind } => {
            let target = match kind {
                FetchCommands::Initial {
                    start_year,
                    end_year,
                    enrich,
                } => FetchTarget::Initial {
                    start_year,
                    end_year,
                    enrich,
                },
                FetchCommands::Missing { after_date, end_year } => FetchTarget::Missing { after_date, end_year },
                FetchCommands::Changes { days } => FetchTarget::Changes { days },
            };
            run::run_fetch(target, &opts, &output).await
        }
        Commands::Load { file, batch_type } => run::run_load(file, batch_type, &opts, &output).await,
        Commands::History { days } => history::run_history(days, &opts, &output).await,
        Commands::Config { cmd } => config::run_config(cmd.unwrap_or(ConfigCommands::Show), &opts, &output).await,
    }
}
