//! readlog: command-line driver for reading-time tracking and cloud sync.
//!
//! ## Subcommands
//!
//! - `status`: Reading summary and sync state for the user
//! - `record`: Record a scrape snapshot read from stdin
//! - `sync`: Page-load sync (or a full sync with `--full`)
//! - `deltas`: Per-period counter deltas
//! - `config`: Show or write the effective config
//! - `run`: Foreground tracking loop fed by stdin events
//!
//! The user comes from `--user` or `READLOG_USER`; the bearer token from
//! `READLOG_TOKEN`.

mod commands;
mod logging;
mod run;
mod session;

use clap::{Parser, Subcommand};
use readlog_core::AggregationKind;
use std::path::PathBuf;

use session::Options;

#[derive(Parser)]
#[command(name = "readlog")]
#[command(about = "Reading-time tracker with cloud sync")]
#[command(version)]
struct Cli {
    /// Data directory (defaults to ~/.readlog)
    #[arg(long, global = true, value_name = "PATH")]
    root: Option<PathBuf>,

    /// Config file (defaults to <root>/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// User whose data to operate on
    #[arg(long, global = true)]
    user: Option<String>,

    /// Override the sync API base URL
    #[arg(long, global = true, value_name = "URL")]
    api_base: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show today's, this month's and this year's minutes plus sync state
    Status,

    /// Record a scrape snapshot (reads JSON from stdin)
    Record,

    /// Reconcile with the server
    Sync {
        /// Download, upload the whole ledger, then sync requirement history
        #[arg(long)]
        full: bool,
    },

    /// Print counter deltas per period
    Deltas {
        /// daily, weekly or monthly
        #[arg(long, default_value = "daily")]
        kind: AggregationKind,

        /// Number of periods (daily and monthly only)
        #[arg(long, default_value_t = 7)]
        window: usize,

        /// Counter to include; repeat for several, omit for all
        #[arg(long = "counter", value_name = "NAME")]
        counters: Vec<String>,
    },

    /// Print the effective config
    Config {
        /// Save it to the config file
        #[arg(long)]
        write: bool,
    },

    /// Track in the foreground until stdin closes
    Run,
}

fn main() {
    let cli = Cli::parse();
    let options = Options {
        root: cli.root,
        config: cli.config,
        user: cli.user,
        api_base: cli.api_base,
    };
    let logging_guard = logging::init(&options.storage().logs_dir());

    let result = match cli.command {
        Commands::Status => commands::status(&options),
        Commands::Record => commands::record(&options),
        Commands::Sync { full } => commands::sync(&options, full),
        Commands::Deltas {
            kind,
            window,
            counters,
        } => commands::deltas(&options, kind, window, &counters),
        Commands::Config { write } => commands::config(&options, write),
        Commands::Run => run::run(&options),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "readlog failed");
        drop(logging_guard);
        std::process::exit(1);
    }
}
