//! One-shot subcommands. Each prints a JSON document on stdout.

use std::io::{self, Read};

use readlog_core::{
    save_config, AggregationKind, PageLoadReport, ReadingSummary, ScrapeSnapshot, SyncOutcome,
    SyncStatus,
};
use serde::Serialize;

use crate::session::{open_engine, print_json, CliError, Options};

#[derive(Serialize)]
struct StatusOutput {
    summary: ReadingSummary,
    sync: SyncStatus,
}

pub fn status(options: &Options) -> Result<(), CliError> {
    let engine = open_engine(options)?;
    print_json(&StatusOutput {
        summary: engine.summary(),
        sync: engine.sync().sync_status(),
    })
}

#[derive(Serialize)]
struct RecordOutput {
    recorded: bool,
    entries: usize,
}

/// Reads one scrape snapshot (`{"name": {"value": 3, "ok": true}}`) from stdin.
pub fn record(options: &Options) -> Result<(), CliError> {
    let mut input = String::new();
    io::stdin().read_to_string(&mut input)?;
    if input.trim().is_empty() {
        return Err(CliError::Usage("expected a scrape snapshot on stdin".to_string()));
    }
    let snapshot: ScrapeSnapshot = serde_json::from_str(&input)?;

    let engine = open_engine(options)?;
    let recorded = engine.on_scrape(&snapshot)?;
    print_json(&RecordOutput {
        recorded,
        entries: engine.history_entries().len(),
    })
}

#[derive(Serialize)]
struct IncrementalSyncOutput {
    page_load: PageLoadReport,
    today: SyncOutcome,
}

pub fn sync(options: &Options, full: bool) -> Result<(), CliError> {
    let engine = open_engine(options)?;
    if full {
        return print_json(&engine.sync().full_sync()?);
    }
    let page_load = engine.on_page_load()?;
    let today = engine.sync().sync_reading_time()?;
    print_json(&IncrementalSyncOutput { page_load, today })
}

pub fn deltas(
    options: &Options,
    kind: AggregationKind,
    window: usize,
    counters: &[String],
) -> Result<(), CliError> {
    let engine = open_engine(options)?;
    print_json(&engine.deltas(kind, counters, window))
}

/// Prints the effective config; with `write`, saves it so later edits start
/// from a complete file.
pub fn config(options: &Options, write: bool) -> Result<(), CliError> {
    let config = options.config();
    if write {
        let path = options.config_path();
        save_config(&path, &config)?;
        tracing::info!(path = %path.display(), "Config written");
    }
    print_json(&config)
}
