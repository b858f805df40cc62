//! Foreground tracking loop.
//!
//! Simulates a page session: tracking starts on launch, stdin lines deliver
//! page events, and every timer is driven from one loop that sleeps until the
//! engine's next deadline.
//!
//! ```text
//! pulse                 → user activity
//! hide                  → page hidden (flush)
//! scrape {"posts": ...} → record a scrape snapshot
//! status                → print the reading summary
//! quit                  → flush and exit
//! ```

use std::io::{self, BufRead};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use readlog_core::{ReadlogEngine, ScrapeSnapshot};
use tracing::{debug, info, warn};

use crate::session::{open_engine, print_json, CliError, Options};

const MAX_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, PartialEq)]
enum Input {
    Pulse,
    Hide,
    Scrape(ScrapeSnapshot),
    Status,
    Quit,
}

fn parse_line(line: &str) -> Result<Option<Input>, CliError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let input = match command {
        "pulse" | "activity" => Input::Pulse,
        "hide" => Input::Hide,
        "scrape" => Input::Scrape(serde_json::from_str(rest.trim())?),
        "status" => Input::Status,
        "quit" | "exit" => Input::Quit,
        other => return Err(CliError::Usage(format!("unknown command: {}", other))),
    };
    Ok(Some(input))
}

fn apply(engine: &ReadlogEngine, input: Input) -> Result<(), CliError> {
    match input {
        Input::Pulse => engine.on_activity(),
        Input::Hide => engine.on_hide(),
        Input::Scrape(snapshot) => {
            let recorded = engine.on_scrape(&snapshot)?;
            debug!(recorded, "Scrape handled");
        }
        Input::Status => print_json(&engine.summary())?,
        Input::Quit => {}
    }
    Ok(())
}

fn wait_time(engine: &ReadlogEngine) -> Duration {
    engine
        .next_deadline()
        .map(|deadline| (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO))
        .unwrap_or(MAX_WAIT)
        .min(MAX_WAIT)
}

pub fn run(options: &Options) -> Result<(), CliError> {
    let engine = open_engine(options)?;
    let page_load = engine.on_page_load()?;
    debug!(report = ?page_load, "Page load sync finished");
    info!("Tracking; reading commands from stdin");

    let (tx, rx) = mpsc::channel::<String>();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    loop {
        match rx.recv_timeout(wait_time(&engine)) {
            Ok(line) => match parse_line(&line) {
                Ok(Some(Input::Quit)) => break,
                Ok(Some(input)) => {
                    if let Err(err) = apply(&engine, input) {
                        warn!(error = %err, "Command failed");
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, line = %line, "Ignoring input"),
            },
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let report = engine.tick();
        if report.accrued_minutes.is_some() || report.sync.is_some() {
            debug!(report = ?report, "Tick");
        }
    }

    let flushed = engine.destroy();
    info!(written = flushed.written, failed = flushed.failed.len(), "Tracking stopped");
    Ok(())
}
