// src/main.rs

//! The main entry point. The default mode runs the kontrol runtime (slave
//! and/or master per $KONTROL_MODE); the `--automaton` mode runs the
//! standalone shell state machine.

use anyhow::Result;
use kontrol::automaton::{self, AutomatonOpts, DEFAULT_SOCKET};
use kontrol::config::Config;
use kontrol::server;
use std::env;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("kontrol version {VERSION}");
        return Ok(());
    }

    if args.len() > 1 && args[1] == "--automaton" {
        // --- Automaton Mode ---
        let (opts, debug, logfile) = match parse_automaton_args(&args[2..]) {
            Ok(parsed) => parsed,
            Err(usage) => {
                eprintln!("{usage}");
                std::process::exit(1);
            }
        };

        init_logging(debug, logfile.as_deref());

        if let Err(e) = automaton::run(opts).await {
            error!("automaton runtime error: {}", e);
            return Err(e);
        }
    } else {
        // --- Kontrol Runtime ---
        let config = match Config::from_env() {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("invalid configuration: {e}");
                std::process::exit(1);
            }
        };

        init_logging(config.mode.verbose, None);

        if let Err(e) = server::run(config).await {
            error!("kontrol runtime error: {}", e);
            return Err(e);
        }
    }

    Ok(())
}

/// `--automaton <input> [-s|--socket <path>] [-l|--logfile <path>] [-d|--debug]`
fn parse_automaton_args(
    args: &[String],
) -> Result<(AutomatonOpts, bool, Option<String>), String> {
    const USAGE: &str =
        "Usage: kontrol --automaton <input> [--socket <path>] [--logfile <path>] [--debug]";

    let mut input = None;
    let mut socket = PathBuf::from(DEFAULT_SOCKET);
    let mut logfile = None;
    let mut debug = false;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-s" | "--socket" => {
                socket = PathBuf::from(iter.next().ok_or(USAGE)?);
            }
            "-l" | "--logfile" => {
                logfile = Some(iter.next().ok_or(USAGE)?.clone());
            }
            "-d" | "--debug" => debug = true,
            other if input.is_none() && !other.starts_with('-') => {
                input = Some(PathBuf::from(other));
            }
            _ => return Err(USAGE.to_string()),
        }
    }

    let input = input.ok_or(USAGE)?;
    Ok((AutomatonOpts { input, socket }, debug, logfile))
}

/// Compact single-line logging; $RUST_LOG wins over the mode flags, and the
/// automaton can append to a logfile instead of stderr.
fn init_logging(debug: bool, logfile: Option<&str>) {
    let fallback = if debug { "info,kontrol=debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    match logfile {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .unwrap_or_else(|e| {
                    eprintln!("unable to open logfile {path}: {e}");
                    std::process::exit(1);
                });
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .compact()
                .with_ansi(false)
                .with_writer(std::sync::Arc::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .compact()
                .with_ansi(true)
                .init();
        }
    }
}
