//! gather — fetch one file from every sender on the local network at once.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};

use gather_core::config::GatherConfig;
use gather_services::{ConsoleProgress, ReceiverCoordinator, ReceiverSettings, TransferError};

fn print_usage() {
    println!("Usage: gather [filename]");
    println!();
    println!("Broadcasts a request for <filename>, splits it across every sender");
    println!("that answers, and writes the reassembled file to the output directory.");
    println!("Prompts for the filename when none is given.");
    println!();
    println!("Configuration: $GATHER_CONFIG or ~/.config/gather/config.toml");
}

fn prompt_filename() -> Result<String> {
    print!("Enter filename to request: ");
    std::io::stdout().flush().ok();

    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read filename")?;
    let name = line.trim().to_string();
    if name.is_empty() {
        anyhow::bail!("no filename given");
    }
    Ok(name)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let filename = match args.as_slice() {
        [] => prompt_filename()?,
        [flag] if flag == "help" || flag == "--help" || flag == "-h" => {
            print_usage();
            return Ok(());
        }
        [name] => name.clone(),
        other => {
            eprintln!("Unexpected arguments: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = GatherConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = GatherConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        GatherConfig::default()
    });

    let coordinator = ReceiverCoordinator::new(ReceiverSettings::from_config(&config));
    let progress = ConsoleProgress::new();

    let outcome = match coordinator.run(&filename, &progress).await {
        Ok(outcome) => outcome,
        Err(e) => {
            if let Some(TransferError::NoSenders(_)) = e.downcast_ref::<TransferError>() {
                tracing::error!(filename = %filename, "no senders found, exiting");
                std::process::exit(1);
            }
            return Err(e);
        }
    };

    println!("═══════════════════════════════════════");
    println!("  Transfer Complete");
    println!("═══════════════════════════════════════");
    println!("  File     : {}", outcome.path.display());
    println!("  Size     : {} bytes", outcome.file_size);
    println!("  Senders  : {}", outcome.assignments.len());
    for a in &outcome.assignments {
        println!("  ┌─ sender {}", a.sender_id);
        println!("  │  addr  : {}", a.addr.ip());
        println!("  └─ range : {} ({} bytes)", a.range, a.range.len());
    }

    Ok(())
}
