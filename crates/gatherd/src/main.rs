//! gatherd — Gather sender daemon.
//!
//! Answers discovery broadcasts for files in its input directory and serves
//! the byte ranges a receiver assigns to it.

use anyhow::{Context, Result};

use gather_core::config::GatherConfig;
use gather_core::SenderId;
use gather_services::{SenderAgent, SenderSettings};

struct Args {
    id: SenderId,
    active: bool,
}

fn print_usage() {
    println!("Usage: gatherd --id <sender-id> [--active <true|false>]");
    println!();
    println!("Options:");
    println!("  --id <n>         Sender identity; assignments arrive on base_port + n");
    println!("  --active <bool>  Exit immediately when false (default: true)");
}

fn parse_args() -> Result<Option<Args>> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut id = None;
    let mut active = true;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--id" => {
                i += 1;
                id = Some(
                    args.get(i)
                        .context("--id requires a value")?
                        .parse()
                        .context("--id must be a number between 0 and 65535")?,
                );
            }
            "--active" => {
                i += 1;
                active = args
                    .get(i)
                    .context("--active requires a value")?
                    .eq_ignore_ascii_case("true");
            }
            "help" | "--help" | "-h" => return Ok(None),
            other => anyhow::bail!("unknown argument: {other}"),
        }
        i += 1;
    }

    let id = id.context("--id is required")?;
    Ok(Some(Args { id, active }))
}

fn report_exit(name: &str, result: Result<Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => tracing::debug!(task = name, "stopped"),
        Ok(Err(e)) => tracing::error!(task = name, error = %e, "task failed"),
        Err(e) => tracing::error!(task = name, error = %e, "task panicked"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = match parse_args() {
        Ok(Some(args)) => args,
        Ok(None) => {
            print_usage();
            return Ok(());
        }
        Err(e) => {
            eprintln!("{e:#}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    if !args.active {
        println!("[Sender {}] Inactive. Exiting.", args.id);
        return Ok(());
    }

    if let Err(e) = GatherConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = GatherConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        GatherConfig::default()
    });

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let agent = SenderAgent::new(args.id, SenderSettings::from_config(&config));
    let sender_id = agent.id();
    let tasks = agent
        .spawn(&shutdown_tx)
        .with_context(|| format!("sender {sender_id} failed to start"))?;

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut responder = tasks.responder;
    let mut listener = tasks.listener;

    // Both loops stop on the shutdown signal. If one dies first, stop the other.
    tokio::select! {
        r = &mut responder => {
            report_exit("discovery responder", r);
            let _ = shutdown_tx.send(());
            report_exit("assignment listener", listener.await);
        }
        r = &mut listener => {
            report_exit("assignment listener", r);
            let _ = shutdown_tx.send(());
            report_exit("discovery responder", responder.await);
        }
    }

    tracing::info!(sender_id, "shutting down");
    Ok(())
}
