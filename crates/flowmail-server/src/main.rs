//! FlowMail server — entry point.
//!
//! # Commands
//!
//! - `flowmail-server serve` — run the inbound webhook HTTP server plus
//!   the background timeout sweeper.
//! - `flowmail-server flow get <id>` — print one flow's current state.
//! - `flowmail-server flow list --agent <id> [--status <status>]` —
//!   list flows for an agent.

mod handler;
mod wiring;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router as AxumRouter;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use flowmail_core::config::load_config;
use flowmail_sweeper::TimeoutSweeper;

const MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "flowmail-server", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the inbound webhook server and the timeout sweeper.
    Serve {
        #[arg(long, default_value_t = false)]
        logs: bool,
    },
    /// Inspect persisted flows.
    Flow {
        #[command(subcommand)]
        action: FlowCommands,
    },
    /// Print the effective configuration (file + env overrides).
    Config,
}

#[derive(Subcommand)]
enum FlowCommands {
    /// Print one flow by id.
    Get { id: String },
    /// List flows for an agent, optionally filtered by status.
    List {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        status: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { logs } => {
            init_logging(logs);
            serve().await
        }
        Commands::Flow { action } => {
            init_logging(false);
            flow_command(action)
        }
        Commands::Config => {
            init_logging(false);
            let config = load_config().context("failed to load configuration")?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn serve() -> Result<()> {
    println!();
    println!("{}", "FlowMail — inbound mail flow engine".cyan().bold());
    println!();

    let config = load_config().context("failed to load configuration")?;
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server host/port")?;

    let components = Arc::new(wiring::build(config)?);

    let sweeper = Arc::new(TimeoutSweeper::new(
        components.flows.clone(),
        components.identity.clone(),
        components.router.clone(),
    ));
    let sweeper_handle = {
        let sweeper = sweeper.clone();
        tokio::spawn(async move { sweeper.run().await })
    };

    let app = AxumRouter::new()
        .route("/inbound", post(handler::inbound_webhook))
        .route("/healthz", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(components);

    info!(%addr, "flowmail-server listening");
    let listener = tokio::net::TcpListener::bind(addr).await.context("failed to bind server address")?;

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("server exited")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
    }

    sweeper.stop();
    let _ = sweeper_handle.await;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

fn flow_command(action: FlowCommands) -> Result<()> {
    let config = load_config().context("failed to load configuration")?;
    let components = wiring::build(config)?;
    match action {
        FlowCommands::Get { id } => {
            let flow = components.flows.get(&id)?;
            println!("{}", serde_json::to_string_pretty(&flow)?);
        }
        FlowCommands::List { agent, status } => {
            let status = status.map(|s| parse_status(&s)).transpose()?;
            let flows = components.flows.list_by_agent(&agent, status);
            for flow in flows {
                println!(
                    "{:<20} {:<10} round {}/{}  {}",
                    flow.id,
                    format!("{:?}", flow.status).to_lowercase(),
                    flow.current_round,
                    flow.max_rounds,
                    flow.trigger.subject
                );
            }
        }
    }
    Ok(())
}

fn parse_status(raw: &str) -> Result<flowmail_core::models::FlowStatus> {
    use flowmail_core::models::FlowStatus::*;
    Ok(match raw.to_lowercase().as_str() {
        "running" => Running,
        "waiting" => Waiting,
        "completed" => Completed,
        "failed" => Failed,
        "expired" => Expired,
        other => anyhow::bail!("unknown flow status: {other}"),
    })
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("flowmail=debug,info")
    } else {
        EnvFilter::new("flowmail=info,warn")
    };

    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}
