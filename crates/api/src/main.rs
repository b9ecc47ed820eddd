//! HealMate API server binary.
//!
//! Usage:
//!   healmate-api --config healmate.toml
//!   healmate-api --port 8080 --bind 0.0.0.0
//!
//! # Environment Variables
//!
//! - `HEALMATE_API_KEY` - Bearer key required on `/api/*` routes (recommended)
//! - `HEALMATE_BIND_ADDR` - Server bind address (default: 127.0.0.1)
//! - `HEALMATE_CORS_ORIGINS` - CORS allowed origins (comma-separated)
//! - `OPENAI_API_KEY` / `DEEPSEEK_API_KEY` - Model provider keys

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use healmate_api::{ApiKeyConfig, AppState, serve};
use healmate_coordinator::CoordinatorConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "HealMate API Server

Usage: healmate-api [OPTIONS]

Options:
  -p, --port <PORT>      Port to listen on (default: 8080)
  -b, --bind <ADDR>      Bind address (default: 127.0.0.1, env: HEALMATE_BIND_ADDR)
  -c, --config <FILE>    Path to the TOML configuration file
  -h, --help             Show this help message

Environment variables:
  HEALMATE_API_KEY       Bearer key for /api/* routes (recommended for production)
  HEALMATE_BIND_ADDR     Server bind address (overridden by --bind)
  HEALMATE_CORS_ORIGINS  CORS allowed origins (comma-separated)
  OPENAI_API_KEY         OpenAI key (provider = \"openai\")
  DEEPSEEK_API_KEY       DeepSeek key (provider = \"deepseek\")";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,healmate_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let mut port: u16 = 8080;
    let mut config_path: Option<String> = None;
    let mut bind_addr: Option<String> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--port" | "-p" => {
                let value = args.next().context("--port needs a value")?;
                port = value.parse().context("Invalid port number")?;
            }
            "--config" | "-c" => config_path = Some(args.next().context("--config needs a path")?),
            "--bind" | "-b" => bind_addr = Some(args.next().context("--bind needs an address")?),
            "--help" | "-h" => {
                println!("{USAGE}");
                return Ok(());
            }
            other => tracing::warn!(arg = %other, "Ignoring unknown argument"),
        }
    }

    let host = bind_addr
        .or_else(|| std::env::var("HEALMATE_BIND_ADDR").ok())
        .unwrap_or_else(|| "127.0.0.1".to_string());

    if host == "0.0.0.0" {
        tracing::warn!(
            "Server binding to 0.0.0.0, exposing the API on all interfaces. \
             Ensure HEALMATE_API_KEY is set and a firewall is in place."
        );
    }

    let api_key = std::env::var("HEALMATE_API_KEY").ok();
    if api_key.is_none() {
        tracing::warn!(
            "HEALMATE_API_KEY not set, API will run without authentication. \
             Acceptable for local development, not for production."
        );
    }

    let cors_origins: Option<Vec<String>> = std::env::var("HEALMATE_CORS_ORIGINS")
        .ok()
        .map(|s| s.split(',').map(|o| o.trim().to_string()).collect());

    let config = if let Some(path) = config_path {
        tracing::info!(path = %path, "Loading configuration");
        CoordinatorConfig::from_file(&path)?
    } else {
        tracing::info!("Using default configuration");
        CoordinatorConfig::default()
    };

    let mut state = AppState::from_config(&config)?;
    if let Some(key) = api_key {
        state = state.with_api_key(ApiKeyConfig::new(key));
        tracing::info!("API key authentication enabled");
    }

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    serve(Arc::new(state), addr, cors_origins).await?;

    Ok(())
}
