//!
//! sentinel server binary
//! ----------------------
//! Command-line entry point for the agent. Configuration comes from the
//! environment; `--http-port`, `--bind` and `--data-dir` override it.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

use sentinel::config::AgentConfig;

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
        i += 1;
    }
    None
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

#[tokio::main]
async fn main() -> Result<()> {
    println!(r"                    __  _            __
   ________  ____  / /_(_)___  ___  / /
  / ___/ _ \/ __ \/ __/ / __ \/ _ \/ /
 (__  )  __/ / / / /_/ / / / /  __/ /
/____/\___/_/ /_/\__/_/_/ /_/\___/_/   ");

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();

    let args: Vec<String> = env::args().collect();

    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        println!("sentinel Server\n\nUSAGE:\n  sentinel_server [--http-port N] [--bind ADDR] [--data-dir PATH]\n\nOPTIONS:\n  --http-port N      Listen port (env: SENTINEL_HTTP_PORT, default 5001)\n  --bind ADDR        Listen address (env: SENTINEL_BIND, default 0.0.0.0)\n  --data-dir PATH    users.txt and proofs/ root (env: SENTINEL_DATA_DIR, default data)\n\nREQUIRED ENVIRONMENT:\n  AUTH_MASTER_CODE   Master code that unlocks account registration\n");
        return Ok(());
    }

    // a missing master code aborts startup here
    let mut cfg = AgentConfig::from_env().context("agent configuration")?;

    // CLI arguments override environment
    if let Some(port) = arg_value(&args, "--http-port") {
        cfg.http_port = port.parse::<u16>().with_context(|| format!("invalid --http-port {}", port))?;
    }
    if let Some(bind) = arg_value(&args, "--bind") { cfg.bind = bind; }
    if let Some(dir) = arg_value(&args, "--data-dir") { cfg.data_dir = PathBuf::from(dir); }

    println!("sentinel starting: bind={}, http={}, data_dir={}", cfg.bind, cfg.http_port, cfg.data_dir.display());
    tracing::info!(target: "startup", "Using bind={} http={} data_dir={}", cfg.bind, cfg.http_port, cfg.data_dir.display());
    sentinel::server::run(cfg).await
}
