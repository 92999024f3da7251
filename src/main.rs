use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use gatekeeper::config::GatekeeperConfig;
use gatekeeper::store::{RedisBackend, StoreClient};
use gatekeeper::throttle::{Id, LimiterRegistry, Throttler};

/// Operator tool for Gatekeeper limiters.
#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about)]
struct Cli {
    /// YAML configuration file; GATEKEEPER__* variables override it
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Args)]
struct Target {
    /// Limiter name
    #[arg(long, short)]
    limiter: String,

    /// Identity as TYPE=KEY, repeatable
    #[arg(long = "id", required = true, value_parser = parse_id)]
    ids: Vec<Id>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Count an attempt and report whether it is throttled
    Incr(Target),
    /// Clear counters and timeouts
    Reset(Target),
    /// Report whether any identity is timed out
    TimedOut(Target),
    /// Show limit, remaining attempts and reset time for the first identity
    Details(Target),
    /// List stored keys
    Keys {
        #[arg(default_value = "*")]
        pattern: String,
    },
    /// Delete every key in the store
    Flush {
        /// Confirm the flush
        #[arg(long)]
        yes: bool,
    },
    /// Check store connectivity
    Ping,
}

fn parse_id(s: &str) -> Result<Id, String> {
    Id::parse(s).ok_or_else(|| format!("expected TYPE=KEY, got {s:?}"))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn limiter<'a>(registry: &'a LimiterRegistry, name: &str) -> anyhow::Result<&'a Throttler> {
    registry.get(name).with_context(|| {
        format!(
            "unknown limiter {name:?}, configured: {}",
            registry.names().join(", ")
        )
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = GatekeeperConfig::load(cli.config.as_deref()).context("loading configuration")?;
    debug!(store = %config.store.url, limiters = config.limiters.len(), "Configuration loaded");

    let backend = RedisBackend::connect(&config.store.url)
        .await
        .with_context(|| format!("connecting to {}", config.store.url))?;
    let store = StoreClient::new("redis", Arc::new(backend), config.breaker.breaker_config())?;
    let registry = LimiterRegistry::from_config(store.clone(), &config.limiters)?;

    let output = match cli.command {
        Command::Incr(target) => {
            let throttled = limiter(&registry, &target.limiter)?.incr(&target.ids).await?;
            json!({ "limiter": target.limiter, "throttled": throttled })
        }
        Command::Reset(target) => {
            limiter(&registry, &target.limiter)?.reset(&target.ids).await?;
            json!({ "limiter": target.limiter, "reset": target.ids })
        }
        Command::TimedOut(target) => {
            let timed_out = limiter(&registry, &target.limiter)?
                .timed_out(&target.ids)
                .await?;
            json!({ "limiter": target.limiter, "timed_out": timed_out })
        }
        Command::Details(target) => {
            let details = limiter(&registry, &target.limiter)?
                .details(&target.ids)
                .await?;
            let headers: serde_json::Map<String, serde_json::Value> = details
                .headers()
                .into_iter()
                .map(|(name, value)| (name.to_string(), value.into()))
                .collect();
            json!({ "limiter": target.limiter, "details": details, "headers": headers })
        }
        Command::Keys { pattern } => {
            let mut keys = store.keys(&pattern).await?;
            keys.sort();
            json!({ "pattern": pattern, "keys": keys })
        }
        Command::Flush { yes } => {
            if !yes {
                anyhow::bail!("refusing to flush the store without --yes");
            }
            store.flush().await?;
            info!(store = %config.store.url, "Store flushed");
            json!({ "flushed": true })
        }
        Command::Ping => {
            store.ping().await?;
            json!({ "ping": "ok", "circuit": store.circuit_state() })
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    debug!(stats = ?store.breaker_stats(), "Done");
    Ok(())
}
