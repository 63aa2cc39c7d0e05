//! Connection probe for HomeSide controllers
//!
//! Connects to a controller, prints its identity and, given a variable
//! catalogue, runs one poll cycle per group and prints the combined
//! values. Useful for verifying reachability and credentials before
//! wiring the client into anything bigger.

use anyhow::Context;
use clap::Parser;
use homeside_client::combine::{combine, CombinedState};
use homeside_client::config::HomesideConfig;
use homeside_client::protocol::{HomesideSession, ProtocolSession};
use homeside_client::registry::VariableRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "homeside-probe", about = "Probe a HomeSide heating controller")]
struct Args {
    /// Controller host, with optional port
    #[arg(env = "HOMESIDE_HOST")]
    host: String,

    /// Username for an authenticated session
    #[arg(short, long, env = "HOMESIDE_USERNAME")]
    username: Option<String>,

    /// Password for an authenticated session
    #[arg(short, long, env = "HOMESIDE_PASSWORD")]
    password: Option<String>,

    /// Variable catalogue to load and poll once
    #[arg(short, long)]
    catalogue: Option<PathBuf>,

    /// Write `VARIABLE=VALUE` after polling (requires credentials)
    #[arg(short, long)]
    write: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = HomesideConfig::new(args.host);
    config.username = args.username;
    config.password = args.password;
    config.validate().context("invalid configuration")?;

    println!("🔌 Connecting to {} ...", config.ws_url());
    let session = Arc::new(HomesideSession::new(config.clone()));
    session.connect().await.context("connection failed")?;

    let identity = session.identity().await;
    println!("✅ Connected ({:?})", session.state().await);
    println!("   Controller: {}", identity.controller_name.as_deref().unwrap_or("<unknown>"));
    println!("   Project:    {}", identity.project_name.as_deref().unwrap_or("<unknown>"));
    println!("   Serial:     {}", identity.serial.as_deref().unwrap_or("<unknown>"));
    if let Some(level) = session.session_level().await {
        println!("   Privilege:  level {level}");
    }

    let registry = match &args.catalogue {
        Some(path) => {
            let registry = Arc::new(
                VariableRegistry::load_file(path).context("failed to load catalogue")?,
            );
            info!(variables = registry.len(), "catalogue loaded");
            poll_all_groups(&registry, session.as_ref()).await?;
            Some(registry)
        }
        None => None,
    };

    if let Some(spec) = &args.write {
        let (id, value) = spec
            .split_once('=')
            .context("write expects VARIABLE=VALUE")?;
        let value: f64 = value.trim().parse().context("write value must be numeric")?;
        let registry = registry
            .clone()
            .context("writing requires a catalogue (--catalogue)")?;
        let gateway = homeside_client::gateway::WriteGateway::new(registry, session.clone());
        gateway.submit(id.trim(), value).await?;
        println!("✏️  Wrote {value} to '{}'", id.trim());
    }

    session.close().await;
    Ok(())
}

async fn poll_all_groups(
    registry: &VariableRegistry,
    session: &HomesideSession,
) -> anyhow::Result<()> {
    for group in registry.active_groups() {
        let addresses = registry.addresses_needed_by(group);
        println!("\n📡 Group {group} ({} addresses)", addresses.len());
        let raw = session.fetch(&addresses).await?;
        for def in registry.definitions_in(group) {
            let combined = combine(def, &raw);
            let rendered = match &combined.state {
                CombinedState::Unavailable => "unavailable".to_string(),
                CombinedState::Bool(b) => b.to_string(),
                CombinedState::Numeric(n) => match &def.unit {
                    Some(unit) => format!("{n} {unit}"),
                    None => n.to_string(),
                },
                CombinedState::Text(t) => t.clone(),
            };
            let marker = if combined.valid { " " } else { "!" };
            println!("  {marker} {:<32} {rendered}", def.display_name());
        }
    }
    Ok(())
}
