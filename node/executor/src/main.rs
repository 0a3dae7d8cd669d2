use anyhow::{Context, Result};
use clap::Parser;
use keeper_common::{Job, TriggerData};
use keeper_executor::{config::Args, Keeper};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let job: Job = read_json(&args.job)?;
    let trigger: TriggerData = read_json(&args.trigger)?;
    let config = args.into_config()?;

    info!("Starting keeper on chain {}", config.chain_id);

    let keeper = Keeper::from_config(&config)?;
    let performed = keeper.perform(job, trigger).await?;

    println!("{}", serde_json::to_string_pretty(&performed)?);
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> Result<T> {
    let raw = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))
}
