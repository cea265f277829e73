mod cli;
mod config;
mod storage;

use crate::cli::{Command, ConfigCommand};
use clap::Parser;
use color_eyre::Result;
use keystash_core::{Backend, SharedBackend, StorageKey};
use keystash_observe::StorageFacade;
use serde_json::Value;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load()?;
    let kind = cli.backend.unwrap_or_else(|| config.backend());

    match cli.command {
        Command::Version => print_version(),
        Command::Config(ConfigCommand::Init) => init_config(&config)?,
        command => {
            let backend = storage::backend_from_config(&config, kind)?;
            let facade = StorageFacade::new();
            run_command(command, &facade, &backend).await?
        }
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters, default to info to avoid noisy stdout.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("keystash {}", env!("CARGO_PKG_VERSION"));
}

fn init_config(config: &config::Config) -> Result<()> {
    let path = config::write_default_if_missing(config)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}

async fn run_command(command: Command, facade: &StorageFacade, backend: &SharedBackend) -> Result<()> {
    match command {
        Command::Get { key } => match get_value(facade, backend, &key).await? {
            Some(value) => println!("{value}"),
            None => color_eyre::eyre::bail!("no value stored under {key}"),
        },
        Command::Set { key, value } => {
            set_value(facade, backend, &key, &value).await?;
            println!("Stored {key}");
        }
        Command::Delete { key } => {
            facade.remove(backend, &parse_key(&key)?).await?;
            println!("Deleted {key}");
        }
        Command::Watch { key, count } => {
            watch_value(facade, backend, &key, count, |value| match value {
                Some(value) => println!("{value}"),
                None => println!("(unset)"),
            })
            .await?;
        }
        Command::Health => {
            run_backend_health(backend.as_ref()).await?;
            println!("Storage ({}): ok", backend.name());
        }
        Command::Version | Command::Config(_) => {}
    }
    Ok(())
}

fn parse_key(raw: &str) -> Result<StorageKey> {
    Ok(StorageKey::new(raw)?)
}

async fn get_value(facade: &StorageFacade, backend: &SharedBackend, key: &str) -> Result<Option<Value>> {
    Ok(facade.read(backend, &parse_key(key)?).await?)
}

async fn set_value(facade: &StorageFacade, backend: &SharedBackend, key: &str, raw: &str) -> Result<()> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| color_eyre::eyre::eyre!("value is not valid JSON: {e}"))?;
    facade.write(backend, &parse_key(key)?, &value).await?;
    Ok(())
}

/// Emits the current value (if stored) and every later change until `count`
/// values were emitted or the observation ends. Returns how many were emitted.
async fn watch_value(
    facade: &StorageFacade,
    backend: &SharedBackend,
    key: &str,
    count: Option<usize>,
    mut emit: impl FnMut(Option<&Value>),
) -> Result<usize> {
    let key = parse_key(key)?;
    let mut handle = facade.observe_optional::<Value>(backend, &key).await;
    if let Some(err) = handle.error() {
        warn!(%key, %err, "current value could not be read");
    }

    let mut emitted = 0;
    while count.map_or(true, |limit| emitted < limit) {
        let Some(value) = handle.next().await else {
            break;
        };
        emit(value.as_ref());
        emitted += 1;
    }
    handle.unsubscribe();
    facade.release(backend, &key);
    Ok(emitted)
}

/// Runs a write/read/delete probe against the backend.
async fn run_backend_health(backend: &dyn Backend) -> Result<()> {
    let probe_key = StorageKey::new("health/probe")?;
    let payload = b"ok";
    backend.set(&probe_key, payload).await?;
    let round_trip = backend.get(&probe_key).await?;
    backend.delete(&probe_key).await?;

    if round_trip.as_deref() != Some(&payload[..]) {
        color_eyre::eyre::bail!("storage round-trip failed");
    }
    if backend.get(&probe_key).await?.is_some() {
        color_eyre::eyre::bail!("probe key survived delete");
    }
    Ok(())
}
