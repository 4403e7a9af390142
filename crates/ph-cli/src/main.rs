use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use ph_offline::{
    BufferStore, ConnectivityMonitor, HttpRemoteApi, OfflineClient, OfflineConfig, Outbox,
    PendingRecord, ReplayOutcome, SaveOutcome, SqliteBufferStore,
};
use serde_json::{json, Value};
use std::sync::Arc;

const CLI_NAME: &str = "pizza-hunt-cli";

#[derive(Parser)]
#[command(name = "pizza-hunt", version, about = "Pizza Hunt API and offline client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the REST API
    Api,
    /// Apply database migrations and exit
    Migrate,
    /// Work with the local buffer of pizzas saved while the API was unreachable
    Offline {
        #[command(subcommand)]
        command: OfflineCommand,
    },
}

#[derive(Subcommand)]
enum OfflineCommand {
    /// Create a pizza, buffering it locally if the API is unreachable
    Save(SaveArgs),
    /// Print the buffered records in submission order
    Pending(OutputArgs),
    /// Send the buffer to the API once
    Replay,
    /// Drop every buffered record without sending it
    Clear,
    /// Replay on start and on every reconnect until interrupted
    Watch,
}

#[derive(Args)]
struct SaveArgs {
    /// Pizza payload, e.g. '{"pizzaName":"Margherita","toppings":["basil"]}'
    #[arg(long)]
    json: String,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args)]
struct OutputArgs {
    /// Pretty-print JSON output
    #[arg(long, default_value_t = false)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Api => {
            let config = ph_api::load_config()?;
            ph_api::run(config).await?;
        }
        Commands::Migrate => {
            ph_core::logging::init(CLI_NAME);
            let database_url =
                ph_core::config::env_or("DATABASE_URL", "sqlite://data/pizza_hunt_api.db?mode=rwc");
            let pool = ph_core::db::connect(&database_url).await?;
            ph_core::migrations::run(&pool).await?;
            tracing::info!("migrations applied");
        }
        Commands::Offline { command } => {
            ph_core::logging::init(CLI_NAME);
            let config = ph_offline::load_config()?;
            run_offline(command, &config).await?;
        }
    }

    Ok(())
}

async fn run_offline(command: OfflineCommand, config: &OfflineConfig) -> Result<()> {
    match command {
        OfflineCommand::Save(args) => save(args, config).await?,
        OfflineCommand::Pending(args) => {
            let store = SqliteBufferStore::open(&config.store_dir).await?;
            let pending: Vec<Value> = store
                .drain()
                .await?
                .into_iter()
                .map(|entry| json!({ "key": entry.key.get(), "record": entry.record }))
                .collect();
            print_json(&Value::Array(pending), args.pretty)?;
        }
        OfflineCommand::Replay => {
            let client = OfflineClient::open(config, true).await?;
            match client.engine.replay().await {
                ReplayOutcome::Submitted { count } => println!("submitted {count} pizza(s)"),
                ReplayOutcome::Empty => println!("nothing to replay"),
                ReplayOutcome::Skipped => println!("replay already in progress"),
                ReplayOutcome::Rejected { message } => {
                    return Err(anyhow!("replay rejected by api: {message}"));
                }
                ReplayOutcome::Failed { reason } => {
                    return Err(anyhow!("replay failed: {reason}"));
                }
            }
        }
        OfflineCommand::Clear => {
            let store = SqliteBufferStore::open(&config.store_dir).await?;
            let count = store.len().await?;
            store.clear().await?;
            tracing::info!(count, "offline buffer cleared");
        }
        OfflineCommand::Watch => {
            let client = OfflineClient::open(config, true).await?;
            watch(client, config).await?;
        }
    }

    Ok(())
}

/// A missing local store only disables buffering; online saves still work.
async fn save(args: SaveArgs, config: &OfflineConfig) -> Result<()> {
    let record = PendingRecord::from_json_str(&args.json)?;
    let remote = Arc::new(HttpRemoteApi::new(
        &config.api_base_url,
        config.remote_timeout,
    )?);
    let monitor = ConnectivityMonitor::new(true);
    let outbox = match SqliteBufferStore::open(&config.store_dir).await {
        Ok(store) => Outbox::new(Arc::new(store), remote, monitor),
        Err(err) => {
            tracing::warn!(error = %err, "offline buffer unavailable; saving without it");
            Outbox::unbuffered(remote, monitor)
        }
    };

    let output = match outbox.save(record).await? {
        SaveOutcome::Created(document) => json!({ "created": document }),
        SaveOutcome::Buffered(key) => {
            tracing::info!(key = %key, "pizza saved offline");
            json!({ "buffered": key.get() })
        }
    };
    print_json(&output, args.output.pretty)
}

async fn watch(client: OfflineClient, config: &OfflineConfig) -> Result<()> {
    let probe_client = reqwest_client(config)?;
    let health_url = config.health_url();
    let online = ph_offline::connectivity::probe_once(&probe_client, &health_url).await;
    client.monitor.set_online(online);

    let probe = client
        .monitor
        .spawn_probe(probe_client, health_url, config.poll_interval);
    let watcher = client.engine.start(&client.monitor).await;
    tracing::info!(
        api = %config.api_base_url,
        store = %client.store.location().display(),
        online,
        "watching connectivity"
    );

    ph_core::server::shutdown_signal().await;
    probe.abort();
    watcher.abort();
    tracing::info!("watch stopped");
    Ok(())
}

fn reqwest_client(config: &OfflineConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(config.remote_timeout)
        .build()?)
}

fn print_json(value: &Value, pretty: bool) -> Result<()> {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{rendered}");
    Ok(())
}
