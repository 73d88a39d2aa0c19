mod format;

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use shelf_api::{HttpApi, ShelfApi, SnapshotLoader, DEFAULT_API_URL};
use shelf_core::{CorrelationToken, Draft, ImageUpload, Record, RecordId};
use shelf_hub::{run_connection, Backoff, EventHub, NdjsonConnector};
use shelf_store::{spawn_sync, Status, SyncConfig, ViewSnapshot};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "shelfctl", version, about = "Shelf CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// REST base URL of the objects server
    #[arg(long = "api", env = "SHELF_API_URL", global = true, default_value = DEFAULT_API_URL)]
    api_url: String,

    /// Live event stream URL (default: <api>/objects/events)
    #[arg(long = "events", env = "SHELF_EVENTS_URL", global = true)]
    events_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List all objects
    Ls,
    /// Show one object
    Get { id: String },
    /// Create an object with an image
    Create {
        #[arg(long)]
        title: String,
        #[arg(long)]
        description: String,
        /// Path to a .jpg or .png file
        #[arg(long)]
        image: String,
    },
    /// Delete an object
    Rm { id: String },
    /// Keep a live view of the catalog and print changes until Ctrl-C
    Watch,
}

fn init_tracing() {
    let env = std::env::var("SHELF_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SHELF_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid SHELF_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let api = Arc::new(HttpApi::new(cli.api_url.clone()));

    match cli.command {
        Commands::Ls => {
            info!(api = %api.base_url(), "ls invoked");
            let records = list_records(api.as_ref()).await?;
            match cli.output {
                Output::Human => {
                    let now = chrono::Utc::now();
                    println!("{}", format::header());
                    for r in &records {
                        println!("{}", format::record_row(r, now));
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&records)?),
            }
        }
        Commands::Get { id } => {
            let record = api.get(&RecordId::new(id)).await?;
            match cli.output {
                Output::Human => {
                    println!("id:          {}", record.id);
                    println!("title:       {}", record.title);
                    println!("description: {}", record.description);
                    println!("image:       {}", record.image_url);
                    println!("created:     {}", record.created_at.to_rfc3339());
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&record)?),
            }
        }
        Commands::Create { title, description, image } => {
            let bytes = tokio::fs::read(&image).await.with_context(|| format!("reading image {}", image))?;
            let draft = Draft::new(&title, &description, Some(ImageUpload::new(&image, bytes)));
            draft.validate()?;
            let record = api.create(&draft, &CorrelationToken::generate()).await?;
            match cli.output {
                Output::Human => println!("created {}", record.id),
                Output::Json => println!("{}", serde_json::to_string_pretty(&record)?),
            }
        }
        Commands::Rm { id } => {
            let id = RecordId::new(id);
            api.delete(&id).await?;
            if cli.output == Output::Human {
                println!("deleted {}", id);
            }
        }
        Commands::Watch => {
            let events_url = cli.events_url.clone().unwrap_or_else(|| format!("{}/objects/events", api.base_url()));
            info!(api = %api.base_url(), events = %events_url, "watch invoked");
            let hub = EventHub::global().clone();
            let connector = NdjsonConnector::new(events_url);
            let conn_handle = tokio::spawn({
                let hub = hub.clone();
                async move { run_connection(hub, &connector, Backoff::from_env()).await }
            });

            let handle = spawn_sync(api.clone() as Arc<dyn ShelfApi>, &hub, SyncConfig::from_env());
            if let Err(e) = handle.load().await {
                error!(error = %e, "initial load failed");
                eprintln!("load error: {} (live events are still applied)", e);
            }

            let mut rx = handle.subscribe_epoch();
            let mut shown: Vec<(String, String)> = Vec::new();
            let mut last_status = Status::Uninitialized;
            loop {
                let snap = handle.current();
                match cli.output {
                    Output::Human => print_changes(&snap, &mut shown, &mut last_status),
                    Output::Json => println!("{}", serde_json::to_string(&*snap)?),
                }
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            warn!("synchronizer stopped; exiting watch loop");
                            break;
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }

            handle.teardown().await;
            conn_handle.abort();
            info!("watch loop ended");
        }
    }

    Ok(())
}

async fn list_records(api: &dyn SnapshotLoader) -> Result<Vec<Record>> {
    api.load().await.context("listing objects")
}

/// Print `+`/`-` lines for entries that appeared or vanished since the last call.
fn print_changes(snap: &ViewSnapshot, shown: &mut Vec<(String, String)>, last_status: &mut Status) {
    if snap.status != *last_status {
        match &snap.status {
            Status::Failed(reason) => println!("status: failed ({})", reason),
            other => println!("status: {:?}", other),
        }
        *last_status = snap.status.clone();
    }
    let now: Vec<(String, String)> = snap.entries.iter().map(format::entry_label).collect();
    for (key, title) in shown.iter().filter(|old| !now.iter().any(|n| n.0 == old.0)) {
        println!("- {} {}", key, title);
    }
    for (key, title) in now.iter().filter(|n| !shown.iter().any(|old| old.0 == n.0)) {
        println!("+ {} {}", key, title);
    }
    if let Some(err) = &snap.last_error {
        eprintln!("error: {}", err);
    }
    *shown = now;
}
