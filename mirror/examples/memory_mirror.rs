/*
Memory Mirror Example

Runs a mirror between the in-memory source and destination and walks it through its lifecycle:
creation with an initial snapshot, streaming, a configuration edit adding a table, and drop.

Usage:
    cargo run --example memory_mirror -- --rows 1000 --batch-size 200
    cargo run --example memory_mirror -- --config-dir configuration
*/

use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use mirror::connector::memory::{MemoryDestination, MemorySource};
use mirror::control::{CreateMirrorRequest, MirrorController, PeerRegistry, StateChangeRequest};
use mirror::coordinator::{ConfigUpdate, TableMappingRequest};
use mirror::state::mirror::MirrorState;
use mirror::store::both::memory::MemoryStore;
use mirror::types::{ControlPlaneConfig, MirrorConfig, TableMapping, TableName, TableRow};
use mirror_config::{Environment, load_config_from};
use mirror_telemetry::metrics::init_metrics_handle;
use mirror_telemetry::tracing::init_tracing;
use rand::Rng;
use serde_json::json;
use tracing::{error, info};

const MIRROR_NAME: &str = "demo_mirror";

#[derive(Debug, Parser)]
#[command(name = "memory_mirror", version, about)]
struct AppArgs {
    /// Number of rows seeded into each source table before the mirror is created
    #[arg(long, default_value = "100")]
    rows: u32,

    /// Number of changes streamed after the initial snapshot
    #[arg(long, default_value = "50")]
    changes: u32,

    /// Maximum number of changes applied to the destination in one batch
    #[arg(long, default_value = "100")]
    batch_size: u32,

    /// Maximum number of table snapshots copied concurrently, overrides the loaded configuration
    #[arg(long)]
    max_snapshot_workers: Option<u16>,

    /// Directory with `base` and per-environment control plane configuration files
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Directory for log files written by release builds
    #[arg(long, default_value = "logs")]
    log_dir: String,

    /// Print the collected metrics in Prometheus format before exiting
    #[arg(long)]
    print_metrics: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = AppArgs::parse();
    let _log_flusher = init_tracing("memory_mirror", &args.log_dir)?;

    if let Err(e) = main_impl(args).await {
        error!("{e}");
        std::process::exit(1);
    }

    Ok(())
}

async fn main_impl(args: AppArgs) -> Result<(), Box<dyn Error>> {
    let metrics = init_metrics_handle()?;

    let users = TableName::parse("public.users")?;
    let orders = TableName::parse("public.orders")?;

    let source = MemorySource::new();
    let destination = MemoryDestination::new();
    for table in [&users, &orders] {
        source.create_table(table).await;
        for id in 0..args.rows {
            source.insert(table, random_row(id)).await;
        }
    }

    let peers = PeerRegistry::new();
    peers
        .create_source_peer("memory_source", source.clone(), false)
        .await?;
    peers
        .create_destination_peer("memory_destination", destination.clone(), false)
        .await?;

    let mut control_config = match &args.config_dir {
        Some(directory) => {
            load_config_from::<ControlPlaneConfig>(directory, Environment::load()?)?
        }
        None => ControlPlaneConfig {
            poll_interval_ms: 10,
            ..Default::default()
        },
    };
    if let Some(max_snapshot_workers) = args.max_snapshot_workers {
        control_config.max_snapshot_workers = max_snapshot_workers;
    }
    let controller = MirrorController::new(control_config, peers, MemoryStore::new())?;

    let config = MirrorConfig {
        batch_size: args.batch_size,
        idle_timeout_seconds: 1,
        table_mappings: vec![TableMapping::new(users.clone(), "users")],
    };
    let status = controller
        .create_mirror(CreateMirrorRequest {
            name: MIRROR_NAME.to_string(),
            source_peer: "memory_source".to_string(),
            destination_peer: "memory_destination".to_string(),
            config,
            do_initial_snapshot: true,
        })
        .await?;
    info!(state = %status.current_state, "mirror created");

    for id in 0..args.changes {
        source.update(&users, random_row(id % args.rows.max(1))).await;
    }
    wait_until_caught_up(&controller, &source).await?;
    info!(
        rows = destination.table_rows("users").await.len(),
        "users mirrored"
    );

    controller
        .change_state(StateChangeRequest::pause(MIRROR_NAME))
        .await?;
    let update = ConfigUpdate {
        additional_tables: vec![TableMappingRequest::new("public.orders", "orders")],
        ..Default::default()
    };
    let status = controller
        .change_state(StateChangeRequest::edit(
            MIRROR_NAME,
            update,
            MirrorState::Running,
        ))
        .await?;
    info!(
        state = %status.current_state,
        tables = status.config.table_mappings.len(),
        "mirror edited"
    );

    wait_until_caught_up(&controller, &source).await?;
    while destination.table_rows("orders").await.len() < args.rows as usize {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    info!(
        rows = destination.table_rows("orders").await.len(),
        "orders mirrored"
    );

    let status = controller
        .change_state(StateChangeRequest::drop(MIRROR_NAME, false))
        .await?;
    info!(
        state = %status.current_state,
        syncs = status.number_of_syncs,
        "mirror dropped"
    );

    if args.print_metrics {
        println!("{}", metrics.render());
    }

    Ok(())
}

fn random_row(id: u32) -> TableRow {
    let mut rng = rand::thread_rng();

    TableRow::new(
        id.to_string(),
        json!({
            "id": id,
            "balance": rng.gen_range(0..10_000),
            "active": rng.gen_bool(0.5),
        }),
    )
}

async fn wait_until_caught_up(
    controller: &MirrorController<MemorySource, MemoryDestination, MemoryStore>,
    source: &MemorySource,
) -> Result<(), Box<dyn Error>> {
    let head = source.head().await;

    loop {
        let status = controller.mirror_status(MIRROR_NAME).await?;
        if status.checkpoint.position.is_some_and(|position| position >= head) {
            return Ok(());
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
