//! projectq CLI: operator interface to the work queue.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use projectq::broker::BrokerClient;
use projectq::config::Config;
use projectq::db::Db;
use projectq::engine::{Engine, EngineConfig, Registry};
use projectq::model::{NewWorkItem, State, WorkFilter, WorkId, WorkItem};
use projectq::telemetry::init_telemetry;
use secrecy::ExposeSecret;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "projectq", about = "Durable work item queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker pool
    Serve {
        /// Number of workers (overrides PROJECTQ_WORKERS)
        #[arg(long)]
        workers: Option<usize>,
        /// Handler per kind: `kind=echo` or `kind=/path/to/executable`
        #[arg(long = "handler", value_name = "KIND=TARGET")]
        handlers: Vec<String>,
        /// Base directory for hook working directories
        #[arg(long)]
        work_dir: Option<PathBuf>,
    },
    /// Submit a new work item
    Submit {
        #[arg(long)]
        topic: String,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long)]
        name: Option<String>,
        /// Work kind (selects the handler)
        #[arg(long, default_value = projectq::model::DEFAULT_KIND)]
        kind: String,
    },
    /// Print the state of a work item
    Status {
        /// Work item ID (full UUID or prefix)
        id: String,
    },
    /// List work items, newest first
    List {
        /// Filter by state
        #[arg(long)]
        state: Option<State>,
        /// Filter by kind
        #[arg(long)]
        kind: Option<String>,
        /// Maximum items to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a work item
    Show {
        /// Work item ID (full UUID or prefix)
        id: String,
    },
    /// Probe broker and store health (JSON)
    Health,
    /// Re-enqueue a work item stuck in CREATED
    Resubmit {
        /// Work item ID (full UUID or prefix)
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;
    let _guard = init_telemetry(config.telemetry_config())?;

    match cli.command {
        Command::Serve {
            workers,
            handlers,
            work_dir,
        } => cmd_serve(config, workers, handlers, work_dir).await,
        Command::Submit {
            topic,
            notes,
            name,
            kind,
        } => cmd_submit(&client(&config).await?, topic, notes, name, kind).await,
        Command::Status { id } => {
            let engine = client(&config).await?;
            let id = resolve_id(&engine, &id).await?;
            println!("{}", engine.status(id).await?);
            Ok(())
        }
        Command::List { state, kind, limit } => {
            cmd_list(&client(&config).await?, state, kind, limit).await
        }
        Command::Show { id } => {
            let engine = client(&config).await?;
            let id = resolve_id(&engine, &id).await?;
            print_item(&engine.get(id).await?);
            Ok(())
        }
        Command::Health => cmd_health(&client(&config).await?).await,
        Command::Resubmit { id } => {
            let engine = client(&config).await?;
            let id = resolve_id(&engine, &id).await?;
            let msg_id = engine.resubmit(id).await?;
            println!("Re-enqueued: {id} (msg {msg_id})");
            Ok(())
        }
    }
}

/// Engine for one-shot commands: no handlers, so kinds are not checked.
async fn client(config: &Config) -> anyhow::Result<Engine> {
    connect(config, Registry::empty(), false).await
}

/// Connect, migrate, make sure the queue exists, and build the engine.
async fn connect(
    config: &Config,
    registry: Registry,
    validate_kinds: bool,
) -> anyhow::Result<Engine> {
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    db.create_queue(&config.queue).await?;

    let broker = BrokerClient::new(
        Arc::new(db.broker(&config.queue, config.visibility_timeout)),
        &config.queue,
        config.broker_retry(),
    );
    Ok(Engine::new(
        Arc::new(db),
        broker,
        registry,
        EngineConfig {
            validate_kinds,
            ..config.engine_config()
        },
    ))
}

async fn cmd_serve(
    config: Config,
    workers: Option<usize>,
    mut handlers: Vec<String>,
    work_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    if handlers.is_empty() {
        warn!(
            kind = projectq::model::DEFAULT_KIND,
            "no handlers given, registering echo"
        );
        handlers.push(format!("{}=echo", projectq::model::DEFAULT_KIND));
    }
    let work_dir = work_dir.unwrap_or_else(|| std::env::temp_dir().join("projectq-work"));
    tokio::fs::create_dir_all(&work_dir).await?;
    let registry = Registry::from_specs(&handlers, &work_dir)?;
    info!(kinds = ?registry.kinds(), "handlers registered");

    let engine = connect(&config, registry, true).await?;
    let mut worker_config = config.worker_config();
    if let Some(n) = workers {
        worker_config.workers = n.max(1);
    }
    let pool = engine.worker_pool(config.executor_config(), worker_config);

    let stopper = pool.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown requested");
        stopper.shutdown();
    });

    pool.run().await?;
    Ok(())
}

async fn cmd_submit(
    engine: &Engine,
    topic: String,
    notes: Option<String>,
    name: Option<String>,
    kind: String,
) -> anyhow::Result<()> {
    let mut new = NewWorkItem::new(topic).kind(kind);
    if let Some(notes) = notes {
        new = new.notes(notes);
    }
    if let Some(name) = name {
        new = new.name(name);
    }

    let id = engine.submit(new).await?;
    println!("Submitted: {id} (state: {})", engine.status(id).await?);
    Ok(())
}

async fn cmd_list(
    engine: &Engine,
    state: Option<State>,
    kind: Option<String>,
    limit: usize,
) -> anyhow::Result<()> {
    let mut filter = WorkFilter::default().limit(limit);
    if let Some(state) = state {
        filter = filter.state(state);
    }
    if let Some(kind) = kind {
        filter = filter.kind(kind);
    }

    let items = engine.list(&filter).await?;
    if items.is_empty() {
        println!("No work items found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<12}  {:<10}  {:<30}  CREATED",
        "ID", "KIND", "STATE", "TOPIC"
    );
    println!("{}", "-".repeat(80));
    for item in &items {
        let short_id = &item.id.to_string()[..8];
        let topic: String = item.metadata.topic.chars().take(30).collect();
        println!(
            "{:<8}  {:<12}  {:<10}  {:<30}  {}",
            short_id,
            item.kind,
            item.state,
            topic,
            item.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{} item(s)", items.len());
    Ok(())
}

async fn cmd_health(engine: &Engine) -> anyhow::Result<()> {
    let report = engine.health().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_healthy() {
        anyhow::bail!("unhealthy");
    }
    Ok(())
}

/// Accept a full UUID or a unique prefix of one among recent items.
async fn resolve_id(engine: &Engine, raw: &str) -> anyhow::Result<WorkId> {
    if let Ok(id) = raw.parse::<WorkId>() {
        return Ok(id);
    }
    let items = engine.list(&WorkFilter::default()).await?;
    let matches: Vec<_> = items
        .iter()
        .filter(|item| item.id.to_string().starts_with(raw))
        .collect();
    match matches.as_slice() {
        [] => anyhow::bail!("no work item matching '{raw}'"),
        [one] => Ok(one.id),
        many => anyhow::bail!("{} work items match prefix '{raw}', be more specific", many.len()),
    }
}

fn print_item(item: &WorkItem) {
    println!("ID:       {}", item.id);
    println!("Kind:     {}", item.kind);
    println!("State:    {}", item.state);
    println!("Topic:    {}", item.metadata.topic);
    println!("Name:     {}", item.metadata.name.as_deref().unwrap_or("-"));
    println!("Notes:    {}", item.metadata.notes.as_deref().unwrap_or("-"));
    println!("Created:  {}", item.created_at);
    println!("Updated:  {}", item.updated_at);
}
