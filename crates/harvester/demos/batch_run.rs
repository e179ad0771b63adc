//! Batch driver: run a configured extraction batch and inspect the store.
//!
//!   cargo run --example batch_run -- --config harvest.json run Aak Exusiai
//!   cargo run --example batch_run -- --fixtures pages/ run Aak
//!   cargo run --example batch_run -- run --index https://example.org/wiki/Operator_List \
//!       --item "table.ops td a"
//!   cargo run --example batch_run -- show Aak

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use harvester::config::{BackendKind, HarvestConfig};
use harvester::progress::{self, BatchEventKind};
use harvester::{discover_ids, EntityId, Orchestrator, Selector, StopSignal};

#[derive(Parser)]
#[command(
    name = "batch_run",
    about = "Extract structured records for a batch of entities",
    version
)]
struct Cli {
    /// Path to harvest.json.
    #[arg(short, long)]
    config: Option<String>,

    /// Serve saved `*.html` pages from this directory instead of a browser.
    #[arg(long)]
    fixtures: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process entities and print the batch report as JSON.
    Run {
        /// Entity ids, processed in order.
        ids: Vec<String>,

        /// Read additional ids from a file, one per line.
        #[arg(long)]
        ids_file: Option<PathBuf>,

        /// Index page to collect additional ids from.
        #[arg(long, requires = "item")]
        index: Option<String>,

        /// CSS selector of the index entries whose text is an entity id.
        #[arg(long)]
        item: Option<String>,

        /// Readiness marker for the index page. Defaults to --item.
        #[arg(long)]
        index_marker: Option<String>,

        /// Override the configured worker count.
        #[arg(short, long)]
        workers: Option<usize>,

        /// Clear each entity's record before processing it.
        #[arg(long)]
        clean: bool,
    },

    /// Print the stored record for one entity.
    Show { id: String },

    /// List entity ids with stored records.
    List,

    /// Remove one record, or all records with --all.
    Clear {
        id: Option<String>,

        #[arg(long)]
        all: bool,
    },

    /// Load and validate the configuration, then print it.
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = HarvestConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.fixtures {
        config.browser.backend = BackendKind::Fixture;
        config.browser.fixture_dir = Some(dir);
        config.validate()?;
    }

    match cli.command {
        Commands::Run {
            ids,
            ids_file,
            index,
            item,
            index_marker,
            workers,
            clean,
        } => {
            let mut entities: Vec<EntityId> = ids.into_iter().map(EntityId::new).collect();
            if let Some(path) = ids_file {
                let content = std::fs::read_to_string(&path)?;
                entities.extend(
                    content
                        .lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty() && !l.starts_with('#'))
                        .map(EntityId::from),
                );
            }
            if let (Some(index), Some(item)) = (index, item) {
                let marker = index_marker.unwrap_or_else(|| item.clone());
                let found = discover(&config, &index, &marker, &item).await?;
                eprintln!("Discovered {} entities at {index}", found.len());
                for id in found {
                    if !entities.contains(&id) {
                        entities.push(id);
                    }
                }
            }
            if entities.is_empty() {
                anyhow::bail!("no entity ids given");
            }
            if let Some(workers) = workers {
                config.batch.workers = workers.max(1);
            }
            if clean {
                config.batch.clean_before_run = true;
            }
            run(&config, &entities).await?;
        }
        Commands::Show { id } => {
            let store = config.store()?;
            match store.get(&EntityId::new(id.clone()))? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record.fields)?),
                None => anyhow::bail!("no record for {id}"),
            }
        }
        Commands::List => {
            for id in config.store()?.ids()? {
                println!("{id}");
            }
        }
        Commands::Clear { id, all } => {
            let store = config.store()?;
            let removed = match (id, all) {
                (Some(id), _) => store.clear(Some(&EntityId::new(id)))?,
                (None, true) => store.clear(None)?,
                (None, false) => anyhow::bail!("give an id or --all"),
            };
            eprintln!("Removed {removed} record(s)");
        }
        Commands::Validate => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn discover(
    config: &HarvestConfig,
    index: &str,
    marker: &str,
    item: &str,
) -> anyhow::Result<Vec<EntityId>> {
    let manager = config.session_manager()?;
    let mut session = manager.create().await?;
    let found = discover_ids(
        &mut session,
        &config.navigator(),
        index,
        &Selector::css(marker),
        &Selector::css(item),
        config.locator_policy(),
    )
    .await;
    manager.close(session).await;
    Ok(found?)
}

async fn run(config: &HarvestConfig, entities: &[EntityId]) -> anyhow::Result<()> {
    let (tx, mut rx) = progress::channel();
    let orchestrator = Orchestrator::new(
        Arc::new(config.session_manager()?),
        config.address.clone(),
        config.readiness_marker.clone(),
        config.pipeline()?,
        config.store()?,
    )
    .with_navigator(config.navigator())
    .with_locator_policy(config.locator_policy())
    .with_settings(config.orchestrator_settings())
    .with_progress(tx);

    let stop = StopSignal::new();
    let on_interrupt = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing the current entity");
            on_interrupt.stop();
        }
    });

    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            if let BatchEventKind::EntityFinished {
                entity, succeeded, ..
            } = &event.event
            {
                let mark = if *succeeded { "ok" } else { "FAILED" };
                eprintln!("[{}] {entity}: {mark}", event.seq);
            }
        }
    });

    let report = orchestrator.run_batch(entities, &stop).await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(reason) = &report.aborted {
        anyhow::bail!("batch aborted: {reason}");
    }
    Ok(())
}
