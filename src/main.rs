mod config;
mod data;
mod execution;
mod monitoring;
mod pipelines;
#[cfg(test)]
mod test_support;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use config::{Config, EnvConfig};
use data::contract::EthersLedger;
use data::ledger::{Ledger, TxSubmitter};
use data::weather::{OracleClient, WeatherProvider};
use execution::admin::AdminGate;
use execution::outage::{OutageController, OutageGate, OutagePolicy};
use execution::persistence::{KeeperDatabase, SharedStore};
use execution::queue::{Queue, Worker};
use execution::simulator::DryRunLedger;
use execution::types::{EnqueueResult, QueueName};
use monitoring::logger::EventJournal;
use pipelines::creation::{CreationScheduler, MarketCreator};
use pipelines::settlement::SettlementEngine;

#[derive(Parser, Debug)]
#[command(name = "market-keeper")]
#[command(about = "Creates and settles daily weather prediction markets")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, env = "KEEPER_CONFIG", default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scheduler, settlement poll, outage monitor and workers
    Run,
    /// Show outage state, pause flag and queue depths
    Status,
    /// List dead-lettered jobs
    DeadLetters {
        #[arg(long)]
        queue: Option<QueueName>,
    },
    /// Put a dead-lettered job back on its queue
    Replay { id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    let env_config = EnvConfig::load()?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config, env_config).await,
        Command::Status => status(&config, &env_config),
        Command::DeadLetters { queue } => dead_letters(&config, &env_config, queue),
        Command::Replay { id } => replay(&config, &env_config, id),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "market_keeper=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn open_database(config: &Config, env_config: &EnvConfig) -> Result<KeeperDatabase> {
    let path = env_config.database_path(config);
    tracing::info!("Opening queue database: {}", path);
    KeeperDatabase::new(path)
}

async fn run(config: Config, env_config: EnvConfig) -> Result<()> {
    tracing::info!("🚀 Market keeper starting...");

    let dry_run = env_config.dry_run(&config);
    tracing::info!("Dry run mode: {}", dry_run);

    let db = open_database(&config, &env_config)?;
    let store: Arc<dyn SharedStore> = Arc::new(db.clone());

    let journal = if config.monitoring.csv_logging {
        tracing::info!("Event journal: {}", config.monitoring.csv_log_path);
        Some(Arc::new(EventJournal::new(config.monitoring.csv_log_path.clone())?))
    } else {
        None
    };

    let provider: Arc<dyn WeatherProvider> = Arc::new(OracleClient::new(
        env_config.oracle_api_url()?.to_string(),
        env_config.oracle_api_key.clone(),
        Duration::from_secs(config.outage.probe_timeout_secs),
    )?);

    let ledger: Arc<dyn Ledger> = if dry_run {
        Arc::new(DryRunLedger::new())
    } else {
        let creds = env_config.chain_credentials()?;
        Arc::new(
            EthersLedger::connect(
                creds.rpc_url,
                creds.private_key,
                creds.contract_address,
                config.chain.stake_decimals,
            )
            .await?,
        )
    };

    let admin = AdminGate::new(store.clone());
    let submitter = Arc::new(TxSubmitter::new(
        ledger,
        admin.clone(),
        Duration::from_secs(config.chain.confirmation_timeout_secs),
        Duration::from_millis(config.chain.receipt_poll_ms),
    ));

    let make_queue = |name: QueueName| {
        let queue = Queue::new(
            name,
            db.clone(),
            config.queue.retry_policy(),
            config.queue.lease_ttl(),
            config.queue.dedupe_retention(),
        );
        match &journal {
            Some(journal) => queue.with_journal(journal.clone()),
            None => queue,
        }
    };
    let creation_queue = make_queue(QueueName::MarketCreation);
    let settlement_queue = make_queue(QueueName::Settlement);

    let settle_interval = Duration::from_secs(config.settlement.poll_interval_secs);
    let idle_poll = Duration::from_millis(config.queue.idle_poll_ms);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    if config.outage.enabled {
        let mut controller = OutageController::new(
            provider.clone(),
            store.clone(),
            OutagePolicy {
                gate_on_degraded: config.outage.gate_on_degraded,
            },
        )?;
        if let Some(journal) = &journal {
            controller = controller.with_journal(journal.clone());
        }
        let interval = Duration::from_secs(config.outage.poll_interval_secs);
        handles.push(tokio::spawn(Arc::new(controller).run(interval, shutdown_rx.clone())));
    } else {
        tracing::warn!("Outage monitor disabled, settlement will not be gated on provider health");
    }

    // Creation stays at one in flight so slots land in order
    let creator = Arc::new(MarketCreator::new(submitter.clone(), settle_interval));
    handles.push(
        Worker::new(creation_queue.clone(), 1, creator)
            .with_idle_poll(idle_poll)
            .spawn(shutdown_rx.clone()),
    );

    let engine = Arc::new(SettlementEngine::new(
        submitter,
        admin.clone(),
        OutageGate::new(store.clone()),
        provider,
        settle_interval,
    ));
    handles.push(
        Worker::new(settlement_queue.clone(), config.settlement.concurrency, engine.clone())
            .with_idle_poll(idle_poll)
            .spawn(shutdown_rx.clone()),
    );
    handles.push(tokio::spawn(engine.run_poll(
        settlement_queue,
        settle_interval,
        shutdown_rx.clone(),
    )));

    let scheduler = Arc::new(CreationScheduler::new(
        creation_queue,
        admin,
        config.creation.clone(),
    )?);
    if let Some(next) = scheduler.next_fire(Utc::now()) {
        tracing::info!("Next market creation batch at {}", next);
    }
    handles.push(tokio::spawn(scheduler.run(shutdown_rx.clone())));

    handles.push(tokio::spawn(purge_loop(
        db.clone(),
        config.queue.dedupe_retention(),
        shutdown_rx,
    )));

    tracing::info!("✅ Keeper running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down, waiting for in-flight jobs...");
    shutdown_tx.send(true).ok();

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!("Task ended abnormally: {}", e);
        }
    }

    tracing::info!("👋 Keeper stopped");
    Ok(())
}

/// Forget completed dedupe keys once they age past the retention window
async fn purge_loop(db: KeeperDatabase, retention: chrono::Duration, mut shutdown: watch::Receiver<bool>) {
    loop {
        match db.purge_completed(Utc::now() - retention) {
            Ok(0) => {}
            Ok(purged) => tracing::debug!("Purged {} completed job records", purged),
            Err(e) => tracing::warn!("Failed to purge completed jobs: {:#}", e),
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
            _ = shutdown.changed() => break,
        }
    }
}

fn status(config: &Config, env_config: &EnvConfig) -> Result<()> {
    let db = open_database(config, env_config)?;
    let store: Arc<dyn SharedStore> = Arc::new(db.clone());

    let admin = AdminGate::new(store.clone()).config()?;
    let outage = OutageGate::new(store).is_outage()?;

    println!("=== Market Keeper Status ===");
    println!("Provider outage: {}", if outage { "YES (settlement gated)" } else { "no" });
    match admin.paused_reason {
        Some(reason) if admin.settler_paused => println!("Settler paused: yes ({})", reason),
        _ => println!("Settler paused: {}", if admin.settler_paused { "yes" } else { "no" }),
    }
    println!();

    for queue in [QueueName::MarketCreation, QueueName::Settlement] {
        let depth = db.queue_depth(queue)?;
        println!(
            "{:<16} queued={} running={} dead={}",
            queue, depth.queued, depth.running, depth.dead
        );
    }
    Ok(())
}

fn dead_letters(config: &Config, env_config: &EnvConfig, queue: Option<QueueName>) -> Result<()> {
    let db = open_database(config, env_config)?;
    let letters = db.list_dead_letters(queue)?;

    if letters.is_empty() {
        println!("No dead-lettered jobs");
        return Ok(());
    }

    for letter in letters {
        println!(
            "#{} [{}] key={} attempts={} failed_at={}",
            letter.id,
            letter.queue,
            letter.dedupe_key.as_deref().unwrap_or("-"),
            letter.attempts,
            letter.failed_at.to_rfc3339()
        );
        println!("    error: {}", letter.error);
        println!("    payload: {}", letter.payload);
    }
    Ok(())
}

fn replay(config: &Config, env_config: &EnvConfig, id: i64) -> Result<()> {
    let db = open_database(config, env_config)?;

    match db
        .replay_dead_letter(id, Utc::now())?
        .with_context(|| format!("No dead letter with id {}", id))?
    {
        EnqueueResult::Enqueued(job_id) => println!("Dead letter #{} requeued as job {}", id, job_id),
        EnqueueResult::Duplicate => println!("Dead letter #{} kept, an identical job is already pending", id),
    }
    Ok(())
}
