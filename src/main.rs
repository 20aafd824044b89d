//! Meta Allocator - Main Entry Point
//!
//! Paper-trading decision loop over a recorded snapshot feed, offline
//! pretraining from history, and a status view of the persisted state.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use meta_allocator::allocation::GroupTable;
use meta_allocator::config::Config;
use meta_allocator::engine::{
    restore_trainer, ControlCommand, DecisionLoop, Learner, PaperDispatcher,
};
use meta_allocator::history::{load_history, pretrain, reconstruct_transitions};
use meta_allocator::market::JsonlFeed;
use meta_allocator::persistence::PersistenceManager;
use meta_allocator::policy::ParameterStore;
use meta_allocator::replay::SharedReplay;
use meta_allocator::state::STATE_DIM;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Meta Allocator CLI
#[derive(Parser)]
#[command(name = "meta-allocator")]
#[command(version, about = "Learned risk-budget allocation across option strategy groups")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the decision loop against a JSON-lines snapshot feed (default)
    Run {
        /// Path to the snapshot feed
        #[arg(short, long, default_value = "data/snapshots.jsonl")]
        feed: String,
    },

    /// Reconstruct transitions from history and pretrain offline
    Pretrain {
        /// Path to the JSON-lines history file
        #[arg(long)]
        history: String,

        /// Number of offline learning steps
        #[arg(short, long, default_value = "10000")]
        steps: usize,
    },

    /// Show checkpoints and recent risk events from the database
    Status {
        /// Path to SQLite database (default: data/allocator.db)
        #[arg(short, long, default_value = "data/allocator.db")]
        db: String,

        /// Number of checkpoints and events to list
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    match cli.command {
        Some(Commands::Pretrain { history, steps }) => run_pretrain(&history, steps).await,
        Some(Commands::Status { db, limit }) => show_status(&db, limit),
        Some(Commands::Run { feed }) => run_allocator(&feed).await,
        None => run_allocator("data/snapshots.jsonl").await,
    }
}

/// Load and validate configuration; any failure aborts startup.
fn load_config() -> Result<Config> {
    let config = Config::load()?;
    config.validate().context("Invalid configuration")?;
    log_config(&config);
    Ok(config)
}

async fn run_allocator(feed_path: &str) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║       Meta Allocator v{} - Paper Allocation              ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    let config = load_config()?;
    let groups = GroupTable::from_config(&config.groups)?;

    let persistence = Arc::new(
        PersistenceManager::new(&config.persistence.db_path)
            .context("Failed to initialize persistence database")?,
    );

    let trainer = restore_trainer(&config, &groups, Some(persistence.as_ref()));
    let params = Arc::new(ParameterStore::new(trainer.current_snapshot()));

    let replay = SharedReplay::new(config.replay.clone()).with_dimensions(STATE_DIM, groups.len());
    let archived = persistence.load_transitions(config.replay.capacity, groups.version())?;
    if !archived.is_empty() {
        let restored = replay.extend(archived)?;
        info!("📂 [PERSISTENCE] Restored {} transitions into replay", restored);
    }

    let (transition_tx, transition_rx) = mpsc::channel(config.learning.update_every.max(1) * 64);
    let learner = Learner::new(trainer, replay, params.clone(), &config, groups.version())
        .with_persistence(persistence.clone());
    let learner_handle = tokio::spawn(learner.run(transition_rx));

    let feed = JsonlFeed::open(feed_path).await?;
    let dispatcher = PaperDispatcher::new(&groups);
    let decision_loop = DecisionLoop::new(&config, groups, params, feed, dispatcher, transition_tx)?
        .with_persistence(persistence.clone());

    // Operator acknowledgment: type `resume` on stdin.
    let (control_tx, control_rx) = mpsc::channel(8);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            match line.trim() {
                "resume" => {
                    if control_tx.blocking_send(ControlCommand::Resume).is_err() {
                        break;
                    }
                }
                "" => {}
                other => warn!("Unknown command '{}', expected 'resume'", other),
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        shutdown_tx.send(true).ok();
    });

    let metrics = decision_loop.run(control_rx, shutdown_rx).await;

    // The loop owned the only transition sender; the learner now drains and stops.
    let summary = learner_handle.await.context("Learner task panicked")??;

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!(
        "📊 Ticks: {} | Dispatched: {} | Overrides: {} | Skipped: {} | Fallbacks: {}",
        metrics.ticks, metrics.dispatched, metrics.overrides, metrics.skipped, metrics.fallbacks
    );
    info!(
        "🧠 Transitions: {} sent, {} dropped | Updates: {} committed, {} discarded | Checkpoints: {}",
        metrics.transitions_sent,
        metrics.transitions_dropped,
        summary.committed_updates,
        summary.discarded_updates,
        summary.checkpoints
    );
    if summary.halted {
        error!("🚨 Learning was halted by repeated divergence during this run");
    }

    Ok(())
}

async fn run_pretrain(history_path: &str, steps: usize) -> Result<()> {
    info!("🧠 Offline pretraining from {}", history_path);

    let config = load_config()?;
    let groups = GroupTable::from_config(&config.groups)?;
    let persistence = PersistenceManager::new(&config.persistence.db_path)
        .context("Failed to initialize persistence database")?;

    let records = load_history(history_path)?;
    let transitions = reconstruct_transitions(&records, &config, &groups)?;
    anyhow::ensure!(
        !transitions.is_empty(),
        "history produced no transitions; need at least two consecutive invested ticks"
    );

    if config.persistence.archive_transitions {
        let archived = persistence.archive_transitions(&transitions)?;
        info!("💾 Archived {} historical transitions", archived);
    }

    let replay = SharedReplay::new(config.replay.clone()).with_dimensions(STATE_DIM, groups.len());
    replay.extend(transitions)?;

    let mut trainer = restore_trainer(&config, &groups, Some(&persistence));
    let (trainer, report) = tokio::task::spawn_blocking(move || {
        let report = pretrain(&mut trainer, &replay, steps);
        (trainer, report)
    })
    .await
    .context("Pretraining task panicked")?;

    info!(
        "🧠 Pretraining finished: {} committed, {} discarded{}",
        report.committed,
        report.discarded,
        if report.halted { " (halted)" } else { "" }
    );

    if report.committed > 0 {
        let checkpoint = trainer.checkpoint(groups.version());
        persistence.save_checkpoint(&checkpoint)?;
        info!(
            "💾 [CHECKPOINT] Saved v{} at step {}",
            checkpoint.version, checkpoint.training_step
        );
    } else {
        warn!("No updates committed, checkpoint not written");
    }

    Ok(())
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "allocator.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(_guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("meta_allocator=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!(
        "   Groups: {} (version {})",
        config.groups.groups.len(),
        config.groups.groups_version
    );
    for group in &config.groups.groups {
        info!("     {:<16} cap {:.2}  {}", group.id, group.max_allocation, group.label);
    }
    info!(
        "   Tick: every {}s, snapshot timeout {}s",
        config.schedule.tick_interval_secs, config.schedule.snapshot_timeout_secs
    );
    info!(
        "   Limits: IV pct {:.2}, |GEX| {:.2e}, |delta| {:.2}, daily loss {}, leverage {}x",
        config.risk.max_volatility_percentile,
        config.risk.max_abs_gamma_exposure,
        config.risk.max_abs_normalized_delta,
        config.risk.max_daily_loss,
        config.risk.max_leverage
    );
    info!(
        "   Reward: drawdown x{}, exposure x{}, window {}",
        config.reward.drawdown_penalty, config.reward.exposure_penalty, config.reward.drawdown_window
    );
    info!(
        "   Learning: hidden {:?}, gamma {}, tau {}, batch {}, every {} transitions",
        config.learning.hidden_sizes,
        config.learning.gamma,
        config.learning.tau,
        config.learning.batch_size,
        config.learning.update_every
    );
    info!(
        "   Replay: capacity {}, alpha {}, beta {} -> 1",
        config.replay.capacity, config.replay.alpha, config.replay.beta_start
    );
}

/// Show persisted checkpoints, archive size and recent risk events.
fn show_status(db_path: &str, limit: usize) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              META ALLOCATOR STATUS                         ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        println!("   The allocator has not been started yet, or the database path is incorrect.");
        return Ok(());
    }

    let persistence = PersistenceManager::new(db_path)?;

    let checkpoints = persistence.list_checkpoints(limit)?;
    println!("\n💾 Checkpoints");
    if checkpoints.is_empty() {
        println!("   (none)");
    }
    for cp in &checkpoints {
        println!(
            "   ├─ v{:<6} step {:<8} features v{} groups v{}  {}  ({} bytes)",
            cp.version,
            cp.training_step,
            cp.feature_version,
            cp.groups_version,
            cp.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            cp.payload_bytes
        );
    }

    println!("\n🔁 Transition archive");
    println!("   └─ {} stored", persistence.transition_count()?);

    let events = persistence.recent_risk_events(limit)?;
    println!("\n🚨 Recent risk events");
    if events.is_empty() {
        println!("   (none)");
    }
    for event in &events {
        println!(
            "   ├─ {}  [{}] {}: {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            event.severity.as_str(),
            event.kind_label(),
            event.message
        );
    }

    Ok(())
}
