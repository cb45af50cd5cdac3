//! fleetpace CLI entry point.

use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

mod cli;

use cli::{Cli, Command};
use fleetpace::config::Config;
use fleetpace::{
    ActionError, ActionExecutor, ActionKind, ActionOutcome, ActionRunner, ActionSpec, Bucket, BucketCounts, Campaign,
    CampaignId, Controller, DistributionScheduler, EngagementPost, Identity, IdentityId, IdentityLocks, MemoryStore, PostId,
    RandomSelector, RateLimitLedger, ReconcileMode, Reconciler, ResourceRef, Store, StoreSessionChecker,
};

fn setup_logging(log_dir: &Path) -> Result<()> {
    fs::create_dir_all(log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("fleetpace.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    setup_logging(&config.log_dir()).context("Failed to setup logging")?;

    info!("Starting with config from: {:?}", cli.config);

    match cli.command {
        Some(Command::Config) => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        Some(Command::Limits { identity }) => show_limits(&config, identity.as_deref(), cli.verbose).await,
        Some(Command::Unblock { identity }) => {
            let ledger = open_ledger(&config)?;
            let removed = ledger.clear(&IdentityId::new(identity.as_str())).await?;
            if removed == 0 {
                println!("{} {} had no active blocks", "○".yellow(), identity);
            } else {
                println!("{} Lifted {} block(s) on {}", "✓".green(), removed, identity.cyan());
            }
            Ok(())
        }
        Some(Command::Compact) => {
            let ledger = open_ledger(&config)?;
            let kept = ledger.compact().await?;
            println!(
                "{} Compacted {} ({} active block(s) kept)",
                "✓".green(),
                config.ledger_path().display(),
                kept
            );
            Ok(())
        }
        Some(Command::Simulate {
            identities,
            target,
            sync,
        }) => simulate(&config, identities, target, sync).await,
        Some(Command::Serve {
            identities,
            target,
            sync,
        }) => serve(&config, identities, target, sync).await,
        None => show_limits(&config, None, cli.verbose).await,
    }
}

fn open_ledger(config: &Config) -> Result<RateLimitLedger> {
    fs::create_dir_all(&config.data_dir).context("Failed to create data directory")?;
    let path = config.ledger_path();
    RateLimitLedger::open(&path).context(format!("Failed to open ledger {}", path.display()))
}

async fn show_limits(config: &Config, identity: Option<&str>, verbose: bool) -> Result<()> {
    let ledger = open_ledger(config)?;
    let entries: Vec<_> = ledger
        .entries()
        .await
        .into_iter()
        .filter(|entry| identity.is_none_or(|id| entry.identity.0 == id))
        .collect();

    if entries.is_empty() {
        println!("{} No active rate-limit blocks", "✓".green());
        return Ok(());
    }

    let now = Utc::now();
    println!("{} active block(s):", entries.len().to_string().bold());
    for entry in entries {
        let remaining = (entry.until - now).num_minutes().max(0);
        println!(
            "  {} {} until {} ({}m left)",
            entry.identity.0.cyan(),
            entry.kind.to_string().yellow(),
            entry.until.format("%Y-%m-%d %H:%M:%S UTC"),
            remaining
        );
    }
    if verbose {
        println!("Ledger: {}", config.ledger_path().display());
    }
    Ok(())
}

/// Executor for `simulate`: every action succeeds after a short pause.
struct SimulatedExecutor;

#[async_trait]
impl ActionExecutor for SimulatedExecutor {
    async fn execute(&self, identity: &Identity, action: &ActionSpec) -> Result<ActionOutcome, ActionError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        info!("simulated {} {} by {}", action.kind, action.resource, identity.id);
        Ok(ActionOutcome::default())
    }
}

fn reconcile_mode(sync: bool) -> ReconcileMode {
    if sync {
        ReconcileMode::Sync
    } else {
        ReconcileMode::Activation
    }
}

/// In-memory fleet with one campaign and one post published a day ago.
fn simulated_store(identities: usize, target: u32) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for i in 0..identities {
        store.put_identity(Identity::new(format!("sim-{}", i)));
    }
    store.put_campaign(Campaign {
        id: CampaignId(1),
        name: "simulated".to_string(),
        resource: Some(ResourceRef::new("sim/channel")),
        target_participants: target,
        active: true,
    });
    // Published a day ago, so every slot is already due.
    store.put_post(EngagementPost {
        id: PostId(1),
        campaign: CampaignId(1),
        resource: ResourceRef::new("sim/channel/1"),
        action: ActionKind::View,
        published_at: Utc::now() - chrono::Duration::hours(25),
        theory: BucketCounts::new(3, 2, 1, 1),
        fact: BucketCounts::default(),
    });
    store
}

async fn simulate(config: &Config, identities: usize, target: u32, sync: bool) -> Result<()> {
    let store = simulated_store(identities, target);
    let runner = ActionRunner::new(
        store.clone(),
        IdentityLocks::new(),
        Arc::new(RateLimitLedger::in_memory()),
        Arc::new(SimulatedExecutor),
        Arc::new(StoreSessionChecker::new(store.clone())),
    );
    let selector = Arc::new(RandomSelector::from_seed(config.seed));

    let mode = reconcile_mode(sync);
    println!("{} Reconciling ({:?}) toward {} participants...", "→".blue(), mode, target);
    let reconciler = Reconciler::new(runner.clone(), selector.clone(), config.reconciler.clone());
    let report = reconciler.run(mode).await?;
    println!(
        "  {} joined, {} failed, {} skipped; participation now {}",
        report.joins_succeeded.to_string().green(),
        report.joins_failed.to_string().red(),
        report.joins_skipped,
        store.participation_count(CampaignId(1)).await?
    );

    println!("{} Scheduling post-1...", "→".blue());
    let scheduler = DistributionScheduler::new(runner, selector, config.scheduler.clone());
    let schedule = scheduler.schedule_post(PostId(1)).await?;
    scheduler.drain().await;
    println!(
        "  {} planned ({} immediate, {} unfilled)",
        schedule.planned.total(),
        schedule.immediate,
        schedule.unfilled
    );
    if let Some(post) = store.post(PostId(1)).await? {
        for bucket in Bucket::ALL {
            println!("  {:>5}: {}/{}", bucket.to_string(), post.fact.get(bucket), post.theory.get(bucket));
        }
    }
    Ok(())
}

/// Answer JSON-line control requests on stdin while sweeps run in the background.
async fn serve(config: &Config, identities: usize, target: u32, sync: bool) -> Result<()> {
    let store = simulated_store(identities, target);
    let ledger = open_ledger(config)?;
    let runner = ActionRunner::new(
        store.clone(),
        IdentityLocks::new(),
        Arc::new(ledger),
        Arc::new(SimulatedExecutor),
        Arc::new(StoreSessionChecker::new(store)),
    );
    let controller = Controller::from_config(config, runner);
    let sweeps = controller.spawn_sweeps(reconcile_mode(sync));
    eprintln!(
        "{} Serving control requests on stdin ({} identities, sweep every {}s)",
        "→".blue(),
        identities,
        config.reconciler.interval_secs
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read request")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = controller.handle_line(&line).await;
                stdout.write_all(response.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    controller.shutdown().await;
    sweeps.await.context("Sweep task panicked")?;
    Ok(())
}
