//! Journey runner. Replays a recorded event script through the journey
//! engine with in-memory ports and a file-backed journey store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use campaign_core::config::AppConfig;
use campaign_journey::clock::ManualClock;
use campaign_journey::memory::MemoryPorts;
use campaign_journey::{
    CompletionRecord, FileBackend, Journey, JourneyBackend, JourneyOrchestrator, Profile,
    TrackedEvent,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "journey-runner")]
#[command(about = "Replay analytics events through the journey engine")]
#[command(version)]
struct Cli {
    /// TOML configuration file (environment variables still apply)
    #[arg(long, env = "JOURNEY_RUNNER_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay an event script and print the resulting journeys
    Run {
        /// JSON array of campaign definitions
        #[arg(long)]
        campaigns: PathBuf,

        /// JSON array of tracked events
        #[arg(long)]
        events: PathBuf,

        /// User for events that don't name one
        #[arg(long, default_value = "user-1", env = "JOURNEY_RUNNER_DISTINCT_ID")]
        distinct_id: String,

        /// Segments the user belongs to
        #[arg(long, value_delimiter = ',')]
        segments: Vec<String>,

        /// Journey store file (overrides config)
        #[arg(long)]
        store: Option<String>,
    },
    /// Check campaign definitions without running them
    Validate {
        #[arg(long)]
        campaigns: PathBuf,
    },
    /// Print the contents of a journey store file
    Inspect {
        #[arg(long)]
        store: Option<String>,
    },
}

#[derive(Serialize)]
struct Report {
    active_journeys: Vec<Journey>,
    ledger: Vec<CompletionRecord>,
    presented: Vec<String>,
    host_calls: Vec<(String, Value)>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the report.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "journey_runner=info,campaign_journey=info".into()),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = AppConfig::load_from(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    info!(
        node_id = %config.node_id,
        store = %config.store.path,
        enabled = config.journey.enabled,
        "Configuration loaded"
    );

    match cli.command {
        Command::Run {
            campaigns,
            events,
            distinct_id,
            segments,
            store,
        } => {
            let mut config = config;
            if let Some(store) = store {
                config.store.path = store;
            }
            run(config, &campaigns, &events, &distinct_id, segments).await
        }
        Command::Validate { campaigns } => validate(&campaigns),
        Command::Inspect { store } => inspect(store.unwrap_or(config.store.path)).await,
    }
}

async fn run(
    config: AppConfig,
    campaigns: &Path,
    events: &Path,
    distinct_id: &str,
    segments: Vec<String>,
) -> anyhow::Result<()> {
    let raw_campaigns: Vec<Value> = read_json(campaigns)?;
    let mut events: Vec<TrackedEvent> = read_json(events)?;
    for event in &mut events {
        if event.distinct_id.is_empty() {
            event.distinct_id = distinct_id.to_string();
        }
    }
    events.sort_by_key(|e| e.timestamp);

    // Replay on the script's own timeline.
    let start = events.first().map(|e| e.timestamp).unwrap_or_else(Utc::now);
    let clock = Arc::new(ManualClock::new(start));
    let profile = Profile {
        campaigns: raw_campaigns,
        segments,
        ..Default::default()
    };
    let ports = MemoryPorts::new(distinct_id, profile, clock.clone());
    let backend: Arc<dyn JourneyBackend> = Arc::new(FileBackend::new(&config.store.path));
    let orchestrator = JourneyOrchestrator::new(config.journey.clone(), ports.ports(), backend)
        .with_clock(clock.clone());
    orchestrator
        .initialize()
        .await
        .context("failed to initialize journey orchestrator")?;

    let total = events.len();
    for event in events {
        clock.set(event.timestamp);
        ports
            .events
            .record(&event.name, &event.distinct_id, event.timestamp);
        orchestrator.resume_due().await?;
        info!(event = %event.name, distinct_id = %event.distinct_id, at = %event.timestamp, "Replaying event");
        orchestrator.handle_event(event).await?;
        orchestrator.idle().await?;
    }
    orchestrator.resume_due().await?;
    orchestrator.idle().await?;

    let report = Report {
        active_journeys: orchestrator.get_active_journeys(distinct_id),
        ledger: orchestrator.ledger(),
        presented: ports.presenter.presented(),
        host_calls: ports.host.calls(),
    };
    info!(
        events = total,
        active = report.active_journeys.len(),
        completed = report.ledger.len(),
        "Replay finished"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);

    orchestrator.shutdown().await;
    Ok(())
}

fn validate(campaigns: &Path) -> anyhow::Result<()> {
    let profile = Profile {
        campaigns: read_json(campaigns)?,
        ..Default::default()
    };
    let (valid, errors) = profile.parse_campaigns();
    for campaign in &valid {
        println!("ok       {} (v{}, {} nodes)", campaign.id, campaign.version, campaign.nodes.len());
    }
    for error in &errors {
        println!("invalid  {error}");
    }
    if !errors.is_empty() {
        anyhow::bail!("{} of {} campaigns are invalid", errors.len(), valid.len() + errors.len());
    }
    Ok(())
}

async fn inspect(path: String) -> anyhow::Result<()> {
    let snapshot = FileBackend::new(&path)
        .load()
        .await
        .with_context(|| format!("failed to read journey store {path}"))?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}
