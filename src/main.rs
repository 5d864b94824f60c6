use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use maestro::config::Config;
use maestro::{Coordinator, EngineEvent, Error, Result, SystemStatus};

/// Maestro - worker coordination and continuous optimization engine
#[derive(Parser, Debug)]
#[command(name = "maestro")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    MAESTRO_DEBUG=1     Enable debug logging (alternative to --debug)\n    MAESTRO_LOG=...     Full tracing filter directive")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.maestro/maestro.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run every coordination loop over simulated workers
    Run {
        /// Config file (defaults to ~/.maestro/maestro.toml)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Stop after this many seconds (runs until Ctrl-C otherwise)
        #[arg(long)]
        duration: Option<u64>,

        /// Print the final status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run one cycle of every loop and print the resulting status
    Status {
        /// Config file (defaults to ~/.maestro/maestro.toml)
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write a sample config to ~/.maestro/maestro.toml
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    maestro::log::init_with_debug(cli.debug);

    match cli.command {
        Command::Run {
            config,
            duration,
            json,
        } => run(load_config(config)?, duration, json).await,
        Command::Status { config, json } => status(load_config(config)?, json).await,
        Command::Init { force } => init(force),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(&path),
        None => Config::load(),
    }
}

async fn build(config: Config) -> Result<Coordinator> {
    if config.workers.is_empty() {
        return Err(Error::Validation(
            "no workers configured (run `maestro init` for a sample catalog)".to_string(),
        ));
    }
    Coordinator::builder(config)
        .with_simulated_workers()
        .build()
        .await
}

async fn run(config: Config, duration: Option<u64>, json: bool) -> Result<()> {
    let coordinator = build(config).await?;
    let mut events = coordinator.subscribe();

    info!(?duration, "maestro starting");
    coordinator.start_all().await;

    let deadline = async {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "failed to listen for Ctrl-C");
                }
            }
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => match event {
                Ok(event) => {
                    if !json {
                        print_event(&event);
                    }
                }
                Err(RecvError::Lagged(missed)) => warn!(missed, "event printer lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    coordinator.stop_all().await;
    print_status(&coordinator.status().await, json)
}

async fn status(config: Config, json: bool) -> Result<()> {
    let coordinator = build(config).await?;
    coordinator.run_all_cycles().await;
    print_status(&coordinator.status().await, json)
}

fn init(force: bool) -> Result<()> {
    let path = Config::config_path()?;
    let config = Config::init(&path, force)?;
    println!(
        "Wrote {} ({} workers, {} units)",
        path.display(),
        config.workers.len(),
        config.units.len()
    );
    Ok(())
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::Coordination(e) => {
            let workers: Vec<&str> = e.workers.iter().map(|w| w.as_str()).collect();
            println!("[coordination] {:?} {} {}", e.kind, workers.join(","), e.detail);
        }
        EngineEvent::WorkerActivated { worker } => println!("[scaler] activated {}", worker),
        EngineEvent::CapacityRaised { worker, capacity } => {
            println!("[scaler] {} capacity -> {:.2}", worker, capacity)
        }
        EngineEvent::OptimizationRecorded {
            unit,
            success_rate,
            improvement_score,
        } => println!(
            "[optimizer] {} success={:.2} improvement={:.3}",
            unit, success_rate, improvement_score
        ),
        EngineEvent::RecoveryScheduled { unit, action } => {
            println!("[recovery] {} -> {:?}", unit, action)
        }
        EngineEvent::UnitFlagged { unit } => println!("[recovery] {} flagged for review", unit),
        EngineEvent::CriticalError { message } => println!("[critical] {}", message),
        EngineEvent::ReflectionCompleted {
            patterns,
            insights,
            lessons,
        } => println!(
            "[reflection] patterns={} insights={} lessons={}",
            patterns, insights, lessons
        ),
        EngineEvent::ScalabilityEvaluated { .. }
        | EngineEvent::LoopStarted { .. }
        | EngineEvent::LoopStopped { .. } => {}
    }
}

fn print_status(status: &SystemStatus, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(status)?);
        return Ok(());
    }

    println!(
        "Workers: {} total, {} active, {} pending, {} inactive",
        status.total_workers, status.active_workers, status.pending_workers, status.inactive_workers
    );
    for (category, c) in &status.categories {
        println!(
            "  {:<12} {}/{} active, avg load {:.2}",
            category.as_str(),
            c.active,
            c.total,
            c.average_load
        );
    }
    if !status.overloaded_workers.is_empty() {
        let ids: Vec<&str> = status.overloaded_workers.iter().map(|w| w.as_str()).collect();
        println!("Overloaded: {}", ids.join(", "));
    }
    println!(
        "Scalability {:.2}, coordination efficiency {:.2}, performance stability {:.2}",
        status.scalability_index, status.coordination_efficiency, status.performance_stability
    );
    println!(
        "Units: {}, in review: {}, critical errors: {}",
        status.units,
        status.review_queue.len(),
        status.critical_errors
    );
    println!(
        "Knowledge: {} patterns, {} lessons, threshold adjustment {:+.2}, cooldown x{:.2}",
        status.patterns,
        status.lessons,
        status.bias.priority_threshold_adjustment,
        status.bias.cooldown_multiplier
    );
    if !status.recent_events.is_empty() {
        println!("Recent coordination:");
        for event in &status.recent_events {
            println!(
                "  {} {:?} {}",
                event.timestamp.format("%H:%M:%S"),
                event.kind,
                event.detail
            );
        }
    }
    Ok(())
}
