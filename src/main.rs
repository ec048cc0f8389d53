mod signals;

use clap::Parser;
use loadmgr::config::LoadMgrConfig;
use loadmgr::deadlock::DeadlockDetector;
use loadmgr::fee_track::{LoadFeeTrack, LoggingFeeListener};
use loadmgr::job_queue::JobQueue;
use loadmgr::{Collaborators, LoadManager, LoadManagerSettings, ProcessClock, Stoppable};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Run the load manager watchdog: throttle the local fee under overload and
/// abort the process if it deadlocks.
#[derive(Parser, Debug)]
#[command(name = "loadmgr", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "loadmgr.toml")]
    config: PathBuf,

    /// Tick period in milliseconds (overrides config)
    #[arg(long)]
    period_ms: Option<u64>,

    /// Stall length in seconds that aborts the process (overrides config)
    #[arg(long)]
    fatal_stall_secs: Option<i64>,

    /// Synthetic jobs submitted per second (overrides config, 0 disables)
    #[arg(long)]
    arrivals_per_sec: Option<u64>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (tick decisions, lifecycle transitions)
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply_overrides(&self, config: &mut LoadMgrConfig) {
        if let Some(period_ms) = self.period_ms {
            config.watchdog.period_ms = period_ms;
        }
        if let Some(fatal) = self.fatal_stall_secs {
            config.watchdog.fatal_stall_secs = fatal;
        }
        if let Some(arrivals) = self.arrivals_per_sec {
            config.queue.arrivals_per_sec = arrivals;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "loadmgr=debug"
    } else {
        "loadmgr=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_thread_names(true)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match LoadMgrConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    cli.apply_overrides(&mut config);
    if let Err(e) = config.validate() {
        tracing::error!("{e}");
        return ExitCode::FAILURE;
    }

    if cli.dry_run {
        match toml::to_string_pretty(&config) {
            Ok(text) => {
                println!("Dry run mode: config validated, not running.\n");
                print!("{text}");
                return ExitCode::SUCCESS;
            }
            Err(e) => {
                tracing::error!("failed to render config: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: LoadMgrConfig) -> Result<(), Box<dyn std::error::Error>> {
    let clock = Arc::new(ProcessClock::new());
    let work_queue = Arc::new(JobQueue::new(config.queue.overload_threshold));
    let fees = Arc::new(LoadFeeTrack::new(config.fee.clone()));
    let listener = Arc::new(LoggingFeeListener::new(fees.clone()));

    let stopped = Arc::new(Notify::new());
    let mut manager = LoadManager::new(
        clock,
        Collaborators {
            work_queue: work_queue.clone(),
            fee_tracker: fees,
            listener,
        },
        Arc::new(signals::StoppedNotifier::new(stopped.clone())),
        LoadManagerSettings::from(&config.watchdog),
    )?;

    manager.on_start()?;
    tracing::info!(
        period_ms = config.watchdog.period_ms,
        fatal_stall_secs = config.watchdog.fatal_stall_secs,
        "load manager running"
    );

    let heartbeat = tokio::spawn(heartbeat_loop(
        manager.deadlock_detector(),
        Duration::from_secs(config.heartbeat.interval_secs),
        Duration::from_secs(config.watchdog.arm_after_secs),
    ));

    let load = (config.queue.arrivals_per_sec > 0).then(|| {
        tracing::info!(
            arrivals_per_sec = config.queue.arrivals_per_sec,
            service_per_sec = config.queue.service_per_sec,
            "synthetic load source enabled"
        );
        tokio::spawn(load_source(
            work_queue,
            config.queue.arrivals_per_sec,
            config.queue.service_per_sec,
        ))
    });

    let signal = signals::wait_for_shutdown().await?;
    tracing::info!(signal, "shutdown requested");
    heartbeat.abort();
    if let Some(load) = load {
        load.abort();
    }

    manager.on_stop();
    stopped.notified().await;

    let stats = manager.stats();
    // Dropping joins the watchdog thread; keep that off the async workers.
    tokio::task::spawn_blocking(move || drop(manager)).await?;

    tracing::info!(stats = %serde_json::to_string(&stats)?, "load manager stopped");
    Ok(())
}

/// Liveness check-in from the async runtime. Arms the detector once the
/// startup grace period has passed; a wedged runtime stops checking in and the
/// watchdog notices.
async fn heartbeat_loop(detector: Arc<DeadlockDetector>, interval: Duration, arm_after: Duration) {
    let armed_at = tokio::time::Instant::now() + arm_after;
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        detector.reset();
        if !detector.is_armed() && tokio::time::Instant::now() >= armed_at {
            detector.activate();
            tracing::info!("deadlock detector armed");
        }
    }
}

/// Feeds the job queue at a fixed rate so overload, and with it the fee
/// raise path, can be driven from config.
async fn load_source(queue: Arc<JobQueue>, arrivals_per_sec: u64, service_per_sec: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        let backlog = queue.pump(arrivals_per_sec, service_per_sec);
        tracing::debug!(backlog, "load source tick");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loadmgr::feedback::WorkQueue;

    #[test]
    fn test_cli_overrides_config() {
        let cli = Cli::parse_from(["loadmgr", "--period-ms", "250", "--fatal-stall-secs", "90"]);
        let mut config = LoadMgrConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.watchdog.period_ms, 250);
        assert_eq!(config.watchdog.fatal_stall_secs, 90);
        assert_eq!(cli.config, PathBuf::from("loadmgr.toml"));
    }

    #[test]
    fn test_cli_without_overrides_keeps_config() {
        let cli = Cli::parse_from(["loadmgr", "--dry-run"]);
        let mut config = LoadMgrConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config, LoadMgrConfig::default());
        assert!(cli.dry_run);
    }

    #[test]
    fn test_cli_arrivals_override() {
        let cli = Cli::parse_from(["loadmgr", "--arrivals-per-sec", "500"]);
        let mut config = LoadMgrConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.queue.arrivals_per_sec, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_source_drives_queue_into_overload() {
        let queue = Arc::new(JobQueue::new(100));
        let task = tokio::spawn(load_source(queue.clone(), 150, 100));

        // Ticks at t=0 and t=1 leave a backlog of 100: not yet overloaded.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(queue.backlog(), 100);
        assert!(!queue.is_overloaded());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(queue.backlog(), 150);
        assert!(queue.is_overloaded());
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_checks_in_and_arms() {
        let clock = Arc::new(ProcessClock::new());
        let detector = Arc::new(DeadlockDetector::new(clock, Default::default()));
        let task = tokio::spawn(heartbeat_loop(
            detector.clone(),
            Duration::from_secs(1),
            Duration::from_secs(3),
        ));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!detector.is_armed());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(detector.is_armed());
        task.abort();
    }
}
