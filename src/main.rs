//! Binary entry point: wires the library's processors into a runnable
//! service, or runs one of the operator utility subcommands, using
//! `clap::Parser` and a `tokio` bootstrap.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use phoenix_sa_omf::config::{load_config_file, load_policy_file, ControlFilePolicy, Policy, ServiceConfig};
use phoenix_sa_omf::control_file::{self, ProfileHysteresis};
use phoenix_sa_omf::controller::AdaptiveController;
use phoenix_sa_omf::governance::{Governance, Processor};
use phoenix_sa_omf::pipeline::config::{FilterStrategy, PipelineConfig};
use phoenix_sa_omf::pipeline::MetricPipeline;
use phoenix_sa_omf::safety::SafetyMonitor;

#[derive(Parser)]
#[command(name = "phoenixd")]
#[command(version)]
#[command(about = "Self-adaptive metrics processing fabric")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the service: metric pipeline, adaptive controllers, safety
    /// monitor, and governance, until Ctrl-C.
    Run {
        #[arg(long, default_value = "phoenix.toml")]
        config: PathBuf,
        #[arg(long, default_value = "policy.toml")]
        policy: PathBuf,
    },
    /// Load and validate a policy file without starting the service.
    ValidatePolicy {
        #[arg(long, default_value = "policy.toml")]
        policy: PathBuf,
    },
    /// Load a config file and print the pipeline's resulting status.
    ConfigStatus {
        #[arg(long, default_value = "phoenix.toml")]
        config: PathBuf,
        /// Print as JSON instead of plain key/value lines.
        #[arg(long)]
        json: bool,
    },
}

/// Owns every long-running task's `JoinHandle` plus the token that cancels
/// them: owned tasks with a shutdown handle, not ambient background work.
struct ServiceHandle {
    cancel: CancellationToken,
    safety: Arc<SafetyMonitor>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ServiceHandle {
    async fn shutdown(self) {
        self.safety.stop();
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

fn build_pipeline_config(service: &ServiceConfig) -> PipelineConfig {
    let mut cfg = PipelineConfig::default();
    cfg.enabled = service.pipeline.enabled;
    cfg.priority_attribute = if service.pipeline.priority_attribute.is_empty() {
        cfg.priority_attribute
    } else {
        service.pipeline.priority_attribute.clone()
    };
    cfg.filter_strategy = match service.pipeline.filter_strategy.as_str() {
        "priority" => FilterStrategy::Priority,
        "topk" => FilterStrategy::Topk,
        "hybrid" => FilterStrategy::Hybrid,
        _ => cfg.filter_strategy,
    };
    cfg
}

/// Read-modify-write the control file with the Adaptive Controller's latest
/// effective output magnitude, deriving `optimization_profile` via
/// `hysteresis` from `cfg`'s thresholds.
fn update_control_file(
    path: &std::path::Path,
    hysteresis: &mut ProfileHysteresis,
    magnitude: f64,
    cfg: &ControlFilePolicy,
) -> phoenix_sa_omf::PhoenixResult<()> {
    let thresholds = control_file::ProfileThresholds {
        conservative_max_ts: cfg.conservative_max_ts,
        aggressive_min_ts: cfg.aggressive_min_ts,
    };
    control_file::update(path, |doc| {
        let next = hysteresis.next_profile(doc.optimization_profile, magnitude, &thresholds);
        if next != doc.optimization_profile {
            doc.trigger_reason = format!("effective_output_magnitude={magnitude:.2}");
            doc.last_profile_change_timestamp =
                std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs();
        }
        doc.optimization_profile = next;
        doc.thresholds = thresholds.clone();
        doc.current_metrics.full_ts = magnitude;
    })?;
    Ok(())
}

async fn run_service(config_path: PathBuf, policy_path: PathBuf) -> phoenix_sa_omf::PhoenixResult<()> {
    let service: ServiceConfig = load_config_file(&config_path).unwrap_or_default();
    let policy: Policy = load_policy_file(&policy_path).unwrap_or_default();

    let pipeline = Arc::new(MetricPipeline::new(build_pipeline_config(&service)));
    let governance = Arc::new(Governance::new((&policy.governance).into()));
    let pipeline_as_processor: Arc<dyn Processor> = pipeline.clone();
    governance.register("metric-pipeline", &pipeline_as_processor);

    let safety = Arc::new(SafetyMonitor::new((&policy.safety).into()));
    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();
    tasks.push(Arc::clone(&safety).start());

    let mut controllers: Vec<AdaptiveController> = policy
        .controllers
        .iter()
        .map(|c| AdaptiveController::new(c.into()))
        .collect::<Result<_, _>>()?;

    if controllers.is_empty() {
        info!("no controllers configured in policy file, running pipeline + safety monitor only");
    }

    let control_cancel = cancel.clone();
    let control_governance = governance.clone();
    let control_safety = safety.clone();
    let control_file_policy = policy.control_file.clone();
    tasks.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
        let mut profile_state = control_file_policy.enabled.then(|| {
            let recovery_ticks = (control_file_policy.recovery_time_seconds / 5).max(1) as usize;
            (ProfileHysteresis::new(recovery_ticks), PathBuf::from(&control_file_policy.path))
        });
        loop {
            tokio::select! {
                _ = control_cancel.cancelled() => {
                    info!("adaptive control loop stopping");
                    return;
                }
                _ = interval.tick() => {
                    let level = control_safety.current_level();
                    for controller in &mut controllers {
                        // No live KPI source is wired up in this standalone
                        // binary (receivers are out of scope); ticks run
                        // with no measurement so the controller only reacts
                        // to safety-level escalation/suspension.
                        if let Err(e) = controller.tick_and_submit(None, level, &control_governance) {
                            warn!(error = %e, "controller tick refused");
                        }
                    }

                    if let Some((hysteresis, path)) = &mut profile_state {
                        let magnitude = controllers
                            .iter()
                            .filter_map(|c| c.effective_output_magnitude())
                            .fold(f64::NEG_INFINITY, f64::max);
                        if magnitude.is_finite() {
                            if let Err(e) = update_control_file(path, hysteresis, magnitude, &control_file_policy) {
                                warn!(error = %e, "control file update failed");
                            }
                        }
                    }
                }
            }
        }
    }));

    let handle = ServiceHandle { cancel, safety, tasks };

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal"),
        Err(e) => warn!(error = %e, "failed to install ctrl-c handler, shutting down anyway"),
    }
    handle.shutdown().await;
    Ok(())
}

fn validate_policy(path: PathBuf) -> phoenix_sa_omf::PhoenixResult<()> {
    let policy = load_policy_file(&path)?;
    println!("policy file {path:?} is valid");
    println!("  controllers: {}", policy.controllers.len());
    println!("  max_patches_per_minute: {}", policy.governance.max_patches_per_minute);
    Ok(())
}

fn config_status(path: PathBuf, json: bool) -> phoenix_sa_omf::PhoenixResult<()> {
    let service = load_config_file(&path)?;
    let pipeline = MetricPipeline::new(build_pipeline_config(&service));
    let status = pipeline.config_status();
    if json {
        let rendered = serde_json::to_string_pretty(&status)
            .map_err(|e| phoenix_sa_omf::PhoenixError::ConfigInvalid(e.to_string()))?;
        println!("{rendered}");
    } else {
        println!("enabled: {}", status.enabled);
        for (key, value) in status.parameters {
            println!("  {key} = {value}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match args.command {
        Command::Run { config, policy } => run_service(config, policy).await?,
        Command::ValidatePolicy { policy } => validate_policy(policy)?,
        Command::ConfigStatus { config, json } => config_status(config, json)?,
    }
    Ok(())
}
