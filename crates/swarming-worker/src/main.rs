use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use swarming_core::{CancelReason, CancelToken};
use swarming_fleet::{token_source_from_env, FleetAdapter, FleetSettings, PrpcFleetTransport, TokenSource};
use swarming_harness::{is_cancellation, BotConfig, SideEffectsConfig, TaskArgs, TaskRunner};
use tracing_subscriber::EnvFilter;

const EXIT_CANCELLED: i32 = 3;

#[derive(Parser, Debug)]
#[command(
    name = "skylab_swarming_worker",
    version = "0.3.0",
    about = "Runs a Skylab admin task against the DUTs of this Swarming bot"
)]
struct Cli {
    /// Task to run, e.g. admin_repair, deploy or set_needs_repair.
    #[arg(long)]
    task_name: String,
    /// Admin inventory service host; overrides ADMIN_SERVICE.
    #[arg(long)]
    admin_service: Option<String>,
    /// Soft deadline for the engine, RFC3339.
    #[arg(long, value_parser = parse_deadline)]
    deadline: Option<DateTime<Utc>>,
    /// Comma separated actions for deploy and audit tasks.
    #[arg(long, default_value = "")]
    actions: String,
    #[arg(long)]
    isolated_outdir: Option<PathBuf>,
    #[arg(long)]
    logdog_annotation_url: Option<String>,
    /// Side effects configuration as a JSON document.
    #[arg(long)]
    side_effect_config: Option<String>,
    #[arg(long)]
    client_test: bool,
    #[arg(long, default_value = "")]
    provision_labels: String,
    /// JSON object of string keyvals recorded with the results.
    #[arg(long, value_parser = parse_keyvals)]
    keyvals: Option<BTreeMap<String, String>>,
    #[arg(long)]
    test_args: Option<String>,
}

fn parse_deadline(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid deadline {:?}: {}", raw, e))
}

fn parse_keyvals(raw: &str) -> Result<BTreeMap<String, String>, String> {
    if raw.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(raw).map_err(|e| format!("invalid keyvals: {}", e))
}

fn comma_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

impl Cli {
    fn task_args(&self) -> Result<TaskArgs> {
        let side_effects = match non_blank(self.side_effect_config.clone()) {
            Some(raw) => Some(SideEffectsConfig::parse(&raw)?),
            None => None,
        };
        Ok(TaskArgs {
            task_name: self.task_name.trim().to_string(),
            deadline: self.deadline,
            actions: comma_list(&self.actions),
            isolated_outdir: self.isolated_outdir.clone(),
            logdog_annotation_url: non_blank(self.logdog_annotation_url.clone()),
            side_effects,
            client_test: self.client_test,
            provision_labels: comma_list(&self.provision_labels),
            keyvals: self.keyvals.clone().unwrap_or_default(),
            test_args: non_blank(self.test_args.clone()),
        })
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();
    tracing::info!(args = ?std::env::args().collect::<Vec<_>>(), "swarming worker starting");
    match run(&cli) {
        Ok(()) => {
            tracing::info!("task completed");
            Ok(())
        }
        Err(err) if is_cancellation(&err) => {
            tracing::error!(error = %format!("{:#}", err), "task cancelled");
            std::process::exit(EXIT_CANCELLED);
        }
        Err(err) => {
            tracing::error!(error = %format!("{:#}", err), "task failed");
            Err(err)
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let args = cli.task_args()?;
    let mut config = BotConfig::from_env()?;
    if let Some(admin) = non_blank(cli.admin_service.clone()) {
        config.admin_service = Some(admin);
    }

    let settings = FleetSettings::from_env()?;
    let tokens: Arc<dyn TokenSource> = Arc::from(token_source_from_env()?);
    let transport = PrpcFleetTransport::new(
        config.ufs_service.clone(),
        config.admin_service.clone(),
        tokens,
        settings.timeouts,
    )
    .context("build fleet client")?;
    let fleet = FleetAdapter::new(Arc::new(transport), config.admin_service.clone(), settings.retry);
    tracing::info!(
        ufs = ?config.ufs_service,
        admin = ?config.admin_service,
        writeback = fleet.writes_enabled(),
        "fleet client ready"
    );

    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    ctrlc::set_handler(move || {
        tracing::warn!("received termination signal; aborting task");
        on_signal.cancel(CancelReason::Signal);
    })
    .map_err(|e| anyhow!("install signal handler: {}", e))?;

    let report = TaskRunner::new(config, Arc::new(fleet)).run(&args, &cancel)?;
    tracing::info!(duts = report.results.len(), "task results recorded");
    Ok(())
}
