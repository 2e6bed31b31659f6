use crate::annotations::FifoCopier;
use crate::botconfig::BotConfig;
use crate::dutharness::Writeback;
use crate::errors::MultiError;
use crate::harness::{HarnessOptions, TaskHarness};
use crate::lucifer::{Engine, EngineArgs, EngineTask};
use crate::results::{write_task_results, DutResult};
use crate::sideeffects::SideEffectsConfig;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use swarming_core::{CancelToken, DutState, LOGDOG_FIFO_NAME};
use swarming_fleet::FleetAdapter;

const ADMIN_PREFIX: &str = "admin_";

/// Per-task inputs from the command line.
#[derive(Debug, Clone, Default)]
pub struct TaskArgs {
    pub task_name: String,
    pub deadline: Option<DateTime<Utc>>,
    pub actions: Vec<String>,
    pub isolated_outdir: Option<PathBuf>,
    pub logdog_annotation_url: Option<String>,
    pub side_effects: Option<SideEffectsConfig>,
    pub client_test: bool,
    pub provision_labels: Vec<String>,
    pub keyvals: BTreeMap<String, String>,
    pub test_args: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    Admin(String),
    Deploy,
    Audit,
    SetState(DutState),
    Unknown(String),
}

impl TaskKind {
    pub fn parse(name: &str) -> TaskKind {
        match name {
            "deploy" => return TaskKind::Deploy,
            "set_needs_repair" => return TaskKind::SetState(DutState::NeedsRepair),
            "set_reserved" => return TaskKind::SetState(DutState::Reserved),
            "set_manual_repair" => return TaskKind::SetState(DutState::ManualRepair),
            "set_needs_replacement" => return TaskKind::SetState(DutState::NeedsReplacement),
            "set_needs_manual_repair" => return TaskKind::SetState(DutState::NeedsManualRepair),
            _ => {}
        }
        match name.strip_prefix(ADMIN_PREFIX) {
            Some("audit") => TaskKind::Audit,
            Some(task) if !task.is_empty() => TaskKind::Admin(task.to_string()),
            _ => TaskKind::Unknown(name.to_string()),
        }
    }

    /// Only repair, deploy and audit report labels and metadata; the
    /// state-setting tasks report the host state alone.
    pub fn writeback(&self) -> Writeback {
        match self {
            TaskKind::Admin(task) if task == "repair" => Writeback::Inventory,
            TaskKind::Deploy | TaskKind::Audit => Writeback::Inventory,
            TaskKind::SetState(_) => Writeback::HostState,
            _ => Writeback::Skip,
        }
    }

    fn engine_task(&self, actions: &[String]) -> Option<EngineTask> {
        match self {
            TaskKind::Admin(task) => Some(EngineTask::Admin { task: task.clone() }),
            TaskKind::Deploy => Some(EngineTask::Deploy {
                actions: actions.to_vec(),
            }),
            TaskKind::Audit => Some(EngineTask::Audit {
                actions: actions.to_vec(),
            }),
            TaskKind::SetState(_) | TaskKind::Unknown(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskReport {
    pub results: Vec<DutResult>,
}

pub struct TaskRunner {
    config: BotConfig,
    fleet: Arc<FleetAdapter>,
    engine: Engine,
}

impl TaskRunner {
    pub fn new(config: BotConfig, fleet: Arc<FleetAdapter>) -> Self {
        let engine = Engine::new(&config.lucifer_path(), &config.autotest_dir);
        Self {
            config,
            fleet,
            engine,
        }
    }

    /// Runs one Swarming task end to end. Errors from the engine runs and
    /// from teardown are returned together once the harness is closed.
    pub fn run(&self, args: &TaskArgs, cancel: &CancelToken) -> Result<TaskReport> {
        let kind = TaskKind::parse(&args.task_name);
        tracing::info!(
            task = %args.task_name,
            kind = ?kind,
            task_id = %self.config.task_id,
            resource = %self.config.fleet_resource_name,
            multi_duts = self.config.multi_duts,
            client_test = args.client_test,
            provision_labels = ?args.provision_labels,
            test_args = ?args.test_args,
            "starting task"
        );
        let options = HarnessOptions {
            writeback: kind.writeback(),
            logdog_url: args.logdog_annotation_url.clone(),
            side_effects: args.side_effects.clone(),
        };
        let mut harness = TaskHarness::open(&self.config, self.fleet.clone(), options, cancel)?;

        let mut errs = MultiError::new();
        let mut report = TaskReport::default();
        match &kind {
            TaskKind::SetState(state) => {
                for dh in harness.opened_duts_mut() {
                    tracing::info!(hostname = %dh.hostname, state = %state, "setting host state");
                    dh.set_host_state(*state);
                }
            }
            TaskKind::Unknown(name) => {
                errs.push(anyhow!("unrecognized task name {:?}", name));
            }
            _ => {
                if let Some(task) = kind.engine_task(&args.actions) {
                    report.results = self.lucifer_flow(&task, args, &mut harness, cancel, &mut errs);
                }
            }
        }

        if let Some(outdir) = &args.isolated_outdir {
            errs.collect(write_task_results(outdir, &report.results));
        }
        errs.collect(harness.close().context("close task harness"));
        errs.into_result().map(|()| report)
    }

    fn lucifer_flow(
        &self,
        task: &EngineTask,
        args: &TaskArgs,
        harness: &mut TaskHarness,
        cancel: &CancelToken,
        errs: &mut MultiError,
    ) -> Vec<DutResult> {
        let sink = harness.annotations().cloned();
        let task_url = harness.config().task_url();
        let mut copier = match &sink {
            Some(sink) => {
                let fifo = harness.results_path().join(LOGDOG_FIFO_NAME);
                errs.collect(FifoCopier::start(sink.clone(), &fifo))
            }
            None => None,
        };
        let fifo_path = copier.as_ref().map(|c| c.path().to_path_buf());

        let mut results = Vec::new();
        for dh in harness.opened_duts_mut() {
            let (Some(results_dir), Some(abort_sock)) = (dh.results_dir.clone(), dh.abort_sock()) else {
                continue;
            };
            let engine_args = EngineArgs {
                task: task.clone(),
                hostname: dh.hostname.clone(),
                results_dir: results_dir.clone(),
                abort_sock,
                logdog_file: fifo_path.clone(),
            };
            let run_cancel = match args.deadline {
                Some(deadline) => cancel.with_deadline(instant_for(deadline)),
                None => cancel.child(),
            };
            let run = match self.engine.run(&engine_args, &run_cancel, sink.as_ref()) {
                Ok(run) => run,
                Err(err) => {
                    errs.push(err.context(format!("run lucifer task on {}", dh.hostname)));
                    continue;
                }
            };
            if let Some(state) = run.events.host_state {
                dh.set_host_state(state);
            }
            let result = DutResult::from_run(&args.task_name, &dh.hostname, &run, dh.host_state(), &args.keyvals);
            errs.collect(result.write(&results_dir));
            results.push(result);
            if let Err(err) = run.check() {
                tracing::warn!(hostname = %dh.hostname, error = %format!("{:#}", err), "lucifer task did not succeed");
                errs.push(err.context(format!("run lucifer task on {}", dh.hostname)));
            }
        }

        if let Some(copier) = copier.as_mut() {
            copier.close();
        }
        if let Some(sink) = &sink {
            errs.collect(sink.epilog(task_url.as_deref()));
        }
        results
    }
}

fn instant_for(deadline: DateTime<Utc>) -> Instant {
    let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    Instant::now() + remaining
}
