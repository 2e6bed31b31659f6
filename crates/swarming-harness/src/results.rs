use crate::lucifer::EngineRun;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use swarming_core::{atomic_write_json_pretty, ensure_dir, DutState, RESULTS_DOCUMENT_NAME};

/// Outcome of one engine run on one DUT, as left in its results directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DutResult {
    pub task_name: String,
    pub hostname: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub abort_forwarded: bool,
    pub cancel_cause: Option<String>,
    pub failed_tests: Vec<String>,
    pub autoserv_failed: bool,
    pub autoserv_synthesized: bool,
    pub host_state: Option<DutState>,
    #[serde(default)]
    pub keyvals: BTreeMap<String, String>,
}

impl DutResult {
    pub fn from_run(
        task_name: &str,
        hostname: &str,
        run: &EngineRun,
        host_state: Option<DutState>,
        keyvals: &BTreeMap<String, String>,
    ) -> Self {
        Self {
            task_name: task_name.to_string(),
            hostname: hostname.to_string(),
            exit_code: run.exit_code,
            signal: run.signal,
            abort_forwarded: run.abort.delivered,
            cancel_cause: run.abort.reason.map(|r| r.to_string()),
            failed_tests: run.events.failed_tests.clone(),
            autoserv_failed: run.autoserv_failed(),
            autoserv_synthesized: run.autoserv_synthesized,
            host_state,
            keyvals: keyvals.clone(),
        }
    }

    pub fn write(&self, dut_results_dir: &Path) -> Result<PathBuf> {
        let path = dut_results_dir.join(RESULTS_DOCUMENT_NAME);
        atomic_write_json_pretty(&path, self)
            .with_context(|| format!("write results for {}", self.hostname))?;
        Ok(path)
    }
}

/// Task-level summary for the isolated output directory.
pub fn write_task_results(outdir: &Path, results: &[DutResult]) -> Result<PathBuf> {
    ensure_dir(outdir).with_context(|| format!("create isolated outdir {}", outdir.display()))?;
    let path = outdir.join(RESULTS_DOCUMENT_NAME);
    atomic_write_json_pretty(&path, results)
        .with_context(|| format!("write task results {}", path.display()))?;
    tracing::info!(path = %path.display(), duts = results.len(), "wrote task results");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::AbortOutcome;
    use chrono::Utc;
    use std::fs;
    use swarming_core::CancelReason;

    struct TempDirGuard {
        path: PathBuf,
    }

    impl TempDirGuard {
        fn new(prefix: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "{}_{}_{}",
                prefix,
                std::process::id(),
                Utc::now().timestamp_micros()
            ));
            fs::create_dir_all(&path).expect("temp dir");
            Self { path }
        }
    }

    impl Drop for TempDirGuard {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn aborted_run_records_cause_and_status() {
        let root = TempDirGuard::new("ssw_results_abort");
        let mut run = EngineRun {
            exit_code: Some(1),
            abort: AbortOutcome {
                reason: Some(CancelReason::Deadline),
                delivered: true,
            },
            ..Default::default()
        };
        run.events.failed_tests.push("power_Idle".to_string());
        let keyvals = BTreeMap::from([("suite".to_string(), "bvt-inline".to_string())]);
        let result = DutResult::from_run("admin_repair", "host1", &run, Some(DutState::NeedsRepair), &keyvals);
        let path = result.write(&root.path).expect("write");

        let raw: serde_json::Value = serde_json::from_slice(&fs::read(path).expect("read")).expect("json");
        assert_eq!(raw["cancel_cause"], "deadline exceeded");
        assert_eq!(raw["abort_forwarded"], true);
        assert_eq!(raw["host_state"], "needs_repair");
        assert_eq!(raw["failed_tests"][0], "power_Idle");
        assert_eq!(raw["keyvals"]["suite"], "bvt-inline");
        assert_eq!(raw["autoserv_failed"], false);
    }

    #[test]
    fn task_results_list_every_dut() {
        let root = TempDirGuard::new("ssw_results_task");
        let outdir = root.path.join("isolated");
        let results = vec![
            DutResult {
                hostname: "a".to_string(),
                autoserv_failed: true,
                autoserv_synthesized: true,
                exit_code: Some(1),
                ..Default::default()
            },
            DutResult {
                hostname: "b".to_string(),
                exit_code: Some(0),
                host_state: Some(DutState::Ready),
                ..Default::default()
            },
        ];
        let path = write_task_results(&outdir, &results).expect("write");
        let back: Vec<DutResult> = serde_json::from_slice(&fs::read(path).expect("read")).expect("json");
        assert_eq!(back, results);
    }
}
