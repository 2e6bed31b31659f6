//! Task-level scope: the results directory and the DUTs of one task.

use crate::annotations::AnnotationSink;
use crate::botconfig::BotConfig;
use crate::dutharness::{DutHarness, Writeback};
use crate::errors::MultiError;
use crate::localstate::LocalStateFiles;
use crate::resultsdir::ResultsDir;
use crate::sideeffects::SideEffectsConfig;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use swarming_core::{CancelToken, ANNOTATIONS_NAME};
use swarming_fleet::{DutLookup, FleetAdapter};

#[derive(Debug, Clone)]
pub struct HarnessOptions {
    pub writeback: Writeback,
    pub logdog_url: Option<String>,
    pub side_effects: Option<SideEffectsConfig>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            writeback: Writeback::Skip,
            logdog_url: None,
            side_effects: None,
        }
    }
}

pub struct TaskHarness {
    config: BotConfig,
    results: ResultsDir,
    duts: Vec<DutHarness>,
    annotations: Option<AnnotationSink>,
    open_errors: MultiError,
    closed: bool,
}

impl TaskHarness {
    /// Opens the task results directory and every DUT of the task.
    ///
    /// A DUT that fails to open does not stop the others; its error is
    /// reported by `close`. Errors before any DUT is opened are returned
    /// directly.
    pub fn open(
        config: &BotConfig,
        fleet: Arc<FleetAdapter>,
        options: HarnessOptions,
        cancel: &CancelToken,
    ) -> Result<Self> {
        if let Some(side_effects) = &options.side_effects {
            side_effects.validate()?;
        }
        let results = ResultsDir::open(&config.task_results_dir()?)?;
        let mut harness = Self {
            config: config.clone(),
            results,
            duts: Vec::new(),
            annotations: None,
            open_errors: MultiError::new(),
            closed: false,
        };
        if let Err(err) = harness.open_task_scope(&fleet, &options, cancel) {
            if let Err(close_err) = harness.close() {
                tracing::warn!(error = %format!("{:#}", close_err), "closing partially opened task harness failed");
            }
            return Err(err.context("open task harness"));
        }
        Ok(harness)
    }

    fn open_task_scope(
        &mut self,
        fleet: &Arc<FleetAdapter>,
        options: &HarnessOptions,
        cancel: &CancelToken,
    ) -> Result<()> {
        if let Some(side_effects) = &options.side_effects {
            side_effects.write_to(self.results.path())?;
        }
        if let Some(url) = &options.logdog_url {
            let sink = AnnotationSink::create(&self.results.path().join(ANNOTATIONS_NAME), url)?;
            self.annotations = Some(sink);
        }

        let lookups = self.dut_lookups(fleet, cancel)?;
        let files = LocalStateFiles::new(&self.config.autotest_dir);
        for lookup in lookups {
            let mut dh = DutHarness::new(lookup, files.clone(), fleet.clone(), options.writeback);
            if let Err(err) = dh.open(&self.results, cancel) {
                tracing::warn!(dut = %dh.name(), error = %format!("{:#}", err), "failed to open dut harness");
                self.open_errors.push(err);
            }
            self.duts.push(dh);
        }
        Ok(())
    }

    fn dut_lookups(&self, fleet: &FleetAdapter, cancel: &CancelToken) -> Result<Vec<DutLookup>> {
        let name = &self.config.fleet_resource_name;
        if !self.config.multi_duts {
            return Ok(vec![DutLookup::Id(name.clone())]);
        }
        let hostnames = fleet
            .scheduling_unit_members(name, cancel)
            .with_context(|| format!("resolve scheduling unit {}", name))?;
        tracing::info!(unit = %name, duts = ?hostnames, "running scheduling unit task");
        Ok(hostnames.into_iter().map(DutLookup::Hostname).collect())
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn results_path(&self) -> &Path {
        self.results.path()
    }

    pub fn annotations(&self) -> Option<&AnnotationSink> {
        self.annotations.as_ref()
    }

    pub fn duts(&self) -> &[DutHarness] {
        &self.duts
    }

    /// DUTs whose open sequence completed.
    pub fn opened_duts_mut(&mut self) -> impl Iterator<Item = &mut DutHarness> {
        self.duts.iter_mut().filter(|dh| dh.is_open())
    }

    /// Closes every DUT in reverse order of opening, then seals the results
    /// directory. Errors from all of them, and from DUTs that failed to
    /// open, are returned together.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // Teardown is not bound by the task's cancellation.
        let teardown = CancelToken::new();
        let mut errs = std::mem::take(&mut self.open_errors);
        for dh in self.duts.iter_mut().rev() {
            errs.collect(dh.close(&teardown));
        }
        errs.collect(self.results.close());
        errs.into_result()
    }
}

impl Drop for TaskHarness {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(error = %format!("{:#}", err), "task harness closed on drop with errors");
        }
    }
}
