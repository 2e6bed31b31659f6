//! Per-DUT resource scope.
//!
//! Opening runs a fixed sequence of steps; every step that leaves something
//! to undo registers a closer. Closers run in reverse order and their
//! errors are gathered rather than short-circuiting, so a failed host info
//! read still lets local state and fleet writeback happen.

use crate::errors::MultiError;
use crate::hostinfo::HostInfo;
use crate::localstate::{LocalDutState, LocalStateFiles};
use crate::resultsdir::ResultsDir;
use crate::writeback::dut_state_update;
use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use swarming_core::{CancelToken, DutState, ABORT_SOCK_NAME};
use swarming_fleet::{DeviceInfo, DutLookup, FleetAdapter};

/// What a DUT's close reports back to the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Writeback {
    /// Nothing is written.
    Skip,
    /// Metadata, component states and host state (repair, deploy, audit).
    Inventory,
    /// Host state only (state-setting tasks).
    HostState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closer {
    LocalState,
    Borrow,
    ExposedHostInfo,
}

pub struct DutHarness {
    pub dut_id: String,
    pub hostname: String,
    pub local_state: LocalDutState,
    pub device: Option<DeviceInfo>,
    pub host_info: Option<HostInfo>,
    pub results_dir: Option<PathBuf>,
    pub host_info_path: Option<PathBuf>,
    files: LocalStateFiles,
    fleet: Arc<FleetAdapter>,
    writeback: Writeback,
    closers: Vec<Closer>,
    opened: bool,
}

impl DutHarness {
    pub fn new(
        lookup: DutLookup,
        files: LocalStateFiles,
        fleet: Arc<FleetAdapter>,
        writeback: Writeback,
    ) -> Self {
        let (dut_id, hostname) = match lookup {
            DutLookup::Id(id) => (id, String::new()),
            DutLookup::Hostname(hostname) => (String::new(), hostname),
        };
        Self {
            dut_id,
            hostname,
            local_state: LocalDutState::default(),
            device: None,
            host_info: None,
            results_dir: None,
            host_info_path: None,
            files,
            fleet,
            writeback,
            closers: Vec::new(),
            opened: false,
        }
    }

    /// A readable name for logs and errors: hostname when known.
    pub fn name(&self) -> &str {
        if self.hostname.is_empty() {
            &self.dut_id
        } else {
            &self.hostname
        }
    }

    /// True once every open step has succeeded.
    pub fn is_open(&self) -> bool {
        self.opened
    }

    pub fn abort_sock(&self) -> Option<PathBuf> {
        self.results_dir.as_ref().map(|dir| dir.join(ABORT_SOCK_NAME))
    }

    pub fn host_state(&self) -> Option<DutState> {
        self.local_state.host_state
    }

    pub fn set_host_state(&mut self, state: DutState) {
        self.local_state.host_state = Some(state);
    }

    /// Runs the open sequence. On error the steps already taken stay
    /// registered; the caller must still `close`.
    pub fn open(&mut self, results: &ResultsDir, cancel: &CancelToken) -> Result<()> {
        let name = self.name().to_string();
        self.load_local_state()
            .with_context(|| format!("load local state for {}", name))?;
        self.load_device(cancel)
            .with_context(|| format!("load fleet device info for {}", name))?;
        let host_info = self.make_host_info(cancel);
        self.borrow_local_state(host_info);
        self.make_results_dir(results)?;
        self.expose_host_info()?;
        self.opened = true;
        tracing::info!(hostname = %self.hostname, dut_id = %self.dut_id, "opened dut harness");
        Ok(())
    }

    fn load_local_state(&mut self) -> Result<()> {
        self.local_state = self.files.open(&self.hostname, &self.dut_id)?;
        self.closers.push(Closer::LocalState);
        Ok(())
    }

    fn load_device(&mut self, cancel: &CancelToken) -> Result<()> {
        let lookup = if !self.dut_id.is_empty() {
            DutLookup::Id(self.dut_id.clone())
        } else if !self.hostname.is_empty() {
            DutLookup::Hostname(self.hostname.clone())
        } else {
            return Err(anyhow!("both dut id and hostname are empty"));
        };
        let device = self.fleet.device(&lookup, cancel)?;
        self.dut_id = device.id.clone();
        self.hostname = device.hostname.clone();
        let reading = self.fleet.read_dut_state(&self.hostname, cancel)?;
        self.local_state.host_state = Some(reading.state);
        tracing::info!(
            hostname = %self.hostname,
            dut_id = %self.dut_id,
            state = %reading.state,
            "loaded fleet device info"
        );
        self.device = Some(device);
        Ok(())
    }

    fn make_host_info(&self, cancel: &CancelToken) -> HostInfo {
        let versions = self.fleet.stable_versions(&self.hostname, cancel);
        match &self.device {
            Some(device) => HostInfo::from_device(device, &versions),
            None => HostInfo::default(),
        }
    }

    fn borrow_local_state(&mut self, mut host_info: HostInfo) {
        host_info.borrow_local_state(&self.local_state);
        self.host_info = Some(host_info);
        self.closers.push(Closer::Borrow);
    }

    fn make_results_dir(&mut self, results: &ResultsDir) -> Result<()> {
        let path = results
            .open_subdir(&self.hostname)
            .with_context(|| format!("create results dir for {}", self.hostname))?;
        tracing::info!(hostname = %self.hostname, path = %path.display(), "created dut results dir");
        self.results_dir = Some(path);
        Ok(())
    }

    fn expose_host_info(&mut self) -> Result<()> {
        let (Some(info), Some(dir)) = (&self.host_info, &self.results_dir) else {
            return Err(anyhow!("host info for {} is not ready to expose", self.name()));
        };
        let path = info.expose(dir, &self.hostname)?;
        self.host_info_path = Some(path);
        self.closers.push(Closer::ExposedHostInfo);
        Ok(())
    }

    /// Runs every registered closer, newest first. Safe to call again; a
    /// second call has nothing left to do.
    pub fn close(&mut self, cancel: &CancelToken) -> Result<()> {
        self.opened = false;
        let mut errs = MultiError::new();
        while let Some(closer) = self.closers.pop() {
            let result = match closer {
                Closer::ExposedHostInfo => self.reload_host_info(),
                Closer::Borrow => {
                    self.unborrow();
                    Ok(())
                }
                Closer::LocalState => self.flush_local_state(cancel),
            };
            errs.collect(result);
        }
        tracing::info!(hostname = %self.hostname, errors = errs.len(), "closed dut harness");
        errs.into_result()
            .with_context(|| format!("close harness for {}", self.name()))
    }

    fn reload_host_info(&mut self) -> Result<()> {
        let Some(path) = self.host_info_path.as_ref() else {
            return Ok(());
        };
        self.host_info = Some(HostInfo::read(path)?);
        Ok(())
    }

    fn unborrow(&mut self) {
        if let Some(info) = &self.host_info {
            info.unborrow_into(&mut self.local_state);
        }
    }

    /// Saves local state, then writes back to the fleet. The fleet write is
    /// attempted even when the save fails; both errors are reported.
    fn flush_local_state(&mut self, cancel: &CancelToken) -> Result<()> {
        let mut errs = MultiError::new();
        errs.collect(
            self.files
                .close(&self.local_state, &self.hostname, &self.dut_id)
                .with_context(|| format!("save local state for {}", self.name())),
        );
        if self.device.is_some() {
            errs.collect(self.write_back(cancel));
        }
        errs.into_result()
    }

    fn write_back(&self, cancel: &CancelToken) -> Result<()> {
        match self.writeback {
            Writeback::Skip => {
                tracing::info!(hostname = %self.hostname, "task does not update the fleet; skipping writeback");
                Ok(())
            }
            Writeback::Inventory => {
                let Some(info) = &self.host_info else {
                    return Ok(());
                };
                let update = dut_state_update(info, &self.dut_id, &self.hostname, self.local_state.host_state);
                self.fleet
                    .update_dut_state(&update, cancel)
                    .with_context(|| format!("write back dut state for {}", self.hostname))
            }
            Writeback::HostState => {
                let state = self.local_state.host_state.unwrap_or_default();
                self.fleet
                    .update_host_state(&self.hostname, state, cancel)
                    .with_context(|| format!("write back host state for {}", self.hostname))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::localstate::LABEL_CROS_VERSION;
    use chrono::Utc;
    use std::fs;
    use std::path::Path;
    use swarming_core::local_state_path;
    use swarming_fleet::{FakeFleet, FleetTransport, GrpcCode, RetrySettings};

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

    fn adapter(fake: &Arc<FakeFleet>, admin: Option<&str>) -> Arc<FleetAdapter> {
        let transport: Arc<dyn FleetTransport> = fake.clone();
        Arc::new(FleetAdapter::new(
            transport,
            admin.map(str::to_string),
            RetrySettings {
                max_attempts: 2,
                base_backoff_ms: 1,
            },
        ))
    }

    fn harness(root: &Path, fleet: Arc<FleetAdapter>, writeback: Writeback) -> DutHarness {
        DutHarness::new(
            DutLookup::Id("dut-42".to_string()),
            LocalStateFiles::new(&root.join("autotest")),
            fleet,
            writeback,
        )
    }

    #[test]
    fn open_resolves_identity_and_exposes_host_info() {
        let root = TempDirGuard::new("ssw_dutharness_open");
        let fake = Arc::new(FakeFleet::new());
        fake.add_dut("dut-42", "host42");
        fake.set_host_state("host42", DutState::NeedsReset);
        let results = ResultsDir::open(&root.path.join("results")).expect("results");

        let mut dh = harness(&root.path, adapter(&fake, None), Writeback::Skip);
        dh.open(&results, &CancelToken::new()).expect("open");
        assert_eq!(dh.hostname, "host42");
        assert_eq!(dh.dut_id, "dut-42");
        assert!(dh.is_open());
        assert_eq!(dh.host_state(), Some(DutState::NeedsReset));
        assert_eq!(dh.results_dir, Some(root.path.join("results").join("host42")));
        assert!(dh.host_info_path.as_ref().expect("path").exists());
        assert_eq!(dh.abort_sock(), Some(root.path.join("results/host42/abort_sock")));

        dh.close(&CancelToken::new()).expect("close");
        assert!(local_state_path(&root.path.join("autotest"), "host42").exists());
        assert!(local_state_path(&root.path.join("autotest"), "dut-42").exists());
        dh.close(&CancelToken::new()).expect("second close");
    }

    #[test]
    fn engine_edits_to_host_info_reach_local_state() {
        let root = TempDirGuard::new("ssw_dutharness_unborrow");
        let fake = Arc::new(FakeFleet::new());
        fake.add_dut("dut-42", "host42");
        let results = ResultsDir::open(&root.path.join("results")).expect("results");
        let mut dh = harness(&root.path, adapter(&fake, None), Writeback::Skip);
        dh.open(&results, &CancelToken::new()).expect("open");

        let path = dh.host_info_path.clone().expect("path");
        let mut info = HostInfo::read(&path).expect("read");
        info.set_label(LABEL_CROS_VERSION, "octopus-release/R90-13816.0.0");
        fs::write(&path, info.to_bytes().expect("bytes")).expect("engine write");

        dh.close(&CancelToken::new()).expect("close");
        let saved = LocalDutState::load(&local_state_path(&root.path.join("autotest"), "host42"))
            .expect("load");
        assert_eq!(
            saved.provisionable_labels.get(LABEL_CROS_VERSION).map(String::as_str),
            Some("octopus-release/R90-13816.0.0")
        );
    }

    #[test]
    fn inventory_writeback_sends_final_state_once() {
        let root = TempDirGuard::new("ssw_dutharness_writeback");
        let fake = Arc::new(FakeFleet::new());
        fake.add_dut("dut-42", "host42");
        let results = ResultsDir::open(&root.path.join("results")).expect("results");
        let mut dh = harness(&root.path, adapter(&fake, Some("admin.example")), Writeback::Inventory);
        dh.open(&results, &CancelToken::new()).expect("open");
        dh.set_host_state(DutState::Ready);
        dh.close(&CancelToken::new()).expect("close");

        assert_eq!(fake.calls_to("UpdateDutState"), 1);
        assert_eq!(fake.host_state("host42").as_deref(), Some("STATE_SERVING"));
        let updates = fake.dut_state_updates();
        assert_eq!(updates[0].dut_meta.hostname, "host42");
    }

    #[test]
    fn state_setting_writes_host_state_only() {
        let root = TempDirGuard::new("ssw_dutharness_hoststate");
        let fake = Arc::new(FakeFleet::new());
        fake.add_dut("dut-42", "host42");
        let results = ResultsDir::open(&root.path.join("results")).expect("results");
        let mut dh = harness(&root.path, adapter(&fake, Some("admin.example")), Writeback::HostState);
        dh.open(&results, &CancelToken::new()).expect("open");
        dh.set_host_state(DutState::Reserved);
        dh.close(&CancelToken::new()).expect("close");

        assert_eq!(fake.calls_to("UpdateDutState"), 0);
        assert_eq!(fake.host_state("host42").as_deref(), Some("STATE_RESERVED"));
    }

    #[test]
    fn failed_device_lookup_still_closes_local_state() {
        let root = TempDirGuard::new("ssw_dutharness_partial");
        let fake = Arc::new(FakeFleet::new());
        fake.add_dut("dut-42", "host42");
        fake.fail("GetMachine", GrpcCode::PermissionDenied, usize::MAX);
        let results = ResultsDir::open(&root.path.join("results")).expect("results");
        let mut dh = harness(&root.path, adapter(&fake, Some("admin.example")), Writeback::Inventory);

        let err = dh.open(&results, &CancelToken::new()).expect_err("open fails");
        assert!(!dh.is_open());
        assert!(format!("{:#}", err).contains("dut-42"), "{:#}", err);
        dh.close(&CancelToken::new()).expect("close");
        assert!(local_state_path(&root.path.join("autotest"), "dut-42").exists());
        assert_eq!(fake.calls_to("UpdateDutState"), 0);
        assert!(!root.path.join("results").join("host42").exists());
    }

    #[test]
    fn missing_host_info_file_is_a_close_error_but_writeback_runs() {
        let root = TempDirGuard::new("ssw_dutharness_lost_hostinfo");
        let fake = Arc::new(FakeFleet::new());
        fake.add_dut("dut-42", "host42");
        let results = ResultsDir::open(&root.path.join("results")).expect("results");
        let mut dh = harness(&root.path, adapter(&fake, Some("admin.example")), Writeback::Inventory);
        dh.open(&results, &CancelToken::new()).expect("open");
        fs::remove_file(dh.host_info_path.clone().expect("path")).expect("remove");

        let err = dh.close(&CancelToken::new()).expect_err("close fails");
        assert!(format!("{:#}", err).contains("read host info"), "{:#}", err);
        assert_eq!(fake.calls_to("UpdateDutState"), 1);
    }
}
