use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use swarming_core::{atomic_write_json_pretty, local_state_path, DutState};

pub const LABEL_CROS_VERSION: &str = "cros-version";
pub const LABEL_FWRO_VERSION: &str = "fwro-version";
pub const LABEL_FWRW_VERSION: &str = "fwrw-version";
pub const ATTR_JOB_REPO_URL: &str = "job_repo_url";
pub const ATTR_OUTLET_CHANGED: &str = "outlet_changed";

pub const PROVISIONABLE_LABELS: &[&str] =
    &[LABEL_CROS_VERSION, LABEL_FWRO_VERSION, LABEL_FWRW_VERSION];
pub const PROVISIONABLE_ATTRIBUTES: &[&str] = &[ATTR_JOB_REPO_URL, ATTR_OUTLET_CHANGED];

/// Per-DUT provisioning state cached on the drone between tasks.
///
/// `host_state` belongs to the fleet: it is filled in at open, written
/// back at close, and never stored in the file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDutState {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub provisionable_labels: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub provisionable_attributes: BTreeMap<String, String>,
    #[serde(skip)]
    pub host_state: Option<DutState>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<BTreeMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl LocalDutState {
    /// Reads a state file; a missing file yields an empty state.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(err).with_context(|| format!("read local dut state {}", path.display()))
            }
        };
        serde_json::from_slice(&raw)
            .with_context(|| format!("parse local dut state {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write_json_pretty(path, self)
            .with_context(|| format!("write local dut state {}", path.display()))
    }
}

/// Location of a DUT's state files under the autotest checkout.
///
/// The file is keyed by hostname; a copy keyed by dut id is kept for older
/// tooling. Before the hostname is known, the dut id copy is read instead.
#[derive(Debug, Clone)]
pub struct LocalStateFiles {
    autotest_dir: PathBuf,
}

impl LocalStateFiles {
    pub fn new(autotest_dir: &Path) -> Self {
        Self {
            autotest_dir: autotest_dir.to_path_buf(),
        }
    }

    pub fn open(&self, hostname: &str, dut_id: &str) -> Result<LocalDutState> {
        let key = if !hostname.is_empty() { hostname } else { dut_id };
        if key.is_empty() {
            anyhow::bail!("cannot open local dut state: both hostname and dut id are empty");
        }
        let path = local_state_path(&self.autotest_dir, key);
        let state = LocalDutState::load(&path)?;
        tracing::info!(path = %path.display(), "loaded local dut state");
        Ok(state)
    }

    /// Writes both copies; either failing fails the close.
    pub fn close(&self, state: &LocalDutState, hostname: &str, dut_id: &str) -> Result<()> {
        let mut keys = Vec::new();
        if !hostname.is_empty() {
            keys.push(hostname);
        }
        if !dut_id.is_empty() && dut_id != hostname {
            keys.push(dut_id);
        }
        if keys.is_empty() {
            anyhow::bail!("cannot save local dut state: both hostname and dut id are empty");
        }
        for key in keys {
            let path = local_state_path(&self.autotest_dir, key);
            state.save(&path)?;
            tracing::info!(path = %path.display(), "saved local dut state");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

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
    fn missing_file_is_empty_state() {
        let root = TempDirGuard::new("ssw_localstate_missing");
        let state = LocalDutState::load(&root.path.join("nope.json")).expect("load");
        assert!(state.provisionable_labels.is_empty());
        assert!(state.provisionable_attributes.is_empty());
        assert_eq!(state.host_state, None);
    }

    #[test]
    fn null_maps_become_empty_and_state_field_is_ignored() {
        let root = TempDirGuard::new("ssw_localstate_null");
        let path = root.path.join("host1.json");
        fs::write(
            &path,
            r#"{"provisionable_labels": null, "state": "ready", "provisionable_attributes": {"job_repo_url": "http://x"}}"#,
        )
        .expect("write");
        let state = LocalDutState::load(&path).expect("load");
        assert!(state.provisionable_labels.is_empty());
        assert_eq!(state.host_state, None);
        state.save(&path).expect("save");
        let rewritten = fs::read_to_string(&path).expect("read");
        assert!(!rewritten.contains("\"state\""));
        assert!(rewritten.contains("job_repo_url"));
    }

    #[test]
    fn reserialization_is_byte_identical() {
        let root = TempDirGuard::new("ssw_localstate_stable");
        let path = root.path.join("host1.json");
        let mut state = LocalDutState::default();
        state
            .provisionable_labels
            .insert("cros-version".to_string(), "octopus-release/R90".to_string());
        state
            .provisionable_labels
            .insert("custom-label".to_string(), "kept".to_string());
        state.host_state = Some(DutState::Ready);
        state.save(&path).expect("save");
        let first = fs::read(&path).expect("read");
        LocalDutState::load(&path).expect("load").save(&path).expect("resave");
        assert_eq!(first, fs::read(&path).expect("read again"));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let root = TempDirGuard::new("ssw_localstate_bad");
        let path = root.path.join("host1.json");
        fs::write(&path, "{not json").expect("write");
        let err = LocalDutState::load(&path).expect_err("malformed");
        assert!(format!("{:#}", err).contains("parse local dut state"));
    }

    #[test]
    fn close_writes_hostname_and_dut_id_copies() {
        let root = TempDirGuard::new("ssw_localstate_files");
        let files = LocalStateFiles::new(&root.path);
        let mut state = files.open("", "dut-42").expect("open by id");
        state
            .provisionable_attributes
            .insert("outlet_changed".to_string(), "true".to_string());
        files.close(&state, "host1", "dut-42").expect("close");
        assert!(local_state_path(&root.path, "host1").exists());
        assert!(local_state_path(&root.path, "dut-42").exists());
        let reopened = files.open("host1", "dut-42").expect("reopen");
        assert_eq!(reopened, state_without_host(&state));
    }

    fn state_without_host(state: &LocalDutState) -> LocalDutState {
        LocalDutState {
            host_state: None,
            ..state.clone()
        }
    }
}
