use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Serialize;
use std::env;
use std::fs;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

mod cancel;
mod dutstate;
pub use cancel::{CancelReason, CancelToken};
pub use dutstate::{DutState, UnknownDutState};

pub const ENV_ADMIN_SERVICE: &str = "ADMIN_SERVICE";
pub const ENV_AUTOTEST_DIR: &str = "AUTOTEST_DIR";
pub const ENV_LUCIFER_TOOLS_DIR: &str = "LUCIFER_TOOLS_DIR";
pub const ENV_PARSER_PATH: &str = "PARSER_PATH";
pub const ENV_INVENTORY_SERVICE: &str = "INVENTORY_SERVICE";
pub const ENV_UFS_SERVICE: &str = "UFS_SERVICE";
pub const ENV_SWARMING_SERVICE: &str = "SWARMING_SERVICE";
pub const ENV_FLEET_RESOURCE_NAME: &str = "FLEET_RESOURCE_NAME";
pub const ENV_FLEET_MULTIDUTS_FLAG: &str = "FLEET_MULTIDUTS_FLAG";
pub const ENV_SWARMING_TASK_ID: &str = "SWARMING_TASK_ID";
pub const ENV_LUCI_CONTEXT: &str = "LUCI_CONTEXT";
pub const ENV_STATIC_TOKEN: &str = "SSW_STATIC_TOKEN";

pub const SWARMING_STATE_DIR: &str = "swarming_state";
pub const RESULTS_DIR: &str = "results";
pub const HOST_INFO_SUBDIR: &str = "host_info_store";
pub const HOST_INFO_EXT: &str = "store";
pub const HOST_INFO_INDENTED_EXT: &str = "host_info_store2";
pub const ABORT_SOCK_NAME: &str = "abort_sock";
pub const OFFLOAD_MARKER_NAME: &str = ".ready_for_offload";
pub const SIDE_EFFECTS_CONFIG_NAME: &str = "side_effects_config.json";
pub const RESULTS_DOCUMENT_NAME: &str = "results.json";
pub const LOGDOG_FIFO_NAME: &str = "logdog.fifo";
pub const ANNOTATIONS_NAME: &str = "annotations.txt";

pub const DIR_MODE: u32 = 0o755;
pub const FILE_MODE: u32 = 0o644;

/// Reports whether an env flag value counts as enabled (`true` or `1`).
pub fn truthy(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "true" | "1")
}

pub fn parse_optional_positive_u64_env(name: &str) -> Result<Option<u64>> {
    match env::var(name) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let parsed = trimmed.parse::<u64>().map_err(|_| {
                anyhow!(
                    "{} must be a positive integer when set (got: {})",
                    name,
                    raw
                )
            })?;
            if parsed == 0 {
                return Err(anyhow!("{} must be > 0 when set", name));
            }
            Ok(Some(parsed))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("failed reading {}: {}", name, err)),
    }
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn ensure_dir_with_mode(path: &Path, mode: u32) -> Result<()> {
    ensure_dir(path)?;
    #[cfg(unix)]
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

pub fn local_state_path(autotest_dir: &Path, key: &str) -> PathBuf {
    autotest_dir
        .join(SWARMING_STATE_DIR)
        .join(format!("{}.json", key))
}

pub fn host_info_path(results_dir: &Path, hostname: &str) -> PathBuf {
    results_dir
        .join(HOST_INFO_SUBDIR)
        .join(format!("{}.{}", hostname, HOST_INFO_EXT))
}

pub fn host_info_indented_path(results_dir: &Path, hostname: &str) -> PathBuf {
    results_dir
        .join(HOST_INFO_SUBDIR)
        .join(format!("{}.{}", hostname, HOST_INFO_INDENTED_EXT))
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    atomic_write_bytes(path, &bytes)
}

pub fn write_file_with_mode(path: &Path, bytes: &[u8], mode: u32) -> Result<()> {
    atomic_write_bytes(path, bytes)?;
    #[cfg(unix)]
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}
