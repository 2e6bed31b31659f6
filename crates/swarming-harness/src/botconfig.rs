use anyhow::{anyhow, Result};
use std::env;
use std::path::PathBuf;
use swarming_core::{
    truthy, ENV_ADMIN_SERVICE, ENV_AUTOTEST_DIR, ENV_FLEET_MULTIDUTS_FLAG,
    ENV_FLEET_RESOURCE_NAME, ENV_INVENTORY_SERVICE, ENV_LUCIFER_TOOLS_DIR, ENV_PARSER_PATH,
    ENV_SWARMING_SERVICE, ENV_SWARMING_TASK_ID, ENV_UFS_SERVICE, RESULTS_DIR,
};

/// Bot and task configuration, read once from the environment at start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotConfig {
    pub admin_service: Option<String>,
    pub autotest_dir: PathBuf,
    pub lucifer_tools_dir: PathBuf,
    pub parser_path: Option<PathBuf>,
    pub inventory_service: Option<String>,
    pub ufs_service: Option<String>,
    pub swarming_service: Option<String>,
    pub fleet_resource_name: String,
    pub multi_duts: bool,
    pub task_id: String,
}

impl BotConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the config from an arbitrary variable lookup. Blank values
    /// count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let optional = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |name: &str| {
            optional(name).ok_or_else(|| anyhow!("required environment variable {} is not set", name))
        };
        Ok(Self {
            admin_service: optional(ENV_ADMIN_SERVICE),
            autotest_dir: PathBuf::from(required(ENV_AUTOTEST_DIR)?),
            lucifer_tools_dir: PathBuf::from(required(ENV_LUCIFER_TOOLS_DIR)?),
            parser_path: optional(ENV_PARSER_PATH).map(PathBuf::from),
            inventory_service: optional(ENV_INVENTORY_SERVICE),
            ufs_service: optional(ENV_UFS_SERVICE),
            swarming_service: optional(ENV_SWARMING_SERVICE),
            fleet_resource_name: required(ENV_FLEET_RESOURCE_NAME)?,
            multi_duts: optional(ENV_FLEET_MULTIDUTS_FLAG)
                .map(|v| truthy(&v))
                .unwrap_or(false),
            task_id: required(ENV_SWARMING_TASK_ID)?,
        })
    }

    /// Task-level results directory: `<autotest>/results/swarming-<prefix>0/<suffix>`,
    /// where `suffix` is the last character of the task run id.
    pub fn task_results_dir(&self) -> Result<PathBuf> {
        let mut prefix = self.task_id.clone();
        let suffix = prefix
            .pop()
            .ok_or_else(|| anyhow!("swarming task id is empty"))?;
        Ok(self
            .autotest_dir
            .join(RESULTS_DIR)
            .join(format!("swarming-{}0", prefix))
            .join(suffix.to_string()))
    }

    pub fn lucifer_path(&self) -> PathBuf {
        self.lucifer_tools_dir.join("lucifer")
    }

    /// Link to the Swarming task page, when the service is known.
    pub fn task_url(&self) -> Option<String> {
        self.swarming_service.as_ref().map(|host| {
            let host = host.trim_end_matches('/');
            let host = if host.contains("://") {
                host.to_string()
            } else {
                format!("https://{}", host)
            };
            format!("{}/task?id={}", host, self.task_id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn base() -> Vec<(&'static str, &'static str)> {
        vec![
            (ENV_AUTOTEST_DIR, "/usr/local/autotest"),
            (ENV_LUCIFER_TOOLS_DIR, "/opt/lucifer"),
            (ENV_FLEET_RESOURCE_NAME, "dut-42"),
            (ENV_SWARMING_TASK_ID, "4a1b2c3d4e5f6071"),
        ]
    }

    #[test]
    fn reads_required_and_optional_values() {
        let mut vars = base();
        vars.push((ENV_ADMIN_SERVICE, "  "));
        vars.push((ENV_UFS_SERVICE, "ufs.example.com"));
        vars.push((ENV_FLEET_MULTIDUTS_FLAG, "1"));
        let cfg = BotConfig::from_lookup(lookup(&vars)).expect("config");
        assert_eq!(cfg.admin_service, None);
        assert_eq!(cfg.ufs_service.as_deref(), Some("ufs.example.com"));
        assert!(cfg.multi_duts);
        assert_eq!(cfg.lucifer_path(), PathBuf::from("/opt/lucifer/lucifer"));
    }

    #[test]
    fn missing_required_variable_is_named() {
        let vars: Vec<_> = base()
            .into_iter()
            .filter(|(k, _)| *k != ENV_SWARMING_TASK_ID)
            .collect();
        let err = BotConfig::from_lookup(lookup(&vars)).expect_err("missing task id");
        assert!(err.to_string().contains(ENV_SWARMING_TASK_ID));
    }

    #[test]
    fn results_dir_shards_by_run_id() {
        let cfg = BotConfig::from_lookup(lookup(&base())).expect("config");
        assert_eq!(
            cfg.task_results_dir().expect("dir"),
            PathBuf::from("/usr/local/autotest/results/swarming-4a1b2c3d4e5f6070/1")
        );
    }

    #[test]
    fn multi_dut_flag_only_accepts_true_or_one() {
        let mut vars = base();
        vars.push((ENV_FLEET_MULTIDUTS_FLAG, "yes"));
        let cfg = BotConfig::from_lookup(lookup(&vars)).expect("config");
        assert!(!cfg.multi_duts);
    }
}
