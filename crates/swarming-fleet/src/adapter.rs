use crate::auth::Identity;
use crate::device::{DeviceInfo, DutLookup, StableVersionMap};
use crate::error::{FleetError, FleetErrorKind};
use crate::model::{
    strip_resource_prefix, DutComponentState, DutMeta, LabMeta, StateRecord,
    UpdateDutStateRequest, HOST_STATE_PREFIX, MACHINE_LSE_PREFIX, MACHINE_PREFIX,
};
use crate::prpc::PrpcTimeouts;
use crate::FleetTransport;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use swarming_core::{parse_optional_positive_u64_env, CancelToken, DutState};

pub const ENV_FLEET_RETRY_MAX_ATTEMPTS: &str = "SSW_FLEET_RETRY_MAX_ATTEMPTS";
pub const ENV_FLEET_RETRY_BASE_BACKOFF_MS: &str = "SSW_FLEET_RETRY_BASE_BACKOFF_MS";
pub const ENV_FLEET_CONNECT_TIMEOUT_MS: &str = "SSW_FLEET_CONNECT_TIMEOUT_MS";
pub const ENV_FLEET_REQUEST_TIMEOUT_MS: &str = "SSW_FLEET_REQUEST_TIMEOUT_MS";

const RETRY_MAX_ATTEMPTS_DEFAULT: usize = 5;
const RETRY_BASE_BACKOFF_MS_DEFAULT: u64 = 500;
const MAX_BACKOFF_SHIFT: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_MAX_ATTEMPTS_DEFAULT,
            base_backoff_ms: RETRY_BASE_BACKOFF_MS_DEFAULT,
        }
    }
}

impl RetrySettings {
    fn backoff_delay(&self, attempt: usize) -> Duration {
        let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT) as u32;
        Duration::from_millis(self.base_backoff_ms.saturating_mul(1u64 << shift))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FleetSettings {
    pub retry: RetrySettings,
    pub timeouts: PrpcTimeouts,
}

impl FleetSettings {
    pub fn from_env() -> Result<Self> {
        let mut settings = FleetSettings::default();
        if let Some(v) = parse_optional_positive_u64_env(ENV_FLEET_RETRY_MAX_ATTEMPTS)? {
            settings.retry.max_attempts = v as usize;
        }
        if let Some(v) = parse_optional_positive_u64_env(ENV_FLEET_RETRY_BASE_BACKOFF_MS)? {
            settings.retry.base_backoff_ms = v;
        }
        if let Some(v) = parse_optional_positive_u64_env(ENV_FLEET_CONNECT_TIMEOUT_MS)? {
            settings.timeouts.connect = Duration::from_millis(v);
        }
        if let Some(v) = parse_optional_positive_u64_env(ENV_FLEET_REQUEST_TIMEOUT_MS)? {
            settings.timeouts.request = Duration::from_millis(v);
        }
        Ok(settings)
    }
}

/// Host state as last recorded by the fleet. `update_time` is `None` when
/// the fleet has no record for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostStateReading {
    pub state: DutState,
    pub update_time: Option<DateTime<Utc>>,
}

/// Everything written back for one DUT at harness close.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DutStateUpdate {
    pub dut_id: String,
    pub hostname: String,
    pub state: DutState,
    pub dut_meta: DutMeta,
    pub lab_meta: LabMeta,
    pub components: DutComponentState,
}

pub struct FleetAdapter {
    transport: Arc<dyn FleetTransport>,
    admin_service: Option<String>,
    retry: RetrySettings,
}

impl FleetAdapter {
    pub fn new(
        transport: Arc<dyn FleetTransport>,
        admin_service: Option<String>,
        retry: RetrySettings,
    ) -> Self {
        Self {
            transport,
            admin_service: admin_service.filter(|s| !s.trim().is_empty()),
            retry,
        }
    }

    pub fn writes_enabled(&self) -> bool {
        self.admin_service.is_some()
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or
    /// the attempt budget runs out. Cancellation is checked before every
    /// attempt and during every backoff sleep.
    fn call<T>(
        &self,
        method: &str,
        cancel: &CancelToken,
        mut op: impl FnMut() -> Result<T, FleetError>,
    ) -> Result<T, FleetError> {
        let cancelled = |reason| FleetError::Cancelled {
            method: method.to_string(),
            reason,
        };
        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            if let Some(reason) = cancel.cause() {
                return Err(cancelled(reason));
            }
            let err = match op() {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_transient() {
                return Err(err);
            }
            if attempt >= attempts {
                if let Some(reason) = cancel.cause() {
                    return Err(cancelled(reason));
                }
                return Err(FleetError::RetriesExhausted {
                    method: method.to_string(),
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
            let delay = self.retry.backoff_delay(attempt);
            tracing::debug!(method, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying fleet call");
            if cancel.wait_timeout(delay) {
                if let Some(reason) = cancel.cause() {
                    return Err(cancelled(reason));
                }
            }
        }
    }

    /// Resolves a DUT to its authoritative record, filling in whichever of
    /// id and hostname the caller did not know.
    pub fn device(&self, lookup: &DutLookup, cancel: &CancelToken) -> Result<DeviceInfo, FleetError> {
        let t = &self.transport;
        let (machine, lse) = match lookup {
            DutLookup::Id(id) => {
                let machine = self.call("GetMachine", cancel, || t.get_machine(Identity::System, id))?;
                let filter = format!("machine={}", id);
                let mut lses = self.call("ListMachineLSEs", cancel, || {
                    t.list_machine_lses(Identity::System, &filter)
                })?;
                match lses.len() {
                    1 => (machine, lses.remove(0)),
                    0 => {
                        return Err(FleetError::NotFound {
                            method: "ListMachineLSEs".to_string(),
                            message: format!("no host is deployed on dut id {:?}", id),
                        })
                    }
                    n => {
                        return Err(FleetError::malformed(
                            "ListMachineLSEs",
                            format!("expected exactly one host for dut id {:?}, got {}", id, n),
                        ))
                    }
                }
            }
            DutLookup::Hostname(hostname) => {
                let lse = self.call("GetMachineLSE", cancel, || {
                    t.get_machine_lse(Identity::System, hostname)
                })?;
                let machine_id = lse
                    .machines
                    .first()
                    .map(|m| strip_resource_prefix(m, MACHINE_PREFIX).to_string())
                    .filter(|m| !m.is_empty())
                    .ok_or_else(|| {
                        FleetError::malformed(
                            "GetMachineLSE",
                            format!("host {:?} is not attached to any machine", hostname),
                        )
                    })?;
                let machine = self.call("GetMachine", cancel, || {
                    t.get_machine(Identity::System, &machine_id)
                })?;
                (machine, lse)
            }
        };

        let id = strip_resource_prefix(&machine.name, MACHINE_PREFIX).to_string();
        let hostname = if lse.hostname.is_empty() {
            strip_resource_prefix(&lse.name, MACHINE_LSE_PREFIX).to_string()
        } else {
            lse.hostname.clone()
        };
        let component_state = if id.is_empty() || hostname.is_empty() {
            None
        } else {
            match self.call("GetDutState", cancel, || {
                t.get_dut_state(Identity::System, &id, &hostname)
            }) {
                Ok(state) => Some(state),
                Err(err) if err.is_not_found() => None,
                Err(err) => return Err(err),
            }
        };

        DeviceInfo::from_fleet(&machine, &lse, component_state.as_ref()).map_err(|message| {
            FleetError::malformed("GetMachineLSE", format!("{} (looked up by {})", message, lookup))
        })
    }

    /// Never fails: any problem is logged and yields an empty map.
    pub fn stable_versions(&self, hostname: &str, cancel: &CancelToken) -> StableVersionMap {
        if hostname.trim().is_empty() {
            tracing::warn!("stable versions requested for an empty hostname");
            return StableVersionMap::new();
        }
        if self.admin_service.is_none() {
            tracing::info!(hostname, "no admin service configured; skipping stable versions");
            return StableVersionMap::new();
        }
        let t = &self.transport;
        match self.call("GetStableVersion", cancel, || {
            t.get_stable_version(Identity::System, hostname)
        }) {
            Ok(resp) => StableVersionMap::from(&resp),
            Err(err) => {
                tracing::warn!(hostname, error = %err, "failed to fetch stable versions");
                StableVersionMap::new()
            }
        }
    }

    pub fn read_dut_state(&self, hostname: &str, cancel: &CancelToken) -> Result<HostStateReading, FleetError> {
        let t = &self.transport;
        match self.call("GetState", cancel, || t.get_state(Identity::System, hostname)) {
            Ok(record) => Ok(HostStateReading {
                state: DutState::from_fleet(&record.state),
                update_time: record
                    .update_time
                    .as_deref()
                    .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                    .map(|ts| ts.with_timezone(&Utc)),
            }),
            Err(err) if err.kind() == FleetErrorKind::NotFound => Ok(HostStateReading {
                state: DutState::default(),
                update_time: None,
            }),
            Err(err) => Err(err),
        }
    }

    /// Writes DUT metadata, component states and host state under the
    /// task identity. Skipped when no admin service is configured.
    pub fn update_dut_state(&self, update: &DutStateUpdate, cancel: &CancelToken) -> Result<(), FleetError> {
        if self.admin_service.is_none() {
            tracing::warn!(hostname = %update.hostname, "no admin service configured; skipping dut state writeback");
            return Ok(());
        }
        let request = UpdateDutStateRequest {
            dut_state: update.components.clone(),
            dut_meta: update.dut_meta.clone(),
            lab_meta: update.lab_meta.clone(),
        };
        let t = &self.transport;
        self.call("UpdateDutState", cancel, || {
            t.update_dut_state(Identity::Task, &request)
        })?;
        self.write_host_state(&update.hostname, update.state, cancel)?;
        tracing::info!(hostname = %update.hostname, dut_id = %update.dut_id, state = %update.state, "wrote dut state back to fleet");
        Ok(())
    }

    /// Host-state-only writeback. Skipped when no admin service is configured.
    pub fn update_host_state(&self, hostname: &str, state: DutState, cancel: &CancelToken) -> Result<(), FleetError> {
        if self.admin_service.is_none() {
            tracing::warn!(hostname, "no admin service configured; skipping host state writeback");
            return Ok(());
        }
        self.write_host_state(hostname, state, cancel)?;
        tracing::info!(hostname, state = %state, "wrote host state back to fleet");
        Ok(())
    }

    fn write_host_state(&self, hostname: &str, state: DutState, cancel: &CancelToken) -> Result<(), FleetError> {
        let record = StateRecord {
            resource_name: format!("{}{}", HOST_STATE_PREFIX, hostname),
            state: state.to_fleet().to_string(),
            ..Default::default()
        };
        let t = &self.transport;
        self.call("UpdateState", cancel, || t.update_state(Identity::Task, &record))
    }

    /// Hostnames of the DUTs in a scheduling unit, sorted.
    pub fn scheduling_unit_members(&self, name: &str, cancel: &CancelToken) -> Result<Vec<String>, FleetError> {
        let t = &self.transport;
        let unit = self.call("GetSchedulingUnit", cancel, || {
            t.get_scheduling_unit(Identity::System, name)
        })?;
        let mut hostnames: Vec<String> = unit
            .machine_lses
            .iter()
            .map(|n| strip_resource_prefix(n, MACHINE_LSE_PREFIX).to_string())
            .filter(|n| !n.is_empty())
            .collect();
        hostnames.sort();
        hostnames.dedup();
        if hostnames.is_empty() {
            return Err(FleetError::malformed(
                "GetSchedulingUnit",
                format!("scheduling unit {:?} has no DUTs", name),
            ));
        }
        Ok(hostnames)
    }
}
