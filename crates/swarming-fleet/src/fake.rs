//! In-memory fleet used by tests. Records every call it receives.

use crate::auth::Identity;
use crate::error::{FleetError, GrpcCode};
use crate::model::{
    ChromeOsDeviceLse, ChromeOsMachine, ChromeOsMachineLse, DeviceUnderTest, DutComponentState,
    GetStableVersionResponse, Machine, MachineLse, SchedulingUnit, StateRecord,
    UpdateDutStateRequest, HOST_STATE_PREFIX, MACHINE_LSE_PREFIX, MACHINE_PREFIX,
};
use crate::FleetTransport;
use std::collections::BTreeMap;
use std::sync::Mutex;
use swarming_core::DutState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCall {
    pub method: String,
    pub identity: Identity,
    pub target: String,
}

#[derive(Default)]
struct FakeState {
    machines: BTreeMap<String, Machine>,
    lses: BTreeMap<String, MachineLse>,
    dut_states: BTreeMap<String, DutComponentState>,
    host_states: BTreeMap<String, StateRecord>,
    scheduling_units: BTreeMap<String, SchedulingUnit>,
    stable_versions: BTreeMap<String, GetStableVersionResponse>,
    failures: BTreeMap<String, (GrpcCode, usize)>,
    calls: Vec<FakeCall>,
    dut_state_updates: Vec<UpdateDutStateRequest>,
}

#[derive(Default)]
pub struct FakeFleet {
    state: Mutex<FakeState>,
}

impl FakeFleet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a minimal machine plus host pair.
    pub fn add_dut(&self, id: &str, hostname: &str) {
        let machine = Machine {
            name: format!("{}{}", MACHINE_PREFIX, id),
            serial_number: format!("SN-{}", id),
            chromeos_machine: Some(ChromeOsMachine {
                build_target: "octopus".to_string(),
                model: "fleex".to_string(),
                hwid: format!("HWID-{}", id),
                ..Default::default()
            }),
        };
        let lse = MachineLse {
            name: format!("{}{}", MACHINE_LSE_PREFIX, hostname),
            hostname: hostname.to_string(),
            machines: vec![id.to_string()],
            chromeos_machine_lse: Some(ChromeOsMachineLse {
                device_lse: Some(ChromeOsDeviceLse {
                    dut: Some(DeviceUnderTest {
                        hostname: hostname.to_string(),
                        ..Default::default()
                    }),
                }),
            }),
        };
        self.add_machine(machine);
        self.add_lse(lse);
    }

    pub fn add_machine(&self, machine: Machine) {
        let id = machine
            .name
            .strip_prefix(MACHINE_PREFIX)
            .unwrap_or(&machine.name)
            .to_string();
        self.lock().machines.insert(id, machine);
    }

    pub fn add_lse(&self, lse: MachineLse) {
        self.lock().lses.insert(lse.hostname.clone(), lse);
    }

    pub fn set_component_state(&self, dut_id: &str, state: DutComponentState) {
        self.lock().dut_states.insert(dut_id.to_string(), state);
    }

    pub fn set_host_state(&self, hostname: &str, state: DutState) {
        self.lock().host_states.insert(
            hostname.to_string(),
            StateRecord {
                resource_name: format!("{}{}", HOST_STATE_PREFIX, hostname),
                state: state.to_fleet().to_string(),
                ..Default::default()
            },
        );
    }

    pub fn add_scheduling_unit(&self, name: &str, hostnames: &[&str]) {
        self.lock().scheduling_units.insert(
            name.to_string(),
            SchedulingUnit {
                name: format!("schedulingunits/{}", name),
                machine_lses: hostnames
                    .iter()
                    .map(|h| format!("{}{}", MACHINE_LSE_PREFIX, h))
                    .collect(),
            },
        );
    }

    pub fn set_stable_version(&self, hostname: &str, resp: GetStableVersionResponse) {
        self.lock().stable_versions.insert(hostname.to_string(), resp);
    }

    /// Makes the next `times` calls to `method` fail with `code`.
    pub fn fail(&self, method: &str, code: GrpcCode, times: usize) {
        self.lock().failures.insert(method.to_string(), (code, times));
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.lock().calls.clone()
    }

    pub fn calls_to(&self, method: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.method == method).count()
    }

    pub fn dut_state_updates(&self) -> Vec<UpdateDutStateRequest> {
        self.lock().dut_state_updates.clone()
    }

    /// Fleet-side state name last written for `hostname`.
    pub fn host_state(&self, hostname: &str) -> Option<String> {
        self.lock().host_states.get(hostname).map(|r| r.state.clone())
    }

    fn record(&self, method: &str, identity: Identity, target: &str) -> Result<(), FleetError> {
        let mut state = self.lock();
        state.calls.push(FakeCall {
            method: method.to_string(),
            identity,
            target: target.to_string(),
        });
        if let Some((code, remaining)) = state.failures.get_mut(method) {
            if *remaining > 0 {
                if *remaining != usize::MAX {
                    *remaining -= 1;
                }
                return Err(FleetError::from_code(method, *code, "injected failure"));
            }
        }
        Ok(())
    }

    fn not_found(method: &str, what: &str) -> FleetError {
        FleetError::from_code(method, GrpcCode::NotFound, format!("{} not found", what))
    }
}

impl FleetTransport for FakeFleet {
    fn get_machine(&self, identity: Identity, id: &str) -> Result<Machine, FleetError> {
        self.record("GetMachine", identity, id)?;
        self.lock()
            .machines
            .get(id)
            .cloned()
            .ok_or_else(|| Self::not_found("GetMachine", id))
    }

    fn get_machine_lse(&self, identity: Identity, hostname: &str) -> Result<MachineLse, FleetError> {
        self.record("GetMachineLSE", identity, hostname)?;
        self.lock()
            .lses
            .get(hostname)
            .cloned()
            .ok_or_else(|| Self::not_found("GetMachineLSE", hostname))
    }

    fn list_machine_lses(&self, identity: Identity, filter: &str) -> Result<Vec<MachineLse>, FleetError> {
        self.record("ListMachineLSEs", identity, filter)?;
        let machine = filter.strip_prefix("machine=").unwrap_or(filter);
        Ok(self
            .lock()
            .lses
            .values()
            .filter(|lse| lse.machines.iter().any(|m| m == machine))
            .cloned()
            .collect())
    }

    fn get_dut_state(
        &self,
        identity: Identity,
        dut_id: &str,
        _hostname: &str,
    ) -> Result<DutComponentState, FleetError> {
        self.record("GetDutState", identity, dut_id)?;
        self.lock()
            .dut_states
            .get(dut_id)
            .cloned()
            .ok_or_else(|| Self::not_found("GetDutState", dut_id))
    }

    fn get_scheduling_unit(&self, identity: Identity, name: &str) -> Result<SchedulingUnit, FleetError> {
        self.record("GetSchedulingUnit", identity, name)?;
        self.lock()
            .scheduling_units
            .get(name)
            .cloned()
            .ok_or_else(|| Self::not_found("GetSchedulingUnit", name))
    }

    fn get_state(&self, identity: Identity, hostname: &str) -> Result<StateRecord, FleetError> {
        self.record("GetState", identity, hostname)?;
        self.lock()
            .host_states
            .get(hostname)
            .cloned()
            .ok_or_else(|| Self::not_found("GetState", hostname))
    }

    fn update_state(&self, identity: Identity, record: &StateRecord) -> Result<(), FleetError> {
        let hostname = record
            .resource_name
            .strip_prefix(HOST_STATE_PREFIX)
            .unwrap_or(&record.resource_name)
            .to_string();
        self.record("UpdateState", identity, &hostname)?;
        self.lock().host_states.insert(hostname, record.clone());
        Ok(())
    }

    fn update_dut_state(&self, identity: Identity, req: &UpdateDutStateRequest) -> Result<(), FleetError> {
        self.record("UpdateDutState", identity, &req.dut_meta.hostname)?;
        self.lock().dut_state_updates.push(req.clone());
        Ok(())
    }

    fn get_stable_version(
        &self,
        identity: Identity,
        hostname: &str,
    ) -> Result<GetStableVersionResponse, FleetError> {
        self.record("GetStableVersion", identity, hostname)?;
        Ok(self
            .lock()
            .stable_versions
            .get(hostname)
            .cloned()
            .unwrap_or_default())
    }
}
