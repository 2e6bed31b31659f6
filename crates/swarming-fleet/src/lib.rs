//! Client side of the lab fleet services (UFS and the admin inventory).
//!
//! `FleetTransport` is the raw RPC seam; `FleetAdapter` layers retry,
//! identity selection and the read/write policies the harness relies on.

mod adapter;
mod auth;
mod device;
mod error;
#[cfg(any(test, feature = "testing"))]
mod fake;
pub mod model;
mod prpc;

pub use adapter::{
    DutStateUpdate, FleetAdapter, FleetSettings, HostStateReading, RetrySettings,
    ENV_FLEET_CONNECT_TIMEOUT_MS, ENV_FLEET_REQUEST_TIMEOUT_MS, ENV_FLEET_RETRY_BASE_BACKOFF_MS,
    ENV_FLEET_RETRY_MAX_ATTEMPTS,
};
pub use auth::{token_source_from_env, Identity, LuciContextTokenSource, StaticTokenSource, TokenSource};
pub use device::{
    DeviceInfo, DeviceLabels, DutLookup, KeyValue, PeripheralInfo, StableVersionMap,
    STABLE_VERSION_CROS, STABLE_VERSION_FAFT, STABLE_VERSION_FIRMWARE, STABLE_VERSION_SERVO_CROS,
};
pub use error::{FleetError, FleetErrorKind, GrpcCode};
#[cfg(any(test, feature = "testing"))]
pub use fake::{FakeCall, FakeFleet};
pub use prpc::{PrpcFleetTransport, PrpcTimeouts};

use model::{
    DutComponentState, GetStableVersionResponse, Machine, MachineLse, SchedulingUnit, StateRecord,
    UpdateDutStateRequest,
};

/// Unary fleet RPCs, one method per call the worker makes.
pub trait FleetTransport: Send + Sync {
    fn get_machine(&self, identity: Identity, id: &str) -> Result<Machine, FleetError>;
    fn get_machine_lse(&self, identity: Identity, hostname: &str) -> Result<MachineLse, FleetError>;
    fn list_machine_lses(&self, identity: Identity, filter: &str) -> Result<Vec<MachineLse>, FleetError>;
    fn get_dut_state(
        &self,
        identity: Identity,
        dut_id: &str,
        hostname: &str,
    ) -> Result<DutComponentState, FleetError>;
    fn get_scheduling_unit(&self, identity: Identity, name: &str) -> Result<SchedulingUnit, FleetError>;
    fn get_state(&self, identity: Identity, hostname: &str) -> Result<StateRecord, FleetError>;
    fn update_state(&self, identity: Identity, record: &StateRecord) -> Result<(), FleetError>;
    fn update_dut_state(&self, identity: Identity, req: &UpdateDutStateRequest) -> Result<(), FleetError>;
    fn get_stable_version(
        &self,
        identity: Identity,
        hostname: &str,
    ) -> Result<GetStableVersionResponse, FleetError>;
}
