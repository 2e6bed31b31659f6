use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Host state of a DUT as seen by the lab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DutState {
    Ready,
    #[default]
    NeedsRepair,
    NeedsReset,
    RepairFailed,
    NeedsDeploy,
    Reserved,
    ManualRepair,
    NeedsManualRepair,
    NeedsReplacement,
}

pub const ALL_DUT_STATES: &[DutState] = &[
    DutState::Ready,
    DutState::NeedsRepair,
    DutState::NeedsReset,
    DutState::RepairFailed,
    DutState::NeedsDeploy,
    DutState::Reserved,
    DutState::ManualRepair,
    DutState::NeedsManualRepair,
    DutState::NeedsReplacement,
];

impl DutState {
    pub fn all() -> &'static [DutState] {
        ALL_DUT_STATES
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DutState::Ready => "ready",
            DutState::NeedsRepair => "needs_repair",
            DutState::NeedsReset => "needs_reset",
            DutState::RepairFailed => "repair_failed",
            DutState::NeedsDeploy => "needs_deploy",
            DutState::Reserved => "reserved",
            DutState::ManualRepair => "manual_repair",
            DutState::NeedsManualRepair => "needs_manual_repair",
            DutState::NeedsReplacement => "needs_replacement",
        }
    }

    /// Name of the fleet service's state enum value for this state.
    pub fn to_fleet(self) -> &'static str {
        match self {
            DutState::Ready => "STATE_SERVING",
            DutState::NeedsRepair => "STATE_NEEDS_REPAIR",
            DutState::NeedsReset => "STATE_NEEDS_RESET",
            DutState::RepairFailed => "STATE_REPAIR_FAILED",
            DutState::NeedsDeploy => "STATE_DEPLOYED_PRE_SERVING",
            DutState::Reserved => "STATE_RESERVED",
            DutState::ManualRepair => "STATE_DISABLED",
            DutState::NeedsManualRepair => "STATE_DEPLOYED_TESTING",
            DutState::NeedsReplacement => "STATE_DECOMMISSIONED",
        }
    }

    /// Inverse of [`DutState::to_fleet`]; unknown fleet states map to the default.
    pub fn from_fleet(raw: &str) -> DutState {
        ALL_DUT_STATES
            .iter()
            .copied()
            .find(|s| s.to_fleet() == raw)
            .unwrap_or_default()
    }
}

impl fmt::Display for DutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownDutState(pub String);

impl fmt::Display for UnknownDutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown dut state: {}", self.0)
    }
}

impl std::error::Error for UnknownDutState {}

impl FromStr for DutState {
    type Err = UnknownDutState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_DUT_STATES
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownDutState(s.to_string()))
    }
}
