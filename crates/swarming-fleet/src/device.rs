use crate::model::{
    strip_resource_prefix, DutComponentState, GetStableVersionResponse, HardwareCapabilities,
    Machine, MachineLse, Rpm, Servo, ServoTopology, MACHINE_PREFIX,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const STABLE_VERSION_CROS: &str = "cros";
pub const STABLE_VERSION_FAFT: &str = "faft";
pub const STABLE_VERSION_FIRMWARE: &str = "firmware";
pub const STABLE_VERSION_SERVO_CROS: &str = "servo-cros";

/// How a DUT is named when it is looked up in the fleet service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DutLookup {
    Id(String),
    Hostname(String),
}

impl std::fmt::Display for DutLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DutLookup::Id(id) => write!(f, "dut id {:?}", id),
            DutLookup::Hostname(hostname) => write!(f, "hostname {:?}", hostname),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Authoritative record of one DUT as served by the fleet service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub hostname: String,
    pub labels: DeviceLabels,
    pub attributes: Vec<KeyValue>,
    pub peripherals: PeripheralInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceLabels {
    pub board: String,
    pub model: String,
    pub sku: String,
    pub device_sku: String,
    pub platform: String,
    pub brand: String,
    pub phase: String,
    pub ec_type: String,
    pub os_type: String,
    pub arc: bool,
    pub variants: Vec<String>,
    pub pools: Vec<String>,
    pub hwid_components: Vec<String>,
    pub cts_abi: Vec<String>,
    pub cts_cpu: Vec<String>,
    pub capabilities: HardwareCapabilities,
    pub cr50_phase: String,
    pub cr50_ro_keyid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeripheralInfo {
    pub servo: Option<Servo>,
    pub rpm: Option<Rpm>,
    pub servo_topology: Option<ServoTopology>,
    pub servo_state: String,
    pub servo_usb_state: String,
    pub storage_state: String,
    pub battery_state: String,
    pub rpm_state: String,
    pub chameleon: bool,
    pub chameleon_types: Vec<String>,
    pub audio_board: bool,
    pub audio_box: bool,
    pub audio_cable: bool,
    pub audio_loopback_dongle: bool,
    pub atrus: bool,
    pub camerabox: bool,
    pub smart_usbhub: bool,
    pub working_bluetooth_btpeer: i32,
    pub bluetooth_peers: Vec<String>,
}

impl DeviceInfo {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|kv| kv.key == key)
            .map(|kv| kv.value.as_str())
    }

    pub fn hwid(&self) -> Option<&str> {
        self.attribute("HWID")
    }

    pub fn sku(&self) -> &str {
        &self.labels.sku
    }

    pub fn cr50_phase(&self) -> &str {
        &self.labels.cr50_phase
    }

    pub fn cr50_ro_keyid(&self) -> &str {
        &self.labels.cr50_ro_keyid
    }

    /// Assembles a device record from the machine, its LSE and (when the
    /// fleet has one) the component state record.
    pub fn from_fleet(
        machine: &Machine,
        lse: &MachineLse,
        state: Option<&DutComponentState>,
    ) -> Result<DeviceInfo, String> {
        let id = strip_resource_prefix(&machine.name, MACHINE_PREFIX).to_string();
        if id.is_empty() {
            return Err(format!(
                "machine record for {:?} has no id",
                lse.hostname
            ));
        }
        let dut = lse.dut();
        let hostname = if !lse.hostname.is_empty() {
            lse.hostname.clone()
        } else {
            dut.map(|d| d.hostname.clone()).unwrap_or_default()
        };
        if hostname.is_empty() {
            return Err(format!("device info for dut id {:?} has no hostname", id));
        }

        let mut labels = DeviceLabels::default();
        if let Some(cros) = machine.chromeos_machine.as_ref() {
            labels.board = first_non_empty(&cros.build_target, &cros.reference_board);
            labels.model = cros.model.clone();
            labels.sku = cros.sku.clone();
            labels.device_sku = cros.device_sku.clone();
            labels.platform = cros.chrome_platform.clone();
            labels.brand = cros.brand.clone();
            labels.phase = cros.phase.clone();
            if let Some(cfg) = cros.device_config.as_ref() {
                labels.variants = cfg.variants.clone();
                labels.hwid_components = cfg.hwid_components.clone();
                labels.cts_abi = cfg.cts_abi.clone();
                labels.cts_cpu = cfg.cts_cpu.clone();
                labels.ec_type = cfg.ec_type.clone();
                labels.os_type = cfg.os_type.clone();
                labels.arc = cfg.arc;
                labels.capabilities = cfg.capabilities.clone().unwrap_or_default();
            }
        }

        let mut attributes = Vec::new();
        if let Some(hwid) = machine
            .chromeos_machine
            .as_ref()
            .map(|c| c.hwid.as_str())
            .filter(|h| !h.is_empty())
        {
            attributes.push(KeyValue {
                key: "HWID".to_string(),
                value: hwid.to_string(),
            });
        }
        if !machine.serial_number.is_empty() {
            attributes.push(KeyValue {
                key: "serial_number".to_string(),
                value: machine.serial_number.clone(),
            });
        }

        let mut peripherals = PeripheralInfo::default();
        if let Some(dut) = dut {
            labels.pools = dut.pools.clone();
            if let Some(p) = dut.peripherals.as_ref() {
                peripherals.servo = p.servo.clone();
                peripherals.servo_topology =
                    p.servo.as_ref().and_then(|s| s.servo_topology.clone());
                peripherals.rpm = p.rpm.clone();
                if let Some(chameleon) = p.chameleon.as_ref() {
                    peripherals.chameleon_types = chameleon.chameleon_peripherals.clone();
                    peripherals.chameleon = !chameleon.chameleon_peripherals.is_empty();
                    peripherals.audio_board = chameleon.audio_board;
                }
                if let Some(audio) = p.audio.as_ref() {
                    peripherals.audio_box = audio.audio_box;
                    peripherals.atrus = audio.atrus;
                    peripherals.audio_cable = audio.audio_cable;
                }
                peripherals.camerabox = p.camerabox;
                peripherals.smart_usbhub = p.smart_usbhub;
                peripherals.bluetooth_peers = p
                    .bluetooth_peers
                    .iter()
                    .map(|peer| peer.hostname.clone())
                    .filter(|h| !h.is_empty())
                    .collect();
            }
        }

        if let Some(state) = state {
            peripherals.servo_state = normalize_state(&state.servo, "");
            peripherals.servo_usb_state = normalize_state(&state.servo_usb_state, "HARDWARE_");
            peripherals.storage_state = normalize_state(&state.storage_state, "HARDWARE_");
            peripherals.battery_state = normalize_state(&state.battery_state, "HARDWARE_");
            peripherals.rpm_state = normalize_state(&state.rpm_state, "");
            if state.chameleon == "WORKING" {
                peripherals.chameleon = true;
            }
            peripherals.audio_loopback_dongle = state.audio_loopback_dongle == "WORKING";
            peripherals.working_bluetooth_btpeer = state.working_bluetooth_btpeer;
            labels.cr50_phase = state
                .cr50_phase
                .strip_prefix("CR50_PHASE_")
                .filter(|p| *p != "INVALID")
                .map(str::to_ascii_lowercase)
                .unwrap_or_default();
            labels.cr50_ro_keyid = state
                .cr50_key_env
                .strip_prefix("CR50_KEYENV_")
                .filter(|p| *p != "INVALID")
                .map(str::to_ascii_lowercase)
                .unwrap_or_default();
        }

        Ok(DeviceInfo {
            id,
            hostname,
            labels,
            attributes,
            peripherals,
        })
    }
}

fn first_non_empty(a: &str, b: &str) -> String {
    if a.is_empty() {
        b.to_string()
    } else {
        a.to_string()
    }
}

fn normalize_state(raw: &str, prefix: &str) -> String {
    let trimmed = raw.strip_prefix(prefix).unwrap_or(raw);
    match trimmed {
        "" | "UNSPECIFIED" | "STATE_UNSPECIFIED" => String::new(),
        other => other.to_string(),
    }
}

/// Recommended versions for a host. Missing keys read as empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StableVersionMap(BTreeMap<String, String>);

impl StableVersionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> &str {
        self.0.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        self.0.insert(key.to_string(), value.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

impl From<BTreeMap<String, String>> for StableVersionMap {
    fn from(value: BTreeMap<String, String>) -> Self {
        Self(value)
    }
}

impl From<&GetStableVersionResponse> for StableVersionMap {
    fn from(resp: &GetStableVersionResponse) -> Self {
        let mut map = StableVersionMap::new();
        for (key, value) in [
            (STABLE_VERSION_CROS, &resp.cros_version),
            (STABLE_VERSION_FAFT, &resp.faft_version),
            (STABLE_VERSION_FIRMWARE, &resp.firmware_version),
            (STABLE_VERSION_SERVO_CROS, &resp.servo_cros_version),
        ] {
            if !value.is_empty() {
                map.insert(key, value);
            }
        }
        map
    }
}
