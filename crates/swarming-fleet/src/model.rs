//! Wire messages of the fleet services, in their pRPC JSON form.
//!
//! Only the fields the worker reads or writes are modelled; unknown fields
//! are ignored on decode.

use serde::{Deserialize, Serialize};

pub const MACHINE_PREFIX: &str = "machines/";
pub const MACHINE_LSE_PREFIX: &str = "machineLSEs/";
pub const SCHEDULING_UNIT_PREFIX: &str = "schedulingunits/";
pub const HOST_STATE_PREFIX: &str = "hosts/";

pub fn strip_resource_prefix<'a>(name: &'a str, prefix: &str) -> &'a str {
    name.strip_prefix(prefix).unwrap_or(name)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Machine {
    pub name: String,
    pub serial_number: String,
    pub chromeos_machine: Option<ChromeOsMachine>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChromeOsMachine {
    pub reference_board: String,
    pub build_target: String,
    pub model: String,
    pub chrome_platform: String,
    pub sku: String,
    pub device_sku: String,
    pub phase: String,
    pub hwid: String,
    pub brand: String,
    pub device_config: Option<DeviceConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceConfig {
    pub variants: Vec<String>,
    pub hwid_components: Vec<String>,
    pub cts_abi: Vec<String>,
    pub cts_cpu: Vec<String>,
    pub ec_type: String,
    pub os_type: String,
    pub arc: bool,
    pub capabilities: Option<HardwareCapabilities>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HardwareCapabilities {
    pub bluetooth: bool,
    pub detachablebase: bool,
    pub fingerprint: bool,
    pub flashrom: bool,
    pub hotwording: bool,
    pub internal_display: bool,
    pub lucidsleep: bool,
    pub touchpad: bool,
    pub touchscreen: bool,
    pub webcam: bool,
    pub carrier: String,
    pub gpu_family: String,
    pub graphics: String,
    pub modem: String,
    pub power: String,
    pub storage: String,
    pub video_acceleration: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MachineLse {
    pub name: String,
    pub hostname: String,
    pub machines: Vec<String>,
    #[serde(rename = "chromeosMachineLse")]
    pub chromeos_machine_lse: Option<ChromeOsMachineLse>,
}

impl MachineLse {
    pub fn dut(&self) -> Option<&DeviceUnderTest> {
        self.chromeos_machine_lse
            .as_ref()?
            .device_lse
            .as_ref()?
            .dut
            .as_ref()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChromeOsMachineLse {
    pub device_lse: Option<ChromeOsDeviceLse>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChromeOsDeviceLse {
    pub dut: Option<DeviceUnderTest>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceUnderTest {
    pub hostname: String,
    pub peripherals: Option<Peripherals>,
    pub pools: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Peripherals {
    pub servo: Option<Servo>,
    pub rpm: Option<Rpm>,
    pub chameleon: Option<Chameleon>,
    pub audio: Option<Audio>,
    pub camerabox: bool,
    pub smart_usbhub: bool,
    pub bluetooth_peers: Vec<BluetoothPeer>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Servo {
    pub servo_hostname: String,
    pub servo_port: i32,
    pub servo_serial: String,
    pub servo_type: String,
    pub servo_setup: String,
    pub servo_topology: Option<ServoTopology>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServoTopology {
    pub main: Option<ServoTopologyItem>,
    pub children: Vec<ServoTopologyItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServoTopologyItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub sysfs_product: String,
    pub serial: String,
    pub usb_hub_port: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Rpm {
    pub powerunit_name: String,
    pub powerunit_outlet: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Chameleon {
    pub chameleon_peripherals: Vec<String>,
    pub audio_board: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Audio {
    pub audio_box: bool,
    pub atrus: bool,
    pub audio_cable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BluetoothPeer {
    pub hostname: String,
    pub state: String,
}

/// Component states of a DUT (servo, storage, battery, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DutComponentState {
    pub id: Option<ChromeOsDeviceId>,
    pub hostname: String,
    pub servo: String,
    pub chameleon: String,
    pub audio_loopback_dongle: String,
    pub working_bluetooth_btpeer: i32,
    pub cr50_phase: String,
    pub cr50_key_env: String,
    pub storage_state: String,
    pub servo_usb_state: String,
    pub battery_state: String,
    pub rpm_state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChromeOsDeviceId {
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DutMeta {
    pub chromeos_device_id: String,
    pub hostname: String,
    pub serial_number: String,
    pub hw_id: String,
    pub device_sku: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LabMeta {
    pub chromeos_device_id: String,
    pub hostname: String,
    pub servo_type: String,
    pub smart_usbhub: bool,
    pub servo_topology: Option<ServoTopology>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateDutStateRequest {
    pub dut_state: DutComponentState,
    pub dut_meta: DutMeta,
    pub lab_meta: LabMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetDutStateRequest {
    pub chromeos_device_id: String,
    pub hostname: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StateRecord {
    pub resource_name: String,
    pub state: String,
    pub description: String,
    pub update_time: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NameRequest {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetStateRequest {
    pub resource_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateStateRequest {
    pub state: StateRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListMachineLsesRequest {
    pub page_size: i32,
    pub page_token: String,
    pub filter: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListMachineLsesResponse {
    #[serde(rename = "machineLSEs")]
    pub machine_lses: Vec<MachineLse>,
    pub next_page_token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulingUnit {
    pub name: String,
    #[serde(rename = "machineLSEs")]
    pub machine_lses: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetStableVersionRequest {
    pub hostname: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetStableVersionResponse {
    pub cros_version: String,
    pub faft_version: String,
    pub firmware_version: String,
    pub servo_cros_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Empty {}
