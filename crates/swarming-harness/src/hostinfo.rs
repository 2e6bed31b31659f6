//! The host info store: the document through which the engine sees, and
//! updates, a DUT's labels and attributes.

use crate::localstate::{LocalDutState, PROVISIONABLE_ATTRIBUTES, PROVISIONABLE_LABELS};
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use swarming_core::{
    ensure_dir_with_mode, host_info_indented_path, host_info_path, write_file_with_mode,
    DIR_MODE, FILE_MODE, HOST_INFO_SUBDIR,
};
use swarming_fleet::{DeviceInfo, StableVersionMap};

pub const SERIALIZER_VERSION: u32 = 1;

pub const LABEL_SERVO_TOPOLOGY: &str = "servo_topology";
pub const LABEL_SKU: &str = "sku";
pub const LABEL_SMART_USBHUB: &str = "smart_usbhub";
pub const LABEL_CHAMELEON: &str = "chameleon";
pub const LABEL_AUDIO_LOOPBACK_DONGLE: &str = "audio_loopback_dongle";
pub const LABEL_WORKING_BTPEER: &str = "working_bluetooth_btpeer";
pub const LABEL_CR50_PHASE: &str = "cr50";
pub const LABEL_CR50_RO_KEYID: &str = "cr50-ro-keyid";
pub const LABEL_SERVO_STATE: &str = "servo_state";
pub const LABEL_SERVO_USB_STATE: &str = "servo_usb_state";
pub const LABEL_STORAGE_STATE: &str = "storage_state";
pub const LABEL_BATTERY_STATE: &str = "battery_state";
pub const LABEL_RPM_STATE: &str = "rpm_state";

fn default_serializer_version() -> u32 {
    SERIALIZER_VERSION
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub stable_versions: BTreeMap<String, String>,
    #[serde(default = "default_serializer_version")]
    pub serializer_version: u32,
}

struct LabelSet(Vec<String>);

impl LabelSet {
    fn flag(&mut self, name: &str, on: bool) {
        if on {
            self.0.push(name.to_string());
        }
    }

    fn value(&mut self, name: &str, value: &str) {
        if !value.is_empty() {
            self.0.push(format!("{}:{}", name, value));
        }
    }

    fn values(&mut self, name: &str, values: &[String]) {
        for value in values {
            self.value(name, value);
        }
    }
}

impl HostInfo {
    /// Derives the document from the fleet record. Pure; labels come out
    /// sorted and deduplicated.
    pub fn from_device(device: &DeviceInfo, stable_versions: &StableVersionMap) -> HostInfo {
        let l = &device.labels;
        let p = &device.peripherals;
        let caps = &l.capabilities;
        let mut labels = LabelSet(Vec::new());

        labels.value("board", &l.board);
        labels.value("model", &l.model);
        labels.value(LABEL_SKU, &l.sku);
        labels.value("device-sku", &l.device_sku);
        labels.value("platform", &l.platform);
        labels.value("brand-code", &l.brand);
        labels.value("phase", &l.phase);
        labels.value("ec", &l.ec_type);
        labels.value("os", &l.os_type);
        labels.flag("arc", l.arc);
        labels.values("variant", &l.variants);
        labels.values("pool", &l.pools);
        labels.values("hwid_component", &l.hwid_components);
        labels.values("cts_abi", &l.cts_abi);
        labels.values("cts_cpu", &l.cts_cpu);

        labels.flag("bluetooth", caps.bluetooth);
        labels.flag("detachablebase", caps.detachablebase);
        labels.flag("fingerprint", caps.fingerprint);
        labels.flag("flashrom", caps.flashrom);
        labels.flag("hotwording", caps.hotwording);
        labels.flag("internal_display", caps.internal_display);
        labels.flag("lucidsleep", caps.lucidsleep);
        labels.flag("touchpad", caps.touchpad);
        labels.flag("touchscreen", caps.touchscreen);
        labels.flag("webcam", caps.webcam);
        labels.value("carrier", &caps.carrier);
        labels.value("gpu_family", &caps.gpu_family);
        labels.value("graphics", &caps.graphics);
        labels.value("modem", &caps.modem);
        labels.value("power", &caps.power);
        labels.value("storage", &caps.storage);
        labels.values("hw_video_acc", &caps.video_acceleration);

        labels.value(LABEL_CR50_PHASE, &l.cr50_phase);
        labels.value(LABEL_CR50_RO_KEYID, &l.cr50_ro_keyid);

        labels.flag(
            "servo",
            p.servo
                .as_ref()
                .map(|s| !s.servo_hostname.is_empty())
                .unwrap_or(false),
        );
        labels.value(LABEL_SERVO_STATE, &p.servo_state);
        labels.value(LABEL_SERVO_USB_STATE, &p.servo_usb_state);
        labels.value(LABEL_STORAGE_STATE, &p.storage_state);
        labels.value(LABEL_BATTERY_STATE, &p.battery_state);
        labels.value(LABEL_RPM_STATE, &p.rpm_state);
        labels.flag(LABEL_CHAMELEON, p.chameleon);
        labels.values(LABEL_CHAMELEON, &p.chameleon_types);
        labels.flag("audio_board", p.audio_board);
        labels.flag("audio_box", p.audio_box);
        labels.flag("audio_cable", p.audio_cable);
        labels.flag(LABEL_AUDIO_LOOPBACK_DONGLE, p.audio_loopback_dongle);
        labels.flag("atrus", p.atrus);
        labels.flag("camerabox", p.camerabox);
        labels.flag(LABEL_SMART_USBHUB, p.smart_usbhub);
        if p.working_bluetooth_btpeer > 0 {
            labels.value(LABEL_WORKING_BTPEER, &p.working_bluetooth_btpeer.to_string());
        }
        if let Some(topology) = p.servo_topology.as_ref() {
            match serde_json::to_vec(topology) {
                Ok(raw) => labels.value(LABEL_SERVO_TOPOLOGY, &BASE64.encode(raw)),
                Err(err) => tracing::warn!(hostname = %device.hostname, error = %err, "cannot encode servo topology"),
            }
        }

        let mut attributes: BTreeMap<String, String> = device
            .attributes
            .iter()
            .filter(|kv| !kv.value.is_empty())
            .map(|kv| (kv.key.clone(), kv.value.clone()))
            .collect();
        let mut attr = |key: &str, value: &str| {
            if !value.is_empty() {
                attributes.insert(key.to_string(), value.to_string());
            }
        };
        if let Some(servo) = p.servo.as_ref() {
            attr("servo_host", &servo.servo_hostname);
            if servo.servo_port != 0 {
                attr("servo_port", &servo.servo_port.to_string());
            }
            attr("servo_serial", &servo.servo_serial);
            attr("servo_setup", &servo.servo_setup);
            attr("servo_type", &servo.servo_type);
        }
        if let Some(rpm) = p.rpm.as_ref() {
            attr("powerunit_hostname", &rpm.powerunit_name);
            attr("powerunit_outlet", &rpm.powerunit_outlet);
        }

        let mut info = HostInfo {
            labels: labels.0,
            attributes,
            stable_versions: stable_versions.as_map().clone(),
            serializer_version: SERIALIZER_VERSION,
        };
        info.normalize();
        info
    }

    fn normalize(&mut self) {
        self.labels.sort();
        self.labels.dedup();
    }

    /// Value of a `key:value` label.
    pub fn label_value(&self, key: &str) -> Option<&str> {
        self.labels.iter().find_map(|label| {
            label
                .strip_prefix(key)
                .and_then(|rest| rest.strip_prefix(':'))
        })
    }

    pub fn has_label(&self, name: &str) -> bool {
        self.labels.iter().any(|l| l == name)
    }

    /// Replaces every `key:*` label with `key:value`.
    pub fn set_label(&mut self, key: &str, value: &str) {
        self.remove_label(key);
        self.labels.push(format!("{}:{}", key, value));
        self.normalize();
    }

    pub fn remove_label(&mut self, key: &str) {
        let prefix = format!("{}:", key);
        self.labels.retain(|l| !l.starts_with(&prefix));
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Merges cached provisioning state into the document the engine sees.
    /// A cached label replaces any `key:*` label from the fleet rather than
    /// sitting next to it, so the engine never sees two values for one key.
    pub fn borrow_local_state(&mut self, state: &LocalDutState) {
        for (key, value) in &state.provisionable_labels {
            self.set_label(key, value);
        }
        for (key, value) in &state.provisionable_attributes {
            self.attributes.insert(key.clone(), value.clone());
        }
    }

    /// Copies recognized provisioning entries back into `state`. Recognized
    /// keys missing from the document are dropped; other keys are kept.
    pub fn unborrow_into(&self, state: &mut LocalDutState) {
        for key in PROVISIONABLE_LABELS {
            match self.label_value(key) {
                Some(value) => {
                    state
                        .provisionable_labels
                        .insert(key.to_string(), value.to_string());
                }
                None => {
                    state.provisionable_labels.remove(*key);
                }
            }
        }
        for key in PROVISIONABLE_ATTRIBUTES {
            match self.attribute(key) {
                Some(value) => {
                    state
                        .provisionable_attributes
                        .insert(key.to_string(), value.to_string());
                }
                None => {
                    state.provisionable_attributes.remove(*key);
                }
            }
        }
    }

    /// Canonical serialized form; labels are sorted first.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut copy = self.clone();
        copy.normalize();
        Ok(serde_json::to_vec(&copy)?)
    }

    fn to_indented_bytes(&self) -> Result<Vec<u8>> {
        let mut copy = self.clone();
        copy.normalize();
        let mut raw = serde_json::to_vec_pretty(&copy)?;
        raw.push(b'\n');
        Ok(raw)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<HostInfo> {
        let mut info: HostInfo = serde_json::from_slice(raw)?;
        info.normalize();
        Ok(info)
    }

    pub fn read(path: &Path) -> Result<HostInfo> {
        let raw = fs::read(path).with_context(|| format!("read host info {}", path.display()))?;
        Self::from_bytes(&raw).with_context(|| format!("parse host info {}", path.display()))
    }

    /// Writes the store file under `results_dir` and returns its path. The
    /// indented copy is best-effort.
    pub fn expose(&self, results_dir: &Path, hostname: &str) -> Result<PathBuf> {
        if hostname.is_empty() {
            anyhow::bail!("cannot expose host info: hostname is empty");
        }
        let dir = results_dir.join(HOST_INFO_SUBDIR);
        ensure_dir_with_mode(&dir, DIR_MODE)
            .with_context(|| format!("create host info dir {}", dir.display()))?;
        let path = host_info_path(results_dir, hostname);
        write_file_with_mode(&path, &self.to_bytes()?, FILE_MODE)
            .with_context(|| format!("write host info {}", path.display()))?;

        let indented = host_info_indented_path(results_dir, hostname);
        let written = self
            .to_indented_bytes()
            .and_then(|raw| write_file_with_mode(&indented, &raw, FILE_MODE));
        if let Err(err) = written {
            tracing::warn!(path = %indented.display(), error = %err, "failed to write indented host info copy");
        }
        tracing::info!(hostname, path = %path.display(), "exposed host info");
        Ok(path)
    }
}
