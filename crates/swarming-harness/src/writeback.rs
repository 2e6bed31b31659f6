use crate::hostinfo::{
    HostInfo, LABEL_AUDIO_LOOPBACK_DONGLE, LABEL_BATTERY_STATE, LABEL_CHAMELEON,
    LABEL_CR50_PHASE, LABEL_CR50_RO_KEYID, LABEL_RPM_STATE, LABEL_SERVO_STATE,
    LABEL_SERVO_TOPOLOGY, LABEL_SERVO_USB_STATE, LABEL_SKU, LABEL_SMART_USBHUB,
    LABEL_STORAGE_STATE, LABEL_WORKING_BTPEER,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use swarming_core::DutState;
use swarming_fleet::model::{ChromeOsDeviceId, DutComponentState, DutMeta, LabMeta, ServoTopology};
use swarming_fleet::DutStateUpdate;

const WORKING: &str = "WORKING";

/// Builds the fleet writeback for one DUT from its closed host info.
pub fn dut_state_update(
    info: &HostInfo,
    dut_id: &str,
    hostname: &str,
    state: Option<DutState>,
) -> DutStateUpdate {
    let dut_meta = DutMeta {
        chromeos_device_id: dut_id.to_string(),
        hostname: hostname.to_string(),
        serial_number: info.attribute("serial_number").unwrap_or_default().to_string(),
        hw_id: info.attribute("HWID").unwrap_or_default().to_string(),
        device_sku: info.label_value(LABEL_SKU).unwrap_or_default().to_string(),
    };
    let lab_meta = LabMeta {
        chromeos_device_id: dut_id.to_string(),
        hostname: hostname.to_string(),
        servo_type: info.attribute("servo_type").unwrap_or_default().to_string(),
        smart_usbhub: info.has_label(LABEL_SMART_USBHUB),
        servo_topology: decode_servo_topology(info, hostname),
    };
    let hardware = |label: &str| {
        info.label_value(label)
            .map(|v| format!("HARDWARE_{}", v))
            .unwrap_or_default()
    };
    let peripheral = |flag: &str| {
        if info.has_label(flag) {
            WORKING.to_string()
        } else {
            String::new()
        }
    };
    let components = DutComponentState {
        id: Some(ChromeOsDeviceId {
            value: dut_id.to_string(),
        }),
        hostname: hostname.to_string(),
        servo: info.label_value(LABEL_SERVO_STATE).unwrap_or_default().to_string(),
        rpm_state: info.label_value(LABEL_RPM_STATE).unwrap_or_default().to_string(),
        storage_state: hardware(LABEL_STORAGE_STATE),
        servo_usb_state: hardware(LABEL_SERVO_USB_STATE),
        battery_state: hardware(LABEL_BATTERY_STATE),
        chameleon: peripheral(LABEL_CHAMELEON),
        audio_loopback_dongle: peripheral(LABEL_AUDIO_LOOPBACK_DONGLE),
        working_bluetooth_btpeer: info
            .label_value(LABEL_WORKING_BTPEER)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        cr50_phase: info
            .label_value(LABEL_CR50_PHASE)
            .map(|v| format!("CR50_PHASE_{}", v.to_ascii_uppercase()))
            .unwrap_or_default(),
        cr50_key_env: info
            .label_value(LABEL_CR50_RO_KEYID)
            .map(|v| format!("CR50_KEYENV_{}", v.to_ascii_uppercase()))
            .unwrap_or_default(),
    };
    DutStateUpdate {
        dut_id: dut_id.to_string(),
        hostname: hostname.to_string(),
        state: state.unwrap_or_default(),
        dut_meta,
        lab_meta,
        components,
    }
}

fn decode_servo_topology(info: &HostInfo, hostname: &str) -> Option<ServoTopology> {
    let encoded = info.label_value(LABEL_SERVO_TOPOLOGY)?;
    let decoded = BASE64
        .decode(encoded)
        .map_err(|err| err.to_string())
        .and_then(|raw| serde_json::from_slice(&raw).map_err(|err| err.to_string()));
    match decoded {
        Ok(topology) => Some(topology),
        Err(err) => {
            tracing::warn!(hostname, error = %err, "ignoring undecodable servo topology label");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarming_fleet::model::{Servo, ServoTopologyItem};
    use swarming_fleet::{DeviceInfo, KeyValue, StableVersionMap};

    #[test]
    fn payload_mirrors_the_host_info_document() {
        let mut device = DeviceInfo {
            id: "dut-42".to_string(),
            hostname: "host1".to_string(),
            ..Default::default()
        };
        device.labels.sku = "sku7".to_string();
        device.labels.cr50_phase = "pvt".to_string();
        device.labels.cr50_ro_keyid = "prod".to_string();
        device.attributes = vec![
            KeyValue {
                key: "serial_number".to_string(),
                value: "SN-1".to_string(),
            },
            KeyValue {
                key: "HWID".to_string(),
                value: "HW".to_string(),
            },
        ];
        device.peripherals.servo = Some(Servo {
            servo_hostname: "lab1".to_string(),
            servo_type: "servo_v4".to_string(),
            ..Default::default()
        });
        device.peripherals.servo_topology = Some(ServoTopology {
            main: Some(ServoTopologyItem {
                kind: "servo_v4".to_string(),
                serial: "S1".to_string(),
                ..Default::default()
            }),
            children: Vec::new(),
        });
        device.peripherals.servo_state = "BROKEN".to_string();
        device.peripherals.storage_state = "ACCEPTABLE".to_string();
        device.peripherals.chameleon = true;
        device.peripherals.smart_usbhub = true;
        device.peripherals.working_bluetooth_btpeer = 2;

        let info = HostInfo::from_device(&device, &StableVersionMap::new());
        let update = dut_state_update(&info, "dut-42", "host1", Some(DutState::Ready));

        assert_eq!(update.state, DutState::Ready);
        assert_eq!(update.dut_meta.serial_number, "SN-1");
        assert_eq!(update.dut_meta.hw_id, "HW");
        assert_eq!(update.dut_meta.device_sku, "sku7");
        assert_eq!(update.lab_meta.servo_type, "servo_v4");
        assert!(update.lab_meta.smart_usbhub);
        assert_eq!(update.lab_meta.servo_topology, device.peripherals.servo_topology);
        let c = &update.components;
        assert_eq!(c.servo, "BROKEN");
        assert_eq!(c.storage_state, "HARDWARE_ACCEPTABLE");
        assert_eq!(c.battery_state, "");
        assert_eq!(c.chameleon, "WORKING");
        assert_eq!(c.audio_loopback_dongle, "");
        assert_eq!(c.working_bluetooth_btpeer, 2);
        assert_eq!(c.cr50_phase, "CR50_PHASE_PVT");
        assert_eq!(c.cr50_key_env, "CR50_KEYENV_PROD");
    }

    #[test]
    fn unset_host_state_writes_needs_repair() {
        let update = dut_state_update(&HostInfo::default(), "dut-1", "h", None);
        assert_eq!(update.state, DutState::NeedsRepair);
        assert!(update.lab_meta.servo_topology.is_none());
    }
}
