//! Typed projections of the dynamic JSON results returned by devices.
//!
//! The inner `result` of a response is arbitrary JSON; these records
//! validate and decode the fields the library understands. Nickname and
//! SSID arrive base64-encoded and are decoded to UTF-8 here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::base64_decode;
use crate::error::TapoError;

fn decode_b64_field(value: &mut Option<String>) {
    if let Some(encoded) = value.as_deref() {
        if let Ok(bytes) = base64_decode(encoded) {
            if let Ok(text) = String::from_utf8(bytes) {
                *value = Some(text);
            }
        }
    }
}

/// Result of `get_device_info`.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub model: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub fw_ver: String,
    pub hw_ver: String,
    pub mac: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub ssid: Option<String>,
    #[serde(default)]
    pub device_on: Option<bool>,
    #[serde(default)]
    pub on_time: Option<u64>,
    #[serde(default)]
    pub overheated: Option<bool>,
    #[serde(default)]
    pub rssi: Option<i32>,
    #[serde(default)]
    pub signal_level: Option<u8>,
    #[serde(default)]
    pub brightness: Option<u8>,
    #[serde(default)]
    pub hue: Option<u16>,
    #[serde(default)]
    pub saturation: Option<u8>,
    #[serde(default)]
    pub color_temp: Option<u16>,
    #[serde(default)]
    pub child_num: Option<u32>,
    #[serde(default)]
    pub lighting_effect: Option<LightingEffect>,
}

impl DeviceInfo {
    /// Validated projection of a `get_device_info` result, with
    /// base64-encoded text fields decoded.
    pub fn from_result(result: Value) -> Result<Self, TapoError> {
        let mut info: DeviceInfo = serde_json::from_value(result)
            .map_err(|err| TapoError::InvalidRequest(format!("malformed device info: {err}")))?;
        decode_b64_field(&mut info.nickname);
        decode_b64_field(&mut info.ssid);
        Ok(info)
    }
}

/// Lighting effect record, shared between `get_device_info` results and
/// `set_lighting_effect` parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightingEffect {
    pub name: String,
    pub enable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<u32>>,
}

impl LightingEffect {
    pub fn new(name: impl Into<String>, enable: bool) -> Self {
        Self {
            name: name.into(),
            enable,
            brightness: None,
            segments: None,
        }
    }
}

/// Result of `get_current_power`.
#[derive(Debug, Clone, Deserialize)]
pub struct CurrentPower {
    pub current_power: f64,
}

/// Result of `get_energy_usage`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnergyUsage {
    #[serde(default)]
    pub today_runtime: u64,
    #[serde(default)]
    pub month_runtime: u64,
    #[serde(default)]
    pub today_energy: u64,
    #[serde(default)]
    pub month_energy: u64,
    #[serde(default)]
    pub current_power: Option<f64>,
}

/// Aggregation windows accepted by `get_energy_data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnergyInterval {
    Hourly,
    Daily,
    Monthly,
}

impl EnergyInterval {
    /// Window size in minutes, as the wire expects.
    pub fn minutes(self) -> u64 {
        match self {
            EnergyInterval::Hourly => 60,
            EnergyInterval::Daily => 1440,
            EnergyInterval::Monthly => 43200,
        }
    }
}

/// Result of `get_energy_data`: a measurement series.
#[derive(Debug, Clone, Deserialize)]
pub struct EnergyData {
    pub start_timestamp: u64,
    #[serde(default)]
    pub end_timestamp: Option<u64>,
    pub interval: u64,
    #[serde(default)]
    pub data: Vec<u64>,
    #[serde(default)]
    pub local_time: Option<String>,
}

/// One entry of `get_child_device_list`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChildDevice {
    pub device_id: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub device_on: Option<bool>,
    #[serde(default)]
    pub position: Option<u32>,
}

/// Projects the `child_device_list` array, decoding nicknames.
pub fn children_from_result(result: Value) -> Result<Vec<ChildDevice>, TapoError> {
    let list = result
        .get("child_device_list")
        .cloned()
        .unwrap_or(Value::Array(Vec::new()));
    let mut children: Vec<ChildDevice> = serde_json::from_value(list)
        .map_err(|err| TapoError::InvalidRequest(format!("malformed child list: {err}")))?;
    for child in &mut children {
        decode_b64_field(&mut child.nickname);
    }
    Ok(children)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::base64_encode;
    use serde_json::json;

    #[test]
    fn device_info_decodes_base64_text_fields() {
        let result = json!({
            "device_id": "8022AB41",
            "model": "L530",
            "type": "SMART.TAPOBULB",
            "fw_ver": "1.1.9",
            "hw_ver": "2.0",
            "mac": "AA-BB-CC-DD-EE-FF",
            "nickname": base64_encode("Desk lamp".as_bytes()),
            "ssid": base64_encode("Home".as_bytes()),
            "device_on": true,
            "brightness": 80,
            "hue": 120,
            "saturation": 100,
        });
        let info = DeviceInfo::from_result(result).unwrap();
        assert_eq!(info.nickname.as_deref(), Some("Desk lamp"));
        assert_eq!(info.ssid.as_deref(), Some("Home"));
        assert_eq!(info.device_on, Some(true));
        assert_eq!(info.hue, Some(120));
    }

    #[test]
    fn device_info_requires_identity_fields() {
        let err = DeviceInfo::from_result(json!({"model": "P100"})).unwrap_err();
        assert!(matches!(err, TapoError::InvalidRequest(_)));
    }

    #[test]
    fn energy_usage_tolerates_missing_power() {
        let usage: EnergyUsage = serde_json::from_value(json!({
            "today_runtime": 120,
            "month_runtime": 4000,
            "today_energy": 500,
            "month_energy": 9000,
        }))
        .unwrap();
        assert_eq!(usage.today_energy, 500);
        assert!(usage.current_power.is_none());
    }

    #[test]
    fn interval_minutes() {
        assert_eq!(EnergyInterval::Hourly.minutes(), 60);
        assert_eq!(EnergyInterval::Daily.minutes(), 1440);
        assert_eq!(EnergyInterval::Monthly.minutes(), 43200);
    }

    #[test]
    fn child_list_decodes_nicknames() {
        let result = json!({
            "child_device_list": [
                {
                    "device_id": "outlet-1",
                    "nickname": base64_encode("Heater".as_bytes()),
                    "device_on": false,
                    "position": 1,
                },
                {"device_id": "outlet-2"},
            ]
        });
        let children = children_from_result(result).unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].nickname.as_deref(), Some("Heater"));
        assert!(children[1].nickname.is_none());
    }

    #[test]
    fn lighting_effect_serializes_sparsely() {
        let effect = LightingEffect::new("Aurora", true);
        let value = serde_json::to_value(&effect).unwrap();
        assert_eq!(value, json!({"name": "Aurora", "enable": true}));
    }
}
