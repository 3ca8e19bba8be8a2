//! Decoding of `status` telemetry frames.
//!
//! Shape (abbreviated keys as sent by the firmware):
//! ```text
//! {"t":"status","um":123456,"dv":"ctrl-a",
//!  "f":{"rd":true,"cn":2,"rpm":1800,"flt":false},
//!  "ac":{"sns":[{"bu":"A","idx":0,"rd":true,
//!                "s":{"vd":true,"um":123400,"vlt":{"k":24.1},"cu":{"k":1.2},"pw":{"k":28.9}}}]},
//!  "l":{"drvs":[{"idx":0,"av":true,"idc":false,"w":1,
//!                "cs":[{"idx":0,"on":true,"pwm":120,"flt":false}]}]}}
//! ```
//! Every field is optional; missing values decode to `None` or defaults.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::protocol::fields;

/// Cooling fan block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FanReport {
    pub ready: Option<bool>,
    pub count: Option<i64>,
    pub rpm: Option<i64>,
    pub fault: Option<bool>,
}

/// One current/voltage sensor on a supply wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorReport {
    pub bus: String,
    pub index: Option<i64>,
    pub ready: bool,
    pub valid: bool,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub power: Option<f64>,
    pub sampled_ms: Option<i64>,
}

/// One output channel as reported by a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelReport {
    pub slot: u8,
    pub level: u8,
    pub pwm: u8,
    pub faulty: bool,
}

/// One driver block.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverReport {
    pub index: u8,
    pub available: Option<bool>,
    pub indicator: Option<bool>,
    pub wire: Option<Value>,
    pub channels: Vec<ChannelReport>,
}

/// Full status telemetry snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusReport {
    pub uptime_ms: Option<i64>,
    pub device_name: Option<String>,
    pub fan: Option<FanReport>,
    pub sensors: Vec<SensorReport>,
    pub drivers: Vec<DriverReport>,
}

impl StatusReport {
    /// Decodes a status frame body.  Malformed sub-entries are skipped.
    pub fn parse(obj: &Map<String, Value>) -> Self {
        let sensors = fields::object(obj, &["ac", "acs"])
            .map(|acs| {
                fields::array(acs, &["sns", "sensors"])
                    .iter()
                    .filter_map(Value::as_object)
                    .map(parse_sensor)
                    .collect()
            })
            .unwrap_or_default();

        let drivers = fields::object(obj, &["l", "led"])
            .map(|led| {
                fields::array(led, &["drvs", "drivers"])
                    .iter()
                    .filter_map(Value::as_object)
                    .filter_map(parse_driver)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            uptime_ms: fields::int(obj, &["um", "uptime_ms"]),
            device_name: fields::text(obj, &["dv", "device_name"]),
            fan: fields::object(obj, &["f", "fan"]).map(|fan| FanReport {
                ready: fields::boolean(fan, &["rd", "ready"]),
                count: fields::int(fan, &["cn", "count"]),
                rpm: fields::int(fan, &["rpm"]),
                fault: fields::boolean(fan, &["flt", "fault"]),
            }),
            sensors,
            drivers,
        }
    }
}

/// Reads the Kalman-filtered value from a `{"k": ..}` measurement block.
fn kalman(block: Option<&Map<String, Value>>) -> Option<f64> {
    let block = block?;
    fields::field(block, &["k", "kalman"]).and_then(fields::float)
}

fn parse_sensor(sensor: &Map<String, Value>) -> SensorReport {
    let index = fields::int(sensor, &["idx", "index"]);
    let bus = fields::text(sensor, &["bu", "bus"]).unwrap_or_else(|| match index {
        Some(i) => format!("Bus {i}"),
        None => "Bus ?".to_string(),
    });
    let empty = Map::new();
    let sample = fields::object(sensor, &["s", "sample"]).unwrap_or(&empty);

    SensorReport {
        bus,
        index,
        ready: fields::boolean(sensor, &["rd", "ready"]).unwrap_or(false),
        valid: fields::boolean(sample, &["vd", "valid"]).unwrap_or(false),
        voltage: kalman(fields::object(sample, &["vlt", "voltage"])),
        current: kalman(fields::object(sample, &["cu", "current"])),
        power: kalman(fields::object(sample, &["pw", "power"])),
        sampled_ms: fields::int(sample, &["um", "updated_ms"]),
    }
}

fn parse_driver(driver: &Map<String, Value>) -> Option<DriverReport> {
    let index = fields::u8_field(driver, &["idx", "index"])?;
    let channels = fields::array(driver, &["cs", "channels"])
        .iter()
        .filter_map(Value::as_object)
        .filter_map(parse_channel)
        .collect();

    Some(DriverReport {
        index,
        available: fields::boolean(driver, &["av", "available"]),
        indicator: fields::boolean(driver, &["idc", "indicator"]),
        wire: fields::field(driver, &["w", "wire"]).cloned(),
        channels,
    })
}

fn parse_channel(channel: &Map<String, Value>) -> Option<ChannelReport> {
    let slot = fields::u8_field(channel, &["idx", "index"])?;
    let on = fields::boolean(channel, &["on"]).unwrap_or_else(|| {
        fields::text(channel, &["sa", "state"])
            .map(|s| matches!(s.to_ascii_lowercase().as_str(), "on" | "true" | "1"))
            .unwrap_or(false)
    });
    let faulty = fields::boolean(channel, &["flt", "fault"]).unwrap_or(false)
        || fields::boolean(channel, &["er", "errored"]).unwrap_or(false)
        || fields::boolean(channel, &["ch", "current_high"]).unwrap_or(false);

    Some(ChannelReport {
        slot,
        level: u8::from(on),
        pwm: fields::u8_field(channel, &["pwm"]).unwrap_or(0),
        faulty,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> StatusReport {
        StatusReport::parse(value.as_object().expect("object"))
    }

    #[test]
    fn test_parse_full_status_frame() {
        // Arrange
        let value = json!({
            "t": "status", "um": 5000, "dv": "bench",
            "f": {"rd": true, "cn": 2, "rpm": 1800, "flt": false},
            "ac": {"sns": [
                {"bu": "A", "idx": 0, "rd": true,
                 "s": {"vd": true, "um": 4990, "vlt": {"k": 24.0}, "cu": {"k": 1.5}, "pw": {"k": 36.0}}}
            ]},
            "l": {"drvs": [
                {"idx": 1, "av": true, "idc": false, "w": 2,
                 "cs": [{"idx": 0, "on": true, "pwm": 120}, {"idx": 3, "sa": "off", "er": true}]}
            ]}
        });

        // Act
        let report = parse(value);

        // Assert
        assert_eq!(report.uptime_ms, Some(5000));
        assert_eq!(report.device_name.as_deref(), Some("bench"));
        assert_eq!(report.fan.as_ref().and_then(|f| f.rpm), Some(1800));
        assert_eq!(report.sensors.len(), 1);
        assert_eq!(report.sensors[0].power, Some(36.0));
        assert!(report.sensors[0].valid);
        let driver = &report.drivers[0];
        assert_eq!(driver.index, 1);
        assert_eq!(driver.channels[0], ChannelReport { slot: 0, level: 1, pwm: 120, faulty: false });
        assert_eq!(driver.channels[1], ChannelReport { slot: 3, level: 0, pwm: 0, faulty: true });
    }

    #[test]
    fn test_sensor_without_bus_name_gets_index_label() {
        let report = parse(json!({"ac": {"sns": [{"idx": 4, "s": {}}]}}));
        assert_eq!(report.sensors[0].bus, "Bus 4");
        assert!(!report.sensors[0].valid);
        assert_eq!(report.sensors[0].voltage, None);
    }

    #[test]
    fn test_driver_without_index_is_skipped() {
        let report = parse(json!({"l": {"drvs": [{"av": true}, {"idx": 0}]}}));
        assert_eq!(report.drivers.len(), 1);
    }

    #[test]
    fn test_empty_status_decodes_to_defaults() {
        assert_eq!(parse(json!({"t": "status"})), StatusReport::default());
    }
}
