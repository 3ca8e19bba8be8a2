//! Registry entity types and the upsert payloads that create or edit them.
//!
//! Entities live in flat id-indexed tables inside [`crate::domain::registry::Registry`];
//! relationships are plain id strings resolved on demand.
//!
//! Each entity separates *editable* fields (set through an `*Input` upsert)
//! from *telemetry* fields (written only from device frames).  Upserts never
//! touch telemetry fields.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::status::{FanReport, SensorReport};

// ── Constants ─────────────────────────────────────────────────────────────────

pub const OUTPUTS_PER_DRIVER: u8 = 4;
pub const MAX_BUTTONS_PER_SWITCH: u8 = 5;
pub const SSR_MAX_ENTRIES: usize = 10;
pub const SSR_MAX_BITS: u8 = 10;
pub const PATCH_PANEL_PORTS: u8 = 48;
pub const SENSOR_HISTORY_LEN: usize = 200;
pub const DEFAULT_BAUDRATE: u32 = 115_200;

/// Prefix distinguishing SSR members from LED outputs in a group.
pub const SSR_MEMBER_PREFIX: &str = "ssr:";

/// Generates an entity id of the form `{prefix}_{uuid-hex}`.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

// ── Controllers ───────────────────────────────────────────────────────────────

/// Connection state of a controller's session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Polling,
}

impl LinkState {
    pub fn is_up(self) -> bool {
        matches!(self, LinkState::Connected | LinkState::Polling)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Polling => "polling",
        };
        f.write_str(s)
    }
}

/// One retained sensor sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub timestamp_ms: Option<i64>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub power: Option<f64>,
}

/// Live status block, written only by the controller's session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub link: LinkState,
    pub last_error: Option<String>,
    pub uptime_ms: Option<i64>,
    pub device_name: Option<String>,
    pub fan: Option<FanReport>,
    pub sensors: Vec<SensorReport>,
    pub total_power: f64,
    pub total_current: f64,
    /// Mean over valid samples, `None` when no sample carried a voltage.
    pub total_voltage: Option<f64>,
    pub voltage_sample_count: u32,
    /// Recent valid samples per bus, newest last.
    pub sensor_history: BTreeMap<String, VecDeque<SensorSample>>,
    pub updated_at_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Controller {
    pub id: String,
    pub name: String,
    /// Serial port path.
    pub port: Option<String>,
    pub baudrate: u32,
    pub has_can_interface: bool,
    pub polling_enabled: bool,
    /// CAN identifier used when this controller relays SSR frames.
    pub can_sender_id: u32,
    #[serde(default)]
    pub status: ControllerStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerInput {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub baudrate: Option<u32>,
    #[serde(default)]
    pub has_can_interface: Option<bool>,
    #[serde(default)]
    pub polling_enabled: Option<bool>,
    #[serde(default)]
    pub can_sender_id: Option<u32>,
}

// ── Drivers and outputs ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedOutput {
    pub id: String,
    pub slot: u8,
    pub name: String,
    pub channels: Vec<u8>,
    pub min_pwm: u8,
    pub max_pwm: u8,
    pub disabled: bool,
    // Telemetry.
    pub pwm: u8,
    pub target_pwm: u8,
    pub level: u8,
    pub faulty: bool,
}

impl LedOutput {
    pub fn with_defaults(driver_id: &str, slot: u8) -> Self {
        Self {
            id: format!("{driver_id}_slot{slot}"),
            slot,
            name: format!("LED {}", slot + 1),
            channels: vec![slot],
            min_pwm: 0,
            max_pwm: 255,
            disabled: false,
            pwm: 0,
            target_pwm: 0,
            level: 0,
            faulty: false,
        }
    }

    /// Channels to address on the wire; falls back to the slot.
    pub fn wire_channels(&self) -> Vec<u8> {
        if self.channels.is_empty() {
            vec![self.slot]
        } else {
            self.channels.clone()
        }
    }

    pub fn clamp_pwm(&self, pwm: i64) -> u8 {
        pwm.clamp(i64::from(self.min_pwm), i64::from(self.max_pwm)) as u8
    }

    /// Applies the forced telemetry of a disabled output.
    pub(crate) fn normalize(&mut self) {
        if self.max_pwm < self.min_pwm {
            self.max_pwm = self.min_pwm;
        }
        if self.disabled {
            self.level = 0;
            self.pwm = self.min_pwm;
            self.target_pwm = self.min_pwm;
            self.faulty = false;
        }
    }
}

/// Device-reported driver status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverStatus {
    pub available: Option<bool>,
    pub indicator: Option<bool>,
    pub wire: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Driver {
    pub id: String,
    pub controller_id: String,
    pub driver_index: u8,
    pub name: String,
    /// Always four entries, slot `n` at index `n`.
    pub outputs: Vec<LedOutput>,
    #[serde(default)]
    pub status: DriverStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputInput {
    pub slot: u8,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub channels: Option<Vec<u8>>,
    #[serde(default)]
    pub min_pwm: Option<u8>,
    #[serde(default)]
    pub max_pwm: Option<u8>,
    #[serde(default)]
    pub disabled: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverInput {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub controller_id: Option<String>,
    #[serde(default)]
    pub driver_index: Option<u8>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub outputs: Vec<OutputInput>,
}

// ── Groups ────────────────────────────────────────────────────────────────────

/// A group member: an LED output id, or an SSR entry id written `ssr:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MemberRef {
    Led(String),
    Ssr(String),
}

impl From<String> for MemberRef {
    fn from(raw: String) -> Self {
        let trimmed = raw.trim();
        match trimmed.strip_prefix(SSR_MEMBER_PREFIX) {
            Some(id) => MemberRef::Ssr(id.to_string()),
            None => MemberRef::Led(trimmed.to_string()),
        }
    }
}

impl From<MemberRef> for String {
    fn from(member: MemberRef) -> Self {
        member.to_string()
    }
}

impl fmt::Display for MemberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberRef::Led(id) => f.write_str(id),
            MemberRef::Ssr(id) => write!(f, "{SSR_MEMBER_PREFIX}{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub members: Vec<MemberRef>,
    /// 0–100.
    pub brightness: u8,
    /// Derived from member telemetry.
    pub is_on: bool,
}

impl Group {
    pub fn led_ids(&self) -> impl Iterator<Item = &str> {
        self.members.iter().filter_map(|m| match m {
            MemberRef::Led(id) => Some(id.as_str()),
            MemberRef::Ssr(_) => None,
        })
    }

    pub fn ssr_ids(&self) -> impl Iterator<Item = &str> {
        self.members.iter().filter_map(|m| match m {
            MemberRef::Ssr(id) => Some(id.as_str()),
            MemberRef::Led(_) => None,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInput {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub members: Option<Vec<MemberRef>>,
    #[serde(default)]
    pub brightness: Option<u8>,
}

// ── Switches and buttons ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchType {
    #[default]
    Momentary,
    Toggle,
    Dimmer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Switch {
    pub id: String,
    /// Hardware switch number, unique across switches.
    pub switch: u32,
    pub name: String,
    #[serde(rename = "type")]
    pub switch_type: SwitchType,
    /// 1–5.
    pub button_count: u8,
    pub has_buzzer: bool,
    pub flash_leds: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchInput {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub switch: Option<u32>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub switch_type: Option<SwitchType>,
    #[serde(default)]
    pub button_count: Option<u8>,
    #[serde(default)]
    pub has_buzzer: Option<bool>,
    #[serde(default)]
    pub flash_leds: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub id: String,
    pub switch_id: String,
    /// Copy of the parent's hardware switch number, for frame matching.
    pub switch: u32,
    pub name: String,
    /// Single bit in `1..=16`.
    pub mask: u8,
    pub group_id: Option<String>,
}

/// Button upsert.  The parent is named by `switch_id`, or by hardware
/// `switch` number when `switch_id` is absent.  `group_id` is replaced as given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonInput {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub switch_id: Option<String>,
    #[serde(default)]
    pub switch: Option<u32>,
    #[serde(default)]
    pub name: Option<String>,
    pub mask: u8,
    #[serde(default)]
    pub group_id: Option<String>,
}

/// Auto-discovered (switch, mask) pair with no configured button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnedButton {
    /// `"{switch}:{mask}"`.
    pub id: String,
    pub switch: u32,
    pub mask: u8,
    pub controller_id: Option<String>,
    pub count: u32,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
}

impl LearnedButton {
    pub fn key(switch: u32, mask: u8) -> String {
        format!("{switch}:{mask}")
    }
}

// ── SSR ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsrEntry {
    pub id: String,
    pub name: String,
    /// 0–9.
    pub bit_index: u8,
    pub group_id: Option<String>,
    /// Last commanded state.
    pub is_on: bool,
}

/// SSR upsert.  `group_id` is replaced as given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsrInput {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub bit_index: u8,
    #[serde(default)]
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsrConfig {
    pub base_address: u8,
    pub entries: BTreeMap<String, SsrEntry>,
}

// ── Patch panel ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchPanelPort {
    pub port_number: u8,
    pub label: String,
    pub notes: String,
    pub led_ids: Vec<String>,
}

impl PatchPanelPort {
    pub fn unset(port_number: u8) -> Self {
        Self {
            port_number,
            label: format!("Port {port_number}"),
            notes: String::new(),
            led_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchPanelInput {
    pub port_number: u8,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub led_ids: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_ref_parses_ssr_prefix() {
        assert_eq!(MemberRef::from("ssr:ssr_1".to_string()), MemberRef::Ssr("ssr_1".into()));
        assert_eq!(MemberRef::from(" drv_a_slot0 ".to_string()), MemberRef::Led("drv_a_slot0".into()));
    }

    #[test]
    fn test_member_ref_serializes_as_prefixed_string() {
        let members = vec![MemberRef::Led("a".into()), MemberRef::Ssr("b".into())];
        let json = serde_json::to_string(&members).expect("serialize");
        assert_eq!(json, r#"["a","ssr:b"]"#);
    }

    #[test]
    fn test_disabled_output_normalizes_telemetry() {
        // Arrange
        let mut output = LedOutput::with_defaults("drv", 2);
        output.min_pwm = 12;
        output.pwm = 200;
        output.level = 1;
        output.faulty = true;
        output.disabled = true;

        // Act
        output.normalize();

        // Assert
        assert_eq!((output.level, output.pwm, output.target_pwm), (0, 12, 12));
        assert!(!output.faulty);
    }

    #[test]
    fn test_inverted_bounds_collapse_to_min() {
        let mut output = LedOutput::with_defaults("drv", 0);
        output.min_pwm = 100;
        output.max_pwm = 50;
        output.normalize();
        assert_eq!(output.max_pwm, 100);
    }

    #[test]
    fn test_new_id_has_prefix_and_hex_suffix() {
        let id = new_id("ctrl");
        let suffix = id.strip_prefix("ctrl_").expect("prefix");
        assert_eq!(suffix.len(), 32);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
