//! Controller protocol message types.
//!
//! Outbound requests are modelled by the closed [`DeviceCommand`] enum; inbound
//! frames are classified into [`InboundMessage`] by [`InboundMessage::from_frame`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::protocol::fields;
use crate::protocol::frame::{Frame, ProtocolError};
use crate::protocol::status::StatusReport;

// ── Protocol constants ────────────────────────────────────────────────────────

/// LED outputs (and PWM slots) per driver.
pub const SLOTS_PER_DRIVER: usize = 4;

/// Slot value meaning "leave this channel alone" in an `on` command.
pub const SLOT_UNCHANGED: i16 = -1;

/// Trailer bytes the SSR board expects after the mask in a CAN frame.
const SSR_FRAME_TRAILER: [u8; 3] = [0x33, 0x22, 0x11];

/// SSR command opcode byte.
const SSR_OPCODE: u8 = 3;

// ── Outbound commands ─────────────────────────────────────────────────────────

/// Channel list for one driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverChannels {
    pub driver: u8,
    pub channels: Vec<u8>,
}

/// Per-slot PWM values for one driver; [`SLOT_UNCHANGED`] marks unaddressed slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverSlots {
    pub driver: u8,
    pub slots: [i16; SLOTS_PER_DRIVER],
}

impl DriverSlots {
    pub fn untouched(driver: u8) -> Self {
        Self {
            driver,
            slots: [SLOT_UNCHANGED; SLOTS_PER_DRIVER],
        }
    }
}

/// Per-channel calibration pushed by `set_led_config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedChannelConfig {
    pub driver: u8,
    pub channel: u8,
    pub min_pwm: u8,
    pub max_pwm: u8,
    pub current_high: bool,
}

/// A single device-level request.  Exactly one may be in flight per controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Status telemetry request issued by the poll timer.
    Status,
    /// Switch channels on at the given per-slot PWM.
    LedOn { drivers: Vec<DriverSlots> },
    /// Switch channels off.
    LedOff { drivers: Vec<DriverChannels> },
    /// Set every listed channel to one PWM value.
    LedPwm { pwm: u8, drivers: Vec<DriverChannels> },
    /// Push channel calibration.
    LedConfig(LedChannelConfig),
    /// Raw CAN frame relayed by the CAN-interface controller.
    CanSend { sender_id: u32, data: [u8; 8] },
}

impl DeviceCommand {
    /// Builds the CAN frame that sets the SSR board's output mask.
    pub fn ssr_mask(sender_id: u32, base_address: u8, mask: u16) -> Self {
        let [hi, lo] = mask.to_be_bytes();
        let [t0, t1, t2] = SSR_FRAME_TRAILER;
        DeviceCommand::CanSend {
            sender_id,
            data: [base_address, 0, SSR_OPCODE, hi, lo, t0, t1, t2],
        }
    }

    /// Short name used in logs and failure reports.
    pub fn name(&self) -> &'static str {
        match self {
            DeviceCommand::Status => "status",
            DeviceCommand::LedOn { .. } => "led.on",
            DeviceCommand::LedOff { .. } => "led.off",
            DeviceCommand::LedPwm { .. } => "led.pwm",
            DeviceCommand::LedConfig(_) => "led.cfg",
            DeviceCommand::CanSend { .. } => "can.send",
        }
    }

    /// Renders the command as a wire frame.
    pub fn to_frame(&self) -> Frame {
        let value = match self {
            DeviceCommand::Status => json!({"cm": "status"}),
            DeviceCommand::LedOn { drivers } => json!({
                "cm": "led",
                "a": "on",
                "drvs": drivers
                    .iter()
                    .map(|d| json!({"drv": d.driver, "cs": d.slots}))
                    .collect::<Vec<_>>(),
            }),
            DeviceCommand::LedOff { drivers } => json!({
                "cm": "led",
                "a": "off",
                "drvs": drivers
                    .iter()
                    .map(|d| json!({"drv": d.driver, "cs": d.channels}))
                    .collect::<Vec<_>>(),
            }),
            DeviceCommand::LedPwm { pwm, drivers } => json!({
                "cm": "led",
                "a": "pwm",
                "drvs": drivers
                    .iter()
                    .map(|d| json!({"dvr": d.driver, "cs": d.channels}))
                    .collect::<Vec<_>>(),
                "pwm": pwm,
            }),
            DeviceCommand::LedConfig(cfg) => json!({
                "cm": "led",
                "a": "cfg",
                "dvr": cfg.driver,
                "c": cfg.channel,
                "mip": cfg.min_pwm,
                "mp": cfg.max_pwm,
                "ch": cfg.current_high,
            }),
            DeviceCommand::CanSend { sender_id, data } => json!({
                "cm": "can",
                "a": "send",
                "i": sender_id,
                "d": data,
            }),
        };
        match value {
            Value::Object(fields) => Frame::new(fields),
            // json!({..}) always yields an object.
            _ => Frame::new(serde_json::Map::new()),
        }
    }

    /// The (driver, channel) pairs whose state events also acknowledge this
    /// command, or `None` when only an explicit success reply counts.
    pub fn expected_leds(&self) -> Option<BTreeSet<(u8, u8)>> {
        let expected: BTreeSet<(u8, u8)> = match self {
            DeviceCommand::LedOn { drivers } => drivers
                .iter()
                .flat_map(|d| {
                    d.slots
                        .iter()
                        .enumerate()
                        .filter(|(_, pwm)| **pwm != SLOT_UNCHANGED)
                        .map(move |(slot, _)| (d.driver, slot as u8))
                })
                .collect(),
            DeviceCommand::LedOff { drivers } | DeviceCommand::LedPwm { drivers, .. } => drivers
                .iter()
                .flat_map(|d| d.channels.iter().map(move |c| (d.driver, *c)))
                .collect(),
            _ => return None,
        };
        (!expected.is_empty()).then_some(expected)
    }
}

// ── Inbound messages ──────────────────────────────────────────────────────────

/// Identifies the output an event refers to.
///
/// Events name a channel, a slot, or both; matching prefers the channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelRef {
    pub driver: Option<u8>,
    pub channel: Option<u8>,
    pub slot: Option<u8>,
}

impl ChannelRef {
    fn parse(obj: &serde_json::Map<String, Value>) -> Self {
        Self {
            driver: fields::u8_field(obj, &["dvr", "drv", "driver", "idx"]),
            channel: fields::u8_field(obj, &["c", "channel"]),
            slot: fields::u8_field(obj, &["i", "id", "idx"]),
        }
    }

    /// Key used to match events against a pending LED command.
    pub fn ack_key(&self) -> Option<(u8, u8)> {
        Some((self.driver?, self.channel.or(self.slot)?))
    }
}

/// `led.channel_state` / `led.enable` / `led.disable` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStateEvent {
    pub target: ChannelRef,
    pub level: Option<u8>,
    pub pwm: Option<u8>,
    pub faulty: Option<bool>,
}

/// Decoded pushbutton report carried in a CAN frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonReport {
    pub switch: u32,
    pub mask: u8,
}

/// `can.message` payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CanMessage {
    pub id: Option<i64>,
    pub data: Vec<u8>,
}

impl CanMessage {
    /// Interprets the frame as a switch report: byte 0 is the switch, byte 5
    /// the pressed-button mask.
    pub fn button_report(&self) -> Option<ButtonReport> {
        if self.data.len() < 6 {
            return None;
        }
        Some(ButtonReport {
            switch: u32::from(self.data[0]),
            mask: self.data[5],
        })
    }
}

/// Asynchronous notification pushed by a controller.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    ChannelState(ChannelStateEvent),
    Fault { target: ChannelRef, active: bool },
    CanMessage(CanMessage),
    Unknown(String),
}

impl DeviceEvent {
    /// Output the event refers to, for acknowledgement matching.
    pub fn channel(&self) -> Option<&ChannelRef> {
        match self {
            DeviceEvent::ChannelState(ev) => Some(&ev.target),
            DeviceEvent::Fault { target, .. } => Some(target),
            _ => None,
        }
    }
}

/// Classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Telemetry snapshot (reply to a poll, or unsolicited).
    Status(Box<StatusReport>),
    Event(DeviceEvent),
    /// Positive reply to the pending command.
    Ack(Value),
    /// Negative reply to the pending command.
    Error { reason: String },
    /// A tagged frame this host does not act on.
    Other(String),
}

impl InboundMessage {
    /// Classifies a decoded frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedPayload`] for an event frame without
    /// an event name.
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let obj = frame.fields();
        let kind = frame.message_type();
        match kind.as_str() {
            "status" => Ok(InboundMessage::Status(Box::new(StatusReport::parse(obj)))),
            "event" => {
                let name = fields::text(obj, &["ev", "event"]).ok_or_else(|| {
                    ProtocolError::MalformedPayload("event frame without `ev`".to_string())
                })?;
                Ok(InboundMessage::Event(parse_event(&name, obj)))
            }
            "error" => Ok(InboundMessage::Error {
                reason: fields::text(obj, &["reason", "rs"])
                    .unwrap_or_else(|| "command failed".to_string()),
            }),
            "" | "ok" | "success" => Ok(InboundMessage::Ack(frame.clone().into_value())),
            _ => Ok(InboundMessage::Other(kind)),
        }
    }
}

fn parse_event(name: &str, obj: &serde_json::Map<String, Value>) -> DeviceEvent {
    match name {
        "led.channel_state" | "led.enable" | "led.disable" => {
            let level = fields::u8_field(obj, &["level"])
                .or_else(|| fields::boolean(obj, &["on"]).map(u8::from))
                .or_else(|| {
                    fields::text(obj, &["sa", "state"])
                        .filter(|s| !s.is_empty())
                        .map(|s| u8::from(matches!(s.to_ascii_lowercase().as_str(), "on" | "true" | "1")))
                });
            DeviceEvent::ChannelState(ChannelStateEvent {
                target: ChannelRef::parse(obj),
                level,
                pwm: fields::u8_field(obj, &["pwm"]),
                faulty: fields::boolean(obj, &["flt", "fault"]),
            })
        }
        "led.fault" | "led.fault_cleared" => DeviceEvent::Fault {
            target: ChannelRef::parse(obj),
            active: name == "led.fault",
        },
        "can.message" => DeviceEvent::CanMessage(CanMessage {
            id: fields::int(obj, &["i", "id"]),
            data: fields::array(obj, &["d", "data"])
                .iter()
                .filter_map(|v| fields::to_i64(v).and_then(|b| u8::try_from(b).ok()))
                .collect(),
        }),
        other => DeviceEvent::Unknown(other.to_string()),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
