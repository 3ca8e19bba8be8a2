//! # ledlink-core
//!
//! Shared library for the LED driver fleet engine: the controller wire
//! protocol and the entity registry with its validation, telemetry and
//! evaluation rules.
//!
//! It has no dependencies on async runtimes, serial ports or sockets; the
//! `ledlink-host` crate supplies those.
//!
//! # Architecture overview (for beginners)
//!
//! A fleet consists of *controllers* reachable over a serial link.  Each
//! controller addresses several *drivers* by index, and each driver powers four
//! LED *outputs*.  Outputs are gathered into *groups* that are switched or
//! dimmed together; groups may also contain solid-state relays (SSRs) driven
//! through a CAN frame relayed by one controller.
//!
//! This crate defines:
//!
//! - **`protocol`** – How frames travel over a link.  Each frame is one line
//!   of compact JSON; [`decode_frame`] splits a byte buffer into frames and
//!   resynchronizes past corrupt lines.
//!
//! - **`domain`** – The [`Registry`] of controllers, drivers, groups, switches,
//!   buttons, SSR entries, patch-panel ports and learned buttons, plus the pure
//!   logic that works on it: the group evaluator, telemetry application and
//!   button press tracking.

pub mod domain;
pub mod protocol;

pub use domain::buttons::{ButtonAction, ButtonBinding, ButtonTracker, RampDirection};
pub use domain::groups::{target_pwm, GroupIntent, GroupStateView, GroupTargets, LedTarget, SsrTarget};
pub use domain::model::*;
pub use domain::registry::{EntityKind, Registry, RegistryError, RegistrySnapshot};
pub use domain::telemetry::TelemetryChanges;
pub use protocol::frame::{decode_frame, encode_frame, Frame, ProtocolError};
pub use protocol::log::{Direction, FrameLog, LogEntry};
pub use protocol::messages::{DeviceCommand, DeviceEvent, InboundMessage};
