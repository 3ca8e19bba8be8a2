//! Pushbutton press tracking.
//!
//! A switch reports the full bitmask of buttons currently held.  The tracker
//! diffs each report against the previous one for the same switch and turns
//! the edges into [`ButtonAction`]s:
//!
//! ```text
//!   bit rises, no button configured   ──► Learn
//!   bit rises, button has a group     ──► Toggle        (single press)
//!                                     ──► (reverse ramp direction, double press)
//!                                     ──► ArmHold       (host starts the hold timer)
//!   bit falls                         ──► Release       (host stops timer / ramp)
//! ```
//!
//! Timing is passed in as [`Instant`]s so the tracker stays free of I/O and
//! timers; the host owns the hold timer and the ramp task.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::domain::groups::LedTarget;
use crate::domain::model::MemberRef;
use crate::domain::registry::Registry;
use crate::protocol::messages::ButtonReport;

/// A second press this soon after a release reverses the ramp instead of toggling.
pub const DOUBLE_PRESS_WINDOW: Duration = Duration::from_millis(500);

/// How long a button must stay down before the ramp starts.
pub const HOLD_THRESHOLD: Duration = Duration::from_millis(400);

/// Interval between ramp steps.
pub const RAMP_STEP_INTERVAL: Duration = Duration::from_millis(300);

/// PWM change per ramp step.
pub const RAMP_STEP: u8 = 1;

/// Splits a button mask into its single-bit components, lowest first.
pub fn split_mask(mask: u8) -> impl Iterator<Item = u8> {
    (0..8u8).map(|b| 1u8 << b).filter(move |bit| mask & bit != 0)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RampDirection {
    #[default]
    Up,
    Down,
}

impl RampDirection {
    pub fn reversed(self) -> Self {
        match self {
            RampDirection::Up => RampDirection::Down,
            RampDirection::Down => RampDirection::Up,
        }
    }

    /// One step from `pwm`, held inside `[min, max]`.
    pub fn step(self, pwm: u8, min: u8, max: u8) -> u8 {
        match self {
            RampDirection::Up => pwm.saturating_add(RAMP_STEP).min(max),
            RampDirection::Down => pwm.saturating_sub(RAMP_STEP).max(min),
        }
    }
}

/// A configured button on the reporting switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ButtonBinding {
    pub mask: u8,
    pub group_id: Option<String>,
}

/// Identifies one physical button.
pub type ButtonKey = (u32, u8);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ButtonAction {
    /// Unmapped bit pressed; record it in the discovery table.
    Learn { switch: u32, mask: u8 },
    /// Single press of a grouped button.
    Toggle { group_id: String },
    /// Grouped button went down; start a ramp if it is still held after
    /// [`HOLD_THRESHOLD`].
    ArmHold {
        key: ButtonKey,
        group_id: String,
        direction: RampDirection,
    },
    /// Button went up; cancel any pending hold or running ramp.
    Release { key: ButtonKey },
}

#[derive(Debug, Clone, Default)]
struct PressState {
    direction: RampDirection,
    last_release: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct ButtonTracker {
    previous_masks: HashMap<u32, u8>,
    presses: HashMap<ButtonKey, PressState>,
}

impl ButtonTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Processes one report.  `bindings` are the configured buttons of
    /// `report.switch`.
    pub fn observe(&mut self, report: ButtonReport, bindings: &[ButtonBinding], now: Instant) -> Vec<ButtonAction> {
        let previous = self
            .previous_masks
            .insert(report.switch, report.mask)
            .unwrap_or(0);
        let risen = report.mask & !previous;
        let fallen = previous & !report.mask;
        let mut actions = Vec::new();

        for bit in split_mask(risen) {
            let Some(binding) = bindings.iter().find(|b| b.mask == bit) else {
                actions.push(ButtonAction::Learn { switch: report.switch, mask: bit });
                continue;
            };
            let key = (report.switch, bit);
            let state = self.presses.entry(key).or_default();
            let double = state
                .last_release
                .is_some_and(|released| now.saturating_duration_since(released) <= DOUBLE_PRESS_WINDOW);
            let Some(group_id) = binding.group_id.clone() else {
                continue;
            };
            if double {
                state.direction = state.direction.reversed();
            } else {
                actions.push(ButtonAction::Toggle { group_id: group_id.clone() });
            }
            actions.push(ButtonAction::ArmHold {
                key,
                group_id,
                direction: state.direction,
            });
        }

        for bit in split_mask(fallen) {
            let key = (report.switch, bit);
            if let Some(state) = self.presses.get_mut(&key) {
                state.last_release = Some(now);
                actions.push(ButtonAction::Release { key });
            }
        }
        actions
    }

    /// Current ramp direction of a button.
    pub fn direction(&self, key: ButtonKey) -> RampDirection {
        self.presses.get(&key).map(|s| s.direction).unwrap_or_default()
    }
}

impl Registry {
    /// Targets for one ramp step over a group's active LED members.
    ///
    /// Only outputs whose PWM would actually move are returned; an empty
    /// result means the ramp has reached its end stop.
    pub fn ramp_step_targets(&self, group_id: &str, direction: RampDirection) -> Vec<LedTarget> {
        let Some(group) = self.group(group_id) else {
            return Vec::new();
        };
        group
            .members
            .iter()
            .filter_map(|m| match m {
                MemberRef::Led(id) => self.led_output(id),
                MemberRef::Ssr(_) => None,
            })
            .filter(|(_, o)| !o.disabled)
            .filter_map(|(driver, output)| {
                let next = direction.step(output.pwm, output.min_pwm, output.max_pwm);
                (next != output.pwm).then(|| LedTarget {
                    output_id: output.id.clone(),
                    controller_id: driver.controller_id.clone(),
                    driver_index: driver.driver_index,
                    slot: output.slot,
                    channels: output.wire_channels(),
                    target_pwm: next,
                    on: next > output.min_pwm,
                })
            })
            .collect()
    }
}
