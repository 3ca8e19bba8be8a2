//! Group evaluation: turns a group-level intent into per-member targets.
//!
//! Pure computation over a registry view; nothing here talks to hardware.
//!
//! ```text
//!   GroupIntent::Power(true)   ──► stored brightness ──┐
//!   GroupIntent::Power(false)  ──► all members off     ├──► GroupTargets
//!   GroupIntent::Brightness(p) ──► p, implies on     ──┘      ├─ leds: LedTarget per active output
//!                                                              └─ ssrs: SsrTarget per SSR entry
//! ```

use serde::{Deserialize, Serialize};

use crate::domain::model::{Group, MemberRef};
use crate::domain::registry::{EntityKind, Registry, RegistryError};

/// `round(min + (max - min) * clamp(percent, 0, 100) / 100)`.
///
/// # Examples
///
/// ```rust
/// use ledlink_core::domain::groups::target_pwm;
///
/// assert_eq!(target_pwm(10, 200, 50), 105);
/// assert_eq!(target_pwm(10, 200, 0), 10);
/// assert_eq!(target_pwm(10, 200, 150), 200);
/// ```
pub fn target_pwm(min_pwm: u8, max_pwm: u8, percent: i64) -> u8 {
    let percent = percent.clamp(0, 100) as f64;
    let span = f64::from(max_pwm.saturating_sub(min_pwm));
    let value = f64::from(min_pwm) + span * percent / 100.0;
    value.round().clamp(0.0, 255.0) as u8
}

/// What the caller wants a group to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupIntent {
    /// On at the group's stored brightness, or off.
    Power(bool),
    /// On at this percentage.
    Brightness(u8),
}

/// Concrete target for one LED output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedTarget {
    pub output_id: String,
    pub controller_id: String,
    pub driver_index: u8,
    pub slot: u8,
    pub channels: Vec<u8>,
    pub target_pwm: u8,
    pub on: bool,
}

/// Concrete target for one SSR entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsrTarget {
    pub ssr_id: String,
    pub bit_index: u8,
    pub on: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupTargets {
    pub leds: Vec<LedTarget>,
    pub ssrs: Vec<SsrTarget>,
}

/// Live state of one group for the read surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupStateView {
    pub group_id: String,
    pub name: String,
    pub is_on: bool,
    pub brightness: u8,
    pub led_ids: Vec<String>,
    pub faulty_leds: Vec<String>,
}

impl Registry {
    /// Resolves `intent` for every member of `group_id`.
    ///
    /// Disabled outputs are skipped unless faulty.  Members that no longer
    /// resolve are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown group.
    pub fn evaluate_group(&self, group_id: &str, intent: GroupIntent) -> Result<GroupTargets, RegistryError> {
        let group = self.group(group_id).ok_or_else(|| RegistryError::NotFound {
            kind: EntityKind::Group,
            id: group_id.to_string(),
        })?;
        let (on, percent) = match intent {
            GroupIntent::Power(on) => (on, group.brightness),
            GroupIntent::Brightness(p) => (true, p.min(100)),
        };

        let mut targets = GroupTargets::default();
        for member in &group.members {
            match member {
                MemberRef::Led(id) => {
                    let Some((driver, output)) = self.led_output(id) else {
                        continue;
                    };
                    if output.disabled {
                        continue;
                    }
                    targets.leds.push(LedTarget {
                        output_id: output.id.clone(),
                        controller_id: driver.controller_id.clone(),
                        driver_index: driver.driver_index,
                        slot: output.slot,
                        channels: output.wire_channels(),
                        target_pwm: target_pwm(output.min_pwm, output.max_pwm, i64::from(percent)),
                        on,
                    });
                }
                MemberRef::Ssr(id) => {
                    if let Some(entry) = self.ssr_entry(id) {
                        targets.ssrs.push(SsrTarget {
                            ssr_id: entry.id.clone(),
                            bit_index: entry.bit_index,
                            on,
                        });
                    }
                }
            }
        }
        Ok(targets)
    }

    /// A group is on when it has at least one active member and every one
    /// of them is lit (or faulty, for LEDs).  Disabled outputs do not count.
    pub fn group_is_on(&self, group: &Group) -> bool {
        let mut active = 0usize;
        for member in &group.members {
            let lit = match member {
                MemberRef::Led(id) => match self.led_output(id) {
                    Some((_, o)) if !o.disabled => o.level > 0 || o.faulty,
                    _ => continue,
                },
                MemberRef::Ssr(id) => match self.ssr_entry(id) {
                    Some(entry) => entry.is_on,
                    None => continue,
                },
            };
            if !lit {
                return false;
            }
            active += 1;
        }
        active > 0
    }

    /// Per-group live state, in id order.
    pub fn groups_state_view(&self) -> Vec<GroupStateView> {
        self.groups()
            .map(|group| {
                let led_ids: Vec<String> = group.led_ids().map(str::to_string).collect();
                let faulty_leds = led_ids
                    .iter()
                    .filter(|id| self.led_output(id).is_some_and(|(_, o)| o.faulty))
                    .cloned()
                    .collect();
                GroupStateView {
                    group_id: group.id.clone(),
                    name: group.name.clone(),
                    is_on: group.is_on,
                    brightness: group.brightness,
                    led_ids,
                    faulty_leds,
                }
            })
            .collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{ControllerInput, DriverInput, GroupInput, OutputInput, SsrInput};
    use crate::protocol::messages::ChannelRef;

    fn fixture(brightness: u8) -> Registry {
        let mut reg = Registry::new();
        for id in ["c1", "c2"] {
            reg.upsert_controller(ControllerInput { id: Some(id.into()), ..Default::default() })
                .expect("controller");
        }
        reg.upsert_driver(DriverInput {
            id: Some("d1".into()),
            controller_id: Some("c1".into()),
            outputs: vec![
                OutputInput { slot: 0, min_pwm: Some(10), max_pwm: Some(200), ..Default::default() },
                OutputInput { slot: 1, disabled: Some(true), ..Default::default() },
            ],
            ..Default::default()
        })
        .expect("d1");
        reg.upsert_driver(DriverInput {
            id: Some("d2".into()),
            controller_id: Some("c2".into()),
            driver_index: Some(3),
            ..Default::default()
        })
        .expect("d2");
        reg.upsert_ssr_entry(SsrInput { id: Some("r".into()), bit_index: 4, ..Default::default() })
            .expect("ssr");
        reg.upsert_group(GroupInput {
            id: Some("g".into()),
            members: Some(vec![
                MemberRef::Led("d1_slot0".into()),
                MemberRef::Led("d1_slot1".into()),
                MemberRef::Led("d2_slot2".into()),
                MemberRef::Ssr("r".into()),
            ]),
            brightness: Some(brightness),
            ..Default::default()
        })
        .expect("group");
        reg
    }

    #[test]
    fn test_target_pwm_boundaries() {
        assert_eq!(target_pwm(10, 200, 0), 10);
        assert_eq!(target_pwm(10, 200, 100), 200);
        assert_eq!(target_pwm(10, 200, -5), 10);
        assert_eq!(target_pwm(0, 255, 50), 128);
        assert_eq!(target_pwm(40, 40, 70), 40);
    }

    #[test]
    fn test_power_on_uses_stored_brightness() {
        // Arrange
        let reg = fixture(50);

        // Act
        let targets = reg.evaluate_group("g", GroupIntent::Power(true)).expect("evaluate");

        // Assert
        assert_eq!(targets.leds.len(), 2, "disabled output is skipped");
        assert_eq!(targets.leds[0].target_pwm, 105);
        assert_eq!(targets.leds[0].controller_id, "c1");
        assert_eq!(targets.leds[1].driver_index, 3);
        assert_eq!(targets.leds[1].channels, vec![2]);
        assert_eq!(targets.ssrs, vec![SsrTarget { ssr_id: "r".into(), bit_index: 4, on: true }]);
    }

    #[test]
    fn test_power_off_marks_every_member_off() {
        let reg = fixture(80);
        let targets = reg.evaluate_group("g", GroupIntent::Power(false)).expect("evaluate");
        assert!(targets.leds.iter().all(|t| !t.on));
        assert!(targets.ssrs.iter().all(|t| !t.on));
    }

    #[test]
    fn test_brightness_intent_implies_on_and_clamps() {
        let reg = fixture(10);
        let targets = reg.evaluate_group("g", GroupIntent::Brightness(250)).expect("evaluate");
        assert!(targets.leds.iter().all(|t| t.on));
        assert_eq!(targets.leds[0].target_pwm, 200);
        assert_eq!(targets.leds[1].target_pwm, 255);
    }

    #[test]
    fn test_fault_on_disabled_output_does_not_bring_it_back() {
        // Arrange
        let mut reg = fixture(100);
        let slot1 = ChannelRef { driver: Some(0), channel: None, slot: Some(1) };
        reg.apply_fault("c1", &slot1, true);

        // Act
        let targets = reg.evaluate_group("g", GroupIntent::Power(true)).expect("evaluate");

        // Assert
        assert!(reg.led_output("d1_slot1").is_some_and(|(_, o)| !o.faulty));
        assert!(targets.leds.iter().all(|t| t.output_id != "d1_slot1"));
    }

    #[test]
    fn test_evaluation_is_stable_after_applying_targets() {
        // Arrange
        let mut reg = fixture(37);
        let first = reg.evaluate_group("g", GroupIntent::Brightness(37)).expect("first");

        // Act
        for t in &first.leds {
            reg.record_output_commanded(&t.output_id, t.target_pwm, t.on).expect("record");
        }
        let second = reg.evaluate_group("g", GroupIntent::Brightness(37)).expect("second");

        // Assert
        assert_eq!(first, second);
    }

    #[test]
    fn test_unknown_group_is_not_found() {
        let reg = Registry::new();
        assert!(reg.evaluate_group("nope", GroupIntent::Power(true)).is_err());
    }

    #[test]
    fn test_empty_group_is_off() {
        let mut reg = Registry::new();
        let group = reg.upsert_group(GroupInput::default()).expect("group");
        assert!(!reg.group_is_on(&group));
    }

    #[test]
    fn test_state_view_lists_faulty_leds() {
        let mut reg = fixture(100);
        if let Some(out) = reg.led_output_mut("d2_slot2") {
            out.faulty = true;
        }
        let view = reg.groups_state_view();
        assert_eq!(view[0].faulty_leds, vec!["d2_slot2".to_string()]);
        assert_eq!(view[0].led_ids.len(), 3);
    }
}
