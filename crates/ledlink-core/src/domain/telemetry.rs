//! Device-reported state applied to the registry.
//!
//! These writes bypass the validation gate: they only touch telemetry fields
//! (controller status, driver status, output `pwm`/`target_pwm`/`level`/
//! `faulty`, SSR `is_on`) and the derived group `is_on`, none of which take
//! part in a structural invariant.

use std::collections::{BTreeSet, VecDeque};

use crate::domain::model::{ControllerStatus, Driver, LinkState, SensorSample, SENSOR_HISTORY_LEN};
use crate::domain::registry::{EntityKind, Registry, RegistryError};
use crate::protocol::messages::{ChannelRef, ChannelStateEvent};
use crate::protocol::status::StatusReport;

/// Ids whose state changed as a result of one telemetry update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetryChanges {
    pub outputs: BTreeSet<String>,
    pub groups: BTreeSet<String>,
}

impl TelemetryChanges {
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty() && self.groups.is_empty()
    }
}

/// Index of the output an event addresses.  A channel match wins over a
/// slot match.
fn match_output(driver: &Driver, channel: Option<u8>, slot: Option<u8>) -> Option<usize> {
    channel
        .and_then(|c| driver.outputs.iter().position(|o| o.channels.contains(&c)))
        .or_else(|| slot.and_then(|s| driver.outputs.iter().position(|o| o.slot == s)))
}

fn update_totals(status: &mut ControllerStatus, now_ms: u64) {
    let valid = status.sensors.iter().filter(|s| s.valid);
    let mut power = 0.0;
    let mut current = 0.0;
    let mut voltage_sum = 0.0;
    let mut voltage_count = 0u32;
    for sensor in valid {
        power += sensor.power.unwrap_or(0.0);
        current += sensor.current.unwrap_or(0.0);
        if let Some(v) = sensor.voltage {
            voltage_sum += v;
            voltage_count += 1;
        }
    }
    status.total_power = power;
    status.total_current = current;
    status.total_voltage = (voltage_count > 0).then(|| voltage_sum / f64::from(voltage_count));
    status.voltage_sample_count = voltage_count;

    for sensor in status.sensors.iter().filter(|s| s.valid) {
        let history = status
            .sensor_history
            .entry(sensor.bus.clone())
            .or_insert_with(VecDeque::new);
        history.push_back(SensorSample {
            timestamp_ms: sensor.sampled_ms,
            voltage: sensor.voltage,
            current: sensor.current,
            power: sensor.power,
        });
        while history.len() > SENSOR_HISTORY_LEN {
            history.pop_front();
        }
    }
    status.updated_at_ms = Some(now_ms);
}

impl Registry {
    /// Records the session's link state.  Returns `false` for an unknown
    /// controller.
    pub fn set_link_state(&mut self, controller_id: &str, link: LinkState, error: Option<String>) -> bool {
        match self.controllers.get_mut(controller_id) {
            Some(controller) => {
                controller.status.link = link;
                if error.is_some() || link.is_up() {
                    controller.status.last_error = error;
                }
                true
            }
            None => false,
        }
    }

    /// Applies a status snapshot: controller totals, driver status and
    /// per-output level/pwm/faulty.  Disabled outputs are left alone.
    pub fn apply_status(&mut self, controller_id: &str, report: &StatusReport, now_ms: u64) -> TelemetryChanges {
        let mut changes = TelemetryChanges::default();
        let Some(controller) = self.controllers.get_mut(controller_id) else {
            return changes;
        };

        let status = &mut controller.status;
        if report.uptime_ms.is_some() {
            status.uptime_ms = report.uptime_ms;
        }
        if report.device_name.is_some() {
            status.device_name = report.device_name.clone();
        }
        if report.fan.is_some() {
            status.fan = report.fan.clone();
        }
        status.sensors = report.sensors.clone();
        update_totals(status, now_ms);

        for driver_report in &report.drivers {
            let Some(driver) = self
                .drivers
                .values_mut()
                .find(|d| d.controller_id == controller_id && d.driver_index == driver_report.index)
            else {
                continue;
            };
            driver.status.available = driver_report.available;
            driver.status.indicator = driver_report.indicator;
            driver.status.wire = driver_report.wire.clone();

            for channel in &driver_report.channels {
                let Some(pos) = match_output(driver, Some(channel.slot), Some(channel.slot)) else {
                    continue;
                };
                let output = &mut driver.outputs[pos];
                if output.disabled {
                    continue;
                }
                let before = (output.level, output.pwm, output.faulty);
                output.level = channel.level;
                output.pwm = channel.pwm;
                output.faulty = channel.faulty;
                if before != (output.level, output.pwm, output.faulty) {
                    changes.outputs.insert(output.id.clone());
                }
            }
        }

        changes.groups = self.refresh_group_states();
        changes
    }

    /// Applies a `led.channel_state` style event.  A missing `pwm` is
    /// derived from the level: `max_pwm` when on, `min_pwm` when off.
    pub fn apply_channel_state(&mut self, controller_id: &str, event: &ChannelStateEvent) -> TelemetryChanges {
        let mut changes = TelemetryChanges::default();
        let target = &event.target;
        let Some(driver) = self.drivers.values_mut().find(|d| {
            d.controller_id == controller_id && Some(d.driver_index) == target.driver
        }) else {
            return changes;
        };
        let Some(pos) = match_output(driver, target.channel, target.slot) else {
            return changes;
        };
        let output = &mut driver.outputs[pos];
        if output.disabled {
            return changes;
        }

        if let Some(level) = event.level {
            output.level = level;
        }
        match (event.pwm, event.level) {
            (Some(pwm), _) => output.pwm = pwm,
            (None, Some(level)) => {
                output.pwm = if level > 0 { output.max_pwm } else { output.min_pwm };
            }
            (None, None) => {}
        }
        if let Some(faulty) = event.faulty {
            output.faulty = faulty;
        }
        changes.outputs.insert(output.id.clone());
        changes.groups = self.refresh_group_states();
        changes
    }

    /// Sets or clears `faulty`.  Disabled outputs always read as not faulty.
    pub fn apply_fault(&mut self, controller_id: &str, target: &ChannelRef, active: bool) -> TelemetryChanges {
        let mut changes = TelemetryChanges::default();
        let Some(driver) = self.drivers.values_mut().find(|d| {
            d.controller_id == controller_id && Some(d.driver_index) == target.driver
        }) else {
            return changes;
        };
        let Some(pos) = match_output(driver, target.channel, target.slot) else {
            return changes;
        };
        let output = &mut driver.outputs[pos];
        output.faulty = active && !output.disabled;
        changes.outputs.insert(output.id.clone());
        changes.groups = self.refresh_group_states();
        changes
    }

    /// Records the state of an output after the device acknowledged a
    /// command for it.  `target_pwm` is always stored; when `on` is false the
    /// output reads as off at `min_pwm`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown output.
    pub fn record_output_commanded(&mut self, output_id: &str, target_pwm: u8, on: bool) -> Result<(), RegistryError> {
        let output = self.led_output_mut(output_id).ok_or_else(|| RegistryError::NotFound {
            kind: EntityKind::LedOutput,
            id: output_id.to_string(),
        })?;
        if output.disabled {
            return Ok(());
        }
        output.target_pwm = target_pwm;
        if on {
            output.pwm = target_pwm;
            output.level = 1;
        } else {
            output.pwm = output.min_pwm;
            output.level = 0;
        }
        self.refresh_group_states();
        Ok(())
    }

    /// Recomputes every group's `is_on`; returns the ids that changed.
    pub(crate) fn refresh_group_states(&mut self) -> BTreeSet<String> {
        let computed: Vec<(String, bool)> = self
            .groups
            .values()
            .map(|g| (g.id.clone(), self.group_is_on(g)))
            .collect();
        let mut changed = BTreeSet::new();
        for (id, on) in computed {
            if let Some(group) = self.groups.get_mut(&id) {
                if group.is_on != on {
                    group.is_on = on;
                    changed.insert(id);
                }
            }
        }
        changed
    }
}
