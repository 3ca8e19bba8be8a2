//! The authoritative in-memory entity registry.
//!
//! # Mutation gate
//!
//! Every user-facing mutation goes through [`Registry::transact`]:
//!
//! ```text
//!   clone draft ──► apply edit ──► recompute group state ──► validate()
//!                                                             │
//!                                     Ok ◄── commit draft ◄───┤
//!                                    Err ◄── drop draft  ◄────┘
//! ```
//!
//! A failing check therefore leaves the registry exactly as it was.  Telemetry
//! writes (see `telemetry.rs`) bypass the gate because they only touch
//! device-owned fields and cannot break a structural invariant.
//!
//! The registry holds no locks itself; the host wraps it in a reader/writer
//! lock so concurrent readers never observe a half-applied edit.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::domain::model::{
    new_id, Button, ButtonInput, Controller, ControllerInput, ControllerStatus, Driver,
    DriverInput, DriverStatus, Group, GroupInput, LearnedButton, LedOutput, MemberRef,
    PatchPanelInput, PatchPanelPort, SsrConfig, SsrEntry, SsrInput, Switch, SwitchInput,
    SwitchType, DEFAULT_BAUDRATE, MAX_BUTTONS_PER_SWITCH, OUTPUTS_PER_DRIVER, PATCH_PANEL_PORTS,
    SSR_MAX_BITS, SSR_MAX_ENTRIES,
};

// ── Error type ────────────────────────────────────────────────────────────────

/// Entity type named in a [`RegistryError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Controller,
    Driver,
    LedOutput,
    Group,
    Switch,
    Button,
    SsrEntry,
    PatchPanelPort,
    LearnedButton,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityKind::Controller => "controller",
            EntityKind::Driver => "driver",
            EntityKind::LedOutput => "LED output",
            EntityKind::Group => "group",
            EntityKind::Switch => "switch",
            EntityKind::Button => "button",
            EntityKind::SsrEntry => "SSR entry",
            EntityKind::PatchPanelPort => "patch panel port",
            EntityKind::LearnedButton => "learned button",
        };
        f.write_str(s)
    }
}

/// Validation failure.  Returned before anything is committed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{kind} `{id}` not found")]
    NotFound { kind: EntityKind, id: String },

    #[error("{kind} `{id}` references missing {target_kind} `{target}`")]
    DanglingReference {
        kind: EntityKind,
        id: String,
        target_kind: EntityKind,
        target: String,
    },

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("LED output name `{name}` is used by both `{first}` and `{second}`")]
    DuplicateOutputName {
        name: String,
        first: String,
        second: String,
    },

    #[error("LED output id `{0}` is used more than once")]
    DuplicateOutputId(String),

    #[error("more than one controller holds the CAN interface: {0:?}")]
    MultipleCanInterfaces(Vec<String>),

    #[error("driver index {index} is used twice on controller `{controller_id}`")]
    DuplicateDriverIndex { controller_id: String, index: u8 },

    #[error("switch number {0} is used by more than one switch")]
    DuplicateSwitchNumber(u32),

    #[error("button mask {mask} is not a single bit in 1..=16")]
    InvalidButtonMask { mask: u8 },

    #[error("button mask {mask} is used twice on switch {switch}")]
    DuplicateButtonMask { switch: u32, mask: u8 },

    #[error("switch {switch} has {count} buttons but allows {limit}")]
    TooManyButtons { switch: u32, count: usize, limit: u8 },

    #[error("SSR bit index {0} is outside 0..=9")]
    SsrBitOutOfRange(u8),

    #[error("SSR bit index {0} is used by more than one entry")]
    DuplicateSsrBit(u8),

    #[error("at most {max} SSR entries are allowed, found {count}")]
    TooManySsrEntries { max: usize, count: usize },
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Flat id-indexed tables for every entity type.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    pub(crate) controllers: BTreeMap<String, Controller>,
    pub(crate) drivers: BTreeMap<String, Driver>,
    pub(crate) groups: BTreeMap<String, Group>,
    pub(crate) switches: BTreeMap<String, Switch>,
    pub(crate) buttons: BTreeMap<String, Button>,
    pub(crate) learned: BTreeMap<String, LearnedButton>,
    pub(crate) ssr: SsrConfig,
    pub(crate) patch_panel: BTreeMap<u8, PatchPanelPort>,
}

/// LED output flattened with its location, as exposed in snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedOutputView {
    #[serde(flatten)]
    pub output: LedOutput,
    pub driver_id: String,
    pub controller_id: String,
    pub driver_index: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SsrSnapshot {
    pub base_address: u8,
    pub entries: Vec<SsrEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatchPanelSnapshot {
    pub ports: Vec<PatchPanelPort>,
}

/// Full read model handed to the external surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrySnapshot {
    pub controllers: Vec<Controller>,
    pub drivers: Vec<Driver>,
    pub groups: Vec<Group>,
    pub led_outputs: Vec<LedOutputView>,
    pub switches: Vec<Switch>,
    pub buttons: Vec<Button>,
    pub learned_buttons: Vec<LearnedButton>,
    pub ssr: SsrSnapshot,
    pub patch_panel: PatchPanelSnapshot,
}

fn not_found(kind: EntityKind, id: &str) -> RegistryError {
    RegistryError::NotFound {
        kind,
        id: id.to_string(),
    }
}

/// Uses the caller's id when present and non-blank, otherwise generates one.
fn resolve_id(id: Option<&str>, prefix: &str) -> String {
    match id.map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => new_id(prefix),
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Reads ─────────────────────────────────────────────────────────────────

    pub fn controllers(&self) -> impl Iterator<Item = &Controller> {
        self.controllers.values()
    }

    pub fn controller(&self, id: &str) -> Option<&Controller> {
        self.controllers.get(id)
    }

    /// The controller currently holding the CAN interface, if any.
    pub fn can_controller(&self) -> Option<&Controller> {
        self.controllers.values().find(|c| c.has_can_interface)
    }

    pub fn drivers(&self) -> impl Iterator<Item = &Driver> {
        self.drivers.values()
    }

    pub fn driver(&self, id: &str) -> Option<&Driver> {
        self.drivers.get(id)
    }

    pub fn drivers_of<'a>(&'a self, controller_id: &'a str) -> impl Iterator<Item = &'a Driver> + 'a {
        self.drivers
            .values()
            .filter(move |d| d.controller_id == controller_id)
    }

    /// Every LED output with the driver that owns it.
    pub fn led_outputs(&self) -> impl Iterator<Item = (&Driver, &LedOutput)> {
        self.drivers
            .values()
            .flat_map(|d| d.outputs.iter().map(move |o| (d, o)))
    }

    pub fn led_output(&self, id: &str) -> Option<(&Driver, &LedOutput)> {
        self.led_outputs().find(|(_, o)| o.id == id)
    }

    pub(crate) fn led_output_mut(&mut self, id: &str) -> Option<&mut LedOutput> {
        self.drivers
            .values_mut()
            .flat_map(|d| d.outputs.iter_mut())
            .find(|o| o.id == id)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn group(&self, id: &str) -> Option<&Group> {
        self.groups.get(id)
    }

    pub fn switches(&self) -> impl Iterator<Item = &Switch> {
        self.switches.values()
    }

    pub fn switch(&self, id: &str) -> Option<&Switch> {
        self.switches.get(id)
    }

    pub fn switch_by_number(&self, switch: u32) -> Option<&Switch> {
        self.switches.values().find(|s| s.switch == switch)
    }

    pub fn buttons(&self) -> impl Iterator<Item = &Button> {
        self.buttons.values()
    }

    pub fn button(&self, id: &str) -> Option<&Button> {
        self.buttons.get(id)
    }

    /// The configured button answering to `(switch, mask)`.
    pub fn button_for(&self, switch: u32, mask: u8) -> Option<&Button> {
        self.buttons
            .values()
            .find(|b| b.switch == switch && b.mask == mask)
    }

    pub fn learned_buttons(&self) -> impl Iterator<Item = &LearnedButton> {
        self.learned.values()
    }

    pub fn learned_button(&self, id: &str) -> Option<&LearnedButton> {
        self.learned.get(id)
    }

    pub fn ssr_base_address(&self) -> u8 {
        self.ssr.base_address
    }

    pub fn ssr_entries(&self) -> impl Iterator<Item = &SsrEntry> {
        self.ssr.entries.values()
    }

    pub fn ssr_entry(&self, id: &str) -> Option<&SsrEntry> {
        self.ssr.entries.get(id)
    }

    /// All 48 patch-panel ports; unset ports carry their defaults.
    pub fn patch_panel_ports(&self) -> Vec<PatchPanelPort> {
        (1..=PATCH_PANEL_PORTS)
            .map(|n| {
                self.patch_panel
                    .get(&n)
                    .cloned()
                    .unwrap_or_else(|| PatchPanelPort::unset(n))
            })
            .collect()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            controllers: self.controllers.values().cloned().collect(),
            drivers: self.drivers.values().cloned().collect(),
            groups: self.groups.values().cloned().collect(),
            led_outputs: self
                .led_outputs()
                .map(|(d, o)| LedOutputView {
                    output: o.clone(),
                    driver_id: d.id.clone(),
                    controller_id: d.controller_id.clone(),
                    driver_index: d.driver_index,
                })
                .collect(),
            switches: self.switches.values().cloned().collect(),
            buttons: self.buttons.values().cloned().collect(),
            learned_buttons: self.learned.values().cloned().collect(),
            ssr: SsrSnapshot {
                base_address: self.ssr.base_address,
                entries: self.ssr.entries.values().cloned().collect(),
            },
            patch_panel: PatchPanelSnapshot {
                ports: self.patch_panel_ports(),
            },
        }
    }

    // ── Mutation gate ─────────────────────────────────────────────────────────

    /// Applies `edit` to a draft copy and commits it only if the draft passes
    /// [`Registry::validate`].
    ///
    /// # Errors
    ///
    /// Returns the first error from `edit` or from validation; `self` is
    /// unchanged in that case.
    pub fn transact<T>(
        &mut self,
        edit: impl FnOnce(&mut Registry) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let mut draft = self.clone();
        let result = edit(&mut draft).and_then(|out| {
            draft.refresh_group_states();
            draft.validate().map(|()| out)
        });
        match result {
            Ok(out) => {
                *self = draft;
                Ok(out)
            }
            Err(err) => {
                tracing::debug!(error = %err, "registry edit rejected");
                Err(err)
            }
        }
    }

    /// Checks every structural invariant.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), RegistryError> {
        self.validate_controllers()?;
        self.validate_drivers()?;
        self.validate_groups()?;
        self.validate_switches()?;
        self.validate_ssr()?;
        self.validate_patch_panel()
    }

    fn validate_controllers(&self) -> Result<(), RegistryError> {
        let holders: Vec<String> = self
            .controllers
            .values()
            .filter(|c| c.has_can_interface)
            .map(|c| c.id.clone())
            .collect();
        if holders.len() > 1 {
            return Err(RegistryError::MultipleCanInterfaces(holders));
        }
        Ok(())
    }

    fn validate_drivers(&self) -> Result<(), RegistryError> {
        let mut indices = BTreeSet::new();
        let mut output_ids = BTreeSet::new();
        let mut names: HashMap<String, String> = HashMap::new();

        for driver in self.drivers.values() {
            if !self.controllers.contains_key(&driver.controller_id) {
                return Err(RegistryError::DanglingReference {
                    kind: EntityKind::Driver,
                    id: driver.id.clone(),
                    target_kind: EntityKind::Controller,
                    target: driver.controller_id.clone(),
                });
            }
            if !indices.insert((driver.controller_id.as_str(), driver.driver_index)) {
                return Err(RegistryError::DuplicateDriverIndex {
                    controller_id: driver.controller_id.clone(),
                    index: driver.driver_index,
                });
            }
            let slots_ok = driver.outputs.len() == usize::from(OUTPUTS_PER_DRIVER)
                && driver
                    .outputs
                    .iter()
                    .enumerate()
                    .all(|(i, o)| usize::from(o.slot) == i);
            if !slots_ok {
                return Err(RegistryError::InvalidField {
                    field: "outputs",
                    reason: format!("driver `{}` must have exactly slots 0..=3", driver.id),
                });
            }
            for output in &driver.outputs {
                if !output_ids.insert(output.id.as_str()) {
                    return Err(RegistryError::DuplicateOutputId(output.id.clone()));
                }
                let key = output.name.trim().to_lowercase();
                if key.is_empty() {
                    continue;
                }
                if let Some(first) = names.insert(key, output.id.clone()) {
                    return Err(RegistryError::DuplicateOutputName {
                        name: output.name.trim().to_string(),
                        first,
                        second: output.id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn validate_groups(&self) -> Result<(), RegistryError> {
        for group in self.groups.values() {
            if group.brightness > 100 {
                return Err(RegistryError::InvalidField {
                    field: "brightness",
                    reason: format!("{} exceeds 100", group.brightness),
                });
            }
            for member in &group.members {
                let (target_kind, target, exists) = match member {
                    MemberRef::Led(id) => (EntityKind::LedOutput, id, self.led_output(id).is_some()),
                    MemberRef::Ssr(id) => (EntityKind::SsrEntry, id, self.ssr.entries.contains_key(id)),
                };
                if !exists {
                    return Err(RegistryError::DanglingReference {
                        kind: EntityKind::Group,
                        id: group.id.clone(),
                        target_kind,
                        target: target.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn validate_switches(&self) -> Result<(), RegistryError> {
        let mut numbers = BTreeSet::new();
        for switch in self.switches.values() {
            if !numbers.insert(switch.switch) {
                return Err(RegistryError::DuplicateSwitchNumber(switch.switch));
            }
            if !(1..=MAX_BUTTONS_PER_SWITCH).contains(&switch.button_count) {
                return Err(RegistryError::InvalidField {
                    field: "button_count",
                    reason: format!("{} is outside 1..=5", switch.button_count),
                });
            }
        }

        let mut per_switch: BTreeMap<&str, BTreeSet<u8>> = BTreeMap::new();
        for button in self.buttons.values() {
            let Some(parent) = self.switches.get(&button.switch_id) else {
                return Err(RegistryError::DanglingReference {
                    kind: EntityKind::Button,
                    id: button.id.clone(),
                    target_kind: EntityKind::Switch,
                    target: button.switch_id.clone(),
                });
            };
            if button.switch != parent.switch {
                return Err(RegistryError::InvalidField {
                    field: "switch",
                    reason: format!(
                        "button `{}` carries switch {} but its parent is {}",
                        button.id, button.switch, parent.switch
                    ),
                });
            }
            if !is_button_mask(button.mask) {
                return Err(RegistryError::InvalidButtonMask { mask: button.mask });
            }
            if let Some(group_id) = &button.group_id {
                self.require_group(EntityKind::Button, &button.id, group_id)?;
            }
            let masks = per_switch.entry(parent.id.as_str()).or_default();
            if !masks.insert(button.mask) {
                return Err(RegistryError::DuplicateButtonMask {
                    switch: parent.switch,
                    mask: button.mask,
                });
            }
            if masks.len() > usize::from(parent.button_count) {
                return Err(RegistryError::TooManyButtons {
                    switch: parent.switch,
                    count: masks.len(),
                    limit: parent.button_count,
                });
            }
        }
        Ok(())
    }

    fn validate_ssr(&self) -> Result<(), RegistryError> {
        let count = self.ssr.entries.len();
        if count > SSR_MAX_ENTRIES {
            return Err(RegistryError::TooManySsrEntries {
                max: SSR_MAX_ENTRIES,
                count,
            });
        }
        let mut bits = BTreeSet::new();
        for entry in self.ssr.entries.values() {
            if entry.bit_index >= SSR_MAX_BITS {
                return Err(RegistryError::SsrBitOutOfRange(entry.bit_index));
            }
            if !bits.insert(entry.bit_index) {
                return Err(RegistryError::DuplicateSsrBit(entry.bit_index));
            }
            if let Some(group_id) = &entry.group_id {
                self.require_group(EntityKind::SsrEntry, &entry.id, group_id)?;
            }
        }
        Ok(())
    }

    fn validate_patch_panel(&self) -> Result<(), RegistryError> {
        for port in self.patch_panel.values() {
            if !(1..=PATCH_PANEL_PORTS).contains(&port.port_number) {
                return Err(RegistryError::InvalidField {
                    field: "port_number",
                    reason: format!("{} is outside 1..=48", port.port_number),
                });
            }
            for led_id in &port.led_ids {
                if self.led_output(led_id).is_none() {
                    return Err(RegistryError::DanglingReference {
                        kind: EntityKind::PatchPanelPort,
                        id: port.port_number.to_string(),
                        target_kind: EntityKind::LedOutput,
                        target: led_id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn require_group(&self, kind: EntityKind, id: &str, group_id: &str) -> Result<(), RegistryError> {
        if self.groups.contains_key(group_id) {
            Ok(())
        } else {
            Err(RegistryError::DanglingReference {
                kind,
                id: id.to_string(),
                target_kind: EntityKind::Group,
                target: group_id.to_string(),
            })
        }
    }

    // ── Controllers ───────────────────────────────────────────────────────────

    /// Inserts or edits a controller.  Taking the CAN flag clears it elsewhere.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistryError`] if the result violates an invariant.
    pub fn upsert_controller(&mut self, input: ControllerInput) -> Result<Controller, RegistryError> {
        self.transact(|reg| {
            let id = resolve_id(input.id.as_deref(), "ctrl");
            let mut controller = reg.controllers.get(&id).cloned().unwrap_or_else(|| Controller {
                id: id.clone(),
                name: id.clone(),
                port: None,
                baudrate: DEFAULT_BAUDRATE,
                has_can_interface: false,
                polling_enabled: false,
                can_sender_id: 0,
                status: ControllerStatus::default(),
            });
            if let Some(name) = input.name.filter(|n| !n.trim().is_empty()) {
                controller.name = name;
            }
            if input.port.is_some() {
                controller.port = input.port.filter(|p| !p.trim().is_empty());
            }
            if let Some(baudrate) = input.baudrate {
                controller.baudrate = baudrate;
            }
            if let Some(polling) = input.polling_enabled {
                controller.polling_enabled = polling;
            }
            if let Some(sender) = input.can_sender_id {
                controller.can_sender_id = sender;
            }
            if let Some(can) = input.has_can_interface {
                controller.has_can_interface = can;
            }
            if controller.has_can_interface {
                reg.clear_can_flags_except(&id);
            }
            reg.controllers.insert(id, controller.clone());
            Ok(controller)
        })
    }

    /// Deletes a controller and every driver it owns.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown id.
    pub fn delete_controller(&mut self, id: &str) -> Result<Controller, RegistryError> {
        self.transact(|reg| {
            let removed = reg
                .controllers
                .remove(id)
                .ok_or_else(|| not_found(EntityKind::Controller, id))?;
            let owned: Vec<String> = reg
                .drivers
                .values()
                .filter(|d| d.controller_id == id)
                .map(|d| d.id.clone())
                .collect();
            for driver_id in owned {
                reg.remove_driver(&driver_id);
            }
            Ok(removed)
        })
    }

    /// Moves the CAN interface to `controller_id` (clearing any previous
    /// holder in the same commit), or clears it from that controller.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown controller.
    pub fn set_can_interface(&mut self, controller_id: &str, enabled: bool) -> Result<(), RegistryError> {
        self.transact(|reg| {
            if !reg.controllers.contains_key(controller_id) {
                return Err(not_found(EntityKind::Controller, controller_id));
            }
            if enabled {
                reg.clear_can_flags_except(controller_id);
            }
            if let Some(controller) = reg.controllers.get_mut(controller_id) {
                controller.has_can_interface = enabled;
            }
            Ok(())
        })
    }

    /// Sets `polling_enabled` and returns the previous value.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown controller.
    pub fn set_polling_enabled(&mut self, controller_id: &str, enabled: bool) -> Result<bool, RegistryError> {
        let controller = self
            .controllers
            .get_mut(controller_id)
            .ok_or_else(|| not_found(EntityKind::Controller, controller_id))?;
        let previous = controller.polling_enabled;
        controller.polling_enabled = enabled;
        Ok(previous)
    }

    fn clear_can_flags_except(&mut self, keep: &str) {
        for other in self.controllers.values_mut() {
            if other.id != keep {
                other.has_can_interface = false;
            }
        }
    }

    // ── Drivers ───────────────────────────────────────────────────────────────

    /// Inserts or edits a driver.  Outputs are normalized to four slots and
    /// keep their telemetry across the edit.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistryError`] if `controller_id` is missing for a new
    /// driver, an output slot is out of range, or an invariant breaks.
    pub fn upsert_driver(&mut self, input: DriverInput) -> Result<Driver, RegistryError> {
        self.transact(|reg| {
            let id = resolve_id(input.id.as_deref(), "drv");
            let mut driver = match reg.drivers.get(&id).cloned() {
                Some(existing) => existing,
                None => {
                    let controller_id = input.controller_id.clone().ok_or(RegistryError::InvalidField {
                        field: "controller_id",
                        reason: "required for a new driver".to_string(),
                    })?;
                    let mut outputs: Vec<LedOutput> = (0..OUTPUTS_PER_DRIVER)
                        .map(|slot| LedOutput::with_defaults(&id, slot))
                        .collect();
                    reg.assign_default_output_names(&mut outputs);
                    Driver {
                        id: id.clone(),
                        controller_id,
                        driver_index: 0,
                        name: id.clone(),
                        outputs,
                        status: DriverStatus::default(),
                    }
                }
            };
            if let Some(controller_id) = input.controller_id {
                driver.controller_id = controller_id;
            }
            if let Some(index) = input.driver_index {
                driver.driver_index = index;
            }
            if let Some(name) = input.name.filter(|n| !n.trim().is_empty()) {
                driver.name = name;
            }

            for edit in input.outputs {
                if edit.slot >= OUTPUTS_PER_DRIVER {
                    return Err(RegistryError::InvalidField {
                        field: "slot",
                        reason: format!("{} is outside 0..=3", edit.slot),
                    });
                }
                let output = &mut driver.outputs[usize::from(edit.slot)];
                if let Some(output_id) = edit.id.filter(|i| !i.trim().is_empty()) {
                    output.id = output_id;
                }
                if let Some(name) = edit.name {
                    output.name = name.trim().to_string();
                }
                if let Some(channels) = edit.channels {
                    output.channels = channels;
                }
                if let Some(min) = edit.min_pwm {
                    output.min_pwm = min;
                }
                if let Some(max) = edit.max_pwm {
                    output.max_pwm = max;
                }
                if let Some(disabled) = edit.disabled {
                    output.disabled = disabled;
                }
            }
            for output in &mut driver.outputs {
                output.normalize();
            }

            reg.drivers.insert(id, driver.clone());
            Ok(driver)
        })
    }

    /// Deletes a driver and unlinks its outputs from groups and the patch panel.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown id.
    pub fn delete_driver(&mut self, id: &str) -> Result<Driver, RegistryError> {
        self.transact(|reg| {
            reg.remove_driver(id)
                .ok_or_else(|| not_found(EntityKind::Driver, id))
        })
    }

    /// Names fresh outputs `LED n` using the lowest numbers not yet taken.
    fn assign_default_output_names(&self, outputs: &mut [LedOutput]) {
        let taken: BTreeSet<String> = self
            .led_outputs()
            .map(|(_, o)| o.name.trim().to_lowercase())
            .collect();
        let mut next = 1u32;
        for output in outputs {
            while taken.contains(&format!("led {next}")) {
                next += 1;
            }
            output.name = format!("LED {next}");
            next += 1;
        }
    }

    fn remove_driver(&mut self, id: &str) -> Option<Driver> {
        let driver = self.drivers.remove(id)?;
        let gone: BTreeSet<&str> = driver.outputs.iter().map(|o| o.id.as_str()).collect();
        for group in self.groups.values_mut() {
            group
                .members
                .retain(|m| !matches!(m, MemberRef::Led(led) if gone.contains(led.as_str())));
        }
        for port in self.patch_panel.values_mut() {
            port.led_ids.retain(|led| !gone.contains(led.as_str()));
        }
        Some(driver)
    }

    // ── Groups ────────────────────────────────────────────────────────────────

    /// Inserts or edits a group.  New groups start at full brightness.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistryError`] for unresolved members or brightness > 100.
    pub fn upsert_group(&mut self, input: GroupInput) -> Result<Group, RegistryError> {
        self.transact(|reg| {
            let id = resolve_id(input.id.as_deref(), "group");
            let mut group = reg.groups.get(&id).cloned().unwrap_or_else(|| Group {
                id: id.clone(),
                name: id.clone(),
                members: Vec::new(),
                brightness: 100,
                is_on: false,
            });
            if let Some(name) = input.name.filter(|n| !n.trim().is_empty()) {
                group.name = name;
            }
            if let Some(members) = input.members {
                let mut seen = BTreeSet::new();
                group.members = members
                    .into_iter()
                    .filter(|m| !m.to_string().is_empty() && seen.insert(m.clone()))
                    .collect();
            }
            if let Some(brightness) = input.brightness {
                group.brightness = brightness;
            }
            reg.groups.insert(id.clone(), group);
            Ok(id)
        })
        .and_then(|id| {
            self.groups
                .get(&id)
                .cloned()
                .ok_or_else(|| not_found(EntityKind::Group, &id))
        })
    }

    /// Deletes a group and clears references from buttons and SSR entries.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown id.
    pub fn delete_group(&mut self, id: &str) -> Result<Group, RegistryError> {
        self.transact(|reg| {
            let removed = reg
                .groups
                .remove(id)
                .ok_or_else(|| not_found(EntityKind::Group, id))?;
            for button in reg.buttons.values_mut() {
                if button.group_id.as_deref() == Some(id) {
                    button.group_id = None;
                }
            }
            for entry in reg.ssr.entries.values_mut() {
                if entry.group_id.as_deref() == Some(id) {
                    entry.group_id = None;
                }
            }
            Ok(removed)
        })
    }

    /// Stores a group's brightness after the device accepted it.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown group.
    pub fn set_group_brightness(&mut self, id: &str, brightness: u8) -> Result<(), RegistryError> {
        let group = self
            .groups
            .get_mut(id)
            .ok_or_else(|| not_found(EntityKind::Group, id))?;
        group.brightness = brightness.min(100);
        Ok(())
    }

    // ── Switches and buttons ──────────────────────────────────────────────────

    /// Inserts or edits a switch.  Renumbering updates its buttons.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistryError`] when a new switch has no number or the
    /// number is already taken.
    pub fn upsert_switch(&mut self, input: SwitchInput) -> Result<Switch, RegistryError> {
        self.transact(|reg| {
            let id = resolve_id(input.id.as_deref(), "switch");
            let mut switch = match reg.switches.get(&id).cloned() {
                Some(existing) => existing,
                None => {
                    let number = input.switch.ok_or(RegistryError::InvalidField {
                        field: "switch",
                        reason: "required for a new switch".to_string(),
                    })?;
                    Switch {
                        id: id.clone(),
                        switch: number,
                        name: format!("Switch {number}"),
                        switch_type: SwitchType::default(),
                        button_count: MAX_BUTTONS_PER_SWITCH,
                        has_buzzer: false,
                        flash_leds: true,
                    }
                }
            };
            if let Some(number) = input.switch {
                switch.switch = number;
            }
            if let Some(name) = input.name.filter(|n| !n.trim().is_empty()) {
                switch.name = name;
            }
            if let Some(kind) = input.switch_type {
                switch.switch_type = kind;
            }
            if let Some(count) = input.button_count {
                switch.button_count = count.clamp(1, MAX_BUTTONS_PER_SWITCH);
            }
            if let Some(buzzer) = input.has_buzzer {
                switch.has_buzzer = buzzer;
            }
            if let Some(flash) = input.flash_leds {
                switch.flash_leds = flash;
            }
            for button in reg.buttons.values_mut() {
                if button.switch_id == id {
                    button.switch = switch.switch;
                }
            }
            reg.switches.insert(id, switch.clone());
            Ok(switch)
        })
    }

    /// Deletes a switch, its buttons and their learned entries.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown id.
    pub fn delete_switch(&mut self, id: &str) -> Result<Switch, RegistryError> {
        self.transact(|reg| {
            let removed = reg
                .switches
                .remove(id)
                .ok_or_else(|| not_found(EntityKind::Switch, id))?;
            let children: Vec<Button> = reg
                .buttons
                .values()
                .filter(|b| b.switch_id == id)
                .cloned()
                .collect();
            for button in children {
                reg.buttons.remove(&button.id);
                reg.learned.remove(&LearnedButton::key(button.switch, button.mask));
            }
            Ok(removed)
        })
    }

    /// Inserts or edits a button and drops the learned entry it now covers.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistryError`] for an unknown parent switch, a mask that
    /// is not a single bit, a duplicate mask, or a full switch.
    pub fn upsert_button(&mut self, input: ButtonInput) -> Result<Button, RegistryError> {
        self.transact(|reg| {
            let parent = match (&input.switch_id, input.switch) {
                (Some(switch_id), _) => reg
                    .switches
                    .get(switch_id)
                    .ok_or_else(|| not_found(EntityKind::Switch, switch_id))?,
                (None, Some(number)) => reg
                    .switch_by_number(number)
                    .ok_or_else(|| not_found(EntityKind::Switch, &number.to_string()))?,
                (None, None) => {
                    return Err(RegistryError::InvalidField {
                        field: "switch_id",
                        reason: "a button needs a switch_id or switch number".to_string(),
                    })
                }
            }
            .clone();

            let id = resolve_id(input.id.as_deref(), "btn");
            let name = input
                .name
                .filter(|n| !n.trim().is_empty())
                .or_else(|| reg.buttons.get(&id).map(|b| b.name.clone()))
                .unwrap_or_else(|| format!("{} Button", parent.name));
            let button = Button {
                id: id.clone(),
                switch_id: parent.id.clone(),
                switch: parent.switch,
                name,
                mask: input.mask,
                group_id: input.group_id.filter(|g| !g.trim().is_empty()),
            };
            reg.learned.remove(&LearnedButton::key(button.switch, button.mask));
            reg.buttons.insert(id, button.clone());
            Ok(button)
        })
    }

    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown id.
    pub fn delete_button(&mut self, id: &str) -> Result<Button, RegistryError> {
        self.transact(|reg| {
            let removed = reg
                .buttons
                .remove(id)
                .ok_or_else(|| not_found(EntityKind::Button, id))?;
            reg.learned.remove(&LearnedButton::key(removed.switch, removed.mask));
            Ok(removed)
        })
    }

    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown id.
    pub fn delete_learned_button(&mut self, id: &str) -> Result<LearnedButton, RegistryError> {
        self.transact(|reg| {
            reg.learned
                .remove(id)
                .ok_or_else(|| not_found(EntityKind::LearnedButton, id))
        })
    }

    // ── SSR ───────────────────────────────────────────────────────────────────

    /// Clamps `address` into 0–255 and stores it.
    pub fn set_ssr_base_address(&mut self, address: i64) -> u8 {
        let clamped = address.clamp(0, i64::from(u8::MAX)) as u8;
        self.ssr.base_address = clamped;
        clamped
    }

    /// Inserts or edits an SSR entry.  The last commanded state is kept.
    ///
    /// # Errors
    ///
    /// Returns a [`RegistryError`] for a bit index outside 0–9, a duplicate
    /// bit, more than ten entries, or an unknown group.
    pub fn upsert_ssr_entry(&mut self, input: SsrInput) -> Result<SsrEntry, RegistryError> {
        self.transact(|reg| {
            let id = resolve_id(input.id.as_deref(), "ssr");
            let existing = reg.ssr.entries.get(&id);
            let entry = SsrEntry {
                id: id.clone(),
                name: input
                    .name
                    .filter(|n| !n.trim().is_empty())
                    .or_else(|| existing.map(|e| e.name.clone()))
                    .unwrap_or_else(|| format!("SSR {}", input.bit_index)),
                bit_index: input.bit_index,
                group_id: input.group_id.filter(|g| !g.trim().is_empty()),
                is_on: existing.is_some_and(|e| e.is_on),
            };
            reg.ssr.entries.insert(id, entry.clone());
            Ok(entry)
        })
    }

    /// Deletes an SSR entry and removes it from every group.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown id.
    pub fn delete_ssr_entry(&mut self, id: &str) -> Result<SsrEntry, RegistryError> {
        self.transact(|reg| {
            let removed = reg
                .ssr
                .entries
                .remove(id)
                .ok_or_else(|| not_found(EntityKind::SsrEntry, id))?;
            for group in reg.groups.values_mut() {
                group
                    .members
                    .retain(|m| !matches!(m, MemberRef::Ssr(ssr) if ssr == id));
            }
            Ok(removed)
        })
    }

    /// Records the state an SSR entry was last commanded to.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown id.
    pub fn set_ssr_entry_state(&mut self, id: &str, on: bool) -> Result<(), RegistryError> {
        let entry = self
            .ssr
            .entries
            .get_mut(id)
            .ok_or_else(|| not_found(EntityKind::SsrEntry, id))?;
        entry.is_on = on;
        self.refresh_group_states();
        Ok(())
    }

    /// Board output mask with `overrides` applied on top of the stored states.
    pub fn ssr_mask_with(&self, overrides: &BTreeMap<String, bool>) -> u16 {
        self.ssr
            .entries
            .values()
            .filter(|e| overrides.get(&e.id).copied().unwrap_or(e.is_on))
            .fold(0u16, |mask, e| mask | (1u16 << e.bit_index))
    }

    // ── Patch panel ───────────────────────────────────────────────────────────

    /// # Errors
    ///
    /// Returns a [`RegistryError`] for a port outside 1–48 or an unknown LED.
    pub fn upsert_patch_panel_port(&mut self, input: PatchPanelInput) -> Result<PatchPanelPort, RegistryError> {
        self.transact(|reg| {
            let number = input.port_number;
            let mut port = reg
                .patch_panel
                .get(&number)
                .cloned()
                .unwrap_or_else(|| PatchPanelPort::unset(number));
            if let Some(label) = input.label {
                port.label = if label.trim().is_empty() {
                    format!("Port {number}")
                } else {
                    label
                };
            }
            if let Some(notes) = input.notes {
                port.notes = notes;
            }
            if let Some(led_ids) = input.led_ids {
                let mut seen = BTreeSet::new();
                port.led_ids = led_ids
                    .into_iter()
                    .filter(|id| !id.trim().is_empty() && seen.insert(id.clone()))
                    .collect();
            }
            reg.patch_panel.insert(number, port.clone());
            Ok(port)
        })
    }
}

/// A single bit within the five button positions.
pub fn is_button_mask(mask: u8) -> bool {
    mask.is_power_of_two() && mask <= 1 << (MAX_BUTTONS_PER_SWITCH - 1)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
