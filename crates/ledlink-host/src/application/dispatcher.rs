//! Command dispatcher: external intents in, device commands out.
//!
//! # Flow
//!
//! ```text
//!  Command ──► validate + evaluate (registry read lock, no I/O)
//!          ──► Plan: controller_id → [Step { DeviceCommand, effects }]
//!          ──► run every controller's steps in parallel, each controller's
//!              steps one after another through its session
//!          ──► after each acknowledged step, write its effects (output PWM
//!              and level, SSR state) into the registry
//! ```
//!
//! Nothing is written speculatively: a step that times out or is rejected
//! leaves its outputs as the device last reported them.  Successful
//! controllers are never rolled back when another one fails.
//!
//! The SSR board only accepts the full relay mask.  SSR steps are therefore
//! serialised by one lock held from building the mask until its effects are
//! recorded, so concurrent relay changes never overwrite each other.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use ledlink_core::protocol::messages::{DriverChannels, DriverSlots, LedChannelConfig, SLOTS_PER_DRIVER};
use ledlink_core::{DeviceCommand, EntityKind, GroupIntent, LedTarget, Registry, RegistryError, SsrTarget};

use crate::application::registry_store::RegistryStore;
use crate::application::session::{CommandAck, PollingAck, SessionError, SessionPool};

// ── Gateway seam ──────────────────────────────────────────────────────────────

/// Delivers device commands to the session owning a controller.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandGateway: Send + Sync {
    async fn execute(&self, controller_id: &str, command: DeviceCommand) -> Result<CommandAck, SessionError>;

    async fn set_polling(&self, controller_id: &str, enabled: bool) -> Result<PollingAck, SessionError>;
}

#[async_trait]
impl CommandGateway for SessionPool {
    async fn execute(&self, controller_id: &str, command: DeviceCommand) -> Result<CommandAck, SessionError> {
        match self.get(controller_id).await {
            Some(session) => session.execute(command).await,
            None => Err(SessionError::NoSession(controller_id.to_string())),
        }
    }

    async fn set_polling(&self, controller_id: &str, enabled: bool) -> Result<PollingAck, SessionError> {
        match self.get(controller_id).await {
            Some(session) => session.set_polling(enabled).await,
            None => Err(SessionError::NoSession(controller_id.to_string())),
        }
    }
}

// ── Command surface ───────────────────────────────────────────────────────────

fn default_max_pwm() -> u8 {
    255
}

/// Calibration for one channel, as accepted by `set_led_config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedConfigRequest {
    pub controller_id: String,
    pub driver_index: u8,
    pub channel: u8,
    #[serde(default)]
    pub min_pwm: u8,
    #[serde(default = "default_max_pwm")]
    pub max_pwm: u8,
    #[serde(default)]
    pub current_high: bool,
}

/// Every state-changing intent the engine accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    SetGroup {
        group_id: String,
        on: bool,
    },
    SetGroupBrightness {
        group_id: String,
        brightness: u8,
    },
    /// Explicit per-output PWM for members of a group; the brightness, when
    /// given, is stored once the targets are acknowledged.
    SetGroupPwm {
        group_id: String,
        targets: BTreeMap<String, i64>,
        #[serde(default)]
        brightness: Option<u8>,
    },
    SetOutputPwm {
        output_id: String,
        pwm: i64,
    },
    SetOutputState {
        output_id: String,
        on: bool,
    },
    SetLedConfig {
        configs: Vec<LedConfigRequest>,
    },
    SetControllerPoll {
        controller_id: String,
        enabled: bool,
    },
    SetSsrState {
        ssr_id: String,
        on: bool,
    },
    SetSsrBaseAddress {
        base_address: i64,
    },
    SetCanInterface {
        controller_id: String,
        enabled: bool,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::SetGroup { .. } => "set_group",
            Command::SetGroupBrightness { .. } => "set_group_brightness",
            Command::SetGroupPwm { .. } => "set_group_pwm",
            Command::SetOutputPwm { .. } => "set_output_pwm",
            Command::SetOutputState { .. } => "set_output_state",
            Command::SetLedConfig { .. } => "set_led_config",
            Command::SetControllerPoll { .. } => "set_controller_poll",
            Command::SetSsrState { .. } => "set_ssr_state",
            Command::SetSsrBaseAddress { .. } => "set_ssr_base_address",
            Command::SetCanInterface { .. } => "set_can_interface",
        }
    }
}

/// What a successful command did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchReport {
    /// Controllers that acknowledged every command sent to them.
    pub acknowledged: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub polling: Option<PollingAck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssr_base_address: Option<u8>,
}

impl DispatchReport {
    fn acknowledged(acknowledged: Vec<String>) -> Self {
        Self {
            acknowledged,
            ..Self::default()
        }
    }
}

/// One controller's failure inside a fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerFailure {
    pub controller_id: String,
    pub error: SessionError,
}

impl fmt::Display for ControllerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.controller_id, self.error)
    }
}

fn describe_failures(failures: &[ControllerFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Error type for dispatched commands.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchError {
    /// A referenced entity is missing or an edit breaks an invariant.
    #[error(transparent)]
    Validation(#[from] RegistryError),

    /// The request is well-formed but cannot be carried out as given.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A single-controller request failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Some controllers failed; the others were applied and kept.
    #[error("command failed on {}", describe_failures(.failures))]
    PartialFailure {
        failures: Vec<ControllerFailure>,
        succeeded: Vec<String>,
    },
}

impl DispatchError {
    /// Ids of the controllers that failed, for a partial failure.
    pub fn failed_controllers(&self) -> Vec<&str> {
        match self {
            DispatchError::PartialFailure { failures, .. } => {
                failures.iter().map(|f| f.controller_id.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}

// ── Plans ─────────────────────────────────────────────────────────────────────

/// Registry write applied once the owning step is acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Effect {
    Output { output_id: String, target_pwm: u8, on: bool },
    Ssr { ssr_id: String, on: bool },
}

#[derive(Debug, Clone, PartialEq)]
enum Action {
    Send(DeviceCommand),
    /// SSR mask frame, built from the stored relay states when it is sent.
    SsrMask {
        sender_id: u32,
        base_address: u8,
        overrides: BTreeMap<String, bool>,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct Step {
    action: Action,
    effects: Vec<Effect>,
}

/// Steps per controller, in send order.
type Plan = BTreeMap<String, Vec<Step>>;

fn output_effect(target: &LedTarget) -> Effect {
    Effect::Output {
        output_id: target.output_id.clone(),
        target_pwm: target.target_pwm,
        on: target.on,
    }
}

fn by_controller(targets: &[LedTarget]) -> BTreeMap<&str, Vec<&LedTarget>> {
    let mut grouped: BTreeMap<&str, Vec<&LedTarget>> = BTreeMap::new();
    for target in targets {
        grouped.entry(target.controller_id.as_str()).or_default().push(target);
    }
    grouped
}

/// One `led on` per controller carrying every driver's slot PWM.
fn led_on_plan(targets: &[LedTarget]) -> Plan {
    let mut plan = Plan::new();
    for (controller_id, targets) in by_controller(targets) {
        let mut drivers: BTreeMap<u8, DriverSlots> = BTreeMap::new();
        for target in &targets {
            let slots = drivers
                .entry(target.driver_index)
                .or_insert_with(|| DriverSlots::untouched(target.driver_index));
            for channel in &target.channels {
                match slots.slots.get_mut(usize::from(*channel)) {
                    Some(slot) => *slot = i16::from(target.target_pwm),
                    None => debug!(channel, max = SLOTS_PER_DRIVER, "channel outside slot range skipped"),
                }
            }
        }
        plan.entry(controller_id.to_string()).or_default().push(Step {
            action: Action::Send(DeviceCommand::LedOn {
                drivers: drivers.into_values().collect(),
            }),
            effects: targets.iter().map(|t| output_effect(t)).collect(),
        });
    }
    plan
}

fn driver_channels(targets: &[&LedTarget]) -> Vec<DriverChannels> {
    let mut drivers: BTreeMap<u8, BTreeSet<u8>> = BTreeMap::new();
    for target in targets {
        drivers
            .entry(target.driver_index)
            .or_default()
            .extend(target.channels.iter().copied());
    }
    drivers
        .into_iter()
        .map(|(driver, channels)| DriverChannels {
            driver,
            channels: channels.into_iter().collect(),
        })
        .collect()
}

/// One `led off` per controller.
fn led_off_plan(targets: &[LedTarget]) -> Plan {
    let mut plan = Plan::new();
    for (controller_id, targets) in by_controller(targets) {
        plan.entry(controller_id.to_string()).or_default().push(Step {
            action: Action::Send(DeviceCommand::LedOff {
                drivers: driver_channels(&targets),
            }),
            effects: targets
                .iter()
                .map(|t| Effect::Output {
                    output_id: t.output_id.clone(),
                    target_pwm: t.target_pwm,
                    on: false,
                })
                .collect(),
        });
    }
    plan
}

/// One `led pwm` per controller and distinct value, lowest value first.
fn pwm_plan(targets: &[LedTarget]) -> Plan {
    let mut plan = Plan::new();
    for (controller_id, targets) in by_controller(targets) {
        let mut by_value: BTreeMap<u8, Vec<&LedTarget>> = BTreeMap::new();
        for target in targets {
            by_value.entry(target.target_pwm).or_default().push(target);
        }
        let steps = plan.entry(controller_id.to_string()).or_default();
        for (pwm, targets) in by_value {
            steps.push(Step {
                action: Action::Send(DeviceCommand::LedPwm {
                    pwm,
                    drivers: driver_channels(&targets),
                }),
                effects: targets.iter().map(|t| output_effect(t)).collect(),
            });
        }
    }
    plan
}

/// Appends the CAN frame that applies `targets` to the SSR board.
fn add_ssr_step(registry: &Registry, plan: &mut Plan, targets: &[SsrTarget]) -> Result<(), DispatchError> {
    if targets.is_empty() {
        return Ok(());
    }
    let base_address = registry.ssr_base_address();
    if base_address == 0 {
        return Err(DispatchError::InvalidRequest(
            "SSR base address is not configured".to_string(),
        ));
    }
    let can = registry.can_controller().ok_or_else(|| {
        DispatchError::InvalidRequest("no controller holds the CAN interface".to_string())
    })?;
    plan.entry(can.id.clone()).or_default().push(Step {
        action: Action::SsrMask {
            sender_id: can.can_sender_id,
            base_address,
            overrides: targets.iter().map(|t| (t.ssr_id.clone(), t.on)).collect(),
        },
        effects: targets
            .iter()
            .map(|t| Effect::Ssr {
                ssr_id: t.ssr_id.clone(),
                on: t.on,
            })
            .collect(),
    });
    Ok(())
}

/// Single-output target, with the output's controller addressing.
fn output_target(registry: &Registry, output_id: &str, target_pwm: impl FnOnce(u8, u8, u8) -> u8) -> Result<LedTarget, DispatchError> {
    let (driver, output) = registry.led_output(output_id).ok_or_else(|| RegistryError::NotFound {
        kind: EntityKind::LedOutput,
        id: output_id.to_string(),
    })?;
    if output.disabled {
        return Err(DispatchError::InvalidRequest(format!("LED output `{output_id}` is disabled")));
    }
    let pwm = target_pwm(output.min_pwm, output.max_pwm, output.target_pwm);
    Ok(LedTarget {
        output_id: output.id.clone(),
        controller_id: driver.controller_id.clone(),
        driver_index: driver.driver_index,
        slot: output.slot,
        channels: output.wire_channels(),
        target_pwm: pwm,
        on: pwm > output.min_pwm,
    })
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

pub struct Dispatcher {
    store: RegistryStore,
    gateway: Arc<dyn CommandGateway>,
    /// Held across every SSR mask step: build, send, record.
    ssr_lock: Mutex<()>,
}

impl Dispatcher {
    pub fn new(store: RegistryStore, gateway: Arc<dyn CommandGateway>) -> Self {
        Self {
            store,
            gateway,
            ssr_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    /// Validates, plans and executes `command`.  Returns once every device
    /// command it produced has been acknowledged or has failed.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Validation`] / [`DispatchError::InvalidRequest`]
    ///   before anything is sent.
    /// - [`DispatchError::PartialFailure`] naming each failed controller.
    /// - [`DispatchError::Session`] for single-controller requests.
    pub async fn execute(&self, command: Command) -> Result<DispatchReport, DispatchError> {
        info!(command = command.name(), "dispatching");
        match command {
            Command::SetGroup { group_id, on } => self.set_group(&group_id, on).await,
            Command::SetGroupBrightness { group_id, brightness } => {
                self.set_group_brightness(&group_id, brightness).await
            }
            Command::SetGroupPwm {
                group_id,
                targets,
                brightness,
            } => self.set_group_pwm(&group_id, &targets, brightness).await,
            Command::SetOutputPwm { output_id, pwm } => self.set_output_pwm(&output_id, pwm).await,
            Command::SetOutputState { output_id, on } => self.set_output_state(&output_id, on).await,
            Command::SetLedConfig { configs } => self.set_led_config(&configs).await,
            Command::SetControllerPoll { controller_id, enabled } => {
                self.set_controller_poll(&controller_id, enabled).await
            }
            Command::SetSsrState { ssr_id, on } => self.set_ssr_state(&ssr_id, on).await,
            Command::SetSsrBaseAddress { base_address } => {
                let stored = self.store.write().await.set_ssr_base_address(base_address);
                Ok(DispatchReport {
                    ssr_base_address: Some(stored),
                    ..DispatchReport::default()
                })
            }
            Command::SetCanInterface { controller_id, enabled } => {
                self.store
                    .write()
                    .await
                    .set_can_interface(&controller_id, enabled)?;
                Ok(DispatchReport::default())
            }
        }
    }

    /// Sends explicit PWM targets (e.g. one ramp step) without touching the
    /// group's stored brightness.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::PartialFailure`] if any controller failed.
    pub async fn apply_pwm_targets(&self, targets: &[LedTarget]) -> Result<DispatchReport, DispatchError> {
        let acknowledged = self.run(pwm_plan(targets)).await?;
        Ok(DispatchReport::acknowledged(acknowledged))
    }

    async fn set_group(&self, group_id: &str, on: bool) -> Result<DispatchReport, DispatchError> {
        let plan = {
            let registry = self.store.read().await;
            let targets = registry.evaluate_group(group_id, GroupIntent::Power(on))?;
            if targets.leds.is_empty() && targets.ssrs.is_empty() {
                return Err(DispatchError::InvalidRequest(format!(
                    "group `{group_id}` has no active members"
                )));
            }
            let mut plan = if on {
                led_on_plan(&targets.leds)
            } else {
                led_off_plan(&targets.leds)
            };
            add_ssr_step(&registry, &mut plan, &targets.ssrs)?;
            plan
        };
        let acknowledged = self.run(plan).await?;
        Ok(DispatchReport::acknowledged(acknowledged))
    }

    async fn set_group_brightness(&self, group_id: &str, brightness: u8) -> Result<DispatchReport, DispatchError> {
        let brightness = brightness.min(100);
        let plan = {
            let registry = self.store.read().await;
            let targets = registry.evaluate_group(group_id, GroupIntent::Brightness(brightness))?;
            let mut plan = led_on_plan(&targets.leds);
            add_ssr_step(&registry, &mut plan, &targets.ssrs)?;
            plan
        };
        let result = self.run(plan).await;
        self.store_brightness_if_applied(group_id, Some(brightness), &result)
            .await?;
        result.map(DispatchReport::acknowledged)
    }

    async fn set_group_pwm(
        &self,
        group_id: &str,
        requested: &BTreeMap<String, i64>,
        brightness: Option<u8>,
    ) -> Result<DispatchReport, DispatchError> {
        if requested.is_empty() {
            return Err(DispatchError::InvalidRequest("PWM targets are empty".to_string()));
        }
        let targets: Vec<LedTarget> = {
            let registry = self.store.read().await;
            let group = registry.group(group_id).ok_or_else(|| RegistryError::NotFound {
                kind: EntityKind::Group,
                id: group_id.to_string(),
            })?;
            group
                .led_ids()
                .filter_map(|id| registry.led_output(id))
                .filter(|(_, output)| !output.disabled)
                .filter_map(|(driver, output)| {
                    let pwm = output.clamp_pwm(*requested.get(&output.id)?);
                    Some(LedTarget {
                        output_id: output.id.clone(),
                        controller_id: driver.controller_id.clone(),
                        driver_index: driver.driver_index,
                        slot: output.slot,
                        channels: output.wire_channels(),
                        target_pwm: pwm,
                        on: pwm > output.min_pwm,
                    })
                })
                .collect()
        };
        if targets.is_empty() {
            return Err(DispatchError::InvalidRequest(format!(
                "no active member of group `{group_id}` matches the PWM targets"
            )));
        }
        let result = self.run(pwm_plan(&targets)).await;
        self.store_brightness_if_applied(group_id, brightness, &result)
            .await?;
        result.map(DispatchReport::acknowledged)
    }

    /// Stores `brightness` once at least one controller applied the change.
    async fn store_brightness_if_applied(
        &self,
        group_id: &str,
        brightness: Option<u8>,
        result: &Result<Vec<String>, DispatchError>,
    ) -> Result<(), DispatchError> {
        let Some(brightness) = brightness else {
            return Ok(());
        };
        let applied = match result {
            Ok(_) => true,
            Err(DispatchError::PartialFailure { succeeded, .. }) => !succeeded.is_empty(),
            Err(_) => false,
        };
        if applied {
            self.store
                .write()
                .await
                .set_group_brightness(group_id, brightness)?;
        }
        Ok(())
    }

    async fn set_output_pwm(&self, output_id: &str, pwm: i64) -> Result<DispatchReport, DispatchError> {
        let target = {
            let registry = self.store.read().await;
            output_target(&registry, output_id, |min, max, _| {
                pwm.clamp(i64::from(min), i64::from(max)) as u8
            })?
        };
        let acknowledged = self.run(pwm_plan(&[target])).await?;
        Ok(DispatchReport::acknowledged(acknowledged))
    }

    async fn set_output_state(&self, output_id: &str, on: bool) -> Result<DispatchReport, DispatchError> {
        let target = {
            let registry = self.store.read().await;
            output_target(&registry, output_id, |min, max, stored| {
                if stored > min {
                    stored.min(max)
                } else {
                    max
                }
            })?
        };
        let plan = if on {
            led_on_plan(&[target])
        } else {
            led_off_plan(&[target])
        };
        let acknowledged = self.run(plan).await?;
        Ok(DispatchReport::acknowledged(acknowledged))
    }

    async fn set_led_config(&self, configs: &[LedConfigRequest]) -> Result<DispatchReport, DispatchError> {
        if configs.is_empty() {
            return Err(DispatchError::InvalidRequest("no LED configs given".to_string()));
        }
        let mut plan = Plan::new();
        {
            let registry = self.store.read().await;
            for config in configs {
                if registry.controller(&config.controller_id).is_none() {
                    return Err(RegistryError::NotFound {
                        kind: EntityKind::Controller,
                        id: config.controller_id.clone(),
                    }
                    .into());
                }
                if config.max_pwm < config.min_pwm {
                    return Err(DispatchError::InvalidRequest(format!(
                        "channel {} on driver {}: max_pwm {} is below min_pwm {}",
                        config.channel, config.driver_index, config.max_pwm, config.min_pwm
                    )));
                }
                plan.entry(config.controller_id.clone()).or_default().push(Step {
                    action: Action::Send(DeviceCommand::LedConfig(LedChannelConfig {
                        driver: config.driver_index,
                        channel: config.channel,
                        min_pwm: config.min_pwm,
                        max_pwm: config.max_pwm,
                        current_high: config.current_high,
                    })),
                    effects: Vec::new(),
                });
            }
        }
        let acknowledged = self.run(plan).await?;
        Ok(DispatchReport::acknowledged(acknowledged))
    }

    async fn set_controller_poll(&self, controller_id: &str, enabled: bool) -> Result<DispatchReport, DispatchError> {
        if self.store.read().await.controller(controller_id).is_none() {
            return Err(RegistryError::NotFound {
                kind: EntityKind::Controller,
                id: controller_id.to_string(),
            }
            .into());
        }
        let ack = match self.gateway.set_polling(controller_id, enabled).await {
            Ok(ack) => ack,
            // Without a session the flag is only stored for the next start.
            Err(SessionError::NoSession(_)) => {
                let previous = self
                    .store
                    .write()
                    .await
                    .set_polling_enabled(controller_id, enabled)?;
                PollingAck { previous, enabled }
            }
            Err(err) => return Err(err.into()),
        };
        Ok(DispatchReport {
            acknowledged: vec![controller_id.to_string()],
            polling: Some(ack),
            ..DispatchReport::default()
        })
    }

    async fn set_ssr_state(&self, ssr_id: &str, on: bool) -> Result<DispatchReport, DispatchError> {
        let (controller_id, steps) = {
            let registry = self.store.read().await;
            let entry = registry.ssr_entry(ssr_id).ok_or_else(|| RegistryError::NotFound {
                kind: EntityKind::SsrEntry,
                id: ssr_id.to_string(),
            })?;
            let target = SsrTarget {
                ssr_id: entry.id.clone(),
                bit_index: entry.bit_index,
                on,
            };
            let mut plan = Plan::new();
            add_ssr_step(&registry, &mut plan, &[target])?;
            plan.pop_first().ok_or_else(|| {
                DispatchError::InvalidRequest("SSR frame could not be built".to_string())
            })?
        };
        let (controller_id, result) = self.run_controller(controller_id, steps).await;
        result?;
        Ok(DispatchReport::acknowledged(vec![controller_id]))
    }

    /// Runs every controller's steps: controllers in parallel, steps within
    /// a controller in order, stopping that controller at its first failure.
    async fn run(&self, plan: Plan) -> Result<Vec<String>, DispatchError> {
        let runs = plan
            .into_iter()
            .map(|(controller_id, steps)| self.run_controller(controller_id, steps));
        let mut succeeded = Vec::new();
        let mut failures = Vec::new();
        for (controller_id, result) in join_all(runs).await {
            match result {
                Ok(()) => succeeded.push(controller_id),
                Err(error) => failures.push(ControllerFailure { controller_id, error }),
            }
        }
        if failures.is_empty() {
            return Ok(succeeded);
        }
        warn!(
            failed = %describe_failures(&failures),
            succeeded = ?succeeded,
            "command partially failed"
        );
        Err(DispatchError::PartialFailure { failures, succeeded })
    }

    async fn run_controller(&self, controller_id: String, steps: Vec<Step>) -> (String, Result<(), SessionError>) {
        for Step { action, effects } in steps {
            let result = match action {
                Action::Send(command) => self.send_step(&controller_id, command, &effects).await,
                Action::SsrMask {
                    sender_id,
                    base_address,
                    overrides,
                } => {
                    let _ssr = self.ssr_lock.lock().await;
                    let mask = self.store.read().await.ssr_mask_with(&overrides);
                    let command = DeviceCommand::ssr_mask(sender_id, base_address, mask);
                    self.send_step(&controller_id, command, &effects).await
                }
            };
            if let Err(err) = result {
                return (controller_id, Err(err));
            }
        }
        (controller_id, Ok(()))
    }

    /// Sends one command and records `effects` once it is acknowledged.
    async fn send_step(&self, controller_id: &str, command: DeviceCommand, effects: &[Effect]) -> Result<(), SessionError> {
        let name = command.name();
        self.gateway.execute(controller_id, command).await?;
        debug!(controller_id, command = name, "step acknowledged");
        self.apply_effects(effects).await;
        Ok(())
    }

    async fn apply_effects(&self, effects: &[Effect]) {
        if effects.is_empty() {
            return;
        }
        let mut registry = self.store.write().await;
        for effect in effects {
            let result = match effect {
                Effect::Output {
                    output_id,
                    target_pwm,
                    on,
                } => registry.record_output_commanded(output_id, *target_pwm, *on),
                Effect::Ssr { ssr_id, on } => registry.set_ssr_entry_state(ssr_id, *on),
            };
            if let Err(err) = result {
                // The entity was deleted while its command was in flight.
                warn!(error = %err, "acknowledged state not recorded");
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use ledlink_core::{ControllerInput, DriverInput, GroupInput, MemberRef, OutputInput, SsrInput};

    use super::*;

    fn ack(command: &'static str) -> Result<CommandAck, SessionError> {
        Ok(CommandAck { command, reply: None })
    }

    /// Two controllers, one driver each; group `g` spans both.
    async fn fleet() -> RegistryStore {
        let store = RegistryStore::default();
        {
            let mut reg = store.write().await;
            for id in ["c1", "c2"] {
                reg.upsert_controller(ControllerInput {
                    id: Some(id.into()),
                    ..Default::default()
                })
                .expect("controller");
            }
            reg.upsert_driver(DriverInput {
                id: Some("d1".into()),
                controller_id: Some("c1".into()),
                outputs: vec![OutputInput {
                    slot: 0,
                    min_pwm: Some(10),
                    max_pwm: Some(200),
                    ..Default::default()
                }],
                ..Default::default()
            })
            .expect("d1");
            reg.upsert_driver(DriverInput {
                id: Some("d2".into()),
                controller_id: Some("c2".into()),
                driver_index: Some(2),
                ..Default::default()
            })
            .expect("d2");
            reg.upsert_group(GroupInput {
                id: Some("g".into()),
                members: Some(vec![
                    MemberRef::Led("d1_slot0".into()),
                    MemberRef::Led("d2_slot1".into()),
                ]),
                brightness: Some(50),
                ..Default::default()
            })
            .expect("group");
        }
        store
    }

    #[test]
    fn test_command_json_is_type_tagged() {
        // Arrange
        let json = r#"{"type":"set_group_pwm","group_id":"g","targets":{"a":40}}"#;

        // Act
        let command: Command = serde_json::from_str(json).expect("parse");

        // Assert
        assert_eq!(
            command,
            Command::SetGroupPwm {
                group_id: "g".into(),
                targets: BTreeMap::from([("a".to_string(), 40)]),
                brightness: None,
            }
        );
        assert_eq!(command.name(), "set_group_pwm");
    }

    #[test]
    fn test_pwm_plan_batches_by_value() {
        // Arrange
        let target = |id: &str, driver: u8, channel: u8, pwm: u8| LedTarget {
            output_id: id.into(),
            controller_id: "c".into(),
            driver_index: driver,
            slot: channel,
            channels: vec![channel],
            target_pwm: pwm,
            on: true,
        };
        let targets = vec![target("a", 0, 0, 40), target("b", 1, 2, 40), target("c", 0, 1, 90)];

        // Act
        let plan = pwm_plan(&targets);

        // Assert
        let commands: Vec<DeviceCommand> = plan["c"]
            .iter()
            .filter_map(|s| match &s.action {
                Action::Send(command) => Some(command.clone()),
                Action::SsrMask { .. } => None,
            })
            .collect();
        assert_eq!(
            commands,
            vec![
                DeviceCommand::LedPwm {
                    pwm: 40,
                    drivers: vec![
                        DriverChannels { driver: 0, channels: vec![0] },
                        DriverChannels { driver: 1, channels: vec![2] },
                    ],
                },
                DeviceCommand::LedPwm {
                    pwm: 90,
                    drivers: vec![DriverChannels { driver: 0, channels: vec![1] }],
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_set_group_sends_one_led_on_per_controller() {
        // Arrange
        let store = fleet().await;
        let sent = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&sent);
        let mut gateway = MockCommandGateway::new();
        gateway.expect_execute().times(2).returning(move |id, cmd| {
            log.lock().expect("lock").push((id.to_string(), cmd));
            ack("led.on")
        });
        let dispatcher = Dispatcher::new(store.clone(), Arc::new(gateway));

        // Act
        let report = dispatcher
            .execute(Command::SetGroup {
                group_id: "g".into(),
                on: true,
            })
            .await
            .expect("dispatch");

        // Assert
        assert_eq!(report.acknowledged, vec!["c1".to_string(), "c2".to_string()]);
        let mut sent = sent.lock().expect("lock").clone();
        sent.sort_by(|a, b| a.0.cmp(&b.0));
        let mut c1_slots = DriverSlots::untouched(0);
        c1_slots.slots[0] = 105;
        assert_eq!(sent[0].1, DeviceCommand::LedOn { drivers: vec![c1_slots] });
        let reg = store.read().await;
        assert_eq!(reg.led_output("d1_slot0").map(|(_, o)| (o.pwm, o.level)), Some((105, 1)));
        assert!(reg.group("g").is_some_and(|g| g.is_on));
    }

    #[tokio::test]
    async fn test_partial_failure_names_only_failed_controller() {
        // Arrange
        let store = fleet().await;
        let mut gateway = MockCommandGateway::new();
        gateway
            .expect_execute()
            .withf(|id, _| id == "c1")
            .returning(|_, _| ack("led.on"));
        gateway.expect_execute().withf(|id, _| id == "c2").returning(|_, _| {
            Err(SessionError::CommandTimeout {
                command: "led.on",
                timeout_ms: 20_000,
            })
        });
        let dispatcher = Dispatcher::new(store.clone(), Arc::new(gateway));

        // Act
        let err = dispatcher
            .execute(Command::SetGroup {
                group_id: "g".into(),
                on: true,
            })
            .await
            .expect_err("c2 times out");

        // Assert
        assert_eq!(err.failed_controllers(), vec!["c2"]);
        let reg = store.read().await;
        assert_eq!(reg.led_output("d1_slot0").map(|(_, o)| o.level), Some(1));
        assert_eq!(reg.led_output("d2_slot1").map(|(_, o)| o.level), Some(0));
    }

    #[tokio::test]
    async fn test_unknown_group_is_rejected_before_any_send() {
        let mut gateway = MockCommandGateway::new();
        gateway.expect_execute().never();
        let dispatcher = Dispatcher::new(fleet().await, Arc::new(gateway));
        let err = dispatcher
            .execute(Command::SetGroup {
                group_id: "nope".into(),
                on: true,
            })
            .await
            .expect_err("unknown group");
        assert!(matches!(err, DispatchError::Validation(RegistryError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_brightness_stored_only_after_ack() {
        // Arrange
        let store = fleet().await;
        let mut gateway = MockCommandGateway::new();
        gateway.expect_execute().returning(|_, _| {
            Err(SessionError::Rejected {
                command: "led.on",
                reason: "busy".into(),
            })
        });
        let dispatcher = Dispatcher::new(store.clone(), Arc::new(gateway));

        // Act
        let result = dispatcher
            .execute(Command::SetGroupBrightness {
                group_id: "g".into(),
                brightness: 80,
            })
            .await;

        // Assert
        assert!(result.is_err());
        assert_eq!(store.read().await.group("g").map(|g| g.brightness), Some(50));
    }

    #[tokio::test]
    async fn test_ssr_state_goes_through_can_controller() {
        // Arrange
        let store = fleet().await;
        {
            let mut reg = store.write().await;
            reg.set_can_interface("c2", true).expect("can");
            reg.set_ssr_base_address(0x20);
            reg.upsert_ssr_entry(SsrInput {
                id: Some("r".into()),
                bit_index: 9,
                ..Default::default()
            })
            .expect("ssr");
        }
        let mut gateway = MockCommandGateway::new();
        gateway
            .expect_execute()
            .withf(|id, cmd| id == "c2" && *cmd == DeviceCommand::ssr_mask(0, 0x20, 1 << 9))
            .times(1)
            .returning(|_, _| ack("can.send"));
        let dispatcher = Dispatcher::new(store.clone(), Arc::new(gateway));

        // Act
        dispatcher
            .execute(Command::SetSsrState {
                ssr_id: "r".into(),
                on: true,
            })
            .await
            .expect("ssr");

        // Assert
        assert!(store.read().await.ssr_entry("r").is_some_and(|e| e.is_on));
    }

    /// Acknowledges every command after a delay and records what was sent.
    #[derive(Default)]
    struct SlowGateway {
        sent: Mutex<Vec<DeviceCommand>>,
    }

    #[async_trait]
    impl CommandGateway for SlowGateway {
        async fn execute(&self, _controller_id: &str, command: DeviceCommand) -> Result<CommandAck, SessionError> {
            let name = command.name();
            self.sent.lock().expect("lock").push(command);
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            ack(name)
        }

        async fn set_polling(&self, controller_id: &str, _enabled: bool) -> Result<PollingAck, SessionError> {
            Err(SessionError::NoSession(controller_id.to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_ssr_changes_keep_both_relays() {
        // Arrange
        let store = fleet().await;
        {
            let mut reg = store.write().await;
            reg.set_can_interface("c2", true).expect("can");
            reg.set_ssr_base_address(0x20);
            for (id, bit) in [("r0", 0), ("r1", 1)] {
                reg.upsert_ssr_entry(SsrInput {
                    id: Some(id.into()),
                    bit_index: bit,
                    ..Default::default()
                })
                .expect("ssr");
            }
        }
        let gateway = Arc::new(SlowGateway::default());
        let dispatcher = Dispatcher::new(store.clone(), Arc::clone(&gateway) as Arc<dyn CommandGateway>);

        // Act
        let (first, second) = tokio::join!(
            dispatcher.execute(Command::SetSsrState {
                ssr_id: "r0".into(),
                on: true,
            }),
            dispatcher.execute(Command::SetSsrState {
                ssr_id: "r1".into(),
                on: true,
            }),
        );

        // Assert
        assert!(first.is_ok() && second.is_ok());
        let sent = gateway.sent.lock().expect("lock").clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent.last(), Some(&DeviceCommand::ssr_mask(0, 0x20, 0b11)));
        let reg = store.read().await;
        assert!(reg.ssr_entry("r0").is_some_and(|e| e.is_on));
        assert!(reg.ssr_entry("r1").is_some_and(|e| e.is_on));
    }

    #[tokio::test]
    async fn test_ssr_without_can_controller_is_invalid() {
        let store = fleet().await;
        {
            let mut reg = store.write().await;
            reg.set_ssr_base_address(1);
            reg.upsert_ssr_entry(SsrInput {
                id: Some("r".into()),
                bit_index: 0,
                ..Default::default()
            })
            .expect("ssr");
        }
        let dispatcher = Dispatcher::new(store, Arc::new(MockCommandGateway::new()));
        let err = dispatcher
            .execute(Command::SetSsrState {
                ssr_id: "r".into(),
                on: true,
            })
            .await
            .expect_err("no CAN");
        assert!(matches!(err, DispatchError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_poll_toggle_without_session_only_stores_flag() {
        // Arrange
        let store = fleet().await;
        let mut gateway = MockCommandGateway::new();
        gateway
            .expect_set_polling()
            .returning(|id, _| Err(SessionError::NoSession(id.to_string())));
        let dispatcher = Dispatcher::new(store.clone(), Arc::new(gateway));

        // Act
        let report = dispatcher
            .execute(Command::SetControllerPoll {
                controller_id: "c1".into(),
                enabled: true,
            })
            .await
            .expect("poll");

        // Assert
        assert_eq!(report.polling, Some(PollingAck { previous: false, enabled: true }));
        assert!(store.read().await.controller("c1").is_some_and(|c| c.polling_enabled));
    }

    #[tokio::test]
    async fn test_set_output_pwm_clamps_and_records() {
        // Arrange
        let store = fleet().await;
        let mut gateway = MockCommandGateway::new();
        gateway
            .expect_execute()
            .withf(|id, cmd| {
                id == "c1"
                    && *cmd
                        == DeviceCommand::LedPwm {
                            pwm: 200,
                            drivers: vec![DriverChannels { driver: 0, channels: vec![0] }],
                        }
            })
            .returning(|_, _| ack("led.pwm"));
        let dispatcher = Dispatcher::new(store.clone(), Arc::new(gateway));

        // Act
        dispatcher
            .execute(Command::SetOutputPwm {
                output_id: "d1_slot0".into(),
                pwm: 999,
            })
            .await
            .expect("pwm");

        // Assert
        assert_eq!(store.read().await.led_output("d1_slot0").map(|(_, o)| o.pwm), Some(200));
    }

    #[tokio::test]
    async fn test_can_assignment_moves_flag() {
        let store = fleet().await;
        let dispatcher = Dispatcher::new(store.clone(), Arc::new(MockCommandGateway::new()));
        for id in ["c1", "c2"] {
            dispatcher
                .execute(Command::SetCanInterface {
                    controller_id: id.into(),
                    enabled: true,
                })
                .await
                .expect("can");
        }
        assert_eq!(store.read().await.can_controller().map(|c| c.id.clone()), Some("c2".to_string()));
    }
}
