//! Button engine: turns pushbutton reports into group commands.
//!
//! Sessions forward every CAN button report here.  The engine keeps one
//! [`ButtonTracker`] for the whole fleet and acts on what it returns:
//!
//! - **Learn**: the press is counted in the registry's discovery table.
//! - **Toggle**: the button's group is switched to the opposite state.
//! - **ArmHold**: a ramp task is spawned.  It waits [`HOLD_THRESHOLD`],
//!   makes sure the group is on, then steps every active member one PWM unit
//!   per [`RAMP_STEP_INTERVAL`] until an end stop or the release.
//! - **Release**: the ramp task for that button is cancelled.
//!
//! Reports are handled strictly in arrival order, so a toggle always
//! completes before the ramp of the same press is armed.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ledlink_core::domain::buttons::{ButtonKey, HOLD_THRESHOLD, RAMP_STEP_INTERVAL};
use ledlink_core::{ButtonAction, ButtonBinding, ButtonTracker, RampDirection};

use crate::application::dispatcher::{Command, Dispatcher};
use crate::application::link::unix_millis;
use crate::application::session::ButtonEvent;

/// Starts the engine.  It runs until `cancel` fires or every sender of
/// `events` is gone; pending ramps are cancelled on the way out.
pub fn spawn_button_engine(
    dispatcher: Arc<Dispatcher>,
    events: mpsc::Receiver<ButtonEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let engine = ButtonEngine {
        dispatcher,
        tracker: ButtonTracker::new(),
        ramps: HashMap::new(),
        cancel,
    };
    tokio::spawn(engine.run(events))
}

struct ButtonEngine {
    dispatcher: Arc<Dispatcher>,
    tracker: ButtonTracker,
    ramps: HashMap<ButtonKey, CancellationToken>,
    cancel: CancellationToken,
}

impl ButtonEngine {
    async fn run(mut self, mut events: mpsc::Receiver<ButtonEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle(event).await;
        }
        for (_, ramp) in self.ramps.drain() {
            ramp.cancel();
        }
        debug!("button engine stopped");
    }

    async fn handle(&mut self, event: ButtonEvent) {
        let bindings: Vec<ButtonBinding> = self
            .dispatcher
            .store()
            .read()
            .await
            .buttons()
            .filter(|b| b.switch == event.report.switch)
            .map(|b| ButtonBinding {
                mask: b.mask,
                group_id: b.group_id.clone(),
            })
            .collect();

        let now = Instant::now().into_std();
        for action in self.tracker.observe(event.report, &bindings, now) {
            match action {
                ButtonAction::Learn { switch, mask } => {
                    let learned = self.dispatcher.store().write().await.record_learned_press(
                        Some(&event.controller_id),
                        switch,
                        mask,
                        unix_millis(),
                    );
                    info!(
                        controller_id = %event.controller_id,
                        switch,
                        mask,
                        count = learned.count,
                        "unmapped button press learned"
                    );
                }
                ButtonAction::Toggle { group_id } => self.toggle(&group_id).await,
                ButtonAction::ArmHold {
                    key,
                    group_id,
                    direction,
                } => {
                    let token = self.cancel.child_token();
                    if let Some(previous) = self.ramps.insert(key, token.clone()) {
                        previous.cancel();
                    }
                    tokio::spawn(run_ramp(Arc::clone(&self.dispatcher), group_id, direction, token));
                }
                ButtonAction::Release { key } => {
                    if let Some(ramp) = self.ramps.remove(&key) {
                        ramp.cancel();
                    }
                }
            }
        }
    }

    async fn toggle(&self, group_id: &str) {
        let is_on = self
            .dispatcher
            .store()
            .read()
            .await
            .group(group_id)
            .map(|g| g.is_on);
        let Some(is_on) = is_on else {
            warn!(group_id, "button bound to a missing group");
            return;
        };
        debug!(group_id, on = !is_on, "button toggles group");
        let command = Command::SetGroup {
            group_id: group_id.to_string(),
            on: !is_on,
        };
        if let Err(err) = self.dispatcher.execute(command).await {
            warn!(group_id, error = %err, "button toggle failed");
        }
    }
}

/// Hold timer followed by the PWM ramp.  Returns at the first of: the
/// release, an end stop, or a failed step.
async fn run_ramp(dispatcher: Arc<Dispatcher>, group_id: String, direction: RampDirection, cancel: CancellationToken) {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        _ = sleep(HOLD_THRESHOLD) => {}
    }

    let is_on = dispatcher.store().read().await.group(&group_id).map(|g| g.is_on);
    match is_on {
        None => return,
        Some(true) => {}
        Some(false) => {
            let command = Command::SetGroup {
                group_id: group_id.clone(),
                on: true,
            };
            if let Err(err) = dispatcher.execute(command).await {
                warn!(group_id = %group_id, error = %err, "ramp could not switch the group on");
                return;
            }
        }
    }

    info!(group_id = %group_id, ?direction, "ramp started");
    let mut ticker = interval(RAMP_STEP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let targets = dispatcher
            .store()
            .read()
            .await
            .ramp_step_targets(&group_id, direction);
        if targets.is_empty() {
            debug!(group_id = %group_id, "ramp reached its end stop");
            break;
        }
        if let Err(err) = dispatcher.apply_pwm_targets(&targets).await {
            warn!(group_id = %group_id, error = %err, "ramp step failed");
            break;
        }
    }
    info!(group_id = %group_id, "ramp stopped");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
