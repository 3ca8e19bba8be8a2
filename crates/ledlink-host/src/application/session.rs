//! Controller session: one task per controller.
//!
//! # State machine
//!
//! ```text
//!            connect ok                  polling enabled
//!  Disconnected ──► Connecting ──► Connected ◄──────────► Polling
//!       ▲               │               │                    │
//!       └── backoff ◄───┴───────────────┴─ link failure ─────┘
//! ```
//!
//! # In-flight slot (for beginners)
//!
//! A controller answers one request at a time.  The session therefore keeps
//! a single `pending` slot: while it is occupied the request queue is not
//! read at all, so later requests wait in the channel in FIFO order.  The
//! slot is freed by an acknowledgement frame, an `error` frame, a complete
//! set of channel events for an LED command, or the command timeout.
//!
//! A status poll takes the slot like any command, with no caller waiting on
//! it; the `status` reply (or the timeout) frees it.  The poll timer never
//! queues behind a command: a tick that finds the slot occupied is skipped.
//!
//! Replies carry no correlation id.  After a timeout the slot therefore stays
//! closed for `late_reply_grace`: the first `ok`/`error` in that window is
//! the timed-out command's late reply and is discarded, so it cannot settle
//! the next command.  A reply later than the grace window is still
//! indistinguishable from the next command's own.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ledlink_core::protocol::log::DEFAULT_LOG_CAPACITY;
use ledlink_core::protocol::messages::{ButtonReport, ChannelRef};
use ledlink_core::{DeviceCommand, DeviceEvent, Frame, FrameLog, InboundMessage, LinkState, LogEntry};

use crate::application::link::{unix_millis, FrameSink, FrameSource, LinkConnector, SharedFrameLog};
use crate::application::registry_store::RegistryStore;

/// Requests buffered behind the in-flight slot before callers are suspended.
const REQUEST_QUEUE_DEPTH: usize = 64;

/// Session timings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub poll_interval: Duration,
    pub command_timeout: Duration,
    pub late_reply_grace: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub log_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            command_timeout: Duration::from_secs(20),
            late_reply_grace: Duration::from_secs(2),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

/// Error type for requests served by a session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The link is down, or went down while the request was in flight.
    #[error("link to controller `{controller_id}` is down: {reason}")]
    LinkDown { controller_id: String, reason: String },

    /// No acknowledgement before the deadline.
    #[error("`{command}` timed out after {timeout_ms} ms")]
    CommandTimeout { command: &'static str, timeout_ms: u64 },

    /// The controller answered with an `error` frame.
    #[error("controller rejected `{command}`: {reason}")]
    Rejected { command: &'static str, reason: String },

    /// No session was started for the controller (it has no port).
    #[error("no session for controller `{0}`")]
    NoSession(String),

    /// The session task has stopped.
    #[error("session for controller `{0}` has stopped")]
    Stopped(String),
}

/// Successful completion of a device command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandAck {
    pub command: &'static str,
    /// The acknowledgement frame, or `None` when channel events settled it.
    pub reply: Option<Value>,
}

/// Result of a polling toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PollingAck {
    pub previous: bool,
    pub enabled: bool,
}

/// A pushbutton report received by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ButtonEvent {
    pub controller_id: String,
    pub report: ButtonReport,
}

enum SessionRequest {
    Command {
        command: DeviceCommand,
        reply: oneshot::Sender<Result<CommandAck, SessionError>>,
    },
    SetPolling {
        enabled: bool,
        reply: oneshot::Sender<PollingAck>,
    },
}

/// Exponential reconnect backoff: `initial * 2^attempt`, capped at `max`.
pub fn reconnect_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    initial.saturating_mul(2u32.saturating_pow(attempt)).min(max)
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cloneable front door to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    controller_id: String,
    requests: mpsc::Sender<SessionRequest>,
    link: watch::Receiver<LinkState>,
    log: SharedFrameLog,
}

impl SessionHandle {
    pub fn controller_id(&self) -> &str {
        &self.controller_id
    }

    /// Queues `command` and waits for its acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::LinkDown`] while disconnected,
    /// [`SessionError::CommandTimeout`] without an acknowledgement, and
    /// [`SessionError::Rejected`] for a device `error` reply.
    pub async fn execute(&self, command: DeviceCommand) -> Result<CommandAck, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(SessionRequest::Command { command, reply })
            .await
            .map_err(|_| self.stopped())?;
        rx.await.map_err(|_| self.stopped())?
    }

    /// Toggles polling, in order with queued commands.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Stopped`] if the session task has ended.
    pub async fn set_polling(&self, enabled: bool) -> Result<PollingAck, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(SessionRequest::SetPolling { enabled, reply })
            .await
            .map_err(|_| self.stopped())?;
        rx.await.map_err(|_| self.stopped())
    }

    pub fn link_state(&self) -> LinkState {
        *self.link.borrow()
    }

    /// Waits until the link state satisfies `predicate`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Stopped`] if the session ends first.
    pub async fn wait_for_link(&self, predicate: impl Fn(LinkState) -> bool) -> Result<LinkState, SessionError> {
        let mut link = self.link.clone();
        let state = link
            .wait_for(|state| predicate(*state))
            .await
            .map_err(|_| self.stopped())?;
        Ok(*state)
    }

    /// Copy of the frame log, oldest first.
    pub fn log_entries(&self) -> Vec<LogEntry> {
        match self.log.lock() {
            Ok(log) => log.entries(),
            Err(poisoned) => poisoned.into_inner().entries(),
        }
    }

    fn stopped(&self) -> SessionError {
        SessionError::Stopped(self.controller_id.clone())
    }
}

// ── Spawning ──────────────────────────────────────────────────────────────────

/// Starts the session task for `controller_id`.
///
/// Button reports are forwarded to `buttons` when given.  The task ends when
/// `cancel` fires or every [`SessionHandle`] has been dropped.
pub fn spawn_session(
    controller_id: impl Into<String>,
    connector: Arc<dyn LinkConnector>,
    store: RegistryStore,
    config: SessionConfig,
    buttons: Option<mpsc::Sender<ButtonEvent>>,
    cancel: CancellationToken,
) -> (SessionHandle, JoinHandle<()>) {
    let controller_id = controller_id.into();
    let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
    let (link_tx, link_rx) = watch::channel(LinkState::Disconnected);
    let log = Arc::new(Mutex::new(FrameLog::new(config.log_capacity)));

    let session = Session {
        controller_id: controller_id.clone(),
        connector,
        store,
        config,
        requests: request_rx,
        link_tx,
        log: Arc::clone(&log),
        buttons,
        cancel,
        polling: false,
    };
    let task = tokio::spawn(session.run());
    let handle = SessionHandle {
        controller_id,
        requests: request_tx,
        link: link_rx,
        log,
    };
    (handle, task)
}

/// Running sessions by controller id.
#[derive(Clone, Default)]
pub struct SessionPool {
    sessions: Arc<tokio::sync::RwLock<HashMap<String, SessionHandle>>>,
}

impl SessionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handle, replacing any previous one for the controller.
    pub async fn insert(&self, handle: SessionHandle) {
        self.sessions
            .write()
            .await
            .insert(handle.controller_id().to_string(), handle);
    }

    pub async fn remove(&self, controller_id: &str) -> Option<SessionHandle> {
        self.sessions.write().await.remove(controller_id)
    }

    pub async fn get(&self, controller_id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(controller_id).cloned()
    }

    pub async fn controller_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

// ── Session task ──────────────────────────────────────────────────────────────

/// Who is waiting on the occupied slot.
enum Waiter {
    Caller(oneshot::Sender<Result<CommandAck, SessionError>>),
    Poll,
    /// A timed-out command whose reply may still arrive.
    Late,
}

struct Pending {
    command: &'static str,
    expected: Option<BTreeSet<(u8, u8)>>,
    deadline: Instant,
    waiter: Waiter,
}

impl Pending {
    fn poll(deadline: Instant) -> Self {
        Self {
            command: DeviceCommand::Status.name(),
            expected: None,
            deadline,
            waiter: Waiter::Poll,
        }
    }

    fn late(command: &'static str, deadline: Instant) -> Self {
        Self {
            command,
            expected: None,
            deadline,
            waiter: Waiter::Late,
        }
    }

    /// Hands `result` to the caller, if there is one.  A caller that has
    /// given up is ignored.
    fn resolve(self, result: Result<CommandAck, SessionError>) {
        if let Waiter::Caller(reply) = self.waiter {
            let _ = reply.send(result);
        }
    }
}

enum LinkExit {
    Cancelled,
    Failed(String),
}

struct Session {
    controller_id: String,
    connector: Arc<dyn LinkConnector>,
    store: RegistryStore,
    config: SessionConfig,
    requests: mpsc::Receiver<SessionRequest>,
    link_tx: watch::Sender<LinkState>,
    log: SharedFrameLog,
    buttons: Option<mpsc::Sender<ButtonEvent>>,
    cancel: CancellationToken,
    polling: bool,
}

impl Session {
    async fn run(mut self) {
        self.polling = self
            .store
            .read()
            .await
            .controller(&self.controller_id)
            .is_some_and(|c| c.polling_enabled);
        info!(
            controller_id = %self.controller_id,
            endpoint = %self.connector.describe(),
            "session started"
        );

        let mut attempt: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.publish_link(LinkState::Connecting, None).await;
            let connected = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.connector.connect(Arc::clone(&self.log)) => result,
            };

            let reason = match connected {
                Ok((source, sink)) => {
                    info!(controller_id = %self.controller_id, "link up");
                    attempt = 0;
                    match self.serve(source, sink).await {
                        LinkExit::Cancelled => break,
                        LinkExit::Failed(reason) => reason,
                    }
                }
                Err(err) => err.to_string(),
            };

            let delay = reconnect_delay(attempt, self.config.reconnect_initial, self.config.reconnect_max);
            warn!(
                controller_id = %self.controller_id,
                error = %reason,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "link down, reconnecting"
            );
            self.publish_link(LinkState::Disconnected, Some(reason)).await;
            if !self.wait_disconnected(delay).await {
                break;
            }
            attempt = attempt.saturating_add(1);
        }

        self.publish_link(LinkState::Disconnected, None).await;
        info!(controller_id = %self.controller_id, "session stopped");
    }

    /// Serves one open link until it fails or the session is cancelled.
    async fn serve(&mut self, mut source: Box<dyn FrameSource>, mut sink: Box<dyn FrameSink>) -> LinkExit {
        let mut pending: Option<Pending> = None;
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.publish_link(self.up_state(), None).await;

        loop {
            let deadline = pending.as_ref().map(|p| p.deadline);
            let idle = pending.is_none();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    if let Some(p) = pending.take() {
                        p.resolve(Err(SessionError::Stopped(self.controller_id.clone())));
                    }
                    return LinkExit::Cancelled;
                }
                frame = source.next_frame() => match frame {
                    Ok(frame) => self.handle_frame(&frame, &mut pending).await,
                    Err(err) => {
                        let reason = err.to_string();
                        if let Some(p) = pending.take() {
                            p.resolve(Err(self.link_down(&reason)));
                        }
                        return LinkExit::Failed(reason);
                    }
                },
                _ = wait_until(deadline) => self.expire(&mut pending),
                request = self.requests.recv(), if idle => match request {
                    Some(request) => {
                        if let Err(reason) = self.start(request, sink.as_mut(), &mut pending).await {
                            return LinkExit::Failed(reason);
                        }
                    }
                    None => return LinkExit::Cancelled,
                },
                _ = poll.tick() => {
                    if !self.polling {
                        continue;
                    }
                    if pending.is_some() {
                        debug!(controller_id = %self.controller_id, "poll skipped, command in flight");
                        continue;
                    }
                    if let Err(err) = sink.send(&DeviceCommand::Status.to_frame()).await {
                        return LinkExit::Failed(err.to_string());
                    }
                    pending = Some(Pending::poll(Instant::now() + self.config.command_timeout));
                }
            }
        }
    }

    /// Handles requests while the link is down.  Returns `false` when the
    /// session should stop instead of reconnecting.
    async fn wait_disconnected(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                request = self.requests.recv() => match request {
                    Some(SessionRequest::Command { command, reply }) => {
                        debug!(controller_id = %self.controller_id, command = command.name(), "refused, link down");
                        let _ = reply.send(Err(self.link_down("not connected")));
                    }
                    Some(SessionRequest::SetPolling { enabled, reply }) => {
                        let _ = reply.send(self.apply_polling(enabled).await);
                    }
                    None => return false,
                },
            }
        }
    }

    /// Takes the next request into the in-flight slot.  Returns the failure
    /// reason if the link broke while writing.
    async fn start(
        &mut self,
        request: SessionRequest,
        sink: &mut dyn FrameSink,
        pending: &mut Option<Pending>,
    ) -> Result<(), String> {
        match request {
            SessionRequest::SetPolling { enabled, reply } => {
                let _ = reply.send(self.apply_polling(enabled).await);
                Ok(())
            }
            SessionRequest::Command { command, reply } => {
                if reply.is_closed() {
                    debug!(controller_id = %self.controller_id, command = command.name(), "caller gone, dropped");
                    return Ok(());
                }
                let frame: Frame = command.to_frame();
                if let Err(err) = sink.send(&frame).await {
                    let reason = err.to_string();
                    let _ = reply.send(Err(self.link_down(&reason)));
                    return Err(reason);
                }
                *pending = Some(Pending {
                    command: command.name(),
                    expected: command.expected_leds(),
                    deadline: Instant::now() + self.config.command_timeout,
                    waiter: Waiter::Caller(reply),
                });
                Ok(())
            }
        }
    }

    async fn handle_frame(&mut self, frame: &Frame, pending: &mut Option<Pending>) {
        let message = match InboundMessage::from_frame(frame) {
            Ok(message) => message,
            Err(err) => {
                warn!(controller_id = %self.controller_id, error = %err, "unreadable frame dropped");
                return;
            }
        };
        match message {
            InboundMessage::Status(report) => {
                let changes = self
                    .store
                    .write()
                    .await
                    .apply_status(&self.controller_id, &report, unix_millis());
                if !changes.is_empty() {
                    debug!(
                        controller_id = %self.controller_id,
                        outputs = changes.outputs.len(),
                        groups = changes.groups.len(),
                        "status applied"
                    );
                }
                if pending.as_ref().is_some_and(|p| p.command == DeviceCommand::Status.name()) {
                    if let Some(p) = pending.take() {
                        let command = p.command;
                        p.resolve(Ok(CommandAck {
                            command,
                            reply: Some(frame.clone().into_value()),
                        }));
                    }
                }
            }
            InboundMessage::Event(event) => self.handle_event(event, pending).await,
            InboundMessage::Ack(reply) => match pending.take() {
                Some(Pending {
                    command,
                    waiter: Waiter::Late,
                    ..
                }) => debug!(controller_id = %self.controller_id, command, "late acknowledgement discarded"),
                Some(p) => {
                    let command = p.command;
                    debug!(controller_id = %self.controller_id, command, "acknowledged");
                    p.resolve(Ok(CommandAck {
                        command,
                        reply: Some(reply),
                    }));
                }
                None => debug!(controller_id = %self.controller_id, "unsolicited acknowledgement"),
            },
            InboundMessage::Error { reason } => match pending.take() {
                Some(Pending {
                    command,
                    waiter: Waiter::Late,
                    ..
                }) => debug!(controller_id = %self.controller_id, command, reason = %reason, "late rejection discarded"),
                Some(p) => {
                    let command = p.command;
                    warn!(controller_id = %self.controller_id, command, reason = %reason, "command rejected");
                    p.resolve(Err(SessionError::Rejected { command, reason }));
                }
                None => warn!(controller_id = %self.controller_id, reason = %reason, "device error with nothing in flight"),
            },
            InboundMessage::Other(kind) => debug!(controller_id = %self.controller_id, kind = %kind, "frame ignored"),
        }
    }

    async fn handle_event(&mut self, event: DeviceEvent, pending: &mut Option<Pending>) {
        let ack_key = event.channel().and_then(ChannelRef::ack_key);
        match &event {
            DeviceEvent::ChannelState(state) => {
                self.store
                    .write()
                    .await
                    .apply_channel_state(&self.controller_id, state);
            }
            DeviceEvent::Fault { target, active } => {
                let changes = self
                    .store
                    .write()
                    .await
                    .apply_fault(&self.controller_id, target, *active);
                if *active {
                    warn!(controller_id = %self.controller_id, outputs = ?changes.outputs, "LED fault");
                } else {
                    info!(controller_id = %self.controller_id, outputs = ?changes.outputs, "LED fault cleared");
                }
            }
            DeviceEvent::CanMessage(message) => match message.button_report() {
                Some(report) => self.forward_button(report),
                None => debug!(controller_id = %self.controller_id, len = message.data.len(), "CAN frame ignored"),
            },
            DeviceEvent::Unknown(name) => debug!(controller_id = %self.controller_id, event = %name, "event ignored"),
        }

        let Some(key) = ack_key else {
            return;
        };
        let settled = match pending.as_mut().and_then(|p| p.expected.as_mut()) {
            Some(expected) => {
                expected.remove(&key);
                expected.is_empty()
            }
            None => false,
        };
        if settled {
            if let Some(p) = pending.take() {
                let command = p.command;
                debug!(controller_id = %self.controller_id, command, "settled by channel events");
                p.resolve(Ok(CommandAck { command, reply: None }));
            }
        }
    }

    fn forward_button(&self, report: ButtonReport) {
        let Some(buttons) = &self.buttons else {
            return;
        };
        let event = ButtonEvent {
            controller_id: self.controller_id.clone(),
            report,
        };
        if let Err(err) = buttons.try_send(event) {
            warn!(controller_id = %self.controller_id, error = %err, "button report dropped");
        }
    }

    fn expire(&self, pending: &mut Option<Pending>) {
        let Some(p) = pending.take() else {
            return;
        };
        let command = p.command;
        match p.waiter {
            Waiter::Caller(reply) => {
                let timeout_ms = u64::try_from(self.config.command_timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(controller_id = %self.controller_id, command, timeout_ms, "command timed out");
                let _ = reply.send(Err(SessionError::CommandTimeout { command, timeout_ms }));
                if !self.config.late_reply_grace.is_zero() {
                    *pending = Some(Pending::late(command, Instant::now() + self.config.late_reply_grace));
                }
            }
            Waiter::Poll => debug!(controller_id = %self.controller_id, "status poll unanswered"),
            Waiter::Late => debug!(controller_id = %self.controller_id, command, "no late reply"),
        }
    }

    async fn apply_polling(&mut self, enabled: bool) -> PollingAck {
        let previous = self.polling;
        self.polling = enabled;
        if let Err(err) = self
            .store
            .write()
            .await
            .set_polling_enabled(&self.controller_id, enabled)
        {
            warn!(controller_id = %self.controller_id, error = %err, "polling flag not stored");
        }
        if self.link_tx.borrow().is_up() {
            self.publish_link(self.up_state(), None).await;
        }
        info!(controller_id = %self.controller_id, previous, enabled, "polling toggled");
        PollingAck { previous, enabled }
    }

    fn up_state(&self) -> LinkState {
        if self.polling {
            LinkState::Polling
        } else {
            LinkState::Connected
        }
    }

    async fn publish_link(&self, state: LinkState, error: Option<String>) {
        self.link_tx.send_replace(state);
        self.store
            .write()
            .await
            .set_link_state(&self.controller_id, state, error);
    }

    fn link_down(&self, reason: &str) -> SessionError {
        SessionError::LinkDown {
            controller_id: self.controller_id.clone(),
            reason: reason.to_string(),
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
