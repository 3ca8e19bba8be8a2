//! JSON bridge: exposes engine operations to external callers.
//!
//! Every function here takes the shared [`EngineState`] plus plain JSON or
//! DTO arguments and returns a [`CommandResult<T>`].  Callers (an HTTP layer,
//! a home-automation integration, a test) never touch the registry or the
//! sessions directly.
//!
//! # `CommandResult<T>` wrapper
//!
//! All bridge functions return `CommandResult<T>` rather than `Result<T, E>`,
//! so every response has the same shape:
//! `{ success: bool, data: T | null, error: string | null }`.
//!
//! # Request shapes
//!
//! - Commands are tagged by `type`:
//!   `{"type": "set_group", "group_id": "grp_1", "on": true}`.
//! - Upserts are tagged by `entity` with the fields under `data`:
//!   `{"entity": "switch", "data": {"switch": 7, "name": "Hall"}}`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use ledlink_core::{
    ButtonInput, ControllerInput, DriverInput, GroupInput, GroupStateView, LogEntry, PatchPanelInput, RegistryError,
    RegistrySnapshot, SsrInput, SwitchInput,
};

use crate::application::dispatcher::{Command, CommandGateway, DispatchReport, Dispatcher};
use crate::application::registry_store::RegistryStore;
use crate::application::session::SessionPool;

// ── Shared engine state ───────────────────────────────────────────────────────

/// State shared by every bridge call.
///
/// The registry has its own reader/writer lock and the session pool is
/// internally synchronised, so the struct itself needs no mutex.
pub struct EngineState {
    pub store: RegistryStore,
    pub dispatcher: Arc<Dispatcher>,
    pub sessions: SessionPool,
}

impl EngineState {
    /// Wires the dispatcher to the live sessions.
    pub fn new(store: RegistryStore, sessions: SessionPool) -> Arc<Self> {
        let gateway: Arc<dyn CommandGateway> = Arc::new(sessions.clone());
        Self::with_gateway(store, sessions, gateway)
    }

    /// Uses `gateway` for device commands instead of the session pool.
    pub fn with_gateway(store: RegistryStore, sessions: SessionPool, gateway: Arc<dyn CommandGateway>) -> Arc<Self> {
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), gateway));
        Arc::new(Self {
            store,
            dispatcher,
            sessions,
        })
    }
}

// ── Data Transfer Objects ─────────────────────────────────────────────────────

/// Upsert request for any editable entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "entity", content = "data", rename_all = "snake_case")]
pub enum UpsertRequest {
    Controller(ControllerInput),
    Driver(DriverInput),
    Group(GroupInput),
    Switch(SwitchInput),
    Button(ButtonInput),
    SsrEntry(SsrInput),
    PatchPanelPort(PatchPanelInput),
}

/// Entity types that can be deleted by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletableEntity {
    Controller,
    Driver,
    Group,
    Switch,
    Button,
    SsrEntry,
    LearnedButton,
}

/// Unified response wrapper used by bridge functions.
#[derive(Debug, Serialize, Deserialize)]
pub struct CommandResult<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> CommandResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

fn stored<E: Serialize>(result: Result<E, RegistryError>) -> CommandResult<Value> {
    match result.map(|entity| serde_json::to_value(entity)) {
        Ok(Ok(value)) => CommandResult::ok(value),
        Ok(Err(e)) => CommandResult::err(format!("failed to encode entity: {e}")),
        Err(e) => CommandResult::err(e.to_string()),
    }
}

// ── Read ──────────────────────────────────────────────────────────────────────

/// Returns the full registry: entities, telemetry and the discovery table.
pub async fn get_snapshot(state: Arc<EngineState>) -> CommandResult<RegistrySnapshot> {
    CommandResult::ok(state.store.snapshot().await)
}

/// Returns `is_on`, brightness, members and faulty members of every group.
pub async fn get_group_states(state: Arc<EngineState>) -> CommandResult<Vec<GroupStateView>> {
    CommandResult::ok(state.store.groups_state().await)
}

/// Returns the recent frames exchanged with one controller, oldest first.
pub async fn get_controller_log(state: Arc<EngineState>, controller_id: String) -> CommandResult<Vec<LogEntry>> {
    match state.sessions.get(&controller_id).await {
        Some(session) => CommandResult::ok(session.log_entries()),
        None => CommandResult::err(format!("no session for controller `{controller_id}`")),
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// Parses and executes one command.  Returns once the devices involved have
/// acknowledged or failed.
pub async fn execute_command(state: Arc<EngineState>, payload: Value) -> CommandResult<DispatchReport> {
    let command: Command = match serde_json::from_value(payload) {
        Ok(command) => command,
        Err(e) => return CommandResult::err(format!("invalid command: {e}")),
    };
    let name = command.name();
    match state.dispatcher.execute(command).await {
        Ok(report) => CommandResult::ok(report),
        Err(e) => {
            warn!(command = name, error = %e, "command failed");
            CommandResult::err(e.to_string())
        }
    }
}

// ── CRUD ──────────────────────────────────────────────────────────────────────

/// Inserts or edits one entity and returns it as stored.
pub async fn upsert_entity(state: Arc<EngineState>, payload: Value) -> CommandResult<Value> {
    let request: UpsertRequest = match serde_json::from_value(payload) {
        Ok(request) => request,
        Err(e) => return CommandResult::err(format!("invalid upsert: {e}")),
    };
    let mut registry = state.store.write().await;
    match request {
        UpsertRequest::Controller(input) => stored(registry.upsert_controller(input)),
        UpsertRequest::Driver(input) => stored(registry.upsert_driver(input)),
        UpsertRequest::Group(input) => stored(registry.upsert_group(input)),
        UpsertRequest::Switch(input) => stored(registry.upsert_switch(input)),
        UpsertRequest::Button(input) => stored(registry.upsert_button(input)),
        UpsertRequest::SsrEntry(input) => stored(registry.upsert_ssr_entry(input)),
        UpsertRequest::PatchPanelPort(input) => stored(registry.upsert_patch_panel_port(input)),
    }
}

/// Deletes one entity and returns it.  Deleting a controller also stops
/// its session.
pub async fn delete_entity(state: Arc<EngineState>, entity: DeletableEntity, id: String) -> CommandResult<Value> {
    let result = {
        let mut registry = state.store.write().await;
        match entity {
            DeletableEntity::Controller => stored(registry.delete_controller(&id)),
            DeletableEntity::Driver => stored(registry.delete_driver(&id)),
            DeletableEntity::Group => stored(registry.delete_group(&id)),
            DeletableEntity::Switch => stored(registry.delete_switch(&id)),
            DeletableEntity::Button => stored(registry.delete_button(&id)),
            DeletableEntity::SsrEntry => stored(registry.delete_ssr_entry(&id)),
            DeletableEntity::LearnedButton => stored(registry.delete_learned_button(&id)),
        }
    };
    if result.success && entity == DeletableEntity::Controller && state.sessions.remove(&id).await.is_some() {
        info!(controller_id = %id, "session released with its controller");
    }
    result
}

// ── Tests ─────────────────────────────────────────────────────────────────────
