//! Application layer use cases for the host daemon.
//!
//! # What is the "application" layer? (for beginners)
//!
//! The *domain* (in `ledlink-core`) knows what a group, an output or a button
//! is and how their invariants fit together, but it never waits on anything.
//! The *infrastructure* layer owns serial ports and the process boundary.
//!
//! Use cases in this layer:
//!
//! - **Orchestrate** domain objects over time: sessions that poll, commands
//!   that wait for an acknowledgement, ramps that tick every few hundred ms.
//! - **Depend on abstractions** (traits such as [`link::LinkConnector`] and
//!   [`dispatcher::CommandGateway`]) so tests can substitute in-memory links
//!   and mocked gateways.
//! - **Contain no OS calls**: no serial ports and no file system access.
//!
//! # Sub-modules
//!
//! - **`link`**           – The seam between a session and a physical link.
//! - **`registry_store`** – Shared, lock-protected access to the registry.
//! - **`session`**        – One task per controller: connection state machine,
//!   single-in-flight command slot, poll timer, inbound telemetry.
//! - **`dispatcher`**     – Turns external commands into device commands,
//!   fans them out across controllers and records acknowledged state.
//! - **`buttons`**        – Reacts to pushbutton reports: learning, toggling
//!   and hold-to-ramp.

pub mod buttons;
pub mod dispatcher;
pub mod link;
pub mod registry_store;
pub mod session;
