//! Infrastructure layer for the host daemon.
//!
//! Contains OS-facing adapters: serial links, the TOML configuration file,
//! and the JSON bridge used by external callers.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `ledlink_core`, but MUST NOT be imported by the `application` or domain
//! layers.

pub mod api_bridge;
pub mod storage;
pub mod transport;
