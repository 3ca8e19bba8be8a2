//! Registry entities and the pure rules that operate on them.
//!
//! Nothing in here performs I/O or touches a clock directly; timestamps and
//! [`std::time::Instant`]s are passed in by the caller so every rule can be
//! unit-tested in isolation.

/// Pushbutton edge tracking and ramp stepping.
pub mod buttons;
/// Group evaluator: intent to per-member targets.
pub mod groups;
pub mod learning;
pub mod model;
/// The registry store and its validation gate.
pub mod registry;
pub mod telemetry;
