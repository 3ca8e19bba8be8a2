//! Protocol module containing the frame codec and controller message types.

mod fields;
pub mod frame;
pub mod log;
pub mod messages;
pub mod status;

pub use frame::{decode_frame, encode_frame, Frame, ProtocolError};
pub use log::{Direction, FrameLog, LogEntry};
pub use messages::*;
pub use status::StatusReport;
