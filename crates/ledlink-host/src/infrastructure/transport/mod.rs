//! Physical links to controllers.
//!
//! - **`framed`** – Line framing over any `AsyncRead`/`AsyncWrite` pair.
//! - **`serial`** – [`serial::SerialConnector`], the production link.
//! - **`mock`**   – In-memory links driven by tests.

pub mod framed;
pub mod mock;
pub mod serial;
