//! DBGP debugger-protocol client.
//!
//! Implements the IDE side of the DBGP protocol: a listener the engine
//! dials into, the length-prefixed wire framing, the init handshake,
//! and a blocking one-command-one-response transaction engine, composed
//! into a [`Session`] state machine with locally-held breakpoint intent
//! that is replayed onto every new engine connection.

pub mod api;
pub mod breakpoint;
pub mod connection;
pub mod error;
pub mod listener;
pub mod path;
pub mod protocol;
pub mod session;
pub mod transport;

pub use api::{Api, HandshakeFailure};
pub use breakpoint::{Breakpoint, BreakpointKind, BreakpointStore};
pub use connection::Connection;
pub use error::{error_code_meaning, DbgpError};
pub use listener::{Listener, ListenerStatus};
pub use path::{PathMap, PathMapper};
pub use protocol::{FeatureResponse, Init, Response, Status, StatusResponse};
pub use session::{Render, RunState, Session, SessionOptions, SessionState, SourceLocation};
