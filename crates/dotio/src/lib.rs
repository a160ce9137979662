//! Socket RPC dispatch for persistent device connections.
//!
//! Devices hold a TCP connection open and issue requests by sending a sentinel
//! frame followed by an envelope naming a (verb, path). The server runs the
//! registered handler and answers with a 4-byte status frame.

pub mod connection;
pub mod error;
pub mod frame;
pub mod server;

pub use connection::{Inbound, Outbound};
pub use error::{FrameError, HandlerError, RouteError, ServerError, WireStatus};
pub use frame::{Envelope, Frame};
pub use server::{Application, ApplicationSettings, ShutdownHandle};
