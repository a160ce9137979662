//! Server-side types for dotio.
//!
//! The [`Application`] binds a TCP listener and runs one session per device
//! connection. Each session dispatches requests to handlers registered in
//! the [`RouteTable`] by (verb, path).

mod acceptor;
mod application;
mod config;
mod handler;
mod registry;
mod router;
mod session;
mod shutdown;

pub use application::Application;
pub use config::{ApplicationSettings, DEFAULT_ADDRESS, DEFAULT_NAME, DEFAULT_SHUTDOWN_GRACE};
pub use handler::{Handler, Route};
pub use registry::{Device, DeviceGuard, DeviceRegistry, Registration};
pub use router::{RouteTable, VERB_POST, VERB_PUT};
pub use shutdown::ShutdownHandle;
