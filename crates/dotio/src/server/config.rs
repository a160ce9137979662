use bon::Builder;
use std::time::Duration;

use crate::frame::DEFAULT_MAX_FRAME_LEN;
use crate::server::shutdown::ShutdownHandle;

pub const DEFAULT_NAME: &str = "Dot I/O Application";
pub const DEFAULT_ADDRESS: &str = ":25010";
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Configuration for an [`Application`](crate::server::Application).
///
/// ```ignore
/// let settings = ApplicationSettings::builder()
///     .name("telemetry")
///     .address("127.0.0.1:0")
///     .max_connections(64)
///     .build();
/// ```
#[derive(Debug, Clone, Builder)]
pub struct ApplicationSettings {
    /// Human-readable name, only used in logs.
    #[builder(into, default = DEFAULT_NAME.to_string())]
    pub name: String,

    /// `host:port` to listen on. An empty host (`":25010"`) means all interfaces.
    #[builder(into, default = DEFAULT_ADDRESS.to_string())]
    pub address: String,

    /// Maximum number of live connections. Further accepts wait for a slot.
    #[builder(default = 1024)]
    pub max_connections: usize,

    /// Maximum number of requests dispatched at once across all connections.
    /// Requests beyond this are answered with `Busy`.
    #[builder(default = 256)]
    pub max_in_flight_requests: usize,

    /// Largest accepted frame, id included.
    #[builder(default = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_len: usize,

    /// How long a running handler may keep going after shutdown is triggered
    /// before it is cancelled and its connection closed.
    #[builder(default = DEFAULT_SHUTDOWN_GRACE)]
    pub shutdown_grace: Duration,

    /// Stop signal to serve under. Several applications can share one handle;
    /// when unset each application creates its own.
    pub shutdown: Option<ShutdownHandle>,
}

impl ApplicationSettings {
    /// The address in a form the resolver accepts.
    pub fn bind_address(&self) -> String {
        match self.address.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}"),
            None => self.address.clone(),
        }
    }
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}
