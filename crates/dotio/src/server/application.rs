use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::error::{RouteError, ServerError};
use crate::server::acceptor::Acceptor;
use crate::server::config::ApplicationSettings;
use crate::server::handler::Handler;
use crate::server::registry::DeviceRegistry;
use crate::server::router::{RouteTable, VERB_POST, VERB_PUT};
use crate::server::session::SessionContext;
use crate::server::shutdown::ShutdownHandle;

/// A bound server: listener, route table and device registry.
///
/// Routes are registered through `&mut self` before [`listen`](Self::listen)
/// consumes the application, so the route table cannot change while serving.
pub struct Application {
    settings: ApplicationSettings,
    listener: TcpListener,
    routes: RouteTable,
    devices: Arc<DeviceRegistry>,
    shutdown: ShutdownHandle,
}

impl Application {
    /// Resolve and bind the configured address.
    pub async fn bind(settings: ApplicationSettings) -> Result<Self, ServerError> {
        let address = settings.bind_address();
        info!(name = %settings.name, address = %settings.address, "Starting");

        let addr = tokio::net::lookup_host(&address)
            .await
            .and_then(|mut addrs| {
                addrs
                    .next()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses found"))
            })
            .map_err(|source| ServerError::Resolve {
                address: settings.address.clone(),
                source,
            })?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                address: settings.address.clone(),
                source,
            })?;

        if let Ok(local) = listener.local_addr() {
            info!(name = %settings.name, address = %local, "Listening");
        }

        let shutdown = settings.shutdown.clone().unwrap_or_default();

        Ok(Self {
            settings,
            listener,
            routes: RouteTable::new(),
            devices: Arc::new(DeviceRegistry::new()),
            shutdown,
        })
    }

    /// Bind with [`ApplicationSettings::default`].
    pub async fn bind_default() -> Result<Self, ServerError> {
        Self::bind(ApplicationSettings::default()).await
    }

    /// Register a handler for an arbitrary verb.
    ///
    /// A duplicate (verb, path) is rejected and the first handler stays active.
    pub fn register<H: Handler>(
        &mut self,
        verb: &str,
        path: &str,
        handler: H,
    ) -> Result<(), RouteError> {
        self.routes
            .register(verb, path, handler)
            .inspect_err(|e| error!(error = %e, "Route registration rejected"))
    }

    pub fn register_post<H: Handler>(&mut self, path: &str, handler: H) -> Result<(), RouteError> {
        self.register(VERB_POST, path, handler)
    }

    pub fn register_put<H: Handler>(&mut self, path: &str, handler: H) -> Result<(), RouteError> {
        self.register(VERB_PUT, path, handler)
    }

    /// Serve until shutdown is triggered or accepting fails.
    ///
    /// On return every session has been closed and its device removed.
    pub async fn listen(self) -> Result<(), ServerError> {
        info!(
            name = %self.settings.name,
            routes = self.routes.len(),
            max_connections = self.settings.max_connections,
            max_in_flight_requests = self.settings.max_in_flight_requests,
            "Serving"
        );

        let context = SessionContext {
            routes: Arc::new(self.routes),
            admission: Arc::new(Semaphore::new(self.settings.max_in_flight_requests)),
            shutdown: self.shutdown.signal(),
            shutdown_grace: self.settings.shutdown_grace,
        };

        let acceptor = Acceptor {
            listener: self.listener,
            connection_limit: Arc::new(Semaphore::new(self.settings.max_connections)),
            devices: self.devices,
            context,
            shutdown: self.shutdown,
            max_frame_len: self.settings.max_frame_len,
        };

        acceptor.run().await
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &ApplicationSettings {
        &self.settings
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// The live device registry, for diagnostics.
    pub fn devices(&self) -> Arc<DeviceRegistry> {
        Arc::clone(&self.devices)
    }

    /// A handle that stops [`listen`](Self::listen) from any task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }
}
