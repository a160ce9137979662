use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::ServerError;
use crate::server::registry::{Device, DeviceRegistry, Registration};
use crate::server::session::{DeviceSession, SessionContext};
use crate::server::shutdown::ShutdownHandle;

/// Accepts connections and runs one [`DeviceSession`] per connection.
///
/// Waits for a free connection slot before accepting, so at most
/// `max_connections` sessions are ever live.
pub(crate) struct Acceptor {
    pub listener: TcpListener,
    pub connection_limit: Arc<Semaphore>,
    pub devices: Arc<DeviceRegistry>,
    pub context: SessionContext,
    pub shutdown: ShutdownHandle,
    pub max_frame_len: usize,
}

impl Acceptor {
    /// Accept until shutdown or a fatal accept error, then close every live
    /// session and wait for all of them to finish.
    pub async fn run(self) -> Result<(), ServerError> {
        let mut sessions = JoinSet::new();
        let mut stop = self.shutdown.signal();

        let result = loop {
            tokio::select! {
                biased;
                _ = stop.wait() => break Ok(()),
                Some(joined) = sessions.join_next() => log_session_exit(joined),
                accepted = self.accept() => match accepted {
                    Ok(Some((stream, peer, permit))) => {
                        self.start_session(&mut sessions, stream, peer, permit)
                    }
                    Ok(None) => continue,
                    Err(e) => break Err(e),
                },
            }
        };

        if let Err(e) = &result {
            error!(error = %e, "Acceptor failed, shutting down");
        }

        drop(self.listener);
        self.shutdown.trigger();

        debug!(sessions = sessions.len(), "Waiting for sessions to close");
        while let Some(joined) = sessions.join_next().await {
            log_session_exit(joined);
        }

        info!("Server stopped");
        result
    }

    /// Wait for a connection slot, then accept.
    ///
    /// Returns `Ok(None)` for per-connection failures the listener survives.
    async fn accept(
        &self,
    ) -> Result<Option<(TcpStream, SocketAddr, OwnedSemaphorePermit)>, ServerError> {
        let permit = Arc::clone(&self.connection_limit)
            .acquire_owned()
            .await
            .map_err(|_| ServerError::Accept(io::Error::other("connection limiter closed")))?;

        match self.listener.accept().await {
            Ok((stream, peer)) => {
                debug!(
                    peer = %peer,
                    available_slots = self.connection_limit.available_permits(),
                    "Connection accepted"
                );
                Ok(Some((stream, peer, permit)))
            }
            Err(e) if is_transient(&e) => {
                warn!(error = %e, "Dropped connection during accept");
                Ok(None)
            }
            Err(e) => Err(ServerError::Accept(e)),
        }
    }

    fn start_session(
        &self,
        sessions: &mut JoinSet<()>,
        stream: TcpStream,
        peer: SocketAddr,
        permit: OwnedSemaphorePermit,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let device = Device::new(peer, stream, self.max_frame_len);
        match self.devices.get_or_create(peer, || device) {
            Registration::Created(guard) => {
                info!(peer = %peer, devices = self.devices.len(), "Device connected");
                let session = DeviceSession::new(guard, self.context.clone(), Some(permit));
                sessions.spawn(session.run());
            }
            Registration::Existing(_) => {
                // the new connection is dropped (and closed) along with its device
                warn!(peer = %peer, "Peer already has a live device, closing connection");
            }
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

fn log_session_exit(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Session task panicked");
        } else {
            debug!(error = %e, "Session task cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }
}
