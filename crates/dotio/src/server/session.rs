//! The per-connection frame-dispatch loop.
//!
//! ```text
//! AwaitMarker --sentinel--> AwaitEnvelope --envelope--> Dispatch --status--> AwaitMarker
//!      |  ^                       |                         |
//!      +--+ other ids dropped     +-- non-envelope id ------+--> AwaitMarker (no reply)
//!      |                          |                         |
//!      +-----------------------> Closed <-------------------+  read/write failure, shutdown
//! ```
//!
//! One task drives the machine and runs the handler inline, so at most one read
//! is outstanding and at most one request is in flight per connection. After
//! shutdown a running handler gets `shutdown_grace` to finish; past that it is
//! dropped and the connection closed without a status.

use futures::FutureExt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, trace, warn};

use crate::connection::{Inbound, Outbound};
use crate::error::{FrameError, WireStatus};
use crate::frame::{ENVELOPE_ID, Envelope};
use crate::server::registry::DeviceGuard;
use crate::server::router::RouteTable;
use crate::server::shutdown::ShutdownSignal;

/// State shared by every session of one application.
#[derive(Debug, Clone)]
pub(crate) struct SessionContext {
    pub routes: Arc<RouteTable>,
    pub admission: Arc<Semaphore>,
    pub shutdown: ShutdownSignal,
    pub shutdown_grace: Duration,
}

#[derive(Debug)]
enum State {
    AwaitMarker,
    AwaitEnvelope,
    Dispatch(Envelope),
    Closed(CloseReason),
}

#[derive(Debug)]
enum CloseReason {
    Disconnected,
    Shutdown,
    ReadFailed(FrameError),
    WriteFailed(FrameError),
}

impl From<FrameError> for CloseReason {
    fn from(err: FrameError) -> Self {
        if err.is_disconnect() {
            CloseReason::Disconnected
        } else {
            CloseReason::ReadFailed(err)
        }
    }
}

pub(crate) struct DeviceSession {
    peer: SocketAddr,
    inbound: Inbound,
    outbound: Outbound,
    context: SessionContext,
    // Removes the device from the registry when the session ends.
    guard: DeviceGuard,
    _connection_permit: Option<OwnedSemaphorePermit>,
}

impl DeviceSession {
    pub fn new(
        guard: DeviceGuard,
        context: SessionContext,
        connection_permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        let device = guard.device();
        Self {
            peer: device.peer(),
            inbound: device.inbound().clone(),
            outbound: device.outbound().clone(),
            context,
            guard,
            _connection_permit: connection_permit,
        }
    }

    /// Run the session until the peer goes away, a frame error occurs or the
    /// application shuts down.
    pub async fn run(mut self) {
        debug!(peer = %self.peer, "Session started");

        let mut state = State::AwaitMarker;
        let reason = loop {
            state = match state {
                State::AwaitMarker => self.await_marker().await,
                State::AwaitEnvelope => self.await_envelope().await,
                State::Dispatch(envelope) => self.dispatch(envelope).await,
                State::Closed(reason) => break reason,
            };
        };

        match &reason {
            CloseReason::Disconnected => debug!(peer = %self.peer, "Device disconnected"),
            CloseReason::Shutdown => debug!(peer = %self.peer, "Session closed for shutdown"),
            CloseReason::ReadFailed(e) => {
                warn!(peer = %self.peer, error = %e, "Session ended on read error")
            }
            CloseReason::WriteFailed(e) => {
                warn!(peer = %self.peer, error = %e, "Session ended on write error")
            }
        }

        if let Err(e) = self.outbound.shutdown().await {
            trace!(peer = %self.peer, error = %e, "Connection already closed");
        }
        drop(self.guard);
    }

    async fn await_marker(&mut self) -> State {
        let frame = tokio::select! {
            biased;
            _ = self.context.shutdown.wait() => return State::Closed(CloseReason::Shutdown),
            frame = self.inbound.read_frame() => frame,
        };

        match frame {
            Ok(frame) if frame.is_sentinel() => State::AwaitEnvelope,
            Ok(frame) => {
                trace!(peer = %self.peer, id = frame.id, "Discarding frame outside a request");
                State::AwaitMarker
            }
            Err(e) => State::Closed(e.into()),
        }
    }

    async fn await_envelope(&mut self) -> State {
        let frame = tokio::select! {
            biased;
            _ = self.context.shutdown.wait() => return State::Closed(CloseReason::Shutdown),
            frame = self.inbound.read_frame() => frame,
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => return State::Closed(e.into()),
        };

        if frame.id != ENVELOPE_ID {
            debug!(peer = %self.peer, id = frame.id, "Expected request envelope, ignoring frame");
            return State::AwaitMarker;
        }

        match Envelope::decode(&frame) {
            Ok(envelope) => State::Dispatch(envelope),
            Err(e) => State::Closed(CloseReason::ReadFailed(e)),
        }
    }

    async fn dispatch(&mut self, envelope: Envelope) -> State {
        let Envelope { verb, path } = envelope;
        info!(peer = %self.peer, verb = %verb, path = %path, "Request");

        let Some(status) = self.invoke(&verb, &path).await else {
            return State::Closed(CloseReason::Shutdown);
        };

        match self.outbound.send_status(status).await {
            Ok(()) => {
                debug!(peer = %self.peer, verb = %verb, path = %path, status = %status, "Response sent");
                State::AwaitMarker
            }
            Err(e) => State::Closed(CloseReason::WriteFailed(e)),
        }
    }

    /// Run the matching handler. `None` means shutdown cancelled it.
    async fn invoke(&mut self, verb: &str, path: &str) -> Option<WireStatus> {
        let Some(route) = self.context.routes.lookup(verb, path) else {
            warn!(peer = %self.peer, verb = %verb, path = %path, "No route registered");
            return Some(WireStatus::NoRoute);
        };

        let Ok(_permit) = self.context.admission.try_acquire() else {
            warn!(peer = %self.peer, verb = %verb, path = %path, "Request limit reached, rejecting");
            return Some(WireStatus::Busy);
        };

        let call = route
            .handler()
            .call(self.inbound.clone(), self.outbound.clone());
        let call = AssertUnwindSafe(call).catch_unwind();
        tokio::pin!(call);

        let outcome = tokio::select! {
            biased;
            outcome = &mut call => outcome,
            _ = self.context.shutdown.wait() => {
                match tokio::time::timeout(self.context.shutdown_grace, &mut call).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(peer = %self.peer, verb = %verb, path = %path, "Handler cancelled by shutdown");
                        return None;
                    }
                }
            }
        };

        let status = match outcome {
            Ok(Ok(())) => WireStatus::Ok,
            Ok(Err(e)) => {
                warn!(peer = %self.peer, verb = %verb, path = %path, error = %e, "Handler failed");
                WireStatus::HandlerFailed
            }
            Err(_) => {
                error!(peer = %self.peer, verb = %verb, path = %path, "Handler panicked");
                WireStatus::HandlerFailed
            }
        };
        Some(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::frame::{Frame, FrameReader, FrameWriter, PayloadBuilder, SENTINEL_ID};
    use crate::server::registry::{Device, DeviceRegistry, Registration};
    use crate::server::router::{VERB_POST, VERB_PUT};
    use crate::server::shutdown::ShutdownHandle;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    struct Peer {
        reader: FrameReader<OwnedReadHalf>,
        writer: FrameWriter<OwnedWriteHalf>,
    }

    impl Peer {
        async fn request(&mut self, verb: &str, path: &str) {
            self.writer.write_frame(&Frame::sentinel()).await.unwrap();
            self.writer
                .write_frame(&Envelope::new(verb, path).to_frame())
                .await
                .unwrap();
        }

        async fn status(&mut self) -> WireStatus {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.reader.read_frame())
                .await
                .unwrap()
                .unwrap();
            WireStatus::from_code(frame.reader().read_i32().unwrap())
        }
    }

    struct Harness {
        peer: Peer,
        registry: Arc<DeviceRegistry>,
        shutdown: ShutdownHandle,
        session: JoinHandle<()>,
    }

    async fn start(routes: RouteTable, max_in_flight: usize) -> Harness {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = client.unwrap();
        let (server, peer_addr) = accepted.unwrap();

        let registry = Arc::new(DeviceRegistry::new());
        let shutdown = ShutdownHandle::new();
        let context = SessionContext {
            routes: Arc::new(routes),
            admission: Arc::new(Semaphore::new(max_in_flight)),
            shutdown: shutdown.signal(),
            shutdown_grace: Duration::from_millis(100),
        };

        let device = Device::new(peer_addr, server, 1024);
        let Registration::Created(guard) = registry.get_or_create(peer_addr, || device) else {
            panic!("fresh registry already had a device");
        };
        let session = tokio::spawn(DeviceSession::new(guard, context, None).run());

        let (read_half, write_half) = client.into_split();
        Harness {
            peer: Peer {
                reader: FrameReader::new(read_half),
                writer: FrameWriter::new(write_half),
            },
            registry,
            shutdown,
            session,
        }
    }

    fn counting_route(counter: &Arc<AtomicUsize>) -> RouteTable {
        let counter = Arc::clone(counter);
        let mut routes = RouteTable::new();
        routes
            .register(VERB_POST, "/ping", move |_inbound: Inbound, _outbound: Outbound| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), HandlerError>(())
                }
            })
            .unwrap();
        routes
    }

    #[tokio::test]
    async fn test_matched_route_invoked_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut h = start(counting_route(&calls), 4).await;

        h.peer.request("post", "/ping").await;
        assert_eq!(h.peer.status().await, WireStatus::Ok);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unmatched_route_not_invoked() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut h = start(counting_route(&calls), 4).await;

        h.peer.request("get", "/ping").await;
        assert_eq!(h.peer.status().await, WireStatus::NoRoute);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_sentinel_frames_discarded() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut h = start(counting_route(&calls), 4).await;

        // a bare envelope without a marker must not dispatch
        h.peer
            .writer
            .write_frame(&Envelope::new("post", "/ping").to_frame())
            .await
            .unwrap();
        h.peer
            .writer
            .write_frame(&Frame::new(SENTINEL_ID - 1, PayloadBuilder::new().put_i32(5).finish()))
            .await
            .unwrap();
        h.peer.request("post", "/ping").await;

        assert_eq!(h.peer.status().await, WireStatus::Ok);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_envelope_after_marker_returns_to_await_marker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut h = start(counting_route(&calls), 4).await;

        h.peer.writer.write_frame(&Frame::sentinel()).await.unwrap();
        h.peer
            .writer
            .write_frame(&Frame::new(7, Envelope::new("post", "/ping").to_frame().payload))
            .await
            .unwrap();
        h.peer.request("post", "/ping").await;

        // only the well-formed request gets a reply
        assert_eq!(h.peer.status().await, WireStatus::Ok);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_error_reports_status_and_keeps_session() {
        let mut routes = RouteTable::new();
        routes
            .register(VERB_PUT, "/fail", |_inbound: Inbound, _outbound: Outbound| async {
                Err::<(), HandlerError>("storage offline".into())
            })
            .unwrap();
        let mut h = start(routes, 4).await;

        h.peer.request("put", "/fail").await;
        assert_eq!(h.peer.status().await, WireStatus::HandlerFailed);

        h.peer.request("put", "/missing").await;
        assert_eq!(h.peer.status().await, WireStatus::NoRoute);
    }

    async fn panicking(_inbound: Inbound, _outbound: Outbound) -> Result<(), HandlerError> {
        panic!("handler bug")
    }

    #[tokio::test]
    async fn test_handler_panic_reports_status() {
        let mut routes = RouteTable::new();
        routes.register(VERB_POST, "/panic", panicking).unwrap();
        let mut h = start(routes, 4).await;

        h.peer.request("post", "/panic").await;
        assert_eq!(h.peer.status().await, WireStatus::HandlerFailed);
    }

    #[tokio::test]
    async fn test_handler_reads_request_body() {
        let mut routes = RouteTable::new();
        routes
            .register(VERB_PUT, "/echo", |inbound: Inbound, outbound: Outbound| async move {
                let body = inbound.read_frame().await?;
                outbound.send(body.payload).await?;
                Ok::<(), HandlerError>(())
            })
            .unwrap();
        let mut h = start(routes, 4).await;

        h.peer.request("put", "/echo").await;
        h.peer
            .writer
            .write_frame(&Frame::new(1, PayloadBuilder::new().put_string("hi").finish()))
            .await
            .unwrap();

        let echoed = h.peer.reader.read_frame().await.unwrap();
        assert_eq!(echoed.reader().read_string().unwrap(), "hi");
        assert_eq!(h.peer.status().await, WireStatus::Ok);
    }

    #[tokio::test]
    async fn test_no_admission_slots_reports_busy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut h = start(counting_route(&calls), 0).await;

        h.peer.request("post", "/ping").await;
        assert_eq!(h.peer.status().await, WireStatus::Busy);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disconnect_removes_device() {
        let calls = Arc::new(AtomicUsize::new(0));
        let h = start(counting_route(&calls), 4).await;
        assert_eq!(h.registry.len(), 1);

        drop(h.peer);
        tokio::time::timeout(Duration::from_secs(5), h.session)
            .await
            .unwrap()
            .unwrap();
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_envelope_ends_session() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut h = start(counting_route(&calls), 4).await;

        h.peer.writer.write_frame(&Frame::sentinel()).await.unwrap();
        let only_verb = PayloadBuilder::new().put_string("post").finish();
        h.peer
            .writer
            .write_frame(&Frame::new(ENVELOPE_ID, only_verb))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), h.session)
            .await
            .unwrap()
            .unwrap();
        assert!(h.registry.is_empty());
        assert!(matches!(
            h.peer.reader.read_frame().await,
            Err(FrameError::Closed) | Err(FrameError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_session() {
        let calls = Arc::new(AtomicUsize::new(0));
        let h = start(counting_route(&calls), 4).await;

        h.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), h.session)
            .await
            .unwrap()
            .unwrap();
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_handler_waiting_on_peer() {
        let entered = Arc::new(tokio::sync::Notify::new());
        let notify = Arc::clone(&entered);
        let mut routes = RouteTable::new();
        routes
            .register(VERB_PUT, "/echo", move |inbound: Inbound, _outbound: Outbound| {
                let notify = Arc::clone(&notify);
                async move {
                    notify.notify_one();
                    inbound.read_frame().await?;
                    Ok::<(), HandlerError>(())
                }
            })
            .unwrap();
        let mut h = start(routes, 4).await;

        // no body follows, so the handler stays parked on its read
        h.peer.request("put", "/echo").await;
        tokio::time::timeout(Duration::from_secs(5), entered.notified())
            .await
            .unwrap();

        h.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), h.session)
            .await
            .unwrap()
            .unwrap();
        assert!(h.registry.is_empty());
        assert!(matches!(
            h.peer.reader.read_frame().await,
            Err(FrameError::Closed) | Err(FrameError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_handler_finishing_within_grace_gets_status() {
        let entered = Arc::new(tokio::sync::Notify::new());
        let notify = Arc::clone(&entered);
        let mut routes = RouteTable::new();
        routes
            .register(VERB_POST, "/slow", move |_inbound: Inbound, _outbound: Outbound| {
                let notify = Arc::clone(&notify);
                async move {
                    notify.notify_one();
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<(), HandlerError>(())
                }
            })
            .unwrap();
        let mut h = start(routes, 4).await;

        h.peer.request("post", "/slow").await;
        tokio::time::timeout(Duration::from_secs(5), entered.notified())
            .await
            .unwrap();
        h.shutdown.trigger();

        assert_eq!(h.peer.status().await, WireStatus::Ok);
        tokio::time::timeout(Duration::from_secs(5), h.session)
            .await
            .unwrap()
            .unwrap();
        assert!(h.registry.is_empty());
    }
}
