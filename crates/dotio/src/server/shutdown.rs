use std::sync::Arc;
use tokio::sync::watch;

/// Stops a running [`Application`](crate::server::Application).
///
/// Cloneable; triggering any clone stops the acceptor and every live session.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Trigger shutdown. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end held by the acceptor and each session.
#[derive(Debug, Clone)]
pub(crate) struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolves once shutdown has been triggered, including before this call.
    pub async fn wait(&mut self) {
        if self.rx.wait_for(|stopped| *stopped).await.is_err() {
            // every handle is gone, nobody can trigger any more
            std::future::pending::<()>().await;
        }
    }
}
