//! The event server: TCP listener, shared state, and fatal-error handling.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};

use weft_state::{StateStore, StoreError};

use crate::publisher::StatePublisher;
use crate::session;

/// Errors that terminate the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The requested address.
        addr: String,
        /// The bind failure.
        #[source]
        source: std::io::Error,
    },

    /// The listener failed while accepting.
    #[error("listener i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The store reported a fatal failure (invariant violation or id
    /// exhaustion). The server must not keep serving from it.
    #[error("fatal store failure: {0}")]
    Fatal(StoreError),
}

/// State shared by every session task.
#[derive(Debug)]
pub(crate) struct Shared {
    store: Mutex<StateStore>,
    pub(crate) publisher: StatePublisher,
    fatal_tx: mpsc::Sender<StoreError>,
}

impl Shared {
    /// Runs one mutation batch under the store lock and publishes the
    /// resulting snapshot while still holding it, so nonces enter the
    /// channel in version order. Fatal errors are forwarded to the server
    /// loop; the caller's session ends either way.
    pub(crate) async fn mutate<T, E>(
        &self,
        work: impl FnOnce(&mut StateStore) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: AsStoreError,
    {
        let mut store = self.store.lock().await;
        match work(&mut store) {
            Ok(value) => {
                self.publisher.publish(store.snapshot());
                Ok(value)
            }
            Err(err) => {
                if let Some(store_err) = err.as_store_error() {
                    if store_err.is_fatal() {
                        let _ = self.fatal_tx.try_send(store_err.clone());
                    }
                }
                Err(err)
            }
        }
    }
}

/// Extracts the underlying store error, if any, so [`Shared::mutate`] can
/// spot fatal failures behind any handler error type.
pub(crate) trait AsStoreError {
    /// The wrapped store error, when one exists.
    fn as_store_error(&self) -> Option<&StoreError>;
}

impl AsStoreError for StoreError {
    fn as_store_error(&self) -> Option<&StoreError> {
        Some(self)
    }
}

impl AsStoreError for weft_state::PlannerError {
    fn as_store_error(&self) -> Option<&StoreError> {
        match self {
            weft_state::PlannerError::Store(err) => Some(err),
            _ => None,
        }
    }
}

/// The control-plane event server.
///
/// Owns the listener and the shared store; one task per accepted stream.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    fatal_rx: mpsc::Receiver<StoreError>,
}

impl Server {
    /// Binds the listener.
    ///
    /// Binding port 0 selects an ephemeral port; read it back with
    /// [`Server::local_addr`].
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound.
    pub async fn bind(addr: &str) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| {
            ServerError::Bind {
                addr: addr.to_string(),
                source,
            }
        })?;
        let local_addr = listener.local_addr()?;
        let (fatal_tx, fatal_rx) = mpsc::channel(1);
        Ok(Self {
            listener,
            local_addr,
            shared: Arc::new(Shared {
                store: Mutex::new(StateStore::new()),
                publisher: StatePublisher::new(),
                fatal_tx,
            }),
            fatal_rx,
        })
    }

    /// The bound address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts streams until the listener fails or the store reports a
    /// fatal error.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Fatal`] on a store invariant violation or id
    /// exhaustion, and [`ServerError::Io`] if accepting fails.
    pub async fn run(mut self) -> Result<(), ServerError> {
        tracing::info!(addr = %self.local_addr, "control plane listening");
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    tracing::debug!(peer = %peer, "stream accepted");
                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(session::run(shared, stream, peer));
                }
                fatal = self.fatal_rx.recv() => {
                    if let Some(err) = fatal {
                        tracing::error!(error = %err, "fatal store failure; shutting down");
                        return Err(ServerError::Fatal(err));
                    }
                }
            }
        }
    }
}
