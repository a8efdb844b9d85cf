//! Boundary between a [`Connection`] and the socket implementation driving it.
//!
//! A [`Transport`] opens a socket and hands back the frontend half of a
//! channel pair, the [`TransportLink`]. The backend half, [`LinkBackend`],
//! lives wherever the socket is driven (an async task on native, JS callbacks
//! in the browser). All communication between the halves goes through
//! channels, so the frontend never blocks on socket IO.
//!
//! [`Connection`]: crate::connection::Connection

use {
    crate::queue::FlushMode,
    bytes::Bytes,
    core::fmt,
    futures::channel::{mpsc, oneshot},
    tracing::debug,
};

/// Close code sent by the server when it intentionally ends the session (as
/// opposed to a transient drop).
pub const EXIT_CLOSE_CODE: u16 = 1028;

/// Close code reported when the peer closed without a status.
///
/// <https://www.rfc-editor.org/rfc/rfc6455.html#section-7.4.1>
pub const NO_STATUS_CLOSE_CODE: u16 = 1005;

/// Socket implementation which a [`Connection`] sends batches over.
///
/// [`Connection`]: crate::connection::Connection
pub trait Transport {
    /// Error returned if a socket cannot even be created for a URI.
    type Error: core::error::Error + Send + Sync + 'static;

    /// Starts connecting to `uri`.
    ///
    /// This must not block until the connection is established: the backend
    /// reports [`TransportEvent::Opened`] once it is.
    ///
    /// # Errors
    ///
    /// Errors if the socket could not be created, e.g. if `uri` is malformed.
    fn open(&mut self, uri: &str) -> Result<TransportLink, Self::Error>;

    /// How much of the packet queue a single flush should drain.
    fn flush_mode(&self) -> FlushMode;
}

/// Event reported by a transport backend.
#[derive(Debug)]
pub enum TransportEvent {
    /// The socket finished connecting.
    Opened,
    /// A binary frame was received.
    Recv(Bytes),
    /// The socket is closed and will report nothing else.
    Closed(CloseReason),
}

/// Why a transport closed.
#[derive(Debug)]
pub enum CloseReason {
    /// The peer sent a close frame.
    Peer {
        /// Close status code.
        code: u16,
        /// Close reason text.
        reason: String,
    },
    /// The connection failed.
    Error(anyhow::Error),
}

impl CloseReason {
    /// Creates a [`CloseReason::Error`].
    #[must_use]
    pub fn by_error(err: impl Into<anyhow::Error>) -> Self {
        Self::Error(err.into())
    }

    /// Whether the peer signalled that the session was intentionally ended.
    #[must_use]
    pub const fn is_exit(&self) -> bool {
        matches!(
            self,
            Self::Peer {
                code: EXIT_CLOSE_CODE,
                ..
            }
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Peer { code, reason } if reason.is_empty() => {
                write!(f, "closed by peer with code {code}")
            }
            Self::Peer { code, reason } => {
                write!(f, "closed by peer with code {code}: {reason}")
            }
            Self::Error(err) => write!(f, "connection error: {err:#}"),
        }
    }
}

/// Frontend half of a transport, owned by the connection.
#[derive(Debug)]
pub struct TransportLink {
    pub(crate) recv_event: mpsc::UnboundedReceiver<TransportEvent>,
    pub(crate) send_batch: mpsc::UnboundedSender<Bytes>,
    pub(crate) send_close: Option<oneshot::Sender<()>>,
    pub(crate) teardown: Teardown,
}

/// Backend half of a transport, owned by whatever drives the socket.
#[derive(Debug)]
pub struct LinkBackend {
    /// Reports socket events to the frontend.
    pub send_event: mpsc::UnboundedSender<TransportEvent>,
    /// Batches to write to the socket, in order.
    pub recv_batch: mpsc::UnboundedReceiver<Bytes>,
    /// Resolves when the frontend requests the socket to be closed, or is
    /// dropped.
    pub recv_close: oneshot::Receiver<()>,
    /// Signals that the socket has been fully torn down when sent or dropped.
    pub teardown: TeardownSignal,
}

/// Creates a connected [`TransportLink`] and [`LinkBackend`] pair.
#[must_use]
pub fn link() -> (TransportLink, LinkBackend) {
    let (send_event, recv_event) = mpsc::unbounded();
    let (send_batch, recv_batch) = mpsc::unbounded();
    let (send_close, recv_close) = oneshot::channel();
    let (send_teardown, recv_teardown) = ::oneshot::channel();

    (
        TransportLink {
            recv_event,
            send_batch,
            send_close: Some(send_close),
            teardown: Teardown(recv_teardown),
        },
        LinkBackend {
            send_event,
            recv_batch,
            recv_close,
            teardown: TeardownSignal(send_teardown),
        },
    )
}

impl TransportLink {
    /// Asks the backend to close the socket, and returns the signal which
    /// completes when it has.
    ///
    /// Dropping the link here also stops any further events from being
    /// delivered to the frontend.
    pub(crate) fn close(mut self) -> Teardown {
        if let Some(send_close) = self.send_close.take() {
            _ = send_close.send(());
        }
        self.teardown
    }
}

/// Sending half of a [`Teardown`].
#[derive(Debug)]
pub struct TeardownSignal(::oneshot::Sender<()>);

impl TeardownSignal {
    /// Marks the socket as fully torn down.
    ///
    /// Dropping the signal has the same effect.
    pub fn complete(self) {
        _ = self.0.send(());
    }
}

/// Completes once a transport backend has fully released its socket.
#[derive(Debug)]
pub struct Teardown(::oneshot::Receiver<()>);

impl Teardown {
    /// Checks without blocking whether the teardown has completed.
    pub fn is_complete(&mut self) -> bool {
        match self.0.try_recv() {
            Ok(()) | Err(::oneshot::TryRecvError::Disconnected) => true,
            Err(::oneshot::TryRecvError::Empty) => false,
        }
    }

    /// Blocks the current thread until the teardown has completed.
    ///
    /// On WASM the main thread cannot block. The old socket's callbacks are
    /// already detached from the connection at this point, so its remaining
    /// events have nowhere to go, and this returns immediately.
    pub fn wait(mut self) {
        cfg_if::cfg_if! {
            if #[cfg(target_family = "wasm")] {
                if !self.is_complete() {
                    debug!("Previous socket still closing, continuing without waiting");
                }
            } else {
                if self.is_complete() {
                    return;
                }
                debug!("Waiting for previous socket to finish closing");
                // `Err` means the backend dropped its signal, which is also completion
                _ = self.0.recv();
            }
        }
    }
}
