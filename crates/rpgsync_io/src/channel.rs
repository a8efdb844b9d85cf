//! In-memory [`Transport`] using MPSC channels.
//!
//! Each [`ChannelTransport::open`] creates a [`ChannelPeer`] playing the role
//! of the server, which can be taken out with [`ChannelTransport::take_peer`]
//! and used to accept the connection, inject frames and read what was sent.
//! This is useful for testing code built on a [`Connection`] without a real
//! socket.
//!
//! [`Connection`]: crate::connection::Connection

use {
    crate::{
        queue::FlushMode,
        transport::{
            CloseReason, LinkBackend, NO_STATUS_CLOSE_CODE, Transport, TransportEvent,
            TransportLink, link,
        },
    },
    bytes::Bytes,
    derive_more::{Display, Error},
    tracing::trace,
};

/// [`ChannelTransport`] error.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
#[non_exhaustive]
pub enum ChannelError {
    /// The target URI was empty.
    #[display("target URI is empty")]
    EmptyUri,
}

/// [`Transport`] whose remote end is a [`ChannelPeer`] in the same process.
#[derive(Debug, Default)]
pub struct ChannelTransport {
    flush_mode: FlushMode,
    peer: Option<ChannelPeer>,
    num_opened: usize,
}

impl ChannelTransport {
    /// Creates a transport which drains the whole queue on each flush.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flush mode reported to the connection.
    #[must_use]
    pub const fn with_flush_mode(mut self, flush_mode: FlushMode) -> Self {
        self.flush_mode = flush_mode;
        self
    }

    /// Takes the peer created by the last [`Transport::open`], if it was not
    /// already taken.
    pub const fn take_peer(&mut self) -> Option<ChannelPeer> {
        self.peer.take()
    }

    /// Number of successful [`Transport::open`] calls.
    #[must_use]
    pub const fn num_opened(&self) -> usize {
        self.num_opened
    }
}

impl Transport for ChannelTransport {
    type Error = ChannelError;

    fn open(&mut self, uri: &str) -> Result<TransportLink, Self::Error> {
        if uri.is_empty() {
            return Err(ChannelError::EmptyUri);
        }

        let (link, backend) = link();
        trace!("Opened channel to {uri}");
        self.peer = Some(ChannelPeer {
            uri: uri.to_owned(),
            backend,
        });
        self.num_opened += 1;
        Ok(link)
    }

    fn flush_mode(&self) -> FlushMode {
        self.flush_mode
    }
}

/// Remote end of a [`ChannelTransport`] connection.
///
/// Dropping the peer completes the transport's teardown.
#[derive(Debug)]
pub struct ChannelPeer {
    uri: String,
    backend: LinkBackend,
}

impl ChannelPeer {
    /// URI which the connection was opened to.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn emit(&self, event: TransportEvent) {
        // the frontend may have detached already
        _ = self.backend.send_event.unbounded_send(event);
    }

    /// Reports the connection as established.
    pub fn accept(&self) {
        self.emit(TransportEvent::Opened);
    }

    /// Delivers a binary frame to the connection.
    pub fn send_frame(&self, frame: impl Into<Bytes>) {
        self.emit(TransportEvent::Recv(frame.into()));
    }

    /// Closes the connection with a close code, as if a close frame was
    /// received.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        self.emit(TransportEvent::Closed(CloseReason::Peer {
            code,
            reason: reason.into(),
        }));
    }

    /// Closes the connection without a close code.
    pub fn close_without_status(&self) {
        self.close(NO_STATUS_CLOSE_CODE, "");
    }

    /// Fails the connection with an error.
    pub fn fail(&self, err: impl Into<anyhow::Error>) {
        self.emit(TransportEvent::Closed(CloseReason::by_error(err)));
    }

    /// Takes the next batch sent by the connection, if any.
    pub fn recv(&mut self) -> Option<Bytes> {
        self.backend.recv_batch.try_next().ok().flatten()
    }

    /// Whether the connection asked for the transport to close, or dropped it.
    pub fn close_requested(&mut self) -> bool {
        !matches!(self.backend.recv_close.try_recv(), Ok(None))
    }
}

#[cfg(test)]
mod tests {
    #![expect(clippy::unwrap_used, reason = "testing")]

    use super::*;

    #[test]
    fn empty_uri_is_rejected() {
        let mut transport = ChannelTransport::new();
        assert_eq!(ChannelError::EmptyUri, transport.open("").unwrap_err());
        assert!(transport.take_peer().is_none());
        assert_eq!(0, transport.num_opened());
    }

    #[test]
    fn peer_sees_sent_batches() {
        let mut transport = ChannelTransport::new();
        let link = transport.open("mem://a").unwrap();
        let mut peer = transport.take_peer().unwrap();
        assert_eq!("mem://a", peer.uri());

        link.send_batch.unbounded_send(Bytes::from_static(b"x")).unwrap();
        assert_eq!(Some(Bytes::from_static(b"x")), peer.recv());
        assert_eq!(None, peer.recv());
        assert!(!peer.close_requested());

        drop(link.close());
        assert!(peer.close_requested());
    }
}
