//! Session connection: lifecycle state machine, send path and dispatch.
//!
//! ```text
//!           open            Opened
//! Closed ---------> Opening --------> Open
//!   ^                  |               |
//!   |                  | close/Closed  | close/Closed
//!   |    teardown      v               v
//!   +--------------- Closing <---------+
//! ```
//!
//! A [`Connection`] is driven from a single thread: call
//! [`Connection::poll`] once per frame to apply transport events and dispatch
//! handlers. Nothing here blocks except [`Connection::open`] on native, which
//! waits for a previous socket that is still tearing down.

use {
    crate::{
        dispatch::{Handlers, SystemMessage},
        framing::{CounterExhausted, Framer},
        packet::{DelimiterInPayload, Packet, QueuedPacket, parse_batch},
        queue::{FlushStats, MAX_BATCH_LEN, PacketQueue},
        transport::{CloseReason, EXIT_CLOSE_CODE, Teardown, Transport, TransportEvent, TransportLink},
    },
    bytes::Bytes,
    core::num::Saturating,
    derive_more::{Display, Error, From},
    tracing::{debug, trace, trace_span, warn},
};

/// Configuration for a [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Whether to prepend the authentication header to every batch.
    ///
    /// Default: `true`
    pub header: bool,
    /// Pre-shared secret mixed into the header digest.
    ///
    /// Default: empty
    pub psk: Vec<u8>,
    /// Maximum length of a batch produced by the packet queue.
    ///
    /// Default: [`MAX_BATCH_LEN`]
    pub max_batch_len: usize,
    /// Close code which the peer sends to signal that the session was ended
    /// on purpose. Dispatched as [`SystemMessage::Exit`].
    ///
    /// Default: [`EXIT_CLOSE_CODE`]
    pub exit_close_code: u16,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            header: true,
            psk: Vec::new(),
            max_batch_len: MAX_BATCH_LEN,
            exit_close_code: EXIT_CLOSE_CODE,
        }
    }
}

impl ConnectionConfig {
    /// Sets [`ConnectionConfig::header`].
    #[must_use]
    pub const fn with_header(mut self, header: bool) -> Self {
        self.header = header;
        self
    }

    /// Sets [`ConnectionConfig::psk`].
    #[must_use]
    pub fn with_psk(mut self, psk: impl Into<Vec<u8>>) -> Self {
        self.psk = psk.into();
        self
    }

    /// Sets [`ConnectionConfig::max_batch_len`].
    #[must_use]
    pub const fn with_max_batch_len(mut self, max_batch_len: usize) -> Self {
        self.max_batch_len = max_batch_len;
        self
    }

    /// Sets [`ConnectionConfig::exit_close_code`].
    #[must_use]
    pub const fn with_exit_close_code(mut self, code: u16) -> Self {
        self.exit_close_code = code;
        self
    }
}

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No transport exists.
    #[default]
    Closed,
    /// A transport was opened and is connecting.
    Opening,
    /// The transport is connected and batches can be sent.
    Open,
    /// The transport is being torn down.
    Closing {
        /// Whether the transport closed because of an error.
        failed: bool,
    },
}

/// Failed to send a batch.
#[derive(Debug, Display, Error, From)]
#[non_exhaustive]
pub enum SendError {
    /// The connection is not [`ConnectionState::Open`].
    #[display("connection is not open")]
    NotOpen,
    /// No more nonces are left for this connection.
    #[display("send counter exhausted")]
    #[from]
    Counter(CounterExhausted),
    /// The transport backend has stopped.
    #[display("transport backend closed")]
    BackendClosed,
}

/// Failed to queue a packet.
#[derive(Debug, Display, Error, From)]
#[display("failed to encode packet")]
pub struct EnqueueError(DelimiterInPayload);

/// Counts of traffic over the lifetime of a [`Connection`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Batches handed to the transport.
    pub batches_sent: Saturating<usize>,
    /// Bytes handed to the transport, including headers.
    pub bytes_sent: Saturating<usize>,
    /// Frames received from the transport.
    pub frames_recv: Saturating<usize>,
    /// Messages dispatched from received frames.
    pub msgs_recv: Saturating<usize>,
}

/// Client side of a game-sync session over some [`Transport`].
#[derive(Debug)]
pub struct Connection<T> {
    transport: T,
    config: ConnectionConfig,
    state: ConnectionState,
    link: Option<TransportLink>,
    teardown: Option<Teardown>,
    framer: Framer,
    queue: PacketQueue,
    handlers: Handlers,
    stats: ConnectionStats,
}

impl<T: Transport> Connection<T> {
    /// Creates a closed connection over `transport`.
    #[must_use]
    pub fn new(transport: T, config: ConnectionConfig) -> Self {
        Self {
            transport,
            framer: Framer::new(config.psk.clone(), 0),
            queue: PacketQueue::new(config.max_batch_len),
            config,
            state: ConnectionState::Closed,
            link: None,
            teardown: None,
            handlers: Handlers::default(),
            stats: ConnectionStats::default(),
        }
    }

    /// Handlers invoked from [`Connection::poll`].
    pub const fn handlers(&mut self) -> &mut Handlers {
        &mut self.handlers
    }

    /// Registers the handler for messages named `name`.
    ///
    /// See [`Handlers::on_message`].
    pub fn on_message(&mut self, name: impl Into<String>, f: impl FnMut(&[&str]) + 'static) {
        self.handlers.on_message(name, f);
    }

    /// Registers the handler for a lifecycle event.
    pub fn on_system(&mut self, msg: SystemMessage, f: impl FnMut() + 'static) {
        self.handlers.on_system(msg, f);
    }

    /// Registers a handler for messages which have no named handler.
    pub fn on_raw(&mut self, f: impl FnMut(&str, &str) + 'static) {
        self.handlers.on_raw(f);
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether batches can currently be sent.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Open)
    }

    /// Sets the per-connection key mixed into the header digest.
    pub fn set_key(&mut self, key: u32) {
        self.framer.set_key(key);
    }

    /// Per-connection key mixed into the header digest.
    #[must_use]
    pub const fn key(&self) -> u32 {
        self.framer.key()
    }

    /// Counter value carried by the last batch sent on this connection.
    #[must_use]
    pub const fn counter(&self) -> u32 {
        self.framer.counter()
    }

    /// Packets waiting for [`Connection::flush_queue`].
    #[must_use]
    pub const fn queue(&self) -> &PacketQueue {
        &self.queue
    }

    /// Traffic counts.
    #[must_use]
    pub const fn stats(&self) -> ConnectionStats {
        self.stats
    }

    /// Underlying transport.
    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable access to the underlying transport.
    pub const fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Connects to `uri`, closing the current transport first.
    ///
    /// If a previous transport is still tearing down, this waits until it has
    /// released its socket, so that two sockets never both act as the live
    /// session. Failing to create the transport dispatches
    /// [`SystemMessage::Close`].
    pub fn open(&mut self, uri: &str) {
        let span = trace_span!("open", %uri);
        let _span = span.enter();

        self.detach();
        if let Some(teardown) = self.teardown.take() {
            teardown.wait();
        }
        self.state = ConnectionState::Closed;
        self.framer.reset();

        match self.transport.open(uri) {
            Ok(link) => {
                debug!("Opening connection");
                self.link = Some(link);
                self.state = ConnectionState::Opening;
            }
            Err(err) => {
                warn!("Failed to open connection: {:#}", anyhow::Error::new(err));
                self.handlers.dispatch_system(SystemMessage::Close);
            }
        }
    }

    /// Closes the connection.
    ///
    /// Queued packets are dropped, and nothing is dispatched for the closed
    /// transport afterwards. Calling this when already closed does nothing.
    pub fn close(&mut self) {
        self.queue.clear();
        if self.detach() {
            debug!("Closed connection");
        }
    }

    /// Asks the live transport to close and stops receiving its events.
    fn detach(&mut self) -> bool {
        let Some(link) = self.link.take() else {
            return false;
        };
        self.teardown = Some(link.close());
        if !matches!(self.state, ConnectionState::Closing { .. }) {
            self.state = ConnectionState::Closing { failed: false };
        }
        true
    }

    /// Applies transport events and dispatches handlers.
    ///
    /// Call this once per frame. This never blocks.
    pub fn poll(&mut self) {
        let span = trace_span!("poll");
        let _span = span.enter();

        while let Some(link) = &mut self.link {
            let event = match link.recv_event.try_next() {
                Ok(Some(event)) => event,
                Ok(None) => TransportEvent::Closed(CloseReason::by_error(anyhow::anyhow!(
                    "transport backend stopped"
                ))),
                Err(_) => break,
            };
            self.handle_event(event);
        }

        if matches!(self.state, ConnectionState::Closing { .. })
            && self.teardown.as_mut().is_none_or(Teardown::is_complete)
        {
            self.teardown = None;
            self.state = ConnectionState::Closed;
            trace!("Transport torn down");
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                if self.state != ConnectionState::Opening {
                    return;
                }
                debug!("Connection opened");
                self.state = ConnectionState::Open;
                self.handlers.dispatch_system(SystemMessage::Open);
            }
            TransportEvent::Recv(frame) => self.recv(&frame),
            TransportEvent::Closed(reason) => {
                let failed = matches!(reason, CloseReason::Error(_));
                let exit = matches!(
                    reason,
                    CloseReason::Peer { code, .. } if code == self.config.exit_close_code
                );
                if failed {
                    warn!("Connection lost: {reason}");
                } else {
                    debug!("Connection {reason}");
                }

                self.detach();
                self.state = ConnectionState::Closing { failed };
                self.handlers.dispatch_system(if exit {
                    SystemMessage::Exit
                } else {
                    SystemMessage::Close
                });
            }
        }
    }

    fn recv(&mut self, frame: &Bytes) {
        self.stats.frames_recv += 1;
        let msgs = parse_batch(frame);
        trace!(len = frame.len(), msgs = msgs.len(), "Received frame");
        for msg in &msgs {
            self.stats.msgs_recv += 1;
            self.handlers.dispatch_message(msg);
        }
    }

    /// Sends one batch over the transport.
    ///
    /// # Errors
    ///
    /// Errors if the connection is not open, or the batch could not be handed
    /// to the transport. Nothing is sent in that case.
    pub fn send(&mut self, data: &[u8]) -> Result<(), SendError> {
        if !self.is_connected() {
            return Err(SendError::NotOpen);
        }
        let link = self.link.as_ref().ok_or(SendError::NotOpen)?;
        transmit(link, &mut self.framer, &self.config, &mut self.stats, data)
    }

    /// Encodes a packet and appends it to the outbound queue.
    ///
    /// # Errors
    ///
    /// Errors if the packet contains a delimiter sequence.
    pub fn enqueue(&mut self, packet: &(impl Packet + ?Sized)) -> Result<(), EnqueueError> {
        self.queue.push(QueuedPacket::new(packet)?);
        Ok(())
    }

    /// Sends queued packets in batches, in the transport's flush mode.
    ///
    /// If the connection is not open the queue is kept as is.
    ///
    /// # Errors
    ///
    /// Errors if the connection is not open, or if a batch could not be
    /// sent. Batches which failed to send are dropped.
    pub fn flush_queue(&mut self) -> Result<FlushStats, SendError> {
        if !self.is_connected() {
            return Err(SendError::NotOpen);
        }
        let Self {
            transport,
            config,
            link,
            framer,
            queue,
            stats,
            ..
        } = self;
        let link = link.as_ref().ok_or(SendError::NotOpen)?;

        let mut result = Ok(());
        let flushed = queue.flush(transport.flush_mode(), |batch| {
            if let Err(err) = transmit(link, framer, config, stats, &batch) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        });
        result.map(|()| flushed)
    }
}

fn transmit(
    link: &TransportLink,
    framer: &mut Framer,
    config: &ConnectionConfig,
    stats: &mut ConnectionStats,
    data: &[u8],
) -> Result<(), SendError> {
    let frame = Bytes::from(framer.frame(data, config.header)?);
    let len = frame.len();
    link.send_batch
        .unbounded_send(frame)
        .map_err(|_| SendError::BackendClosed)?;
    stats.batches_sent += 1;
    stats.bytes_sent += len;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![expect(clippy::unwrap_used, reason = "testing")]

    use {
        super::*,
        crate::{
            channel::ChannelTransport,
            framing::{HEADER_LEN, compute_header},
            packet::NamedPacket,
            queue::FlushMode,
        },
        std::{cell::RefCell, rc::Rc},
    };

    fn record(conn: &mut Connection<ChannelTransport>) -> Rc<RefCell<Vec<SystemMessage>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        for kind in [SystemMessage::Open, SystemMessage::Close, SystemMessage::Exit] {
            let seen = seen.clone();
            conn.on_system(kind, move || seen.borrow_mut().push(kind));
        }
        seen
    }

    fn opened(config: ConnectionConfig) -> (Connection<ChannelTransport>, crate::channel::ChannelPeer) {
        let mut conn = Connection::new(ChannelTransport::new(), config);
        conn.open("mem://test");
        let peer = conn.transport_mut().take_peer().unwrap();
        peer.accept();
        conn.poll();
        (conn, peer)
    }

    #[test]
    fn open_dispatches_open() {
        let mut conn = Connection::new(ChannelTransport::new(), ConnectionConfig::default());
        let seen = record(&mut conn);

        conn.open("mem://test");
        assert_eq!(ConnectionState::Opening, conn.state());
        let peer = conn.transport_mut().take_peer().unwrap();
        peer.accept();
        conn.poll();

        assert_eq!(ConnectionState::Open, conn.state());
        assert_eq!(vec![SystemMessage::Open], *seen.borrow());
    }

    #[test]
    fn send_is_noop_unless_open() {
        let mut conn = Connection::new(ChannelTransport::new(), ConnectionConfig::default());
        assert!(matches!(conn.send(b"x"), Err(SendError::NotOpen)));
        assert_eq!(0, conn.counter());

        conn.open("mem://test");
        assert!(matches!(conn.send(b"x"), Err(SendError::NotOpen)));
        assert_eq!(0, conn.counter());
    }

    #[test]
    fn send_prepends_header_with_increasing_counter() {
        let (mut conn, mut peer) = opened(ConnectionConfig::default().with_psk(*b"psk"));
        conn.set_key(7);
        conn.send(b"one").unwrap();
        conn.send(b"two").unwrap();

        let first = peer.recv().unwrap();
        let second = peer.recv().unwrap();
        assert_eq!(compute_header(b"psk", 7, 1, b"one"), first[..HEADER_LEN]);
        assert_eq!(compute_header(b"psk", 7, 2, b"two"), second[..HEADER_LEN]);
        assert_eq!(b"two", &second[HEADER_LEN..]);
    }

    #[test]
    fn rejected_batches_are_not_counted() {
        let (mut conn, mut peer) = opened(ConnectionConfig::default());
        conn.send(b"one").unwrap();
        let sent = peer.recv().unwrap().len();
        drop(peer);

        assert!(matches!(conn.send(b"two"), Err(SendError::BackendClosed)));
        let stats = conn.stats();
        assert_eq!(1, stats.batches_sent.0);
        assert_eq!(sent, stats.bytes_sent.0);
    }

    #[test]
    fn header_mode_off_sends_raw() {
        let (mut conn, mut peer) = opened(ConnectionConfig::default().with_header(false));
        conn.send(b"raw").unwrap();
        assert_eq!(&b"raw"[..], &peer.recv().unwrap()[..]);
    }

    #[test]
    fn counter_resets_on_reopen() {
        let (mut conn, peer) = opened(ConnectionConfig::default());
        conn.send(b"a").unwrap();
        conn.send(b"b").unwrap();
        assert_eq!(2, conn.counter());

        drop(peer);
        conn.open("mem://again");
        assert_eq!(0, conn.counter());
        assert_eq!(ConnectionState::Opening, conn.state());
    }

    #[test]
    fn reopen_waits_for_previous_teardown() {
        let (mut conn, peer) = opened(ConnectionConfig::default());
        let released = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));

        let worker = std::thread::spawn({
            let released = released.clone();
            move || {
                std::thread::sleep(core::time::Duration::from_millis(20));
                released.store(true, std::sync::atomic::Ordering::SeqCst);
                drop(peer);
            }
        });

        conn.open("mem://again");
        assert!(released.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(2, conn.transport().num_opened());
        worker.join().unwrap();
    }

    #[test]
    fn exit_code_dispatches_exit() {
        let (mut conn, peer) = opened(ConnectionConfig::default());
        let seen = record(&mut conn);
        peer.close(EXIT_CLOSE_CODE, "bye");
        conn.poll();
        assert_eq!(vec![SystemMessage::Exit], *seen.borrow());
        assert!(!conn.is_connected());
    }

    #[test]
    fn other_close_code_dispatches_close() {
        let (mut conn, peer) = opened(ConnectionConfig::default());
        let seen = record(&mut conn);
        peer.close(1000, "");
        conn.poll();
        assert_eq!(vec![SystemMessage::Close], *seen.borrow());
    }

    #[test]
    fn error_marks_failed_then_closed() {
        let (mut conn, peer) = opened(ConnectionConfig::default());
        let seen = record(&mut conn);
        peer.fail(anyhow::anyhow!("connection reset"));
        conn.poll();

        assert_eq!(vec![SystemMessage::Close], *seen.borrow());
        assert!(matches!(
            conn.state(),
            ConnectionState::Closing { failed: true } | ConnectionState::Closed
        ));
        drop(peer);
        conn.poll();
        assert_eq!(ConnectionState::Closed, conn.state());
    }

    #[test]
    fn close_is_idempotent_and_silent() {
        let (mut conn, mut peer) = opened(ConnectionConfig::default());
        let seen = record(&mut conn);
        conn.enqueue(&NamedPacket::new("m")).unwrap();

        conn.close();
        conn.close();
        assert!(conn.queue().is_empty());

        peer.send_frame("s\u{FFFF}1");
        peer.close(1000, "");
        conn.poll();
        assert!(seen.borrow().is_empty());
        assert!(peer.close_requested());
    }

    #[test]
    fn received_frames_dispatch_by_name() {
        let (mut conn, peer) = opened(ConnectionConfig::default());
        let seen = Rc::new(RefCell::new(Vec::new()));
        {
            let seen = seen.clone();
            conn.on_message("s", move |params| {
                seen.borrow_mut().push(params.join(","));
            });
        }

        peer.send_frame("s\u{FFFF}1\u{FFFF}2\u{FFFE}s\u{FFFF}3");
        conn.poll();
        assert_eq!(vec!["1,2", "3"], *seen.borrow());
        assert_eq!(2, conn.stats().msgs_recv.0);
    }

    #[test]
    fn flush_while_not_open_keeps_queue() {
        let mut conn = Connection::new(ChannelTransport::new(), ConnectionConfig::default());
        conn.enqueue(&NamedPacket::new("m").param(1)).unwrap();
        assert!(matches!(conn.flush_queue(), Err(SendError::NotOpen)));
        assert_eq!(1, conn.queue().len());
    }

    #[test]
    fn flush_sends_partitioned_batches() {
        let (mut conn, mut peer) = opened(ConnectionConfig::default().with_header(false));
        conn.enqueue(&NamedPacket::new("sr").param(1)).unwrap();
        conn.enqueue(&NamedPacket::new("m").param(2)).unwrap();

        let stats = conn.flush_queue().unwrap();
        assert_eq!(2, stats.batches.0);
        assert_eq!(&b"m\xEF\xBF\xBF2"[..], &peer.recv().unwrap()[..]);
        assert_eq!(&b"sr\xEF\xBF\xBF1"[..], &peer.recv().unwrap()[..]);
    }

    #[test]
    fn first_batch_mode_leaves_rest_queued() {
        let mut conn = Connection::new(
            ChannelTransport::new().with_flush_mode(FlushMode::FirstBatch),
            ConnectionConfig::default(),
        );
        conn.open("mem://test");
        conn.transport_mut().take_peer().unwrap().accept();
        conn.poll();

        conn.enqueue(&NamedPacket::new("m")).unwrap();
        conn.enqueue(&NamedPacket::new("sr")).unwrap();
        conn.flush_queue().unwrap();
        assert_eq!(1, conn.queue().len());
    }

    #[test]
    fn open_failure_dispatches_close() {
        let mut conn = Connection::new(ChannelTransport::new(), ConnectionConfig::default());
        let seen = record(&mut conn);
        conn.open("");
        assert_eq!(ConnectionState::Closed, conn.state());
        assert_eq!(vec![SystemMessage::Close], *seen.borrow());
    }
}
