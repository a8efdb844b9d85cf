#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![doc = include_str!("../README.md")]
#![cfg_attr(
    feature = "document-features",
    doc = concat!("# Feature flags\n\n", document_features::document_features!())
)]

mod runtime;

use {
    core::fmt,
    derive_more::{Display, Error},
    rpgsync_io::{
        queue::FlushMode,
        transport::{Transport, TransportLink, link},
    },
    tracing::{Instrument, debug_span},
};
pub use {
    rpgsync_io,
    runtime::{MaybeSend, WebSocketRuntime},
};

cfg_if::cfg_if! {
    if #[cfg(target_family = "wasm")] {
        mod js_error;
        mod wasm;
        pub use js_error::JsError;

        type CreateTargetError = futures::never::Never;
        type CreateSocketError = JsError;
        type ConnectionError = JsError;

        /// Configuration for a [`WebSocketTransport`] in the browser, which
        /// has nothing to configure.
        #[derive(Debug, Clone, Default)]
        pub struct ClientConfig;

        const FLUSH_MODE: FlushMode = FlushMode::Drain;
    } else {
        mod config;
        mod native;
        pub use {
            config::*,
            rustls,
            rustls_native_certs,
            tokio_tungstenite,
            tokio_tungstenite::tungstenite,
        };

        type CreateTargetError = tungstenite::Error;
        type CreateSocketError = futures::never::Never;
        type ConnectionError = tungstenite::Error;

        const FLUSH_MODE: FlushMode = FlushMode::FirstBatch;
    }
}

/// Failed to create a socket for a target URI.
#[derive(Debug, Display, Error)]
#[non_exhaustive]
pub enum OpenError {
    /// The target could not be turned into a WebSocket request.
    #[display("failed to create request target")]
    CreateTarget(CreateTargetError),
    /// The socket object could not be created.
    #[display("failed to create socket")]
    CreateSocket(CreateSocketError),
}

/// Reason reported by a backend when its socket stopped.
#[derive(Debug, Display, Error)]
#[non_exhaustive]
pub enum SessionError {
    /// Failed to connect to the target.
    #[display("failed to connect")]
    Connect(ConnectionError),
    /// The connection was lost.
    #[display("connection lost")]
    Connection(ConnectionError),
    /// The socket stream ended without a close frame.
    #[display("receive stream closed")]
    RecvStreamClosed,
}

/// WebSocket [`Transport`] for a [`Connection`].
///
/// Each [`Transport::open`] spawns a new socket on the [`WebSocketRuntime`].
///
/// [`Connection`]: rpgsync_io::connection::Connection
#[derive(Clone)]
pub struct WebSocketTransport {
    runtime: WebSocketRuntime,
    config: ClientConfig,
    next_socket_id: u64,
}

impl fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("runtime", &self.runtime)
            .field("next_socket_id", &self.next_socket_id)
            .finish_non_exhaustive()
    }
}

impl WebSocketTransport {
    /// Creates a transport spawning sockets on `runtime`.
    #[must_use]
    pub fn new(runtime: WebSocketRuntime, config: impl Into<ClientConfig>) -> Self {
        Self {
            runtime,
            config: config.into(),
            next_socket_id: 0,
        }
    }

    /// Runtime which sockets are spawned on.
    #[must_use]
    pub const fn runtime(&self) -> &WebSocketRuntime {
        &self.runtime
    }
}

impl Transport for WebSocketTransport {
    type Error = OpenError;

    fn open(&mut self, uri: &str) -> Result<TransportLink, Self::Error> {
        let socket = self.next_socket_id;
        self.next_socket_id = self.next_socket_id.wrapping_add(1);

        let (link, backend) = link();
        #[cfg(target_family = "wasm")]
        {
            let backend = wasm::open(uri, backend)?;
            self.runtime
                .spawn(backend.start().instrument(debug_span!("socket", socket)));
        }

        #[cfg(not(target_family = "wasm"))]
        {
            use tungstenite::client::IntoClientRequest;

            let request = uri.into_client_request().map_err(OpenError::CreateTarget)?;
            self.runtime.spawn(
                native::start(self.config.clone(), request, backend)
                    .instrument(debug_span!("socket", socket)),
            );
        }

        Ok(link)
    }

    fn flush_mode(&self) -> FlushMode {
        FLUSH_MODE
    }
}
