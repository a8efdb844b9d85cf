//! Native client configuration.

use {
    rustls::{
        DigitallySignedStruct, RootCertStore, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        crypto::CryptoProvider,
        pki_types::{CertificateDer, ServerName, UnixTime},
    },
    std::sync::Arc,
    tokio_tungstenite::{Connector, tungstenite::protocol::WebSocketConfig},
    tracing::{debug, warn},
};

/// How a [`ClientConfig`] secures its sockets.
#[derive(Debug, Clone, Default)]
pub enum Security {
    /// No TLS. Only `ws://` targets can be reached.
    Plain,
    /// TLS, validating the server against the platform's root certificates.
    #[default]
    NativeRoots,
    /// TLS which accepts any server certificate.
    ///
    /// Only use this against test servers with self-signed certificates.
    AcceptAnyCert,
    /// TLS with a caller-provided `rustls` configuration.
    Custom(Arc<rustls::ClientConfig>),
}

impl Security {
    fn into_tls(self) -> Option<Arc<rustls::ClientConfig>> {
        let config = match self {
            Self::Plain => return None,
            Self::Custom(config) => return Some(config),
            Self::NativeRoots => {
                ensure_crypto_provider();
                rustls::ClientConfig::builder()
                    .with_root_certificates(load_native_roots())
                    .with_no_client_auth()
            }
            Self::AcceptAnyCert => {
                ensure_crypto_provider();
                rustls::ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(AcceptAnyCert::new()))
                    .with_no_client_auth()
            }
        };
        Some(Arc::new(config))
    }
}

/// Configuration for a [`WebSocketTransport`] on a native target.
///
/// [`ClientConfig::default`] connects over TLS checked against the platform's
/// root certificates, with Nagle's algorithm disabled.
///
/// [`WebSocketTransport`]: crate::WebSocketTransport
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub(crate) tls: Option<Arc<rustls::ClientConfig>>,
    pub(crate) socket: WebSocketConfig,
    pub(crate) nodelay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::builder().with_security(Security::default()).build()
    }
}

impl ClientConfig {
    /// Starts building a configuration.
    ///
    /// # Examples
    ///
    /// ```
    /// use rpgsync_websocket::{ClientConfig, Security};
    ///
    /// let config = ClientConfig::builder()
    ///     .with_security(Security::Plain)
    ///     .with_nodelay(true)
    ///     .build();
    /// ```
    pub const fn builder() -> ClientConfigBuilder<NeedsSecurity> {
        ClientConfigBuilder(NeedsSecurity(()))
    }

    pub(crate) fn connector(&self) -> Connector {
        self.tls.clone().map_or(Connector::Plain, Connector::Rustls)
    }
}

/// Typestate builder for [`ClientConfig`].
#[must_use]
pub struct ClientConfigBuilder<S>(S);

/// [`ClientConfigBuilder`] state which still needs a [`Security`] mode.
pub struct NeedsSecurity(());

/// [`ClientConfigBuilder`] state with every required option set.
pub struct Tuning {
    tls: Option<Arc<rustls::ClientConfig>>,
    socket: WebSocketConfig,
    nodelay: bool,
}

impl ClientConfigBuilder<NeedsSecurity> {
    /// Secures sockets according to `security`.
    ///
    /// Certificates are loaded here, not on every connection.
    pub fn with_security(self, security: Security) -> ClientConfigBuilder<Tuning> {
        ClientConfigBuilder(Tuning {
            tls: security.into_tls(),
            socket: WebSocketConfig::default(),
            nodelay: true,
        })
    }
}

impl ClientConfigBuilder<Tuning> {
    /// Replaces the WebSocket protocol configuration.
    ///
    /// Default: [`WebSocketConfig::default`]
    pub fn with_socket_config(mut self, socket: WebSocketConfig) -> Self {
        self.0.socket = socket;
        self
    }

    /// Sets `TCP_NODELAY` on the socket, disabling Nagle's algorithm.
    ///
    /// Default: `true`, since game-sync batches are small and latency
    /// sensitive.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.0.nodelay = nodelay;
        self
    }

    /// Finishes building.
    #[must_use]
    pub fn build(self) -> ClientConfig {
        let Tuning {
            tls,
            socket,
            nodelay,
        } = self.0;
        ClientConfig {
            tls,
            socket,
            nodelay,
        }
    }
}

impl From<ClientConfigBuilder<Tuning>> for ClientConfig {
    fn from(value: ClientConfigBuilder<Tuning>) -> Self {
        value.build()
    }
}

/// Makes `aws-lc-rs` the process-wide `rustls` crypto provider if none is
/// installed yet.
pub fn ensure_crypto_provider() {
    if CryptoProvider::get_default().is_some() {
        return;
    }
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_ok()
    {
        debug!("Using `aws-lc-rs` as the crypto provider");
    }
}

/// Loads the platform's root certificates, skipping any which fail to load or
/// parse.
#[must_use]
pub fn load_native_roots() -> RootCertStore {
    let loaded = rustls_native_certs::load_native_certs();
    for err in &loaded.errors {
        warn!("Skipping native certificate: {err}");
    }
    let mut roots = RootCertStore::empty();
    let (valid, invalid) = roots.add_parsable_certificates(loaded.certs);
    debug!(valid, invalid, "Loaded native root certificates");
    roots
}

/// Verifier which trusts every server, but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyCert(CryptoProvider);

impl AcceptAnyCert {
    fn new() -> Self {
        Self(rustls::crypto::aws_lc_rs::default_provider())
    }
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _leaf: &CertificateDer<'_>,
        _chain: &[CertificateDer<'_>],
        _name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        msg: &[u8],
        cert: &CertificateDer<'_>,
        signed: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        let algs = &self.0.signature_verification_algorithms;
        rustls::crypto::verify_tls12_signature(msg, cert, signed, algs)
    }

    fn verify_tls13_signature(
        &self,
        msg: &[u8],
        cert: &CertificateDer<'_>,
        signed: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        let algs = &self.0.signature_verification_algorithms;
        rustls::crypto::verify_tls13_signature(msg, cert, signed, algs)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
