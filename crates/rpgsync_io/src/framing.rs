//! Authentication header prepended to every outbound batch.
//!
//! # Layout
//!
//! ```text
//! [ digest prefix: 4 bytes ][ counter: u32 BE ][ batch bytes ... ]
//! ```
//!
//! The digest prefix is the first 4 bytes of
//! `SHA-1(psk || key BE || counter BE || batch)`. The server recomputes the
//! digest with the same pre-shared secret and the key it assigned to this
//! connection, and rejects batches whose counter does not strictly increase.
//!
//! All integers are encoded with [`u32::to_be_bytes`], so the header is
//! identical regardless of host byte order.

use {
    derive_more::{Display, Error},
    sha1::{Digest, Sha1},
    tracing::error,
};

/// Length in bytes of the header produced by [`compute_header`].
pub const HEADER_LEN: usize = 8;

/// Computes the authentication header for a single batch.
///
/// # Examples
///
/// ```
/// use rpgsync_io::framing::compute_header;
///
/// let a = compute_header(b"", 7, 3, b"abc");
/// let b = compute_header(b"", 7, 3, b"abc");
/// assert_eq!(a, b);
/// assert_eq!(&a[4..], &3u32.to_be_bytes());
/// ```
#[must_use]
pub fn compute_header(psk: &[u8], key: u32, counter: u32, msg: &[u8]) -> [u8; HEADER_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(psk);
    hasher.update(key.to_be_bytes());
    hasher.update(counter.to_be_bytes());
    hasher.update(msg);
    let digest = hasher.finalize();

    let mut header = [0; HEADER_LEN];
    header[..4].copy_from_slice(&digest[..4]);
    header[4..].copy_from_slice(&counter.to_be_bytes());
    header
}

/// Attempted to send more batches than the nonce space allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
#[display("send counter exhausted")]
pub struct CounterExhausted;

/// Strictly increasing per-connection batch counter.
///
/// The first batch sent on a connection carries the value `1`. The counter
/// never wraps: once [`u32::MAX`] has been handed out, [`SendCounter::next`]
/// fails for the rest of the connection's lifetime.
#[derive(Debug, Clone, Default)]
pub struct SendCounter {
    last: u32,
    exhausted: bool,
}

impl SendCounter {
    /// Creates a counter which has not handed out any values yet.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            last: 0,
            exhausted: false,
        }
    }

    /// Last value handed out, or `0` if none was.
    #[must_use]
    pub const fn last(&self) -> u32 {
        self.last
    }

    /// Advances the counter by one and returns the new value.
    ///
    /// # Errors
    ///
    /// Errors if the counter has reached [`u32::MAX`].
    pub fn next(&mut self) -> Result<u32, CounterExhausted> {
        if self.exhausted {
            return Err(CounterExhausted);
        }
        match self.last.checked_add(1) {
            Some(next) => {
                self.last = next;
                Ok(next)
            }
            None => {
                error!("Send counter exhausted, refusing to reuse a nonce");
                self.exhausted = true;
                Err(CounterExhausted)
            }
        }
    }
}

/// Produces authenticated frames for one connection.
#[derive(Debug, Clone)]
pub struct Framer {
    psk: Vec<u8>,
    key: u32,
    counter: SendCounter,
}

impl Framer {
    /// Creates a framer for a fresh connection.
    #[must_use]
    pub fn new(psk: impl Into<Vec<u8>>, key: u32) -> Self {
        Self {
            psk: psk.into(),
            key,
            counter: SendCounter::new(),
        }
    }

    /// Sets the per-connection key assigned by the session owner.
    pub fn set_key(&mut self, key: u32) {
        self.key = key;
    }

    /// Per-connection key.
    #[must_use]
    pub const fn key(&self) -> u32 {
        self.key
    }

    /// Counter value of the last frame produced.
    #[must_use]
    pub const fn counter(&self) -> u32 {
        self.counter.last()
    }

    /// Restarts the counter for a new connection.
    pub fn reset(&mut self) {
        self.counter = SendCounter::new();
    }

    /// Builds the next frame, optionally prefixed with the header.
    ///
    /// The counter advances for each frame even when `with_header` is
    /// `false`, so toggling header mode mid-connection cannot reuse a nonce.
    ///
    /// # Errors
    ///
    /// Errors if the counter is exhausted.
    pub fn frame(&mut self, msg: &[u8], with_header: bool) -> Result<Vec<u8>, CounterExhausted> {
        let counter = self.counter.next()?;
        if !with_header {
            return Ok(msg.to_vec());
        }

        let header = compute_header(&self.psk, self.key, counter, msg);
        let mut frame = Vec::with_capacity(HEADER_LEN + msg.len());
        frame.extend_from_slice(&header);
        frame.extend_from_slice(msg);
        Ok(frame)
    }
}
