//! [`Fetcher`] implementation using [`reqwest`].

use {
    crate::download::{AttemptOutcome, Fetcher, TransportErrorCode},
    core::ops::Deref,
    derive_more::{Display, Error},
    futures::{FutureExt, StreamExt, future::BoxFuture},
    reqwest::header::LAST_MODIFIED,
    std::{
        io,
        path::{Path, PathBuf},
        sync::{Mutex, MutexGuard, PoisonError},
    },
    tokio::io::AsyncWriteExt,
    tracing::{debug, trace},
};

/// Bounded pool of idle HTTP sessions shared by all download workers.
///
/// A worker takes a session out of the pool for the duration of an attempt,
/// or creates a new one if the pool is empty. When the attempt finishes, the
/// session goes back into the pool unless it is already full.
#[derive(Debug)]
pub struct SessionPool {
    idle: Mutex<Vec<reqwest::Client>>,
    capacity: usize,
    client_builder: fn() -> reqwest::ClientBuilder,
}

impl SessionPool {
    /// Creates an empty pool keeping at most `capacity` idle sessions.
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self::with_client_builder(capacity, reqwest::Client::builder)
    }

    /// Creates an empty pool which configures new sessions with
    /// `client_builder`.
    #[must_use]
    pub const fn with_client_builder(
        capacity: usize,
        client_builder: fn() -> reqwest::ClientBuilder,
    ) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            capacity,
            client_builder,
        }
    }

    /// Takes an idle session, or creates one.
    ///
    /// # Errors
    ///
    /// Errors if a new session could not be created.
    pub fn acquire(&self) -> Result<PooledSession<'_>, reqwest::Error> {
        let idle = self.lock().pop();
        let client = match idle {
            Some(client) => client,
            None => {
                trace!("Creating HTTP session");
                (self.client_builder)().build()?
            }
        };
        Ok(PooledSession { pool: self, client })
    }

    /// Number of idle sessions.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.lock().len()
    }

    fn release(&self, client: reqwest::Client) {
        let mut idle = self.lock();
        if idle.len() < self.capacity {
            idle.push(client);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<reqwest::Client>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Session taken out of a [`SessionPool`], returned to it on drop.
#[derive(Debug)]
pub struct PooledSession<'a> {
    pool: &'a SessionPool,
    client: reqwest::Client,
}

impl Deref for PooledSession<'_> {
    type Target = reqwest::Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

impl Drop for PooledSession<'_> {
    fn drop(&mut self) {
        self.pool.release(self.client.clone());
    }
}

#[derive(Debug, Display, Error)]
enum AttemptError {
    #[display("failed to create session")]
    Session(reqwest::Error),
    #[display("request failed")]
    Request(reqwest::Error),
    #[display("failed to write file")]
    Write(io::Error),
}

impl AttemptError {
    fn code(&self) -> TransportErrorCode {
        match self {
            Self::Session(_) => TransportErrorCode::FailedInit,
            Self::Request(err) => request_error_code(err),
            Self::Write(_) => TransportErrorCode::WriteError,
        }
    }
}

fn request_error_code(err: &reqwest::Error) -> TransportErrorCode {
    if err.is_builder() {
        TransportErrorCode::InvalidUrl
    } else if err.is_redirect() {
        TransportErrorCode::TooManyRedirects
    } else if err.is_timeout() {
        TransportErrorCode::Timeout
    } else if err.is_connect() {
        TransportErrorCode::ConnectionFailure
    } else if err.is_body() || err.is_decode() {
        TransportErrorCode::RecvError
    } else if err.is_request() {
        TransportErrorCode::SendError
    } else {
        TransportErrorCode::Unknown
    }
}

/// Downloads over HTTP(S), streaming response bodies to disk.
///
/// Only successful responses are written to the destination file.
#[derive(Debug)]
pub struct HttpFetcher {
    pool: SessionPool,
}

impl HttpFetcher {
    /// Creates a fetcher keeping at most `pool_size` idle sessions.
    #[must_use]
    pub const fn new(pool_size: usize) -> Self {
        Self {
            pool: SessionPool::new(pool_size),
        }
    }

    /// Creates a fetcher drawing sessions from `pool`.
    #[must_use]
    pub const fn with_pool(pool: SessionPool) -> Self {
        Self { pool }
    }

    /// Pool of sessions used by this fetcher.
    #[must_use]
    pub const fn pool(&self) -> &SessionPool {
        &self.pool
    }

    async fn attempt(&self, url: &str, dest: &Path) -> Result<AttemptOutcome, AttemptError> {
        let session = self.pool.acquire().map_err(AttemptError::Session)?;
        let response = session.get(url).send().await.map_err(AttemptError::Request)?;

        let status = response.status();
        let last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let outcome = AttemptOutcome {
            status: status.as_u16(),
            last_modified,
        };
        if !status.is_success() {
            return Ok(outcome);
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(AttemptError::Write)?;
        }
        // `dest` is only replaced once the whole body is on disk
        let part = part_path(dest);
        let written = match write_body(response, &part).await {
            Ok(len) => tokio::fs::rename(&part, dest)
                .await
                .map(|()| len)
                .map_err(AttemptError::Write),
            Err(err) => Err(err),
        };
        if written.is_err() {
            _ = tokio::fs::remove_file(&part).await;
        }
        let len = written?;

        trace!(len, "Wrote {}", dest.display());
        Ok(outcome)
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut part = dest.as_os_str().to_owned();
    part.push(".part");
    PathBuf::from(part)
}

async fn write_body(response: reqwest::Response, part: &Path) -> Result<usize, AttemptError> {
    let mut file = tokio::fs::File::create(part)
        .await
        .map_err(AttemptError::Write)?;
    let mut body = response.bytes_stream();
    let mut len = 0usize;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(AttemptError::Request)?;
        len += chunk.len();
        file.write_all(&chunk).await.map_err(AttemptError::Write)?;
    }
    file.flush().await.map_err(AttemptError::Write)?;
    Ok(len)
}

impl Fetcher for HttpFetcher {
    fn fetch<'a>(&'a self, url: &'a str, dest: &'a Path) -> BoxFuture<'a, AttemptOutcome> {
        async move {
            match self.attempt(url, dest).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    let code = err.code();
                    debug!("Attempt at {url} failed ({code:?}): {err}");
                    AttemptOutcome::transport(code)
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    #![expect(clippy::unwrap_used, reason = "testing")]

    use super::*;

    #[test]
    fn pool_keeps_at_most_capacity() {
        let pool = SessionPool::new(1);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(0, pool.idle());
        drop(a);
        drop(b);
        assert_eq!(1, pool.idle());

        let _c = pool.acquire().unwrap();
        assert_eq!(0, pool.idle());
    }
}
