//! Retrying downloads of single files.
//!
//! A download is a series of attempts made by a [`Fetcher`]. After each
//! attempt, [`RetryPolicy::judge`] decides whether the download succeeded,
//! should be attempted again, or gave up.

use {
    crate::runtime::FetchRuntime,
    chrono::DateTime,
    core::{cell::Cell, fmt},
    derive_more::Display,
    futures::future::BoxFuture,
    std::{
        path::{Path, PathBuf},
        sync::{Arc, Weak},
        time::SystemTime,
    },
    tracing::{Instrument, debug, debug_span, trace, warn},
};

/// Statuses at or above this value encode a [`TransportErrorCode`] instead of
/// an HTTP status.
pub const TRANSPORT_ERROR_BASE: u16 = 1000;

/// Why an attempt failed before a response status was received.
///
/// The codes follow the numbering of `libcurl`. An attempt failing this way
/// reports a status of [`TRANSPORT_ERROR_BASE`] plus the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
#[non_exhaustive]
pub enum TransportErrorCode {
    /// The URL scheme is not supported.
    UnsupportedProtocol = 1,
    /// The HTTP session could not be set up.
    FailedInit = 2,
    /// The URL is malformed.
    InvalidUrl = 3,
    /// The host name could not be resolved.
    HostResolution = 6,
    /// Failed to connect to the host.
    ConnectionFailure = 7,
    /// Failed to write the response body to the destination file.
    WriteError = 23,
    /// The attempt took too long.
    Timeout = 28,
    /// The TLS handshake failed.
    SslConnect = 35,
    /// The server redirected too many times.
    TooManyRedirects = 47,
    /// The server closed the connection without a response.
    EmptyResponse = 52,
    /// Failed to send the request.
    SendError = 55,
    /// Failed to receive the response.
    RecvError = 56,
    /// Any other failure.
    Unknown = 1000,
}

impl TransportErrorCode {
    /// Status reported by an attempt which failed with this code.
    #[must_use]
    pub const fn status(self) -> u16 {
        TRANSPORT_ERROR_BASE + self as u16
    }
}

/// Result of a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    /// HTTP status of the response, or [`TransportErrorCode::status`] if no
    /// response was received.
    pub status: u16,
    /// Raw `Last-Modified` header of the response.
    pub last_modified: Option<String>,
}

impl AttemptOutcome {
    /// Outcome of an attempt which got a response.
    #[must_use]
    pub const fn status(status: u16) -> Self {
        Self {
            status,
            last_modified: None,
        }
    }

    /// Outcome of an attempt which failed before getting a response.
    #[must_use]
    pub const fn transport(code: TransportErrorCode) -> Self {
        Self::status(code.status())
    }
}

/// Makes single attempts at downloading a URL into a file.
///
/// Attempts may run concurrently on any runtime worker.
pub trait Fetcher: Send + Sync + 'static {
    /// Downloads `url` into `dest`, creating parent directories as needed.
    ///
    /// This must not fail: every failure is reported through
    /// [`AttemptOutcome::status`].
    fn fetch<'a>(&'a self, url: &'a str, dest: &'a Path) -> BoxFuture<'a, AttemptOutcome>;
}

/// Why a download gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum GiveUpReason {
    /// The attempt ceiling was reached.
    #[display("max retries exceeded")]
    MaxAttempts,
    /// The server reported a client error, which retrying will not fix.
    #[display("file not available ({status})")]
    NotAvailable {
        /// Status of the last attempt.
        status: u16,
    },
}

/// Decision taken after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The file was downloaded.
    Success,
    /// Attempt the download again.
    Retry,
    /// Stop and report the download as failed.
    GiveUp(GiveUpReason),
}

/// Decides what happens after each attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed attempts after which a download gives up.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::config::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Judges an attempt which finished with `status`, after `failures`
    /// earlier attempts failed.
    ///
    /// # Examples
    ///
    /// ```
    /// use rpgsync_fetch::download::{GiveUpReason, RetryPolicy, Verdict};
    ///
    /// let policy = RetryPolicy { max_attempts: 16 };
    /// assert_eq!(Verdict::Success, policy.judge(3, 200));
    /// assert_eq!(Verdict::Retry, policy.judge(0, 503));
    /// assert_eq!(
    ///     Verdict::GiveUp(GiveUpReason::NotAvailable { status: 404 }),
    ///     policy.judge(0, 404)
    /// );
    /// assert_eq!(
    ///     Verdict::GiveUp(GiveUpReason::MaxAttempts),
    ///     policy.judge(15, 503)
    /// );
    /// ```
    #[must_use]
    pub const fn judge(&self, failures: u32, status: u16) -> Verdict {
        if status >= 200 && status < 300 {
            Verdict::Success
        } else if status >= 400 && status < 500 {
            Verdict::GiveUp(GiveUpReason::NotAvailable { status })
        } else if failures.saturating_add(1) >= self.max_attempts {
            Verdict::GiveUp(GiveUpReason::MaxAttempts)
        } else {
            Verdict::Retry
        }
    }
}

/// Everything a worker needs to download one file.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    /// Logical path of the file, used in logs.
    pub path: String,
    /// Encoded URL to download.
    pub url: String,
    /// File to write the body to.
    pub dest: PathBuf,
    /// Whether the `Last-Modified` header of a successful attempt should be
    /// reported.
    pub track_freshness: bool,
    /// Alive for as long as someone still wants the result.
    pub owner: Weak<()>,
}

/// Result of a whole download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Whether the file was downloaded.
    pub success: bool,
    /// Number of attempts made.
    pub attempts: u32,
    /// Parsed `Last-Modified` header, if it was tracked and valid.
    pub last_modified: Option<SystemTime>,
}

/// Runs attempts for `job` until `policy` stops them.
///
/// Before every attempt, checks that the job's owner is still alive, and
/// returns [`None`] without another attempt if it is not.
pub async fn download(
    fetcher: &dyn Fetcher,
    policy: RetryPolicy,
    job: &DownloadJob,
) -> Option<DownloadOutcome> {
    let mut failures = 0u32;
    loop {
        if job.owner.strong_count() == 0 {
            debug!("Request cancelled: {}", job.path);
            return None;
        }

        let attempt = fetcher.fetch(&job.url, &job.dest).await;
        trace!(status = attempt.status, failures, "Attempt finished");
        match policy.judge(failures, attempt.status) {
            Verdict::Success => {
                let last_modified = if job.track_freshness {
                    attempt.last_modified.as_deref().and_then(parse_last_modified)
                } else {
                    None
                };
                return Some(DownloadOutcome {
                    success: true,
                    attempts: failures + 1,
                    last_modified,
                });
            }
            Verdict::Retry => {
                failures += 1;
                debug!("Download of {} failed with {}, retrying", job.path, attempt.status);
            }
            Verdict::GiveUp(reason) => {
                warn!("Download failed: {reason}: {}", job.path);
                return Some(DownloadOutcome {
                    success: false,
                    attempts: failures + 1,
                    last_modified: None,
                });
            }
        }
    }
}

/// Parses an RFC 1123 `Last-Modified` header value.
///
/// # Examples
///
/// ```
/// use {rpgsync_fetch::download::parse_last_modified, std::time::{Duration, UNIX_EPOCH}};
///
/// assert_eq!(
///     Some(UNIX_EPOCH + Duration::from_secs(784_111_777)),
///     parse_last_modified("Sun, 06 Nov 1994 08:49:37 GMT")
/// );
/// assert_eq!(None, parse_last_modified("yesterday"));
/// ```
#[must_use]
pub fn parse_last_modified(value: &str) -> Option<SystemTime> {
    match DateTime::parse_from_rfc2822(value) {
        Ok(time) => Some(SystemTime::from(time)),
        Err(err) => {
            debug!("Failed to parse Last-Modified {value:?}: {err}");
            None
        }
    }
}

/// Finished download, sent back to the thread which owns the requests.
#[derive(Debug)]
pub(crate) struct Completion {
    pub job: u64,
    pub outcome: Option<DownloadOutcome>,
}

/// Spawns downloads on a runtime and reports their completions on a channel.
pub(crate) struct Downloader {
    fetcher: Arc<dyn Fetcher>,
    runtime: FetchRuntime,
    policy: RetryPolicy,
    send_done: flume::Sender<Completion>,
    next_job: Cell<u64>,
}

impl fmt::Debug for Downloader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Downloader")
            .field("runtime", &self.runtime)
            .field("policy", &self.policy)
            .field("next_job", &self.next_job)
            .finish_non_exhaustive()
    }
}

impl Downloader {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        runtime: FetchRuntime,
        policy: RetryPolicy,
        send_done: flume::Sender<Completion>,
    ) -> Self {
        Self {
            fetcher,
            runtime,
            policy,
            send_done,
            next_job: Cell::new(0),
        }
    }

    /// Spawns `job` and returns the ID its [`Completion`] will carry.
    pub fn spawn(&self, job: DownloadJob) -> u64 {
        let id = self.next_job.get();
        self.next_job.set(id.wrapping_add(1));

        let fetcher = self.fetcher.clone();
        let policy = self.policy;
        let send_done = self.send_done.clone();
        let span = debug_span!("download", job = id, path = %job.path);
        self.runtime.spawn(
            async move {
                let outcome = download(&*fetcher, policy, &job).await;
                // the service may be gone
                _ = send_done.send(Completion { job: id, outcome });
            }
            .instrument(span),
        );
        id
    }
}
