//! Directory of file requests, and the entry point of this crate.

use {
    crate::{
        config::FetchConfig,
        download::{Completion, Downloader, Fetcher, RetryPolicy},
        http::HttpFetcher,
        manifest::{Manifest, ManifestError, ManifestState},
        path::{RequestKey, make_path},
        request::{FileRequest, RequestCell},
        runtime::FetchRuntime,
    },
    core::{
        cell::{Cell, Ref, RefCell},
        fmt,
    },
    std::{
        collections::HashMap,
        fs, io,
        path::Path,
        rc::{self, Rc},
        sync::Arc,
        time::SystemTime,
    },
    tracing::{debug, error, trace, trace_span, warn},
};

/// State shared between the service and its requests.
#[derive(Debug)]
pub(crate) struct Context {
    pub config: FetchConfig,
    pub manifest: RefCell<ManifestState>,
    /// Files modified at or after this time are up to date. [`None`] if
    /// unknown, in which case every file is downloaded.
    pub freshness: Cell<Option<SystemTime>>,
    pub translation: RefCell<Option<String>>,
    pub downloader: Downloader,
    pub in_flight: RefCell<HashMap<u64, rc::Weak<RequestCell>>>,
    pub next_binding: Cell<u64>,
}

/// Hands out [`FileRequest`]s and applies the results of their downloads.
///
/// Requests and their listeners live on the thread which owns the service.
/// Downloads run on a [`FetchRuntime`], and their results are only applied
/// when [`FetchService::poll`] is called, which the owner should do once per
/// frame.
///
/// # Examples
///
/// ```no_run
/// use rpgsync_fetch::{FetchRuntime, FetchService, config::FetchConfig};
///
/// let mut fetch = FetchService::with_http(FetchConfig::default(), FetchRuntime::default());
/// let window = fetch.request_file("System", "Window.png");
/// let _binding = window.bind(|result| println!("window ready: {}", result.success));
/// window.start();
///
/// loop {
///     fetch.poll();
///     # break;
/// }
/// ```
pub struct FetchService {
    ctx: Rc<Context>,
    requests: HashMap<RequestKey, FileRequest>,
    recv_done: flume::Receiver<Completion>,
    observer: Option<Box<dyn FnMut(&str)>>,
}

impl fmt::Debug for FetchService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchService")
            .field("config", &self.ctx.config)
            .field("manifest_version", &self.ctx.manifest.borrow().version())
            .field("requests", &self.requests.len())
            .field("in_flight", &self.ctx.in_flight.borrow().len())
            .finish_non_exhaustive()
    }
}

impl FetchService {
    /// Creates a service downloading through `fetcher`.
    #[must_use]
    pub fn new(config: FetchConfig, fetcher: impl Fetcher, runtime: FetchRuntime) -> Self {
        let (send_done, recv_done) = flume::unbounded();
        let policy = RetryPolicy {
            max_attempts: config.max_attempts,
        };
        let ctx = Context {
            downloader: Downloader::new(Arc::new(fetcher), runtime, policy, send_done),
            config,
            manifest: RefCell::default(),
            freshness: Cell::new(None),
            translation: RefCell::default(),
            in_flight: RefCell::default(),
            next_binding: Cell::new(0),
        };
        Self {
            ctx: Rc::new(ctx),
            requests: HashMap::new(),
            recv_done,
            observer: None,
        }
    }

    /// Creates a service downloading through an [`HttpFetcher`].
    #[must_use]
    pub fn with_http(config: FetchConfig, runtime: FetchRuntime) -> Self {
        let fetcher = HttpFetcher::new(config.session_pool_size);
        Self::new(config, fetcher, runtime)
    }

    /// Configuration this service was created with.
    #[must_use]
    pub fn config(&self) -> &FetchConfig {
        &self.ctx.config
    }

    /// Currently installed manifest.
    #[must_use]
    pub fn manifest(&self) -> Ref<'_, ManifestState> {
        self.ctx.manifest.borrow()
    }

    /// Modification time at or after which cached files are up to date.
    #[must_use]
    pub fn freshness(&self) -> Option<SystemTime> {
        self.ctx.freshness.get()
    }

    /// Sets a callback which is told the path of every newly registered
    /// request.
    pub fn set_request_observer(&mut self, observer: impl FnMut(&str) + 'static) {
        self.observer = Some(Box::new(observer));
    }

    /// Gets the request for `file` in `directory`, registering it if it does
    /// not exist yet.
    ///
    /// Paths with the same [`RequestKey`] share one request.
    pub fn request_file(&mut self, directory: &str, file: &str) -> FileRequest {
        let path = make_path(directory, file);
        let key = RequestKey::new(&path);
        if let Some(request) = self.requests.get(&key) {
            return request.clone();
        }

        trace!("Registering request for {path}");
        if let Some(observer) = &mut self.observer {
            observer(&path);
        }
        let request = FileRequest::new(self.ctx.clone(), directory, file);
        self.requests.insert(key, request.clone());
        request
    }

    /// Gets the request for `file` in the game's root directory.
    pub fn request_root_file(&mut self, file: &str) -> FileRequest {
        self.request_file(".", file)
    }

    /// Gets an already registered request.
    #[must_use]
    pub fn get_request(&self, directory: &str, file: &str) -> Option<FileRequest> {
        self.requests
            .get(&RequestKey::new(&make_path(directory, file)))
            .cloned()
    }

    /// Number of registered requests.
    #[must_use]
    pub fn num_requests(&self) -> usize {
        self.requests.len()
    }

    /// Number of downloads whose results have not been applied yet.
    #[must_use]
    pub fn num_in_flight(&self) -> usize {
        self.ctx.in_flight.borrow().len()
    }

    /// Reads the index document at `index_path` under the cache root and
    /// installs it as the manifest.
    ///
    /// On failure, the current manifest is kept.
    ///
    /// # Errors
    ///
    /// Errors if the document cannot be read or parsed.
    pub fn create_request_mapping(&mut self, index_path: &str) -> Result<(), ManifestError> {
        let path = self.ctx.config.cache_root.join(index_path);
        let manifest = fs::read_to_string(&path)
            .map_err(ManifestError::from)
            .and_then(|document| Manifest::parse(&document))
            .inspect_err(|err| error!("Failed to load index {}: {err}", path.display()))?;
        self.install_manifest(manifest);
        Ok(())
    }

    /// Installs `manifest`.
    ///
    /// Creates the configured placeholder files listed in it, and starts an
    /// important request for every entry ending with the meta file suffix.
    pub fn install_manifest(&mut self, manifest: Manifest) {
        let span = trace_span!("install_manifest", version = manifest.version());
        let _span = span.enter();

        let config = &self.ctx.config;
        let placeholders = config
            .placeholder_files
            .iter()
            .filter(|file| manifest.contains(&file.to_lowercase()))
            .map(|file| config.cache_root.join(file))
            .collect::<Vec<_>>();
        let metas = manifest
            .iter()
            .filter(|(key, _)| key.ends_with(config.meta_suffix.as_str()))
            .map(|(key, _)| key.to_owned())
            .collect::<Vec<_>>();
        debug!(
            "Installing index with {} entries, {} meta files",
            manifest.len(),
            metas.len()
        );
        if manifest.is_empty() {
            warn!("Index has no entries, requesting paths verbatim");
        }
        *self.ctx.manifest.borrow_mut() = ManifestState::Loaded(manifest);

        for placeholder in placeholders {
            if let Err(err) = create_empty_file(&placeholder) {
                warn!("Failed to create {}: {err}", placeholder.display());
            }
        }
        for meta in metas {
            let request = self.request_root_file(&meta);
            request.set_important_file(true);
            request.start();
        }
    }

    /// Drops every registered request and forgets the freshness time.
    ///
    /// Downloads still running for dropped requests are abandoned, and their
    /// results discarded.
    pub fn clear_requests(&mut self) {
        let resolved = self.requests.values().filter(|r| r.is_ready()).count();
        debug!(
            "Clearing {} requests, {resolved} resolved",
            self.requests.len()
        );
        self.requests.clear();
        self.ctx.freshness.set(None);
    }

    /// Uninstalls the manifest, so that paths are requested verbatim.
    pub fn clear_request_mapping(&mut self) {
        *self.ctx.manifest.borrow_mut() = ManifestState::NotLoaded;
    }

    /// Checks if a registered request which matches the filters has not
    /// finished yet.
    ///
    /// `important` only considers important files, `graphic` only images.
    #[must_use]
    pub fn is_file_pending(&self, important: bool, graphic: bool) -> bool {
        self.requests.values().any(|request| {
            !request.is_ready()
                && (!important || request.is_important_file())
                && (!graphic || request.is_graphic_file())
        })
    }

    /// Checks if an important file has not finished yet.
    #[must_use]
    pub fn is_important_file_pending(&self) -> bool {
        self.is_file_pending(true, false)
    }

    /// Checks if an image has not finished yet.
    #[must_use]
    pub fn is_graphic_file_pending(&self) -> bool {
        self.is_file_pending(false, true)
    }

    /// Sets the root of the active translation, whose images override the
    /// game's own.
    pub fn set_translation(&mut self, root: Option<String>) {
        *self.ctx.translation.borrow_mut() = root;
    }

    /// Root of the active translation.
    #[must_use]
    pub fn translation(&self) -> Option<String> {
        self.ctx.translation.borrow().clone()
    }

    /// Applies the results of finished downloads, calling the listeners of
    /// their requests.
    ///
    /// Results for requests which were dropped in the meantime are
    /// discarded. Never blocks.
    ///
    /// Returns how many results were applied.
    pub fn poll(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(Completion { job, outcome }) = self.recv_done.try_recv() {
            let owner = self.ctx.in_flight.borrow_mut().remove(&job);
            let Some(request) = owner.as_ref().and_then(rc::Weak::upgrade).map(FileRequest) else {
                trace!(job, "Discarding result of dropped request");
                continue;
            };
            let Some(outcome) = outcome else {
                continue;
            };

            if let Some(last_modified) = outcome.last_modified {
                debug!("Files modified since {last_modified:?} are up to date");
                self.ctx.freshness.set(Some(last_modified));
            }
            trace!(job, attempts = outcome.attempts, "Applying result of {}", request.path());
            request.download_done(outcome.success);
            applied += 1;
        }
        applied
    }
}

fn create_empty_file(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::File::create(path).map(drop)
}
