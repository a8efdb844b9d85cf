//! Asynchronous requests for single asset files.

use {
    crate::{
        config::AssetSource,
        download::DownloadJob,
        path::{RequestKey, confine, encode_url_path, make_path, normalize},
        service::Context,
    },
    core::{cell::RefCell, fmt, mem},
    std::{
        fs,
        path::{Path, PathBuf},
        rc::{self, Rc},
        sync::Arc,
        time::SystemTime,
    },
    tracing::{debug, trace, warn},
};

/// Progress of a [`FileRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestState {
    /// [`FileRequest::start`] has not been called yet.
    #[default]
    WaitForStart,
    /// The file is being resolved or downloaded.
    Pending,
    /// The file is available locally.
    DoneSuccess,
    /// The file could not be made available.
    DoneFailure,
}

impl RequestState {
    /// Checks if this is a terminal state.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::DoneSuccess | Self::DoneFailure)
    }
}

/// Record passed to a listener bound with [`FileRequest::bind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRequestResult {
    /// Directory the file was requested in.
    pub directory: String,
    /// Requested file name.
    pub file: String,
    /// ID of the [`RequestBinding`] this listener was bound with.
    pub request_id: u64,
    /// Whether the file is available locally.
    pub success: bool,
}

/// Keeps a listener bound with [`FileRequest::bind`] alive.
///
/// Dropping this before the request finishes cancels the listener.
#[derive(Debug)]
#[must_use = "dropping the binding cancels the listener"]
pub struct RequestBinding(Rc<u64>);

impl RequestBinding {
    /// ID reported in [`FileRequestResult::request_id`].
    #[must_use]
    pub fn id(&self) -> u64 {
        *self.0
    }
}

struct Listener {
    binding: rc::Weak<u64>,
    callback: Box<dyn FnOnce(&FileRequestResult)>,
}

#[derive(Default)]
struct RequestInner {
    state: RequestState,
    important: bool,
    graphic: bool,
    parent_scope: bool,
    request_extension: String,
    local_path: Option<PathBuf>,
    listeners: Vec<Listener>,
}

pub(crate) struct RequestCell {
    ctx: Rc<Context>,
    directory: String,
    file: String,
    path: String,
    alive: Arc<()>,
    inner: RefCell<RequestInner>,
}

/// Shared handle to a request for one asset file.
///
/// Requests are created by [`FetchService::request_file`], which hands out
/// the same request for every path with the same [`RequestKey`]. Cloning the
/// handle is cheap.
///
/// A request does nothing until [`FileRequest::start`] is called. It then
/// moves to [`RequestState::Pending`] and eventually to exactly one terminal
/// state, which it never leaves.
///
/// [`FetchService::request_file`]: crate::service::FetchService::request_file
#[derive(Clone)]
pub struct FileRequest(pub(crate) Rc<RequestCell>);

impl fmt::Debug for FileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.inner.borrow();
        f.debug_struct("FileRequest")
            .field("path", &self.0.path)
            .field("state", &inner.state)
            .field("important", &inner.important)
            .field("graphic", &inner.graphic)
            .field("parent_scope", &inner.parent_scope)
            .field("listeners", &inner.listeners.len())
            .finish_non_exhaustive()
    }
}

struct Resolved {
    url_path: String,
    request_file: String,
}

impl FileRequest {
    pub(crate) fn new(ctx: Rc<Context>, directory: &str, file: &str) -> Self {
        Self(Rc::new(RequestCell {
            ctx,
            directory: directory.to_owned(),
            file: file.to_owned(),
            path: make_path(directory, file),
            alive: Arc::new(()),
            inner: RefCell::default(),
        }))
    }

    /// Directory the file was requested in.
    #[must_use]
    pub fn directory(&self) -> &str {
        &self.0.directory
    }

    /// Requested file name.
    #[must_use]
    pub fn file(&self) -> &str {
        &self.0.file
    }

    /// Logical path of the file, joined from its directory and name.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.0.path
    }

    /// Identity of this request.
    #[must_use]
    pub fn key(&self) -> RequestKey {
        RequestKey::new(&self.0.path)
    }

    /// Checks if both handles refer to the same request.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> RequestState {
        self.0.inner.borrow().state
    }

    /// Checks if the request reached a terminal state.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Checks if the file is available locally.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.state() == RequestState::DoneSuccess
    }

    /// Where the file is stored locally, once that is known.
    #[must_use]
    pub fn local_path(&self) -> Option<PathBuf> {
        self.0.inner.borrow().local_path.clone()
    }

    /// Marks whether the engine must wait for this file before continuing.
    pub fn set_important_file(&self, important: bool) {
        self.0.inner.borrow_mut().important = important;
    }

    /// Checks if the engine must wait for this file before continuing.
    #[must_use]
    pub fn is_important_file(&self) -> bool {
        self.0.inner.borrow().important
    }

    /// Marks whether this file is an image, which makes it subject to
    /// translation overrides.
    pub fn set_graphic_file(&self, graphic: bool) {
        self.0.inner.borrow_mut().graphic = graphic;
    }

    /// Checks if this file is an image.
    #[must_use]
    pub fn is_graphic_file(&self) -> bool {
        self.0.inner.borrow().graphic
    }

    /// Marks whether this file lives in the parent of the game directory on
    /// the server.
    pub fn set_parent_scope(&self, parent_scope: bool) {
        self.0.inner.borrow_mut().parent_scope = parent_scope;
    }

    /// Checks if this file lives in the parent of the game directory.
    #[must_use]
    pub fn is_parent_scope(&self) -> bool {
        self.0.inner.borrow().parent_scope
    }

    /// Sets a suffix appended to both the download URL and the local file.
    pub fn set_request_extension(&self, extension: impl Into<String>) {
        self.0.inner.borrow_mut().request_extension = extension.into();
    }

    /// Suffix appended to both the download URL and the local file.
    #[must_use]
    pub fn request_extension(&self) -> String {
        self.0.inner.borrow().request_extension.clone()
    }

    /// Registers a listener which is called once, when the request reaches a
    /// terminal state.
    ///
    /// Listeners are called in the order they were bound. If the request is
    /// already terminal, the listener is called on the next
    /// [`FileRequest::start`].
    pub fn bind(&self, callback: impl FnOnce(&FileRequestResult) + 'static) -> RequestBinding {
        let id = self.0.ctx.next_binding.get();
        self.0.ctx.next_binding.set(id.wrapping_add(1));

        let binding = RequestBinding(Rc::new(id));
        self.0.inner.borrow_mut().listeners.push(Listener {
            binding: Rc::downgrade(&binding.0),
            callback: Box::new(callback),
        });
        binding
    }

    /// Starts making the file available.
    ///
    /// Starting a pending request does nothing. Starting a terminal request
    /// delivers its outcome again to the listeners bound since.
    pub fn start(&self) {
        let cell = &*self.0;
        let ctx = &*cell.ctx;

        if cell.file == ctx.config.placeholder_asset {
            self.download_done(true);
            return;
        }
        match self.state() {
            RequestState::Pending => return,
            RequestState::DoneSuccess | RequestState::DoneFailure => {
                self.download_done(true);
                return;
            }
            RequestState::WaitForStart => {}
        }
        cell.inner.borrow_mut().state = RequestState::Pending;

        let (data_url, parent_url, game) = match &ctx.config.source {
            AssetSource::Local => {
                let local_path = confine(&cell.path, 1).map(|path| ctx.config.cache_root.join(path));
                let found = local_path.is_some();
                cell.inner.borrow_mut().local_path = local_path;
                self.download_done(found);
                return;
            }
            AssetSource::Remote {
                data_url,
                parent_url,
                game,
            } => (data_url, parent_url, game),
        };

        let (parent_scope, extension) = {
            let inner = cell.inner.borrow();
            (inner.parent_scope, inner.request_extension.clone())
        };
        let Some(resolved) = self.resolve() else {
            debug!("{} not in index", cell.path);
            self.download_done(false);
            return;
        };

        let base = if parent_scope { parent_url } else { data_url };
        let url = format!(
            "{base}{game}/{}",
            encode_url_path(&format!("{}{extension}", resolved.url_path))
        );
        let dest = ctx
            .config
            .cache_root
            .join(format!("{}{extension}", resolved.request_file));
        cell.inner.borrow_mut().local_path = Some(dest.clone());

        if is_fresh(&dest, ctx.freshness.get()) {
            trace!("{} is up to date", cell.path);
            self.download_done(true);
            return;
        }

        let job = DownloadJob {
            path: cell.path.clone(),
            url,
            dest,
            track_freshness: cell.file.eq_ignore_ascii_case(&ctx.config.freshness_file),
            owner: Arc::downgrade(&cell.alive),
        };
        debug!("Requesting {}", job.url);
        let id = ctx.downloader.spawn(job);
        ctx.in_flight.borrow_mut().insert(id, Rc::downgrade(&self.0));
    }

    fn resolve(&self) -> Option<Resolved> {
        let cell = &*self.0;
        let ctx = &*cell.ctx;
        let (parent_scope, graphic) = {
            let inner = cell.inner.borrow();
            (inner.parent_scope, inner.graphic)
        };

        let manifest = ctx.manifest.borrow();
        let Some(manifest) = manifest.manifest().filter(|manifest| !manifest.is_empty()) else {
            return Resolved::verbatim(&cell.path, parent_scope);
        };

        let mut key = manifest.lookup_key(&cell.directory, &cell.path);
        if graphic {
            if let Some(root) = ctx.translation.borrow().as_deref() {
                let translated = make_path(&normalize(root), &key);
                if manifest.contains(&translated) {
                    key = translated;
                }
            }
        }

        if let Some(file) = manifest.get(&key) {
            let Some(file) = confine(file, 0) else {
                warn!("Index entry for {key} points outside the cache: {file}");
                return None;
            };
            Some(Resolved {
                url_path: file.clone(),
                request_file: file,
            })
        } else if parent_scope {
            Resolved::verbatim(&cell.path, parent_scope)
        } else {
            None
        }
    }

    /// Moves the request into a terminal state and calls its listeners.
    ///
    /// If the request is already terminal, its original outcome is kept and
    /// reported instead of `success`.
    pub(crate) fn download_done(&self, success: bool) {
        let (success, listeners) = {
            let mut inner = self.0.inner.borrow_mut();
            let success = match inner.state {
                RequestState::DoneSuccess => true,
                RequestState::DoneFailure => false,
                RequestState::WaitForStart | RequestState::Pending => {
                    inner.state = if success {
                        RequestState::DoneSuccess
                    } else {
                        RequestState::DoneFailure
                    };
                    success
                }
            };
            (success, mem::take(&mut inner.listeners))
        };

        for listener in listeners {
            let Some(id) = listener.binding.upgrade() else {
                debug!("Request cancelled: {}", self.0.path);
                continue;
            };
            let result = FileRequestResult {
                directory: self.0.directory.clone(),
                file: self.0.file.clone(),
                request_id: *id,
                success,
            };
            (listener.callback)(&result);
        }
    }
}

impl Resolved {
    /// [`None`] if `path` does not name a file under the cache root, or one
    /// level above it for parent scope requests.
    fn verbatim(path: &str, parent_scope: bool) -> Option<Self> {
        let request_file = confine(path, usize::from(parent_scope))?;
        let mut url_path = path;
        if parent_scope {
            if let Some(pos) = url_path.find("../") {
                url_path = &url_path[pos + 3..];
            }
        }
        Some(Self {
            url_path: url_path.trim_start_matches("./").to_owned(),
            request_file,
        })
    }
}

fn is_fresh(dest: &Path, fresh_since: Option<SystemTime>) -> bool {
    let Some(fresh_since) = fresh_since else {
        return false;
    };
    fs::metadata(dest)
        .and_then(|metadata| metadata.modified())
        .is_ok_and(|modified| modified >= fresh_since)
}
