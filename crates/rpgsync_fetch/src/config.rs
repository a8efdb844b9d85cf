//! Configuration for a [`FetchService`].
//!
//! [`FetchService`]: crate::service::FetchService

use std::path::PathBuf;

/// Default server root for files which belong to the current game.
pub const DEFAULT_DATA_URL: &str = "https://ynoproject.net/data/";

/// Default server root for files requested in parent scope.
pub const DEFAULT_PARENT_URL: &str = "https://ynoproject.net/";

/// Default game name.
pub const DEFAULT_GAME: &str = "2kki";

/// Default number of failed attempts after which a download gives up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 16;

/// Where assets come from.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum AssetSource {
    /// Assets already exist under the cache root, so every request succeeds
    /// as soon as it is started.
    Local,
    /// Assets are downloaded from a server.
    Remote {
        /// Server root for files of the current game.
        data_url: String,
        /// Server root for files requested in parent scope.
        parent_url: String,
        /// Game name, appended to either root.
        game: String,
    },
}

impl Default for AssetSource {
    fn default() -> Self {
        Self::remote(DEFAULT_GAME)
    }
}

impl AssetSource {
    /// Downloads the given game from the default server.
    #[must_use]
    pub fn remote(game: impl Into<String>) -> Self {
        Self::Remote {
            data_url: DEFAULT_DATA_URL.to_owned(),
            parent_url: DEFAULT_PARENT_URL.to_owned(),
            game: game.into(),
        }
    }
}

/// Configuration for a [`FetchService`].
///
/// # Examples
///
/// ```
/// use rpgsync_fetch::config::{AssetSource, FetchConfig};
///
/// let config = FetchConfig::default()
///     .with_source(AssetSource::remote("yume"))
///     .with_cache_root("/tmp/yume")
///     .with_max_attempts(4);
/// assert_eq!(4, config.max_attempts);
/// ```
///
/// [`FetchService`]: crate::service::FetchService
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct FetchConfig {
    /// Where assets come from.
    pub source: AssetSource,
    /// Local directory which downloaded files are written to.
    pub cache_root: PathBuf,
    /// Number of failed attempts after which a download gives up.
    ///
    /// A client error (4xx) always gives up after the first attempt.
    pub max_attempts: u32,
    /// Maximum number of idle HTTP sessions kept for reuse.
    pub session_pool_size: usize,
    /// Name of the database file whose `Last-Modified` header decides if
    /// already cached files are up to date.
    pub freshness_file: String,
    /// Name of the built-in placeholder asset, which is never downloaded.
    pub placeholder_asset: String,
    /// Files which are created empty if the manifest lists them.
    ///
    /// These are native plugins the server cannot provide, but whose
    /// presence the game checks for.
    pub placeholder_files: Vec<String>,
    /// Manifest entries ending with this suffix are fetched as soon as the
    /// manifest is installed.
    pub meta_suffix: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            source: AssetSource::default(),
            cache_root: PathBuf::from("."),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            session_pool_size: 8,
            freshness_file: "RPG_RT.ldb".to_owned(),
            placeholder_asset: "\u{1}".to_owned(),
            placeholder_files: ["harmony.dll", "ultimate_rt_eb.dll", "dynloader.dll", "accord.dll"]
                .map(str::to_owned)
                .to_vec(),
            meta_suffix: "meta.ini".to_owned(),
        }
    }
}

impl FetchConfig {
    /// Sets [`FetchConfig::source`].
    #[must_use]
    pub fn with_source(mut self, source: AssetSource) -> Self {
        self.source = source;
        self
    }

    /// Sets [`FetchConfig::cache_root`].
    #[must_use]
    pub fn with_cache_root(mut self, cache_root: impl Into<PathBuf>) -> Self {
        self.cache_root = cache_root.into();
        self
    }

    /// Sets [`FetchConfig::max_attempts`].
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets [`FetchConfig::session_pool_size`].
    #[must_use]
    pub const fn with_session_pool_size(mut self, session_pool_size: usize) -> Self {
        self.session_pool_size = session_pool_size;
        self
    }

    /// Sets [`FetchConfig::freshness_file`].
    #[must_use]
    pub fn with_freshness_file(mut self, freshness_file: impl Into<String>) -> Self {
        self.freshness_file = freshness_file.into();
        self
    }

    /// Sets [`FetchConfig::placeholder_files`].
    #[must_use]
    pub fn with_placeholder_files<S: Into<String>>(
        mut self,
        placeholder_files: impl IntoIterator<Item = S>,
    ) -> Self {
        self.placeholder_files = placeholder_files.into_iter().map(Into::into).collect();
        self
    }
}
