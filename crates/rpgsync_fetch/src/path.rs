//! Logical asset paths and the keys derived from them.
//!
//! Logical paths always use `/` as the separator and are relative to the game
//! directory. They are compared case-insensitively.

use {
    core::fmt,
    std::path::{Component, Path},
    tracing::debug,
};

/// Joins `dir` and `file` with a `/`.
///
/// If either side is empty, the other is returned unchanged. Backslashes are
/// turned into forward slashes.
///
/// # Examples
///
/// ```
/// use rpgsync_fetch::path::make_path;
///
/// assert_eq!("System/Window.png", make_path("System", "Window.png"));
/// assert_eq!("Window.png", make_path("", "Window.png"));
/// assert_eq!("Picture/a/b.png", make_path("Picture\\a", "b.png"));
/// ```
#[must_use]
pub fn make_path(dir: &str, file: &str) -> String {
    let joined = if dir.is_empty() {
        file.to_owned()
    } else if file.is_empty() {
        dir.to_owned()
    } else if dir.ends_with('/') {
        format!("{dir}{file}")
    } else {
        format!("{dir}/{file}")
    };
    joined.replace('\\', "/")
}

/// Resolves `.` and `..` components of `path` and drops empty components.
///
/// Up to `initial_deepness` leading `..` components are kept, which allows
/// paths that point into the parent of the game directory. Any traversal
/// beyond that is dropped.
///
/// # Examples
///
/// ```
/// use rpgsync_fetch::path::make_canonical;
///
/// assert_eq!("system/window.png", make_canonical("./system//window.png", 1));
/// assert_eq!("b", make_canonical("a/../b", 0));
/// assert_eq!("../shared/a", make_canonical("../shared/a", 1));
/// ```
#[must_use]
pub fn make_canonical(path: &str, initial_deepness: usize) -> String {
    let mut up_budget = initial_deepness;
    let mut components = Vec::<&str>::new();
    let mut leading_up = 0usize;

    for component in path.split(['/', '\\']) {
        match component {
            "" | "." => {}
            ".." => {
                if components.len() > leading_up {
                    components.pop();
                } else if up_budget > 0 {
                    up_budget -= 1;
                    leading_up += 1;
                    components.push("..");
                } else {
                    debug!("Path traversal out of the game directory: {path}");
                }
            }
            _ => components.push(component),
        }
    }

    components.join("/")
}

/// Turns `path`, which may come from a remote document, into a path relative
/// to the cache root.
///
/// Leading separators are dropped and at most `initial_deepness` leading `..`
/// components survive, as in [`make_canonical`]. Returns [`None`] if nothing
/// is left, or if the result still names a drive or root.
///
/// # Examples
///
/// ```
/// use rpgsync_fetch::path::confine;
///
/// assert_eq!(Some("tmp/a.png".to_owned()), confine("/tmp/a.png", 0));
/// assert_eq!(Some("a.png".to_owned()), confine("../../a.png", 0));
/// assert_eq!(None, confine("/", 0));
/// ```
#[must_use]
pub fn confine(path: &str, initial_deepness: usize) -> Option<String> {
    let canonical = make_canonical(path, initial_deepness);
    let relative = Path::new(&canonical)
        .components()
        .all(|component| matches!(component, Component::Normal(_) | Component::ParentDir));
    (!canonical.is_empty() && relative).then_some(canonical)
}

/// Case folding used for manifest keys.
#[must_use]
pub fn normalize(path: &str) -> String {
    path.to_lowercase()
}

/// Percent-encodes the characters of a URL path which would otherwise be
/// taken as URL syntax.
///
/// Only `%`, `#`, `+` and space are encoded. Everything else, including `/`,
/// is kept.
///
/// # Examples
///
/// ```
/// use rpgsync_fetch::path::encode_url_path;
///
/// assert_eq!("Music/A%20B%2B%23%25.ogg", encode_url_path("Music/A B+#%.ogg"));
/// ```
#[must_use]
pub fn encode_url_path(path: &str) -> String {
    let mut encoded = String::with_capacity(path.len());
    for c in path.chars() {
        match c {
            '%' => encoded.push_str("%25"),
            '#' => encoded.push_str("%23"),
            '+' => encoded.push_str("%2B"),
            ' ' => encoded.push_str("%20"),
            _ => encoded.push(c),
        }
    }
    encoded
}

/// Identity of a file request.
///
/// Two requests for paths which only differ in case, separators, or `.`
/// components have the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(String);

impl RequestKey {
    /// Creates the key for a logical path.
    #[must_use]
    pub fn new(path: &str) -> Self {
        Self(normalize(&make_canonical(path, 1)))
    }

    /// Key as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
