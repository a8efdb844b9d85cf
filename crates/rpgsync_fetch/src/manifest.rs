//! Index manifest mapping logical asset paths to server file names.
//!
//! Two schema versions exist, selected by the top-level `metadata.version`
//! field (1 if missing):
//!
//! * v1: a flat object of `path -> url`.
//! * v2: a tree of objects rooted at the top-level `cache` field. Each object
//!   may name its directory with a `_dirname` string, and its other entries
//!   are either files (strings) or subdirectories (objects).
//!
//! ```json
//! {
//!     "metadata": { "version": 2 },
//!     "cache": {
//!         "system": {
//!             "_dirname": "System",
//!             "window.png": "abcd1234.png"
//!         }
//!     }
//! }
//! ```

use {
    crate::path::{make_canonical, make_path, normalize},
    derive_more::{Display, Error, From},
    serde_json::{Map, Value},
    std::{collections::HashMap, io},
    tracing::trace,
};

const DIRNAME_KEY: &str = "_dirname";

/// Whether a manifest has been installed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ManifestState {
    /// No manifest is available, so every path is requested verbatim.
    #[default]
    NotLoaded,
    /// Requests are resolved through the manifest. An empty manifest resolves
    /// every path verbatim.
    Loaded(Manifest),
}

impl ManifestState {
    /// Gets the manifest if one is loaded.
    #[must_use]
    pub const fn manifest(&self) -> Option<&Manifest> {
        match self {
            Self::NotLoaded => None,
            Self::Loaded(manifest) => Some(manifest),
        }
    }

    /// Schema version used when building lookup keys.
    ///
    /// Without a manifest, lookups behave like v1.
    #[must_use]
    pub const fn version(&self) -> u64 {
        match self {
            Self::NotLoaded => 1,
            Self::Loaded(manifest) => manifest.version,
        }
    }
}

/// Failed to load a manifest.
#[derive(Debug, Display, Error, From)]
#[non_exhaustive]
pub enum ManifestError {
    /// The index document could not be read.
    #[display("failed to read index")]
    #[from]
    Read(io::Error),
    /// The index document is not valid JSON.
    #[display("index is not a valid JSON document")]
    #[from]
    Parse(serde_json::Error),
    /// The index document is not a JSON object.
    #[display("index is not a JSON object")]
    NotAnObject,
}

/// Parsed index manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    version: u64,
    entries: HashMap<String, String>,
}

impl Manifest {
    /// Parses an index document.
    ///
    /// Entries whose value has the wrong type are skipped.
    ///
    /// # Errors
    ///
    /// Errors if `document` is not a JSON object.
    ///
    /// # Examples
    ///
    /// ```
    /// use rpgsync_fetch::manifest::Manifest;
    ///
    /// let manifest = Manifest::parse(r#"{ "title/title.png": "t1.png" }"#).unwrap();
    /// assert_eq!(1, manifest.version());
    /// assert_eq!(Some("t1.png"), manifest.get("title/title.png"));
    /// ```
    pub fn parse(document: &str) -> Result<Self, ManifestError> {
        let Value::Object(root) = serde_json::from_str::<Value>(document)? else {
            return Err(ManifestError::NotAnObject);
        };

        let version = root
            .get("metadata")
            .and_then(|metadata| metadata.get("version"))
            .and_then(Value::as_u64)
            .unwrap_or(1);

        let mut entries = HashMap::new();
        if version >= 2 {
            if let Some(Value::Object(cache)) = root.get("cache") {
                flatten(cache, "", &mut entries);
            }
        } else {
            entries.extend(
                root.iter()
                    .filter_map(|(key, value)| Some((key.clone(), value.as_str()?.to_owned()))),
            );
        }

        trace!(version, entries = entries.len(), "Parsed manifest");
        Ok(Self { version, entries })
    }

    /// Schema version of the document this was parsed from.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Builds the lookup key for a request of `path` in `directory`.
    ///
    /// v2 keys are case folded and canonical. v1 keys are lower case, and
    /// also canonical unless the file is in the root directory and listed
    /// as-is.
    #[must_use]
    pub fn lookup_key(&self, directory: &str, path: &str) -> String {
        if self.version >= 2 {
            return make_canonical(&normalize(path), 1);
        }

        let lower = path.to_lowercase();
        if directory != "." || !self.contains(&lower) {
            make_canonical(&lower, 1)
        } else {
            lower
        }
    }

    /// Gets the server file name for a lookup key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Checks if a lookup key is mapped.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of mapped entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Checks if nothing is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over all `(key, server file name)` entries in arbitrary
    /// order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }
}

fn flatten(node: &Map<String, Value>, parent: &str, entries: &mut HashMap<String, String>) {
    let dirname = match node.get(DIRNAME_KEY).and_then(Value::as_str) {
        Some(dirname) => make_path(parent, dirname),
        None => parent.to_owned(),
    };
    let key_dir = dirname.to_lowercase();

    for (key, value) in node {
        match value {
            Value::Object(child) => flatten(child, &dirname, entries),
            Value::String(_) if key == DIRNAME_KEY => {}
            Value::String(file) => {
                entries.insert(make_path(&key_dir, key), make_path(&dirname, file));
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    #![expect(clippy::unwrap_used, reason = "testing")]

    use super::*;

    #[test]
    fn v1_is_flat() {
        let manifest =
            Manifest::parse(r#"{ "system/window.png": "w.png", "bad": 5 }"#).unwrap();
        assert_eq!(1, manifest.version());
        assert_eq!(1, manifest.len());
        assert_eq!(Some("w.png"), manifest.get("system/window.png"));
    }

    #[test]
    fn v2_flattens_tree() {
        let manifest = Manifest::parse(
            r#"{
                "metadata": { "version": 2 },
                "cache": {
                    "rpg_rt.ldb": "RPG_RT.ldb",
                    "system": {
                        "_dirname": "System",
                        "window.png": "abcd1234.png",
                        "sub": {
                            "_dirname": "Deep",
                            "a.png": "a1.png"
                        }
                    }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(2, manifest.version());
        assert_eq!(3, manifest.len());
        assert_eq!(Some("RPG_RT.ldb"), manifest.get("rpg_rt.ldb"));
        assert_eq!(
            Some("System/abcd1234.png"),
            manifest.get("system/window.png")
        );
        assert_eq!(Some("System/Deep/a1.png"), manifest.get("system/deep/a.png"));
        assert!(!manifest.contains("system/_dirname"));
    }

    #[test]
    fn lookup_keys() {
        let v1 = Manifest::parse(r#"{ "./index.json": "index.json" }"#).unwrap();
        assert_eq!("./index.json", v1.lookup_key(".", "./index.json"));
        assert_eq!("rpg_rt.ldb", v1.lookup_key(".", "./RPG_RT.ldb"));
        assert_eq!("system/window.png", v1.lookup_key("System", "System/Window.png"));

        let v2 = Manifest::parse(r#"{ "metadata": { "version": 2 }, "cache": {} }"#).unwrap();
        assert_eq!("index.json", v2.lookup_key(".", "./index.json"));
        assert_eq!("../yume/a.png", v2.lookup_key("../yume", "../yume/A.png"));
    }

    #[test]
    fn v2_without_cache_is_empty() {
        let manifest = Manifest::parse(r#"{ "metadata": { "version": 2 } }"#).unwrap();
        assert!(manifest.is_empty());
    }

    #[test]
    fn malformed_document() {
        assert!(matches!(
            Manifest::parse("{ not json"),
            Err(ManifestError::Parse(_))
        ));
        assert!(matches!(
            Manifest::parse("[1, 2]"),
            Err(ManifestError::NotAnObject)
        ));
    }

    #[test]
    fn state_defaults_to_v1_lookups() {
        assert_eq!(1, ManifestState::NotLoaded.version());
        assert!(ManifestState::default().manifest().is_none());
    }
}
