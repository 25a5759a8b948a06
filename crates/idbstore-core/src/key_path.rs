//! Key paths and their stored string form

use serde::{Deserialize, Serialize};

/// Joins the components of an array key path when stored.
pub const KEY_PATH_SEPARATOR: char = ' ';

/// Where a record's key lives inside its value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyPath {
    /// Out-of-line keys.
    #[default]
    None,
    String(String),
    Array(Vec<String>),
}

impl KeyPath {
    pub fn is_none(&self) -> bool {
        matches!(self, KeyPath::None)
    }

    /// Stored form: empty for `None`, the path itself for `String`, components
    /// joined by [`KEY_PATH_SEPARATOR`] for `Array`.
    ///
    /// Single paths cannot contain the separator, so the join is unambiguous.
    /// An empty `String` path stores the same as `None`.
    pub fn encode(&self) -> String {
        match self {
            KeyPath::None => String::new(),
            KeyPath::String(path) => path.clone(),
            KeyPath::Array(paths) => {
                let mut joined = String::new();
                for (i, path) in paths.iter().enumerate() {
                    if i > 0 {
                        joined.push(KEY_PATH_SEPARATOR);
                    }
                    joined.push_str(path);
                }
                joined
            }
        }
    }

    pub fn decode(stored: &str) -> Self {
        if stored.is_empty() {
            KeyPath::None
        } else if stored.contains(KEY_PATH_SEPARATOR) {
            KeyPath::Array(
                stored
                    .split(KEY_PATH_SEPARATOR)
                    .map(str::to_string)
                    .collect(),
            )
        } else {
            KeyPath::String(stored.to_string())
        }
    }
}

impl From<&str> for KeyPath {
    fn from(path: &str) -> Self {
        KeyPath::String(path.to_string())
    }
}
