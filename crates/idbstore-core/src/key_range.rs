//! Key ranges used to bound scans, counts and deletions

use serde::{Deserialize, Serialize};

use crate::key::{encode_sortable_key, Key};

/// A possibly half-open interval over keys. A missing bound is unbounded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyRange {
    pub lower: Option<Key>,
    pub upper: Option<Key>,
    pub lower_open: bool,
    pub upper_open: bool,
}

impl KeyRange {
    /// The range covering every key.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// The range containing exactly `key`.
    pub fn only(key: Key) -> Self {
        Self {
            lower: Some(key.clone()),
            upper: Some(key),
            lower_open: false,
            upper_open: false,
        }
    }

    pub fn bound(lower: Key, upper: Key, lower_open: bool, upper_open: bool) -> Self {
        Self {
            lower: Some(lower),
            upper: Some(upper),
            lower_open,
            upper_open,
        }
    }

    pub fn lower_bound(lower: Key, open: bool) -> Self {
        Self {
            lower: Some(lower),
            lower_open: open,
            ..Self::default()
        }
    }

    pub fn upper_bound(upper: Key, open: bool) -> Self {
        Self {
            upper: Some(upper),
            upper_open: open,
            ..Self::default()
        }
    }

    /// Whether the range contains exactly one key.
    pub fn is_only(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Some(lower), Some(upper)) => {
                !self.lower_open && !self.upper_open && lower.encode() == upper.encode()
            }
            _ => false,
        }
    }

    pub fn contains(&self, key: &Key) -> bool {
        let encoded = encode_sortable_key(key);
        let above_lower = self.lower.as_ref().map_or(true, |lower| {
            let lower = encode_sortable_key(lower);
            if self.lower_open {
                encoded > lower
            } else {
                encoded >= lower
            }
        });
        let below_upper = self.upper.as_ref().map_or(true, |upper| {
            let upper = encode_sortable_key(upper);
            if self.upper_open {
                encoded < upper
            } else {
                encoded <= upper
            }
        });
        above_lower && below_upper
    }
}
