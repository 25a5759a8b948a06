//! UTF-16 names for databases, object stores and indexes

use std::fmt;

use serde::{Deserialize, Serialize};

/// A name as a sequence of UTF-16 code units.
///
/// Names are not required to be valid UTF-16, so they are kept as code units
/// and stored as their little-endian bytes.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdbName(Vec<u16>);

impl IdbName {
    pub fn from_code_units(units: Vec<u16>) -> Self {
        Self(units)
    }

    pub fn code_units(&self) -> &[u16] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(|unit| unit.to_le_bytes()).collect()
    }

    /// Returns `None` for an odd number of bytes.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 2 != 0 {
            return None;
        }
        Some(Self(
            bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect(),
        ))
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf16_lossy(&self.0)
    }
}

impl From<&str> for IdbName {
    fn from(name: &str) -> Self {
        Self(name.encode_utf16().collect())
    }
}

impl From<String> for IdbName {
    fn from(name: String) -> Self {
        Self::from(name.as_str())
    }
}

impl fmt::Debug for IdbName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdbName({:?})", self.to_string_lossy())
    }
}

impl fmt::Display for IdbName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}
