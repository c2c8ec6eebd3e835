use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity recorded as the holder of the migration lock.
///
/// Used purely as an attribution label, never for authorization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    /// Generate an identity unique to this process.
    pub fn new() -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("pid-{}-{}", std::process::id(), &suffix[..8]))
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ServiceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceId {
    fn from(s: &str) -> Self {
        Self::from_string(s)
    }
}
