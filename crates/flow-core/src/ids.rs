use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A globally-unique identifier for a job, step, or run.
///
/// Generated from a UUIDv7 so ids sort roughly in creation order, which keeps
/// directory listings (queue dirs, artifact dirs) useful for a human skimming
/// them without needing to consult timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// A job id is used directly as a path component. Reject anything that
    /// could escape the intended directory.
    pub fn is_safe_path_component(&self) -> bool {
        !self.0.is_empty()
            && !self.0.contains('/')
            && !self.0.contains('\\')
            && self.0 != "."
            && self.0 != ".."
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_ids_are_unique() {
        assert_ne!(Id::new(), Id::new());
    }

    #[test]
    fn rejects_path_traversal() {
        assert!(!Id::from_string("../escape").is_safe_path_component());
        assert!(!Id::from_string("a/b").is_safe_path_component());
        assert!(!Id::from_string("a\\b").is_safe_path_component());
        assert!(!Id::from_string("..").is_safe_path_component());
        assert!(!Id::from_string("").is_safe_path_component());
        assert!(Id::from_string("0198abc-def0").is_safe_path_component());
    }
}
