//! Type-safe ID wrappers for tasks, links, steps and runs

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the underlying string
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self::new(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }
    };
}

string_id!(
    /// Identifier assigned by a backend, scoped to its source system
    NativeId
);

string_id!(
    /// Ledger identifier of a linked pair, stable for the pair's lifetime
    LinkId
);

string_id!(
    /// Deterministic identifier of one item inside a change set
    StepId
);

string_id!(
    /// Identifier of a previewed change set
    ChangeSetId
);

string_id!(
    /// Identifier of an apply run
    RunId
);

impl LinkId {
    /// Generate a fresh link id
    pub fn generate() -> Self {
        Self(format!("link-{}", uuid::Uuid::new_v4().simple()))
    }
}

impl ChangeSetId {
    /// Placeholder id carried by change sets straight out of the diff engine
    pub fn pending() -> Self {
        Self("pending".to_string())
    }

    pub fn generate() -> Self {
        Self(format!("cs-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn is_pending(&self) -> bool {
        self.0 == "pending"
    }
}

impl RunId {
    pub fn generate() -> Self {
        Self(format!("run-{}", uuid::Uuid::new_v4().simple()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_id_display() {
        let id = NativeId::new("8123456");
        assert_eq!(id.as_str(), "8123456");
        assert_eq!(format!("{}", id), "8123456");
        assert!(!id.is_empty());
        assert!(NativeId::new("  ").is_empty());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = LinkId::generate();
        let b = LinkId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("link-"));
        assert!(RunId::generate().as_str().starts_with("run-"));
    }

    #[test]
    fn test_pending_change_set_id() {
        assert!(ChangeSetId::pending().is_pending());
        assert!(!ChangeSetId::generate().is_pending());
    }

    #[test]
    fn test_serde_transparent() {
        let id = StepId::new("create:list_service:42");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"create:list_service:42\"");
    }
}
