//! Errors shared by the backend, atoms and namespaces

/// Errors that can occur in store operations
///
/// `Clone` because a single load failure is observed by every waiter of
/// the atom that issued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend call failed or timed out
    StorageUnavailable(String),
    /// Value could not be encoded or decoded
    SerializationFailure(String),
    /// Namespaced accessor requested before its runtime identifier was known
    NamespaceMissingIdentifier {
        /// Prefix of the namespace that could not be bound
        prefix: String,
    },
    /// Key part is empty or contains the key delimiter
    InvalidKey(String),
}

impl StoreError {
    /// Shorthand for a `StorageUnavailable` with the given reason
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::StorageUnavailable(reason.into())
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StorageUnavailable(reason) => write!(f, "Storage unavailable: {reason}"),
            Self::SerializationFailure(reason) => write!(f, "Serialization failure: {reason}"),
            Self::NamespaceMissingIdentifier { prefix } => {
                write!(f, "Namespace '{prefix}' used before its identifier was resolved")
            }
            Self::InvalidKey(part) => write!(f, "Invalid key part: '{part}'"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationFailure(err.to_string())
    }
}
