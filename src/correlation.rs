use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

/// Unique token linking a request envelope to its reply.
///
/// Generated by the client for every call and echoed back unchanged by the
/// server. Opaque to the transport. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(Arc<str>);

impl CorrelationId {
    /// Generate a new unique correlation ID (UUID v4, hyphenated).
    pub fn generate() -> Self {
        Self(Arc::from(Uuid::new_v4().to_string()))
    }

    /// Borrow the correlation ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the id carries no characters. Never the case for generated ids.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Borrow<str> for CorrelationId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_unique() {
        // ---
        let ids: HashSet<CorrelationId> = (0..1000).map(|_| CorrelationId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_format() {
        // ---
        let id = CorrelationId::generate();
        assert_eq!(id.to_string().len(), 36); // hyphenated UUID
        assert!(!id.is_empty());
    }

    #[test]
    fn test_lookup_by_str() {
        // ---
        let id = CorrelationId::from("abc");
        let set: HashSet<CorrelationId> = [id].into_iter().collect();
        assert!(set.contains("abc"));
    }
}
