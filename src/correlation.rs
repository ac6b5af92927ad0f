use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

/// Token that ties one outgoing request to its one response.
///
/// Generated from a random (v4) UUID, so collisions between concurrently
/// outstanding calls are negligible. The value travels as the AMQP
/// `correlation_id` message property and is opaque to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(Arc<str>);

impl CorrelationId {
    /// Generate a fresh correlation id.
    pub fn generate() -> Self {
        Self(Arc::from(Uuid::new_v4().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shared handle to the underlying string, as carried in an [`Envelope`](crate::Envelope).
    pub fn as_shared(&self) -> Arc<str> {
        Arc::clone(&self.0)
    }

    /// `true` if `other` (a correlation id read off a delivery) names this call.
    pub fn matches(&self, other: Option<&str>) -> bool {
        other == Some(self.as_str())
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl From<Arc<str>> for CorrelationId {
    fn from(value: Arc<str>) -> Self {
        Self(value)
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

    #[test]
    fn test_each_call_gets_a_fresh_token() {
        // ---
        let tokens: std::collections::HashSet<String> =
            (0..64).map(|_| CorrelationId::generate().to_string()).collect();
        assert_eq!(tokens.len(), 64);
    }

    #[test]
    fn test_token_is_a_v4_uuid() {
        // ---
        let id = CorrelationId::generate();
        let parsed = uuid::Uuid::parse_str(id.as_str()).expect("not a uuid");
        assert_eq!(parsed.get_version_num(), 4);
    }

    #[test]
    fn test_matches_only_same_token() {
        // ---
        let id = CorrelationId::from("abc");
        assert!(id.matches(Some("abc")));
        assert!(!id.matches(Some("abd")));
        assert!(!id.matches(None));
    }
}
