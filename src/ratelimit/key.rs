//! Bucket key generation and handling.

/// A key that uniquely identifies one rate-limited scope.
///
/// The key is namespaced by the profile name so that the same client
/// address limited by two profiles maps to two unrelated counters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// The profile this bucket belongs to
    pub profile: String,
    /// The request-derived scope, e.g. a client address
    pub scope: String,
}

impl BucketKey {
    /// Create a new bucket key.
    pub fn new(profile: &str, scope: impl Into<String>) -> Self {
        Self {
            profile: profile.to_string(),
            scope: scope.into(),
        }
    }

    /// Convert the bucket key to the string used by the counter stores.
    pub fn to_store_key(&self) -> String {
        format!("{}:{}", self.profile, self.scope)
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.profile, self.scope)
    }
}
