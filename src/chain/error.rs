//! Error types for sigchain import, verification and caching.

use thiserror::Error;

/// Errors raised while decoding or verifying chain links.
///
/// Every variant is fatal for the record or chain it was raised on. Nothing in
/// this crate retries after one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainLinkError {
    #[error("Malformed chain link: {0}")]
    Malformed(String),

    #[error("Bad signature version: {0}")]
    BadVersion(String),

    #[error("KID mismatch: {0}")]
    KidMismatch(String),

    #[error("Stubbed link is unsupported: {0}")]
    StubbedUnsupported(String),

    #[error("Mismatched outer link field: {0}")]
    MismatchedField(String),

    #[error("Prev hash mismatch: {0}")]
    PrevHashMismatch(String),

    #[error("Wrong seqno: {0}")]
    WrongSeqno(String),

    #[error("High skip seqno mismatch: {0}")]
    HighSkipSeqnoMismatch(String),

    #[error("High skip hash mismatch: {0}")]
    HighSkipHashMismatch(String),

    #[error("UID mismatch: {0}")]
    UidMismatch(String),

    #[error("Username mismatch: {0}")]
    UsernameMismatch(String),

    #[error("Server chain error: {0}")]
    ServerChain(String),
}

impl ChainLinkError {
    /// Decode failures and unsupported input. The record itself is bad.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            ChainLinkError::Malformed(_)
                | ChainLinkError::BadVersion(_)
                | ChainLinkError::StubbedUnsupported(_)
        )
    }

    /// Disagreements between fields or links. The chain must not be trusted.
    pub fn is_structural(&self) -> bool {
        !self.is_malformed()
    }
}

/// Errors surfaced by the API collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("API transport failed: {0}")]
    Transport(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("User has been deleted")]
    UserDeleted,

    #[error("API returned status {code}: {desc}")]
    Status { code: i64, desc: String },

    #[error("Failed to decode API response: {0}")]
    Decode(String),
}

/// Errors related to the secondary state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store integrity check failed")]
    IntegrityFailed,

    #[error("Failed to serialize key state: {0}")]
    Serialization(String),

    #[error("Redis operation failed: {0}")]
    RedisError(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::RedisError(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Errors returned from a key state load.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainLinkError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl LoadError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, LoadError::Api(ApiError::NotFound(_)))
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, LoadError::Api(ApiError::UserDeleted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ChainLinkError::Malformed("x".into()).is_malformed());
        assert!(ChainLinkError::BadVersion("x".into()).is_malformed());
        assert!(ChainLinkError::PrevHashMismatch("x".into()).is_structural());
        assert!(ChainLinkError::MismatchedField("x".into()).is_structural());
        assert!(!ChainLinkError::KidMismatch("x".into()).is_malformed());
    }

    #[test]
    fn test_load_error_not_found_and_deleted() {
        let e: LoadError = ApiError::NotFound("uid".into()).into();
        assert!(e.is_not_found());
        assert!(!e.is_deleted());

        let e: LoadError = ApiError::UserDeleted.into();
        assert!(e.is_deleted());
    }
}
