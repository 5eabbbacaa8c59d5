//! Contains the `Error` and `Result` types used throughout the engine.

use std::sync::Arc;

use derive_where::derive_where;
use thiserror::Error;

/// The result type for all fallible operator and cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur while building or driving a pipeline. The inner
/// [`ErrorKind`] is wrapped in an `Arc` so that a single upstream failure can
/// be observed by every downstream subscriber of the same change-set stream
/// without requiring `ErrorKind` itself to be cheaply cloneable.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    /// The kind of failure that occurred.
    pub kind: Arc<ErrorKind>,
    #[source]
    source: Option<Arc<Error>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind: Arc::new(kind), source: None }
    }

    pub(crate) fn with_source(kind: ErrorKind, source: Error) -> Self {
        Self { kind: Arc::new(kind), source: Some(Arc::new(source)) }
    }

    /// A key selector was invoked (via [`crate::source::CacheUpdater::add_or_update`] without an
    /// explicit key) but no key selector was configured for the cache.
    pub fn key_selector_missing() -> Self {
        Self::new(ErrorKind::KeySelector { message: "no key selector configured for add_or_update".into() })
    }

    pub(crate) fn key_selector_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::KeySelector { message: message.into() })
    }

    pub(crate) fn missing_key(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MissingKey { message: message.into() })
    }

    pub(crate) fn sort(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Sort { message: message.into() })
    }

    pub(crate) fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled)
    }

    /// Whether this error originated from a user-supplied closure (transform,
    /// predicate, comparator) rather than from the engine itself.
    pub fn is_user_error(&self) -> bool {
        matches!(&*self.kind, ErrorKind::User { .. })
    }
}

/// The closed set of error kinds surfaced to consumers, per the error-handling design.
#[derive(Debug, derive_more::Display)]
#[non_exhaustive]
pub enum ErrorKind {
    /// `add_or_update` was called without a key and no key selector was configured, or a
    /// key selector closure itself panicked/returned an error while classifying a value.
    #[display(fmt = "key selector error: {message}")]
    KeySelector { message: String },

    /// Grouping observed a value whose group the operator's internal bookkeeping disagreed
    /// about — an invariant violation in item-cache state.
    #[display(fmt = "inconsistent group membership: {message}")]
    MissingKey { message: String },

    /// A sort operator could not determine the position of an entry under its comparator.
    #[display(fmt = "sort position error: {message}")]
    Sort { message: String },

    /// A user-supplied transform, predicate, or comparator failed. Carried to an
    /// operator's error callback when one is installed; otherwise this tears down the
    /// pipeline.
    #[display(fmt = "user closure error: {message}")]
    User { message: String },

    /// The subscription (or the pipeline it was rooted in) was cancelled before completion.
    #[display(fmt = "subscription cancelled")]
    Cancelled,

    /// An internal invariant was violated. Indicates a bug in the engine rather than in
    /// caller-supplied code.
    #[display(fmt = "internal error: {message}")]
    Internal { message: String },
}

impl std::error::Error for ErrorKind {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

/// A typed failure surfaced to a per-operator error callback, carrying the value and key
/// the failing closure was invoked with so the caller can decide whether to skip, retry, or
/// escalate the entry.
#[derive_where(Debug)]
pub struct OperatorError<K, V> {
    /// The underlying cause.
    pub cause: Error,
    /// The value the closure was processing when it failed, if one is available.
    #[derive_where(skip)]
    pub value: Option<V>,
    /// The key associated with `value`.
    pub key: K,
}

impl<K, V> OperatorError<K, V> {
    pub(crate) fn new(cause: Error, key: K, value: Option<V>) -> Self {
        Self { cause, value, key }
    }
}
