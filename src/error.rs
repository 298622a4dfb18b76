use std::sync::Arc;

/// Represents a result type for operations in this crate.
///
/// This `Result` type is a standard Rust `Result` type where the error variant is defined by the
/// crate-specific [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors returned by the synchronization side of the crate.
///
/// Evaluation never returns an error: failures there degrade to the `control` treatment.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// Fetching a change set failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// A writer panicked while holding the rule-set storage lock.
    #[error("rule-set storage lock is poisoned")]
    StoragePoisoned,

    /// Indicates that the sync thread panicked. This should normally never happen.
    #[error("sync thread panicked")]
    SyncThreadPanicked,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

/// Failure reported by a [`Fetch`](crate::Fetch) collaborator.
///
/// The sync helper and the proxy handler branch on the variant, so fetchers should map transport
/// failures to the most specific variant available.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum FetchError {
    /// HTTP 414. Usually caused by too many flag sets in the filter. Never retried.
    #[error("request URI is too long, reduce the number of configured flag sets")]
    UriTooLong,

    /// The intermediary proxy rejected the latest wire spec version.
    #[error("proxy does not support the requested spec version")]
    ProxyOutdated,

    /// HTTP 401 or 403.
    #[error("unauthorized, sdk_key is likely invalid")]
    Unauthorized,

    /// Any other non-2xx status.
    #[error("received non-2xx response: {status}")]
    Http {
        /// HTTP status code.
        status: u16,
    },

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// Response body is not a valid change set.
    #[error("failed to decode change set")]
    Decode(#[source] Arc<serde_json::Error>),
}

impl FetchError {
    /// HTTP-status-like code of the failure, if there's one.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::UriTooLong => Some(414),
            FetchError::ProxyOutdated => Some(400),
            FetchError::Unauthorized => Some(401),
            FetchError::Http { status } => Some(*status),
            FetchError::Network(err) => err.status().map(|status| status.as_u16()),
            FetchError::Decode(_) => None,
        }
    }

    /// Returns `false` for failures that will not go away by retrying the same request.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::UriTooLong | FetchError::Unauthorized)
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(value: reqwest::Error) -> Self {
        FetchError::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(value: serde_json::Error) -> Self {
        FetchError::Decode(Arc::new(value))
    }
}

/// Internal reason why a flag could not be evaluated normally.
///
/// These never cross the public evaluation boundary. They're turned into `control` results with
/// the matching label.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub(crate) enum EvaluationFailure {
    /// Definition was received but could not be compiled into an evaluable flag.
    #[error("malformed definition: {reason}")]
    MalformedDefinition {
        change_number: Option<i64>,
        reason: String,
    },
}
