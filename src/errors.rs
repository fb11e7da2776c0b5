//! Error taxonomy and watch stream classification

use crate::cache::Object;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced to library callers.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Neither a client nor an informer factory was configured.
    #[error("missing kubernetes client, configure a client or an informer factory")]
    MissingClient,

    /// Underlying transport construction failed.
    #[error("failed to initialize transport: {0}")]
    TransportInit(#[source] kube::Error),

    /// A watch was requested outside the watcher's namespace constraint.
    #[error("unable to create watch, namespace {requested:?} does not match watcher namespace {configured:?}")]
    NamespaceMismatch {
        requested: String,
        configured: String,
    },

    /// Enumerating server resource types failed outright.
    #[error("resource discovery failed: {0}")]
    DiscoveryFailure(#[source] kube::Error),

    /// One or more per-call discovery failures, collected together.
    #[error("resource discovery failed: {}", .causes.join(", "))]
    ResourceDiscovery { causes: Vec<String> },

    /// No registry entry matched the requested resource and namespaces.
    #[error("no watch found for resource {resource} in namespaces {namespaces:?}")]
    WatchNotFound {
        resource: String,
        namespaces: Vec<String>,
    },

    /// Registry state under this key is unreadable.
    #[error("watch registry state for key {key} is corrupted")]
    Corrupted { key: String },

    /// An access review denied the requested verb.
    #[error("access denied for resource {resource}, verb {verb}")]
    AccessDenied { resource: String, verb: String },

    /// A composite list where some children failed; carries the union of
    /// the successful children alongside the failures.
    #[error("{}", .failures.iter().map(|f| f.cause.as_str()).collect::<Vec<_>>().join(","))]
    PartialList {
        partial: Vec<Object>,
        failures: Vec<ListerFailure>,
    },

    /// Get found no object under any of the searched namespaces.
    #[error("unable to find object {name} in any namespace of: {namespaces:?}")]
    ObjectNotFound {
        name: String,
        namespaces: Vec<String>,
    },

    /// Failure reported by an underlying lister backend.
    #[error("{0}")]
    Lister(String),

    /// Kubernetes API call failure.
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}

/// One failed child of a composite list.
#[derive(Debug, Clone)]
pub struct ListerFailure {
    pub key: String,
    pub namespace: String,
    pub cause: String,
}

/// Classified failure of an upstream watch stream.
///
/// Produced by the reflector loop and fed to the watch error handler,
/// which decides whether the entry keeps running.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The resource version is expired or gone (HTTP 410).
    #[error("watch expired: {0}")]
    Expired(String),
    /// The server rejected the watch (HTTP 403).
    #[error("watch forbidden: {0}")]
    Forbidden(String),
    /// The stream ended normally.
    #[error("watch stream reached EOF")]
    Eof,
    /// The stream was cut mid-message.
    #[error("watch stream closed unexpectedly: {0}")]
    UnexpectedEof(String),
    /// Anything else; the watch will retry on its own.
    #[error("transient watch error: {0}")]
    Transient(String),
}

impl StreamError {
    /// Classifies a watcher stream error by its rendered shape.
    ///
    /// The watcher error chain differs between transports, so this matches
    /// on the text the same way status reasons are matched upstream.
    pub fn classify(err: &kube::runtime::watcher::Error) -> StreamError {
        let text = err.to_string();
        let lower = text.to_ascii_lowercase();
        if lower.contains("410") || lower.contains("expired") || lower.contains("gone") {
            StreamError::Expired(text)
        } else if lower.contains("403") || lower.contains("forbidden") {
            StreamError::Forbidden(text)
        } else if lower.contains("unexpected eof") || lower.contains("incomplete message") {
            StreamError::UnexpectedEof(text)
        } else if lower.contains("eof") || lower.contains("connection closed") {
            StreamError::Eof
        } else {
            StreamError::Transient(text)
        }
    }
}
