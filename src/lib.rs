//! Client-side resource discovery, access checks and shared watch caches
//! for Kubernetes.
//!
//! The watch registry keeps at most one upstream subscription per resource
//! and namespace, rewrites cluster-wide watches into narrower views, and
//! multiplexes change events to any number of drain consumers.

pub mod access;
pub mod cache;
pub mod client;
pub mod discovery;
pub mod errors;
pub mod informer;
pub mod resource;
pub mod selector;
pub mod testing;

pub use access::{AccessReviewer, AccessStatus, ResourceAccess, DEFAULT_ACCESS_VERBS};
pub use cache::{
    CompositeWatch, Object, ResourceCatalog, ResourceLister, ResourceScope, ScopedWatch,
    WatchEntry, WatchRegistry, Watcher, WatcherBuilder, DEFAULT_RESYNC,
};
pub use client::{Client, ClientBuilder};
pub use discovery::ServerResources;
pub use errors::{Error, ListerFailure, Result, StreamError};
pub use resource::ResourceId;
pub use selector::Selector;
