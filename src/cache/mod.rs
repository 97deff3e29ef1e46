//! Shared caches: host failure suppression, project request/response
//! store, and the single-flight memoization table

pub mod host_errors;
pub mod memo;
pub mod project;

pub use host_errors::HostErrorsCache;
pub use memo::Memoizer;
pub use project::ProjectFile;
