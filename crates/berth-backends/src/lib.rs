//! Local adapters for the berth controller.
//!
//! These implement the `berth-core` backend traits against the local
//! machine: child processes for builds and services, a directory for the
//! registry, and real probes for health checks.

pub mod build;
pub mod credentials;
pub mod error;
pub mod probe;
pub mod registry;
pub mod runtime;

pub use build::CommandBuildBackend;
pub use credentials::StaticCredentials;
pub use error::{BackendError, Result};
pub use probe::CompositeHealthProber;
pub use registry::{FsRegistry, Reference};
pub use runtime::ProcessRuntime;
