//! An embeddable, OSGi-style dynamic module host: versioned manifests,
//! dependency resolution, a dynamic-library-backed module lifecycle with
//! hot reload, and an IPC reliability stack (retry, circuit breaker,
//! health checking, connection pooling) for talking to remote endpoints.
//!
//! The host façade ([`host::Host`]) is the usual entry point; everything
//! else is exported for callers who want to compose the pieces
//! differently (e.g. run the reliability stack standalone).

pub mod collaborators;
pub mod config;
pub mod dependency_graph;
pub mod error;
pub mod file_watcher;
pub mod host;
pub mod manifest;
pub mod module;
pub mod module_handle;
pub mod registry;
pub mod reliability;
pub mod reloader;
pub mod version;
pub mod version_range;

pub use collaborators::{EventDispatcher, ManifestLoader, ServiceRegistry, Transport};
pub use config::FrameworkProperties;
pub use dependency_graph::{DependencyGraph, DependencyResolver};
pub use error::{ModuleException, ParseError, ReliabilityError, ShutdownError};
pub use file_watcher::{FileChangeKind, FileWatcher};
pub use host::{Host, HostState};
pub use manifest::{Dependency, ModuleManifest, ModuleManifestBuilder};
pub use module::{Activator, Module, ModuleContext, ModuleEvent, ModuleEventKind, ModuleListener, ModuleState};
pub use module_handle::{ActivatorFactory, ModuleHandle};
pub use registry::ModuleRegistry;
pub use reloader::{ModuleReloader, ReloadHost};
pub use version::Version;
pub use version_range::VersionRange;
