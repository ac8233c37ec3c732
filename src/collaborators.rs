//! Collaborator contracts the core consumes but does not implement (spec
//! §6): the event dispatcher, service registry, manifest loader and
//! transport. Their internal design is out of scope (JSON manifest file
//! I/O and platform-specific dynamic-loader bindings are named
//! non-goals); these traits exist so the host and reliability stack have
//! something concrete to call.

use std::path::Path;

use async_trait::async_trait;

use crate::error::ModuleException;
use crate::error::ReliabilityError;
use crate::manifest::ModuleManifest;

/// Turns an on-disk manifest document into a [`ModuleManifest`]. The
/// document format itself is out of scope; the host only needs something
/// that produces a manifest with the required fields populated.
pub trait ManifestLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<ModuleManifest, ModuleException>;
}

/// Synchronous or asynchronous fan-out of framework-wide events. The host
/// owns one instance, started at `init()` and stopped at `stop()`.
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    async fn start(&self) -> Result<(), crate::error::ShutdownError>;
    async fn stop(&self) -> Result<(), crate::error::ShutdownError>;
    fn fire(&self, event_type: &str, payload: serde_json::Value);
}

/// Per-context service registration, out of scope to implement; the
/// lifecycle engine unregisters services through this on module stop.
pub trait ServiceRegistry: Send + Sync {
    fn register_service(&self, context_id: u64, interface: &str, service: serde_json::Value) -> u64;
    fn unregister_all(&self, context_id: u64);
}

/// The opaque sink the reliability stack sends bytes through. A transport
/// implementation lives outside this crate; the pool and connection
/// manager only ever see this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<(), ReliabilityError>;
    async fn disconnect(&self);
    async fn is_connected(&self) -> bool;
    async fn send(&self, payload: &[u8]) -> Result<(), ReliabilityError>;
    async fn receive(&self) -> Result<Vec<u8>, ReliabilityError>;
}
