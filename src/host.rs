//! Top-level façade (spec §4.9) composing the module registry, dependency
//! resolver, file watcher and reloader behind one lifecycle:
//! `CREATED -> STARTING -> ACTIVE -> STOPPING -> STOPPED`. Module
//! operations (`install`/`update`/`uninstall`) delegate to the lifecycle
//! engine in `module.rs`; this file owns only the orchestration around it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::collaborators::{EventDispatcher, ManifestLoader, ServiceRegistry};
use crate::config::FrameworkProperties;
use crate::dependency_graph::{resolve_dependency_ids, DependencyResolver};
use crate::error::{ModuleException, ShutdownError};
use crate::manifest::ModuleManifest;
use crate::module::{next_module_id, Module, ModuleContext, ModuleListener, ModuleState};
use crate::module_handle::{ActivatorFactory, ModuleHandle};
use crate::registry::ModuleRegistry;
use crate::reloader::{ModuleReloader, ReloadHost};
use crate::version::Version;
use crate::file_watcher::FileWatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Created,
    Starting,
    Active,
    Stopping,
    Stopped,
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HostState::Created => "CREATED",
            HostState::Starting => "STARTING",
            HostState::Active => "ACTIVE",
            HostState::Stopping => "STOPPING",
            HostState::Stopped => "STOPPED",
        };
        write!(f, "{s}")
    }
}

pub struct Host {
    state: RwLock<HostState>,
    properties: FrameworkProperties,
    registry: Arc<ModuleRegistry>,
    resolver: Arc<DependencyResolver>,
    watcher: Arc<FileWatcher>,
    reloader: Arc<ModuleReloader>,
    event_dispatcher: Arc<dyn EventDispatcher>,
    service_registry: Arc<dyn ServiceRegistry>,
    manifest_loader: Arc<dyn ManifestLoader>,
    listeners: RwLock<Vec<Arc<dyn ModuleListener>>>,
    stop_notify: Notify,
}

impl Host {
    pub fn new(
        properties: FrameworkProperties,
        event_dispatcher: Arc<dyn EventDispatcher>,
        service_registry: Arc<dyn ServiceRegistry>,
        manifest_loader: Arc<dyn ManifestLoader>,
    ) -> Arc<Self> {
        let watcher = FileWatcher::new(properties.modules_reload_poll_interval);
        Arc::new(Self {
            state: RwLock::new(HostState::Created),
            reloader: ModuleReloader::new(watcher.clone()),
            watcher,
            properties,
            registry: Arc::new(ModuleRegistry::new()),
            resolver: Arc::new(DependencyResolver::new()),
            event_dispatcher,
            service_registry,
            manifest_loader,
            listeners: RwLock::new(Vec::new()),
            stop_notify: Notify::new(),
        })
    }

    pub fn state(&self) -> HostState {
        *self.state.read()
    }

    pub fn properties(&self) -> &FrameworkProperties {
        &self.properties
    }

    /// Wires every subsystem and transitions to `ACTIVE`. A subsystem
    /// failure (only the event dispatcher can fail here) aborts the
    /// transition and leaves the host `STARTING`.
    pub async fn init(self: &Arc<Self>) -> Result<(), ShutdownError> {
        {
            let mut state = self.state.write();
            if *state != HostState::Created {
                return Ok(());
            }
            *state = HostState::Starting;
        }

        self.reloader.set_global_enabled(self.properties.modules_auto_reload);
        self.watcher.start();

        if let Err(e) = self.event_dispatcher.start().await {
            warn!(error = %e, "event dispatcher failed to start");
            return Err(e);
        }

        *self.state.write() = HostState::Active;
        self.event_dispatcher.fire("host.started", serde_json::json!({}));
        info!("host started");
        Ok(())
    }

    /// Idempotently ensures the host is `ACTIVE`.
    pub async fn start(self: &Arc<Self>) -> Result<(), ShutdownError> {
        if self.state() == HostState::Active {
            return Ok(());
        }
        self.init().await
    }

    /// Stops every active module (dependency-reverse order, falling back to
    /// reverse install order if the graph is unusable), then the reloader,
    /// watcher and event dispatcher, then clears the registry. The first
    /// error encountered anywhere is retained and returned only after every
    /// subsystem has had a chance to stop (spec §4.9).
    pub async fn stop(self: &Arc<Self>, timeout: Duration) -> Result<(), ShutdownError> {
        {
            let mut state = self.state.write();
            if *state == HostState::Stopped {
                return Ok(());
            }
            *state = HostState::Stopping;
        }

        let mut first_err: Option<ShutdownError> = None;

        self.reloader.set_global_enabled(false);
        self.watcher.stop();

        let stop_order = self.resolver.get_stop_order().unwrap_or_else(|| {
            warn!("dependency graph unusable at shutdown, falling back to reverse install order");
            let mut ids: Vec<u64> = self.registry.get_all().iter().map(|m| m.id()).collect();
            ids.sort_unstable();
            ids.reverse();
            ids
        });

        let deadline = tokio::time::Instant::now() + timeout;
        let mut timed_out = 0usize;
        for id in stop_order {
            if tokio::time::Instant::now() >= deadline {
                timed_out += 1;
                continue;
            }
            if let Some(module) = self.registry.get(id) {
                if let Err(e) = module.stop() {
                    warn!(module = %module.symbolic_name(), error = %e, "module failed to stop during shutdown");
                    first_err.get_or_insert(ShutdownError::SubsystemStopFailed {
                        subsystem: module.symbolic_name(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        if timed_out > 0 {
            first_err.get_or_insert(ShutdownError::ModuleStopTimeout(timed_out));
        }

        if let Err(e) = self.event_dispatcher.stop().await {
            warn!(error = %e, "event dispatcher failed to stop");
            first_err.get_or_insert(e);
        }

        for module in self.registry.get_all() {
            self.registry.unregister(module.id());
        }

        *self.state.write() = HostState::Stopped;
        info!("host stopped");
        self.stop_notify.notify_waiters();

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Resolves once the host reaches `STOPPED`, including if it already
    /// has.
    pub async fn wait_for_stop(&self) {
        loop {
            let notified = self.stop_notify.notified();
            if self.state() == HostState::Stopped {
                return;
            }
            notified.await;
        }
    }

    /// Installs a module backed by a real dynamic library. `manifest_path`
    /// defaults to `library_path` with its extension replaced by `.json`
    /// when omitted.
    pub fn install_module(
        self: &Arc<Self>,
        library_path: impl AsRef<Path>,
        manifest_path: Option<&Path>,
    ) -> Result<u64, ModuleException> {
        let library_path = library_path.as_ref();
        let manifest_path =
            manifest_path.map(PathBuf::from).unwrap_or_else(|| library_path.with_extension("json"));
        let manifest = self.manifest_loader.load(&manifest_path)?;
        manifest.validate()?;

        let handle = ModuleHandle::load(library_path.to_string_lossy().to_string())?;
        let id = self.install_with_handle(manifest.clone(), handle)?;

        self.reloader.register_module(
            self.clone() as Arc<dyn ReloadHost>,
            id,
            manifest.symbolic_name,
            library_path.to_path_buf(),
            Some(manifest_path),
            self.properties.modules_auto_reload,
        );
        Ok(id)
    }

    /// Installs an embedded module whose activator lives in this process
    /// rather than behind `libloading` (spec §6's platform-loader
    /// collaborator is out of scope to implement for anything but real
    /// dylibs; this is the same escape hatch `ModuleHandle::in_process`
    /// offers for tests). Not registered with the reloader since there is
    /// no file to watch.
    pub fn install_in_process_module(
        self: &Arc<Self>,
        manifest: ModuleManifest,
        factory: Arc<dyn ActivatorFactory>,
    ) -> Result<u64, ModuleException> {
        manifest.validate()?;
        let location = format!("mem://{}", manifest.symbolic_name);
        let handle = ModuleHandle::in_process(location, factory);
        self.install_with_handle(manifest, handle)
    }

    fn install_with_handle(
        self: &Arc<Self>,
        manifest: ModuleManifest,
        handle: ModuleHandle,
    ) -> Result<u64, ModuleException> {
        let id = next_module_id();
        let dependency_ids = resolve_dependency_ids(&manifest, &self.registry);
        if !self.resolver.validate_candidate(id, &manifest.symbolic_name, &dependency_ids) {
            return Err(ModuleException::CyclicDependency(manifest.symbolic_name.clone()));
        }

        let module = Arc::new(Module::new(id, manifest.clone(), handle));
        for listener in self.listeners.read().iter() {
            module.add_listener(listener.clone());
        }
        self.registry.register(module.clone());
        module.fire_installed();

        if let Err(e) = self.resolver.rebuild(&self.registry) {
            self.registry.unregister(id);
            return Err(e);
        }

        let satisfied = self.resolver.dependencies_satisfied(&manifest, &self.registry);
        let event = module.mark_resolved(satisfied);
        module.apply_resolution_event(event);
        if !satisfied {
            warn!(module = %manifest.symbolic_name, "installed with unsatisfied dependencies, staying INSTALLED");
        }

        if satisfied && self.properties.modules_auto_start && manifest.auto_start {
            if let Err(e) = module.start() {
                warn!(module = %manifest.symbolic_name, error = %e, "auto-start failed, module remains RESOLVED");
            }
        }

        Ok(id)
    }

    /// Stops (if `ACTIVE`), reloads the manifest and library handle, and
    /// re-resolves. Restarts only if the module was previously `ACTIVE` and
    /// still resolves after the reload (spec §4.6 "Update").
    pub fn update_module(&self, module_id: u64, new_library_path: &Path) -> Result<(), ModuleException> {
        let new_handle = ModuleHandle::load(new_library_path.to_string_lossy().to_string())?;
        self.update_module_with_handle(module_id, new_handle)
    }

    /// Same transition as [`Host::update_module`], but for an embedded
    /// module whose activator lives in this process (the reload-path
    /// counterpart of [`Host::install_in_process_module`]; real dynamic
    /// libraries are unavailable in this crate's own test environment).
    pub fn update_in_process_module(
        &self,
        module_id: u64,
        factory: Arc<dyn ActivatorFactory>,
    ) -> Result<(), ModuleException> {
        let module = self.registry.get(module_id).ok_or_else(|| ModuleException::NotFound(module_id.to_string()))?;
        let location = format!("mem://{}", module.symbolic_name());
        let new_handle = ModuleHandle::in_process(location, factory);
        self.update_module_with_handle(module_id, new_handle)
    }

    fn update_module_with_handle(&self, module_id: u64, new_handle: ModuleHandle) -> Result<(), ModuleException> {
        let module = self.registry.get(module_id).ok_or_else(|| ModuleException::NotFound(module_id.to_string()))?;
        let was_active = module.state() == ModuleState::Active;
        if was_active {
            module.stop()?;
        }

        let manifest = match self.reloader.manifest_path_for(module_id) {
            Some(manifest_path) => self.manifest_loader.load(&manifest_path)?,
            None => module.manifest(),
        };
        manifest.validate()?;

        module.replace(manifest.clone(), new_handle);

        self.resolver.rebuild(&self.registry)?;
        let satisfied = self.resolver.dependencies_satisfied(&manifest, &self.registry);
        let event = module.mark_resolved(satisfied);
        module.apply_resolution_event(event);

        if was_active && satisfied {
            module.start()?;
        }
        Ok(())
    }

    pub fn uninstall_module(&self, module_id: u64) -> Result<(), ModuleException> {
        let module = self.registry.get(module_id).ok_or_else(|| ModuleException::NotFound(module_id.to_string()))?;
        if module.state() == ModuleState::Active {
            module.stop()?;
        }
        self.reloader.unregister_module(module_id);
        self.registry.unregister(module_id);
        self.resolver.rebuild(&self.registry)?;
        module.mark_uninstalled();
        Ok(())
    }

    pub fn get_modules(&self) -> Vec<Arc<Module>> {
        self.registry.get_all()
    }

    pub fn get_module(&self, name: &str) -> Option<Arc<Module>> {
        self.registry.get_by_name(name)
    }

    pub fn get_module_version(&self, name: &str, version: &Version) -> Option<Arc<Module>> {
        self.registry.get_exact(name, version)
    }

    /// Adds a host-scoped listener. It is attached to every module
    /// currently installed as well as every module installed afterward,
    /// unlike a module-scoped listener which only ever sees one module's
    /// events (spec §4.6's "host-level events" superset).
    pub fn add_framework_listener(&self, listener: Arc<dyn ModuleListener>) {
        self.listeners.write().push(listener.clone());
        for module in self.registry.get_all() {
            module.add_listener(listener.clone());
        }
    }

    pub fn remove_framework_listener(&self, listener: &Arc<dyn ModuleListener>) {
        self.listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
        for module in self.registry.get_all() {
            module.remove_listener(listener);
        }
    }

    /// A system-wide context for host-scope service/event operations, not
    /// tied to any installed module.
    pub fn get_context(&self) -> Arc<ModuleContext> {
        Arc::new(ModuleContext::new(0, "host::framework"))
    }

    pub fn service_registry(&self) -> &Arc<dyn ServiceRegistry> {
        &self.service_registry
    }
}

impl ReloadHost for Host {
    fn reload_module(&self, module_id: u64, new_library_path: &Path) {
        if let Err(e) = self.update_module(module_id, new_library_path) {
            warn!(module_id, error = %e, "auto-reload failed");
        }
    }
}
