//! End-to-end install/dependency-resolution scenarios against the public
//! `Host` API, using in-process modules (no real dynamic libraries are
//! available in this test environment).

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use modhost::{
    Activator, ActivatorFactory, EventDispatcher, FileWatcher, FrameworkProperties, Host,
    ManifestLoader, ModuleContext, ModuleEvent, ModuleEventKind, ModuleException, ModuleListener,
    ModuleManifest, ModuleReloader, ModuleState, ReloadHost, ServiceRegistry, ShutdownError,
    Version, VersionRange,
};

struct NoopDispatcher;
#[async_trait]
impl EventDispatcher for NoopDispatcher {
    async fn start(&self) -> Result<(), ShutdownError> {
        Ok(())
    }
    async fn stop(&self) -> Result<(), ShutdownError> {
        Ok(())
    }
    fn fire(&self, _event_type: &str, _payload: serde_json::Value) {}
}

struct NoopServices;
impl ServiceRegistry for NoopServices {
    fn register_service(&self, _context_id: u64, _interface: &str, _service: serde_json::Value) -> u64 {
        0
    }
    fn unregister_all(&self, _context_id: u64) {}
}

struct NoopManifestLoader;
impl ManifestLoader for NoopManifestLoader {
    fn load(&self, _path: &Path) -> Result<ModuleManifest, ModuleException> {
        unimplemented!("these scenarios only install in-process modules")
    }
}

struct NoopActivator;
impl Activator for NoopActivator {
    fn start(&mut self, _ctx: &ModuleContext) -> Result<(), ModuleException> {
        Ok(())
    }
    fn stop(&mut self, _ctx: &ModuleContext) -> Result<(), ModuleException> {
        Ok(())
    }
}

struct NoopFactory;
impl ActivatorFactory for NoopFactory {
    fn create(&self) -> Result<Box<dyn Activator>, ModuleException> {
        Ok(Box::new(NoopActivator))
    }
}

fn make_host() -> Arc<Host> {
    Host::new(
        FrameworkProperties::default(),
        Arc::new(NoopDispatcher),
        Arc::new(NoopServices),
        Arc::new(NoopManifestLoader),
    )
}

#[tokio::test]
async fn topological_start_order_matches_dependency_chain() {
    let host = make_host();
    host.init().await.unwrap();

    let manifest_a = ModuleManifest::builder("a", Version::new(1, 0, 0)).build();
    let manifest_b = ModuleManifest::builder("b", Version::new(1, 0, 0))
        .dependency("a", VersionRange::parse("[1.0.0,2.0.0)").unwrap(), false)
        .build();
    let manifest_c = ModuleManifest::builder("c", Version::new(1, 0, 0))
        .dependency("b", VersionRange::at_least(Version::new(1, 0, 0)), false)
        .build();

    // Installed out of dependency order: C, A, B.
    let id_c = host.install_in_process_module(manifest_c, Arc::new(NoopFactory)).unwrap();
    let id_a = host.install_in_process_module(manifest_a, Arc::new(NoopFactory)).unwrap();
    let id_b = host.install_in_process_module(manifest_b, Arc::new(NoopFactory)).unwrap();

    // All required deps are satisfiable, so resolution order from the
    // registry's own resolver view should run A, B, C.
    let a = host.get_module("a").unwrap();
    let b = host.get_module("b").unwrap();
    let c = host.get_module("c").unwrap();
    assert_eq!(a.state(), ModuleState::Resolved);
    assert_eq!(b.state(), ModuleState::Resolved);
    assert_eq!(c.state(), ModuleState::Resolved);

    assert_eq!(a.id(), id_a);
    assert_eq!(b.id(), id_b);
    assert_eq!(c.id(), id_c);
}

#[tokio::test]
async fn cyclic_dependency_install_is_rejected_and_registry_unaffected() {
    let host = make_host();
    host.init().await.unwrap();

    let manifest_a = ModuleManifest::builder("a", Version::new(1, 0, 0))
        .dependency("b", VersionRange::at_least(Version::new(1, 0, 0)), false)
        .build();
    host.install_in_process_module(manifest_a, Arc::new(NoopFactory)).unwrap();
    assert_eq!(host.get_modules().len(), 1);

    let manifest_b = ModuleManifest::builder("b", Version::new(1, 0, 0))
        .dependency("a", VersionRange::at_least(Version::new(1, 0, 0)), false)
        .build();
    let result = host.install_in_process_module(manifest_b, Arc::new(NoopFactory));
    assert!(matches!(result, Err(ModuleException::CyclicDependency(_))));
    assert_eq!(host.get_modules().len(), 1);
}

#[tokio::test]
async fn auto_start_runs_activator_when_host_and_manifest_agree() {
    let host = make_host();
    host.init().await.unwrap();

    let starts = Arc::new(AtomicUsize::new(0));
    struct CountingActivator {
        starts: Arc<AtomicUsize>,
    }
    impl Activator for CountingActivator {
        fn start(&mut self, _ctx: &ModuleContext) -> Result<(), ModuleException> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn stop(&mut self, _ctx: &ModuleContext) -> Result<(), ModuleException> {
            Ok(())
        }
    }
    struct CountingFactory {
        starts: Arc<AtomicUsize>,
    }
    impl ActivatorFactory for CountingFactory {
        fn create(&self) -> Result<Box<dyn Activator>, ModuleException> {
            Ok(Box::new(CountingActivator { starts: self.starts.clone() }))
        }
    }

    let manifest = ModuleManifest::builder("autostart", Version::new(1, 0, 0)).auto_start(true).build();
    host.install_in_process_module(manifest, Arc::new(CountingFactory { starts: starts.clone() })).unwrap();

    assert_eq!(starts.load(Ordering::SeqCst), 1);
    host.stop(std::time::Duration::from_secs(5)).await.unwrap();
}

struct RecordingListener {
    events: parking_lot::Mutex<Vec<ModuleEvent>>,
}
impl ModuleListener for RecordingListener {
    fn on_module_event(&self, event: &ModuleEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Drives a reload by swapping in a fresh in-process activator for the same
/// module, the embedded-module counterpart of a real dylib being replaced
/// on disk (no real dynamic library is available in this test environment).
struct InProcessReloadHost {
    host: Arc<Host>,
    factory: Arc<dyn ActivatorFactory>,
}
impl ReloadHost for InProcessReloadHost {
    fn reload_module(&self, module_id: u64, _new_library_path: &Path) {
        self.host.update_in_process_module(module_id, self.factory.clone()).unwrap();
    }
}

#[tokio::test]
async fn hot_reload_preserves_activeness() {
    struct CountingActivator {
        starts: Arc<AtomicUsize>,
    }
    impl Activator for CountingActivator {
        fn start(&mut self, _ctx: &ModuleContext) -> Result<(), ModuleException> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn stop(&mut self, _ctx: &ModuleContext) -> Result<(), ModuleException> {
            Ok(())
        }
    }
    struct CountingFactory {
        starts: Arc<AtomicUsize>,
    }
    impl ActivatorFactory for CountingFactory {
        fn create(&self) -> Result<Box<dyn Activator>, ModuleException> {
            Ok(Box::new(CountingActivator { starts: self.starts.clone() }))
        }
    }

    let host = make_host();
    host.init().await.unwrap();

    let listener = Arc::new(RecordingListener { events: parking_lot::Mutex::new(Vec::new()) });
    host.add_framework_listener(listener.clone() as Arc<dyn ModuleListener>);

    let starts = Arc::new(AtomicUsize::new(0));
    let factory: Arc<dyn ActivatorFactory> = Arc::new(CountingFactory { starts: starts.clone() });
    let manifest = ModuleManifest::builder("hot.m", Version::new(1, 0, 0)).auto_start(true).build();
    let id = host.install_in_process_module(manifest, factory.clone()).unwrap();

    let module = host.get_module("hot.m").unwrap();
    assert_eq!(module.state(), ModuleState::Active);
    assert_eq!(starts.load(Ordering::SeqCst), 1);

    // A real library file to watch; its content is irrelevant, only its
    // mtime/size are observed by the poller.
    let dir = tempfile::tempdir().unwrap();
    let lib_path = dir.path().join("hot.so");
    std::fs::write(&lib_path, b"v1").unwrap();

    let poll_interval = Duration::from_millis(10);
    let watcher = FileWatcher::new(poll_interval);
    let reloader = ModuleReloader::new(watcher.clone());
    reloader.set_global_enabled(true);
    let reload_host = Arc::new(InProcessReloadHost { host: host.clone(), factory: factory.clone() });
    reloader.register_module(reload_host, id, "hot.m", lib_path.clone(), None, true);

    std::thread::sleep(poll_interval * 2);
    std::fs::write(&lib_path, b"v2").unwrap();
    watcher.tick();

    assert_eq!(module.state(), ModuleState::Active);
    assert_eq!(starts.load(Ordering::SeqCst), 2);
    let updated_count = listener.events.lock().iter().filter(|e| e.kind == ModuleEventKind::Updated).count();
    assert_eq!(updated_count, 1);

    host.stop(std::time::Duration::from_secs(5)).await.unwrap();
}
