//! The module lifecycle engine (spec §4.6): a per-module state machine with
//! dynamic-library-backed activator creation and event firing on every
//! transition. This is the component with the most surface area in the
//! system, so it is split into the state machine (here) and the host-level
//! orchestration of install/update/uninstall (`host.rs`).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::ModuleException;
use crate::manifest::ModuleManifest;
use crate::module_handle::ModuleHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleState {
    Installed,
    Resolved,
    Starting,
    Active,
    Stopping,
    Uninstalled,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModuleState::Installed => "INSTALLED",
            ModuleState::Resolved => "RESOLVED",
            ModuleState::Starting => "STARTING",
            ModuleState::Active => "ACTIVE",
            ModuleState::Stopping => "STOPPING",
            ModuleState::Uninstalled => "UNINSTALLED",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleEventKind {
    Installed,
    Resolved,
    ResolvedFailed,
    Starting,
    Started,
    Stopping,
    Stopped,
    Updated,
    Uninstalled,
}

#[derive(Debug, Clone)]
pub struct ModuleEvent {
    pub kind: ModuleEventKind,
    pub module_id: u64,
    pub symbolic_name: String,
}

/// A listener scoped either to a single module (receives only that
/// module's events) or to the host (receives the superset, spec §4.6). No
/// back-pointer from publisher to subscriber is kept at the object level;
/// dropping the `Arc` a subscriber holds is enough to stop delivery once
/// the registry is swept (see `remove` methods on the owning registries).
pub trait ModuleListener: Send + Sync {
    fn on_module_event(&self, event: &ModuleEvent);
}

/// Invoked by the host on a module's behalf; owns module-local
/// initialisation and cleanup. Implemented by the module across the ABI
/// boundary (`module_handle::DylibActivatorHandle`) or in-process by
/// embedded modules and tests.
pub trait Activator: Send + Sync {
    fn start(&mut self, ctx: &ModuleContext) -> Result<(), ModuleException>;
    fn stop(&mut self, ctx: &ModuleContext) -> Result<(), ModuleException>;
}

/// The mediated view a module gets of the host while `STARTING`, `ACTIVE`
/// or `STOPPING`. Service registry and event dispatcher access are
/// collaborator contracts (spec §6) this crate only consumes; see
/// `collaborators.rs`.
pub struct ModuleContext {
    module_id: u64,
    symbolic_name: String,
}

impl ModuleContext {
    pub fn new(module_id: u64, symbolic_name: impl Into<String>) -> Self {
        Self { module_id, symbolic_name: symbolic_name.into() }
    }

    /// Builds a context detached from any real module, for unit tests that
    /// only need something to hand an `Activator::start`/`stop`.
    pub fn for_test(symbolic_name: impl Into<String>) -> Self {
        Self::new(0, symbolic_name)
    }

    pub fn module_id(&self) -> u64 {
        self.module_id
    }

    pub fn module_symbolic_name(&self) -> &str {
        &self.symbolic_name
    }
}

struct ModuleInner {
    manifest: ModuleManifest,
    state: ModuleState,
    handle: Option<ModuleHandle>,
    activator: Option<Box<dyn Activator>>,
    context: Option<Arc<ModuleContext>>,
}

/// A single installed module. `id` is assigned once at install time and
/// never reused; after `Uninstalled` the module must not be used for any
/// further operation (enforced by `ModuleException::WrongState` on every
/// entry point below).
pub struct Module {
    id: u64,
    inner: Mutex<ModuleInner>,
    listeners: RwLock<Vec<Arc<dyn ModuleListener>>>,
}

impl Module {
    pub(crate) fn new(id: u64, manifest: ModuleManifest, handle: ModuleHandle) -> Self {
        Self {
            id,
            inner: Mutex::new(ModuleInner { manifest, state: ModuleState::Installed, handle: Some(handle), activator: None, context: None }),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ModuleState {
        self.inner.lock().state
    }

    pub fn symbolic_name(&self) -> String {
        self.inner.lock().manifest.symbolic_name.clone()
    }

    pub fn manifest(&self) -> ModuleManifest {
        self.inner.lock().manifest.clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn ModuleListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ModuleListener>) {
        self.listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    fn event(&self, kind: ModuleEventKind) -> ModuleEvent {
        ModuleEvent { kind, module_id: self.id, symbolic_name: self.inner.lock().manifest.symbolic_name.clone() }
    }

    /// Fires to module-scoped listeners only. Always called with the
    /// module's own lock already released (spec §4.6/§5): listener code
    /// may legitimately want to query this module's state.
    fn fire(&self, event: ModuleEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners.iter() {
            listener.on_module_event(&event);
        }
    }

    /// Transitions `INSTALLED -> RESOLVED` (or emits `ResolvedFailed` and
    /// stays `INSTALLED`). Called by the host after dependency resolution;
    /// not a public lifecycle entry point by itself.
    pub(crate) fn mark_resolved(&self, satisfied: bool) -> ModuleEvent {
        let mut inner = self.inner.lock();
        if satisfied {
            inner.state = ModuleState::Resolved;
            drop(inner);
            self.event(ModuleEventKind::Resolved)
        } else {
            drop(inner);
            self.event(ModuleEventKind::ResolvedFailed)
        }
    }

    pub(crate) fn apply_resolution_event(&self, event: ModuleEvent) {
        self.fire(event);
    }

    /// Starts the module. Must be `RESOLVED`; on success transitions to
    /// `ACTIVE`, on activator failure reverts to `RESOLVED` and propagates.
    pub fn start(&self) -> Result<(), ModuleException> {
        let symbolic_name = self.symbolic_name();
        {
            let mut inner = self.inner.lock();
            if inner.state != ModuleState::Resolved {
                return Err(ModuleException::WrongState {
                    symbolic_name: symbolic_name.clone(),
                    actual: inner.state,
                    expected: ModuleState::Resolved,
                });
            }
            inner.state = ModuleState::Starting;
        }
        self.fire(self.event(ModuleEventKind::Starting));

        let start_result = {
            let mut inner = self.inner.lock();
            let handle = inner.handle.as_ref().expect("handle present while resolved");
            let activator = match handle.create_activator() {
                Ok(a) => a,
                Err(e) => {
                    inner.state = ModuleState::Resolved;
                    return Err(e);
                }
            };
            inner.activator = Some(activator);
            inner.context = Some(Arc::new(ModuleContext::new(self.id, symbolic_name.clone())));
            let ctx = inner.context.clone().expect("just set");
            let result = inner.activator.as_mut().expect("just set").start(&ctx);
            result
        };

        match start_result {
            Ok(()) => {
                let mut inner = self.inner.lock();
                inner.state = ModuleState::Active;
                drop(inner);
                info!(module = %symbolic_name, "module started");
                self.fire(self.event(ModuleEventKind::Started));
                Ok(())
            }
            Err(e) => {
                let mut inner = self.inner.lock();
                inner.activator = None;
                inner.context = None;
                inner.state = ModuleState::Resolved;
                drop(inner);
                warn!(module = %symbolic_name, error = %e, "module start failed, reverted to RESOLVED");
                Err(e)
            }
        }
    }

    /// Stops the module. No-op if not `ACTIVE`. Activator failures are
    /// logged, not propagated (spec §4.6 overrides the CDMF original, see
    /// DESIGN.md Open Question 3); the module still ends up `RESOLVED`.
    pub fn stop(&self) -> Result<(), ModuleException> {
        let symbolic_name = self.symbolic_name();
        {
            let inner = self.inner.lock();
            if inner.state != ModuleState::Active {
                return Ok(());
            }
        }
        self.inner.lock().state = ModuleState::Stopping;
        self.fire(self.event(ModuleEventKind::Stopping));

        let stop_outcome = {
            let mut inner = self.inner.lock();
            let ctx = inner.context.clone();
            match (&mut inner.activator, &ctx) {
                (Some(activator), Some(ctx)) => activator.stop(ctx),
                _ => Ok(()),
            }
        };
        if let Err(e) = &stop_outcome {
            warn!(module = %symbolic_name, error = %e, "activator stop() failed, logging and continuing");
        }

        let mut inner = self.inner.lock();
        inner.context = None;
        inner.activator = None;
        inner.state = ModuleState::Resolved;
        drop(inner);
        info!(module = %symbolic_name, "module stopped");
        self.fire(self.event(ModuleEventKind::Stopped));
        Ok(())
    }

    /// Replaces this module's handle (and thus manifest/dependencies) with
    /// a freshly loaded one. The caller (`host.rs`/reloader) is responsible
    /// for stopping the module first if it was `ACTIVE` and for
    /// re-resolving + restarting afterward; this just swaps the handle and
    /// manifest and fires `Updated`.
    pub(crate) fn replace(&self, new_manifest: ModuleManifest, new_handle: ModuleHandle) {
        let mut inner = self.inner.lock();
        inner.manifest = new_manifest;
        inner.handle = Some(new_handle);
        drop(inner);
        self.fire(self.event(ModuleEventKind::Updated));
    }

    /// Marks this module terminally uninstalled. The caller has already
    /// stopped it if it was active.
    pub(crate) fn mark_uninstalled(&self) {
        let mut inner = self.inner.lock();
        inner.state = ModuleState::Uninstalled;
        inner.handle = None;
        inner.activator = None;
        inner.context = None;
        drop(inner);
        self.fire(self.event(ModuleEventKind::Uninstalled));
    }

    pub(crate) fn fire_installed(&self) {
        self.fire(self.event(ModuleEventKind::Installed));
    }
}

static NEXT_MODULE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_module_id() -> u64 {
    NEXT_MODULE_ID.fetch_add(1, AtomicOrdering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module_handle::ActivatorFactory;
    use crate::version::Version;
    use std::sync::atomic::AtomicUsize;

    struct CountingActivator {
        starts: Arc<AtomicUsize>,
        fail_start: bool,
    }

    impl Activator for CountingActivator {
        fn start(&mut self, _ctx: &ModuleContext) -> Result<(), ModuleException> {
            if self.fail_start {
                return Err(ModuleException::StartFailed { symbolic_name: "x".into(), reason: "boom".into() });
            }
            self.starts.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }
        fn stop(&mut self, _ctx: &ModuleContext) -> Result<(), ModuleException> {
            Ok(())
        }
    }

    struct CountingFactory {
        starts: Arc<AtomicUsize>,
        fail_start: bool,
    }

    impl ActivatorFactory for CountingFactory {
        fn create(&self) -> Result<Box<dyn Activator>, ModuleException> {
            Ok(Box::new(CountingActivator { starts: self.starts.clone(), fail_start: self.fail_start }))
        }
    }

    fn make_module(fail_start: bool) -> (Arc<Module>, Arc<AtomicUsize>) {
        let starts = Arc::new(AtomicUsize::new(0));
        let factory: Arc<dyn ActivatorFactory> = Arc::new(CountingFactory { starts: starts.clone(), fail_start });
        let handle = ModuleHandle::in_process("mem://m", factory);
        let manifest = ModuleManifest::builder("m", Version::new(1, 0, 0)).build();
        let module = Arc::new(Module::new(next_module_id(), manifest, handle));
        module.mark_resolved(true);
        (module, starts)
    }

    #[test]
    fn start_requires_resolved_state() {
        let (module, _) = make_module(false);
        // freshly resolved, start should succeed
        module.start().unwrap();
        assert_eq!(module.state(), ModuleState::Active);
    }

    #[test]
    fn start_when_already_active_is_rejected() {
        let (module, starts) = make_module(false);
        module.start().unwrap();
        let err = module.start();
        assert!(matches!(
            err,
            Err(ModuleException::WrongState { actual: ModuleState::Active, expected: ModuleState::Resolved, .. })
        ));
        assert_eq!(starts.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn failed_start_reverts_to_resolved() {
        let (module, _) = make_module(true);
        let err = module.start();
        assert!(err.is_err());
        assert_eq!(module.state(), ModuleState::Resolved);
    }

    #[test]
    fn stop_is_noop_if_not_active() {
        let (module, _) = make_module(false);
        module.stop().unwrap();
        assert_eq!(module.state(), ModuleState::Resolved);
    }

    #[test]
    fn start_stop_start_returns_to_active() {
        let (module, _) = make_module(false);
        module.start().unwrap();
        module.stop().unwrap();
        module.start().unwrap();
        assert_eq!(module.state(), ModuleState::Active);
    }

    struct RecordingListener {
        events: Mutex<Vec<ModuleEventKind>>,
    }

    impl ModuleListener for RecordingListener {
        fn on_module_event(&self, event: &ModuleEvent) {
            self.events.lock().push(event.kind);
        }
    }

    #[test]
    fn listener_sees_starting_then_started() {
        let (module, _) = make_module(false);
        let listener = Arc::new(RecordingListener { events: Mutex::new(Vec::new()) });
        module.add_listener(listener.clone() as Arc<dyn ModuleListener>);
        module.start().unwrap();
        let events = listener.events.lock().clone();
        assert_eq!(events, vec![ModuleEventKind::Starting, ModuleEventKind::Started]);
    }
}
