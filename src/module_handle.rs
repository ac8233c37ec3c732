//! Owns a loaded dynamic library token and the two well-known entry points
//! every module ABI must export. Mirrors the CDMF `ModuleHandle`: load and
//! immediately resolve both symbols, failing the whole load if either is
//! missing; destroy the activator before the library itself is unloaded.
//!
//! The module ABI (spec §6/§9) is kept to two C-linkage factory functions
//! returning an opaque activator behind a small v-table, so that dynamic
//! dispatch across the dylib boundary never leaks a host-language vtable.

use std::ffi::c_void;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::ModuleException;
use crate::module::{Activator, ModuleContext};

pub const CREATE_SYMBOL: &[u8] = b"createModuleActivator";
pub const DESTROY_SYMBOL: &[u8] = b"destroyModuleActivator";

/// The small v-table a module's `createModuleActivator` hands back. Every
/// field is a plain C-linkage function pointer operating on an opaque
/// `instance` pointer owned by the module.
#[repr(C)]
pub struct RawActivatorVTable {
    pub start: unsafe extern "C" fn(*mut c_void, *mut c_void) -> i32,
    pub stop: unsafe extern "C" fn(*mut c_void, *mut c_void) -> i32,
}

#[repr(C)]
pub struct RawActivator {
    pub vtable: *const RawActivatorVTable,
    pub instance: *mut c_void,
}

pub type CreateActivatorFn = unsafe extern "C" fn() -> *mut RawActivator;
pub type DestroyActivatorFn = unsafe extern "C" fn(*mut RawActivator);

/// Abstracts over where an activator factory actually comes from: a real
/// dynamic library, or (in tests / embedded modules) an in-process Rust
/// factory that skips `libloading` entirely. The host and lifecycle engine
/// never need to know which one they're talking to.
pub trait ActivatorFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn Activator>, ModuleException>;
}

struct DylibAdapter {
    raw: *mut RawActivator,
}

// SAFETY: the raw activator is only ever touched through its own vtable
// calls, which the module author is contractually obligated to make safe
// to call from any thread holding the module's lock (the host never calls
// concurrently into one module instance).
unsafe impl Send for DylibAdapter {}
unsafe impl Sync for DylibAdapter {}

impl Activator for DylibAdapter {
    fn start(&mut self, ctx: &ModuleContext) -> Result<(), ModuleException> {
        let ctx_ptr = ctx as *const ModuleContext as *mut c_void;
        unsafe {
            let vtable = &*(*self.raw).vtable;
            let rc = (vtable.start)((*self.raw).instance, ctx_ptr);
            if rc != 0 {
                return Err(ModuleException::StartFailed {
                    symbolic_name: ctx.module_symbolic_name().to_string(),
                    reason: format!("activator start() returned code {rc}"),
                });
            }
        }
        Ok(())
    }

    fn stop(&mut self, ctx: &ModuleContext) -> Result<(), ModuleException> {
        let ctx_ptr = ctx as *const ModuleContext as *mut c_void;
        unsafe {
            let vtable = &*(*self.raw).vtable;
            let rc = (vtable.stop)((*self.raw).instance, ctx_ptr);
            if rc != 0 {
                return Err(ModuleException::StartFailed {
                    symbolic_name: ctx.module_symbolic_name().to_string(),
                    reason: format!("activator stop() returned code {rc}"),
                });
            }
        }
        Ok(())
    }
}

struct DylibFactory {
    // Kept alive for the lifetime of the factory; dropping the library
    // while an activator still exists is undefined behavior, so the
    // handle's own Drop order (destroy activator, then drop this) matters.
    create_fn: CreateActivatorFn,
    destroy_fn: DestroyActivatorFn,
}

impl ActivatorFactory for DylibFactory {
    fn create(&self) -> Result<Box<dyn Activator>, ModuleException> {
        let raw = unsafe { (self.create_fn)() };
        if raw.is_null() {
            return Err(ModuleException::NullActivator);
        }
        let destroy_fn = self.destroy_fn;
        Ok(Box::new(DylibActivatorHandle { adapter: DylibAdapter { raw }, destroy_fn }))
    }
}

/// Wraps [`DylibAdapter`] so the raw pointer is torn down with
/// `destroyModuleActivator` on drop, whichever path (normal stop, or an
/// error unwind during start) releases it.
struct DylibActivatorHandle {
    adapter: DylibAdapter,
    destroy_fn: DestroyActivatorFn,
}

impl Activator for DylibActivatorHandle {
    fn start(&mut self, ctx: &ModuleContext) -> Result<(), ModuleException> {
        self.adapter.start(ctx)
    }
    fn stop(&mut self, ctx: &ModuleContext) -> Result<(), ModuleException> {
        self.adapter.stop(ctx)
    }
}

impl Drop for DylibActivatorHandle {
    fn drop(&mut self) {
        if !self.adapter.raw.is_null() {
            unsafe { (self.destroy_fn)(self.adapter.raw) };
            self.adapter.raw = std::ptr::null_mut();
        }
    }
}

enum HandleSource {
    Dylib { library: libloading::Library, factory: Arc<DylibFactory> },
    InProcess { factory: Arc<dyn ActivatorFactory> },
}

/// Owns an opaque loaded-library token and the resolved activator factory.
/// Move-only: a handle's library token and function pointers are only
/// meaningful bound to the process memory they were resolved in.
pub struct ModuleHandle {
    location: String,
    source: HandleSource,
}

impl ModuleHandle {
    /// Loads the library at `path` and immediately resolves both well-known
    /// entry points. Either failure is fatal to the load and unloads the
    /// library (dropping it) before returning.
    pub fn load(path: impl Into<String>) -> Result<Self, ModuleException> {
        let path = path.into();
        let library = unsafe {
            libloading::Library::new(&path).map_err(|source| ModuleException::LibraryLoad {
                path: path.clone(),
                source,
            })?
        };

        let create_fn: CreateActivatorFn = unsafe {
            match library.get::<CreateActivatorFn>(CREATE_SYMBOL) {
                Ok(sym) => *sym,
                Err(_) => {
                    return Err(ModuleException::MissingSymbol {
                        path,
                        symbol: String::from_utf8_lossy(CREATE_SYMBOL).to_string(),
                    })
                }
            }
        };
        let destroy_fn: DestroyActivatorFn = unsafe {
            match library.get::<DestroyActivatorFn>(DESTROY_SYMBOL) {
                Ok(sym) => *sym,
                Err(_) => {
                    return Err(ModuleException::MissingSymbol {
                        path,
                        symbol: String::from_utf8_lossy(DESTROY_SYMBOL).to_string(),
                    })
                }
            }
        };

        debug!(%path, "resolved module activator symbols");
        Ok(Self {
            location: path,
            source: HandleSource::Dylib { library, factory: Arc::new(DylibFactory { create_fn, destroy_fn }) },
        })
    }

    /// Builds a handle from an in-process factory, bypassing `libloading`
    /// entirely. Used by embedded modules and by tests, the same way the
    /// corpus tests a plugin registry against a plain struct implementing
    /// the relevant trait rather than a compiled shared object.
    pub fn in_process(location: impl Into<String>, factory: Arc<dyn ActivatorFactory>) -> Self {
        Self { location: location.into(), source: HandleSource::InProcess { factory } }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn create_activator(&self) -> Result<Box<dyn Activator>, ModuleException> {
        match &self.source {
            HandleSource::Dylib { factory, .. } => factory.create(),
            HandleSource::InProcess { factory } => factory.create(),
        }
    }
}

impl Drop for ModuleHandle {
    fn drop(&mut self) {
        if let HandleSource::Dylib { .. } = &self.source {
            warn!(path = %self.location, "unloading module library");
        }
        // `library` (if any) drops here, after any activator created from
        // it should already have been destroyed by the lifecycle engine.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleContext;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeActivator {
        started: Arc<AtomicBool>,
    }

    impl Activator for FakeActivator {
        fn start(&mut self, _ctx: &ModuleContext) -> Result<(), ModuleException> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn stop(&mut self, _ctx: &ModuleContext) -> Result<(), ModuleException> {
            self.started.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeFactory {
        started: Arc<AtomicBool>,
    }

    impl ActivatorFactory for FakeFactory {
        fn create(&self) -> Result<Box<dyn Activator>, ModuleException> {
            Ok(Box::new(FakeActivator { started: self.started.clone() }))
        }
    }

    #[test]
    fn in_process_handle_creates_activator() {
        let started = Arc::new(AtomicBool::new(false));
        let handle = ModuleHandle::in_process("mem://fake", Arc::new(FakeFactory { started: started.clone() }));
        let mut activator = handle.create_activator().unwrap();
        let ctx = ModuleContext::for_test("fake-module");
        activator.start(&ctx).unwrap();
        assert!(started.load(Ordering::SeqCst));
        activator.stop(&ctx).unwrap();
        assert!(!started.load(Ordering::SeqCst));
    }

    #[test]
    fn load_rejects_missing_library() {
        let err = ModuleHandle::load("/nonexistent/path/to/lib.so");
        assert!(err.is_err());
    }
}
