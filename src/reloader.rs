//! Maps watched library/manifest paths back to modules and orchestrates
//! safe `update()` calls (spec §4.8). The lock-release-before-callback
//! discipline here is load-bearing (spec §9): `update` re-enters the
//! reloader via `manifest_path_for`, so the reloader's own lock must be
//! released before the host callback runs, or a save storm deadlocks the
//! poller thread against the host mutex.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::file_watcher::{FileChangeKind, FileWatcher};

#[derive(Clone)]
struct ReloadInfo {
    module_id: u64,
    symbolic_name: String,
    library_path: PathBuf,
    manifest_path: Option<PathBuf>,
    auto_reload_enabled: bool,
}

/// Invoked by the reloader, with its own lock already released, to ask the
/// host to actually reload a module. The host is the only thing that knows
/// how to stop/replace-handle/re-resolve/restart a module.
pub trait ReloadHost: Send + Sync {
    fn reload_module(&self, module_id: u64, new_library_path: &Path);
}

struct ReloaderState {
    by_module: HashMap<u64, ReloadInfo>,
    by_path: HashMap<PathBuf, u64>,
}

pub struct ModuleReloader {
    state: Mutex<ReloaderState>,
    watcher: Arc<FileWatcher>,
    enabled: Arc<AtomicBool>,
}

impl ModuleReloader {
    pub fn new(watcher: Arc<FileWatcher>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ReloaderState { by_module: HashMap::new(), by_path: HashMap::new() }),
            watcher,
            enabled: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn set_global_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn global_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Watches both the library path and (if present) the manifest path
    /// for `module_id`. Fails registration if the library watch fails;
    /// manifest-watch failure is non-fatal (the library alone is enough to
    /// drive reloads).
    pub fn register_module(
        self: &Arc<Self>,
        host: Arc<dyn ReloadHost>,
        module_id: u64,
        symbolic_name: impl Into<String>,
        library_path: PathBuf,
        manifest_path: Option<PathBuf>,
        auto_reload_enabled: bool,
    ) {
        let symbolic_name = symbolic_name.into();
        let info = ReloadInfo {
            module_id,
            symbolic_name: symbolic_name.clone(),
            library_path: library_path.clone(),
            manifest_path: manifest_path.clone(),
            auto_reload_enabled,
        };

        {
            let mut state = self.state.lock();
            state.by_path.insert(library_path.clone(), module_id);
            if let Some(mp) = &manifest_path {
                state.by_path.insert(mp.clone(), module_id);
            }
            state.by_module.insert(module_id, info);
        }

        let this = self.clone();
        let host_for_lib = host.clone();
        self.watcher.watch(
            library_path,
            Arc::new(move |path, kind| this.on_file_changed(path, kind, host_for_lib.clone())),
        );
        if let Some(mp) = manifest_path {
            let this = self.clone();
            self.watcher.watch(mp, Arc::new(move |path, kind| this.on_file_changed(path, kind, host.clone())));
        }
    }

    pub fn unregister_module(&self, module_id: u64) {
        let mut state = self.state.lock();
        if let Some(info) = state.by_module.remove(&module_id) {
            state.by_path.remove(&info.library_path);
            if let Some(mp) = &info.manifest_path {
                state.by_path.remove(mp);
            }
            drop(state);
            self.watcher.unwatch(&info.library_path);
            if let Some(mp) = &info.manifest_path {
                self.watcher.unwatch(mp);
            }
        }
    }

    pub fn set_auto_reload(&self, module_id: u64, enabled: bool) {
        if let Some(info) = self.state.lock().by_module.get_mut(&module_id) {
            info.auto_reload_enabled = enabled;
        }
    }

    pub fn manifest_path_for(&self, module_id: u64) -> Option<PathBuf> {
        self.state.lock().by_module.get(&module_id).and_then(|i| i.manifest_path.clone())
    }

    fn on_file_changed(&self, path: &Path, kind: FileChangeKind, host: Arc<dyn ReloadHost>) {
        // DELETED is intentionally ignored: atomic-replace editor/build
        // patterns (write-new, rename-over) produce a delete then a
        // create, and reacting to the delete would reload against a
        // momentarily-missing file.
        if kind == FileChangeKind::Deleted {
            return;
        }

        let reload = {
            let state = self.state.lock();
            let module_id = match state.by_path.get(path) {
                Some(&id) => id,
                None => return,
            };
            let info = match state.by_module.get(&module_id) {
                Some(info) => info.clone(),
                None => return,
            };
            // Copy out everything needed, then drop the lock (scope exit)
            // before calling back into the host.
            info
        };

        if !self.global_enabled() || !reload.auto_reload_enabled {
            return;
        }

        info!(module = %reload.symbolic_name, path = %path.display(), "triggering module reload");
        host.reload_module(reload.module_id, &reload.library_path);
    }
}

impl Drop for ModuleReloader {
    fn drop(&mut self) {
        if !self.state.lock().by_module.is_empty() {
            warn!("dropping ModuleReloader with modules still registered");
        }
    }
}
