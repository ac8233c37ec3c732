//! Indexed store of installed modules (spec §4.4): by numeric id and by
//! `(symbolic_name, version)`, with version-range lookup. All operations
//! are serialised by a reader/writer lock; reads run concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::module::Module;
use crate::version_range::VersionRange;

#[derive(Default)]
struct RegistryState {
    by_id: HashMap<u64, Arc<Module>>,
    /// Per symbolic name, kept sorted by version descending so "highest
    /// version" lookups are a simple first-element read.
    by_name: HashMap<String, Vec<Arc<Module>>>,
}

pub struct ModuleRegistry {
    state: RwLock<RegistryState>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self { state: RwLock::new(RegistryState::default()) }
    }

    /// Inserts a module into both indices atomically.
    pub fn register(&self, module: Arc<Module>) {
        let mut state = self.state.write();
        let name = module.symbolic_name();
        state.by_id.insert(module.id(), module.clone());
        let versions = state.by_name.entry(name).or_default();
        versions.push(module);
        versions.sort_by(|a, b| b.manifest().version.cmp(&a.manifest().version));
    }

    /// Removes a module from both indices atomically. Returns the removed
    /// module, if any.
    pub fn unregister(&self, id: u64) -> Option<Arc<Module>> {
        let mut state = self.state.write();
        let module = state.by_id.remove(&id)?;
        let name = module.symbolic_name();
        if let Some(versions) = state.by_name.get_mut(&name) {
            versions.retain(|m| m.id() != id);
            if versions.is_empty() {
                state.by_name.remove(&name);
            }
        }
        Some(module)
    }

    pub fn get(&self, id: u64) -> Option<Arc<Module>> {
        self.state.read().by_id.get(&id).cloned()
    }

    /// Highest version registered under `name`.
    pub fn get_by_name(&self, name: &str) -> Option<Arc<Module>> {
        self.state.read().by_name.get(name).and_then(|v| v.first().cloned())
    }

    pub fn get_exact(&self, name: &str, version: &crate::version::Version) -> Option<Arc<Module>> {
        self.state.read().by_name.get(name)?.iter().find(|m| &m.manifest().version == version).cloned()
    }

    /// Highest version satisfying `range`, ties broken by version (so the
    /// already-descending-sorted list's first match wins).
    pub fn find_compatible(&self, name: &str, range: &VersionRange) -> Option<Arc<Module>> {
        self.state.read().by_name.get(name)?.iter().find(|m| range.includes(&m.manifest().version)).cloned()
    }

    pub fn get_all(&self) -> Vec<Arc<Module>> {
        self.state.read().by_id.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ModuleManifest;
    use crate::module::next_module_id;
    use crate::module_handle::{ActivatorFactory, ModuleHandle};
    use crate::version::Version;
    use std::sync::Arc as StdArc;

    struct NoopFactory;
    impl ActivatorFactory for NoopFactory {
        fn create(&self) -> Result<Box<dyn crate::module::Activator>, crate::error::ModuleException> {
            unimplemented!("registry tests never start a module")
        }
    }

    fn make_module(name: &str, version: Version) -> Arc<Module> {
        let handle = ModuleHandle::in_process(format!("mem://{name}"), StdArc::new(NoopFactory));
        let manifest = ModuleManifest::builder(name, version).build();
        Arc::new(Module::new(next_module_id(), manifest, handle))
    }

    #[test]
    fn register_and_lookup_by_id_and_name() {
        let registry = ModuleRegistry::new();
        let m = make_module("a", Version::new(1, 0, 0));
        let id = m.id();
        registry.register(m);
        assert!(registry.get(id).is_some());
        assert!(registry.get_by_name("a").is_some());
    }

    #[test]
    fn by_name_returns_highest_version() {
        let registry = ModuleRegistry::new();
        registry.register(make_module("a", Version::new(1, 0, 0)));
        registry.register(make_module("a", Version::new(2, 0, 0)));
        let top = registry.get_by_name("a").unwrap();
        assert_eq!(top.manifest().version, Version::new(2, 0, 0));
    }

    #[test]
    fn find_compatible_respects_range() {
        let registry = ModuleRegistry::new();
        registry.register(make_module("a", Version::new(1, 0, 0)));
        registry.register(make_module("a", Version::new(2, 0, 0)));
        let range = VersionRange::parse("[1.0.0,2.0.0)").unwrap();
        let found = registry.find_compatible("a", &range).unwrap();
        assert_eq!(found.manifest().version, Version::new(1, 0, 0));
    }

    #[test]
    fn unregister_removes_from_both_indices() {
        let registry = ModuleRegistry::new();
        let m = make_module("a", Version::new(1, 0, 0));
        let id = m.id();
        registry.register(m);
        registry.unregister(id);
        assert!(registry.get(id).is_none());
        assert!(registry.get_by_name("a").is_none());
        assert_eq!(registry.len(), 0);
    }
}
