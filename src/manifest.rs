//! Typed in-memory projection of a module's declaration. The on-disk format
//! is out of scope; any loader that produces a [`ModuleManifest`] with the
//! required fields populated is acceptable.

use serde::{Deserialize, Serialize};

use crate::error::ParseError;
use crate::version::Version;
use crate::version_range::VersionRange;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    pub symbolic_name: String,
    pub range: VersionRange,
    pub optional: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDeclarations {
    #[serde(default)]
    pub provides: Vec<String>,
    #[serde(default)]
    pub requires: Vec<String>,
}

impl Default for ServiceDeclarations {
    fn default() -> Self {
        Self { provides: Vec::new(), requires: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityDeclarations {
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub sandbox_enabled: bool,
}

impl Default for SecurityDeclarations {
    fn default() -> Self {
        Self { permissions: Vec::new(), sandbox_enabled: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub symbolic_name: String,
    pub version: Version,
    pub name: Option<String>,
    pub library: Option<String>,
    pub description: Option<String>,
    pub vendor: Option<String>,
    pub category: Option<String>,
    pub auto_start: bool,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub exported_packages: Vec<String>,
    #[serde(default)]
    pub imported_packages: Vec<String>,
    #[serde(default)]
    pub services: ServiceDeclarations,
    #[serde(default)]
    pub security: SecurityDeclarations,
    /// The raw manifest document this was projected from, retained verbatim
    /// for diagnostics and round-tripping.
    pub raw: serde_json::Value,
}

impl ModuleManifest {
    pub fn builder(symbolic_name: impl Into<String>, version: Version) -> ModuleManifestBuilder {
        ModuleManifestBuilder::new(symbolic_name, version)
    }

    pub fn validate(&self) -> Result<(), ParseError> {
        if self.symbolic_name.is_empty() {
            return Err(ParseError::MissingField("module.symbolic-name"));
        }
        Ok(())
    }

    pub fn required_dependencies(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies.iter().filter(|d| !d.optional)
    }
}

pub struct ModuleManifestBuilder {
    manifest: ModuleManifest,
}

impl ModuleManifestBuilder {
    pub fn new(symbolic_name: impl Into<String>, version: Version) -> Self {
        Self {
            manifest: ModuleManifest {
                symbolic_name: symbolic_name.into(),
                version,
                name: None,
                library: None,
                description: None,
                vendor: None,
                category: None,
                auto_start: false,
                dependencies: Vec::new(),
                exported_packages: Vec::new(),
                imported_packages: Vec::new(),
                services: ServiceDeclarations::default(),
                security: SecurityDeclarations::default(),
                raw: serde_json::Value::Null,
            },
        }
    }

    pub fn library(mut self, path: impl Into<String>) -> Self {
        self.manifest.library = Some(path.into());
        self
    }

    pub fn auto_start(mut self, flag: bool) -> Self {
        self.manifest.auto_start = flag;
        self
    }

    pub fn dependency(mut self, name: impl Into<String>, range: VersionRange, optional: bool) -> Self {
        self.manifest.dependencies.push(Dependency { symbolic_name: name.into(), range, optional });
        self
    }

    pub fn build(self) -> ModuleManifest {
        self.manifest
    }
}
