//! Descriptor scanner
//!
//! Filters the candidates registered by one archive down to valid modules.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;
use sideload_kernel::registration::CandidateSymbol;
use sideload_kernel::{Module, ModuleConstructor, ModuleDescriptor, ModuleResult, ModuleTypeId};
use tracing::{debug, error, warn};

/// A valid module type found in an archive
///
/// Immutable once scanned.
#[derive(Clone)]
pub struct ModuleClass {
    type_id: ModuleTypeId,
    descriptor: ModuleDescriptor,
    constructor: ModuleConstructor,
}

impl ModuleClass {
    pub fn new(
        type_id: ModuleTypeId,
        descriptor: ModuleDescriptor,
        constructor: ModuleConstructor,
    ) -> Self {
        Self {
            type_id,
            descriptor,
            constructor,
        }
    }

    pub fn type_id(&self) -> &ModuleTypeId {
        &self.type_id
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    /// Display name from the descriptor
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Declared dependencies, in declaration order
    pub fn dependencies(&self) -> &[ModuleTypeId] {
        &self.descriptor.dependencies
    }

    /// Run the no-argument constructor
    pub fn construct(&self) -> ModuleResult<Box<dyn Module>> {
        (self.constructor)()
    }

    /// Serializable summary used for inspection output
    pub fn summary(&self) -> ModuleSummary {
        ModuleSummary {
            type_id: self.type_id.clone(),
            name: self.descriptor.name.clone(),
            description: self.descriptor.description.clone(),
            version: self.descriptor.version.clone(),
            enabled_by_default: self.descriptor.enabled_by_default,
            dependencies: self.descriptor.dependencies.clone(),
        }
    }
}

impl fmt::Debug for ModuleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleClass")
            .field("type_id", &self.type_id)
            .field("name", &self.descriptor.name)
            .field("dependencies", &self.descriptor.dependencies)
            .finish()
    }
}

/// Descriptor data of a scanned module
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleSummary {
    pub type_id: ModuleTypeId,
    pub name: String,
    pub description: String,
    pub version: Option<String>,
    pub enabled_by_default: bool,
    pub dependencies: Vec<ModuleTypeId>,
}

/// Filter candidates down to valid module classes
///
/// Candidates missing either half are logged and dropped; candidates missing
/// both are not module candidates at all and are skipped silently. A type
/// identity registered twice keeps its first registration.
pub fn scan(archive: &str, candidates: Vec<CandidateSymbol>) -> Vec<ModuleClass> {
    let mut seen = HashSet::new();
    let mut classes = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        let CandidateSymbol {
            type_id,
            descriptor,
            constructor,
        } = candidate;

        let (descriptor, constructor) = match (descriptor, constructor) {
            (Some(descriptor), Some(constructor)) => (descriptor, constructor),
            (None, Some(_)) => {
                error!(
                    "{} in {} is a module, but has no module descriptor",
                    type_id, archive
                );
                continue;
            }
            (Some(_), None) => {
                error!(
                    "{} in {} has a module descriptor, but is not a module",
                    type_id, archive
                );
                continue;
            }
            (None, None) => continue,
        };

        if !seen.insert(type_id.clone()) {
            warn!(
                "Duplicate module type {} in {}, keeping the first registration",
                type_id, archive
            );
            continue;
        }

        debug!("Found module {} ({}) in {}", descriptor.name, type_id, archive);
        classes.push(ModuleClass::new(type_id, descriptor, constructor));
    }

    classes
}
