//! Self-registration table exported by module archives
//!
//! An archive lists its module candidates by filling a [`RegistrationTable`]
//! from an exported `_sideload_register` function, generated with
//! [`declare_modules!`](crate::declare_modules). The host never inspects the
//! archive any other way.

use std::fmt;
use std::sync::Arc;

use crate::module::{Module, ModuleConstructor, ModuleDescriptor, ModuleResult, ModuleTypeId};

/// API version archives must be built against
pub const SIDELOAD_API_VERSION: u32 = 1;

/// Exported registration function name
pub const REGISTER_SYMBOL: &[u8] = b"_sideload_register";

/// Exported API version function name
pub const API_VERSION_SYMBOL: &[u8] = b"_sideload_api_version";

/// Signature of the exported registration function
pub type RegisterFn = unsafe extern "Rust" fn(&mut RegistrationTable);

/// Signature of the exported API version function
pub type ApiVersionFn = unsafe extern "C" fn() -> u32;

/// One symbol an archive offers as a potential module
///
/// A valid module carries both a descriptor and a constructor. Anything else
/// is reported by the scanner and dropped.
#[derive(Clone)]
pub struct CandidateSymbol {
    pub type_id: ModuleTypeId,
    pub descriptor: Option<ModuleDescriptor>,
    pub constructor: Option<ModuleConstructor>,
}

impl fmt::Debug for CandidateSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CandidateSymbol")
            .field("type_id", &self.type_id)
            .field("descriptor", &self.descriptor)
            .field("has_constructor", &self.constructor.is_some())
            .finish()
    }
}

/// Table filled by an archive's registration function
#[derive(Default, Debug)]
pub struct RegistrationTable {
    candidates: Vec<CandidateSymbol>,
}

impl RegistrationTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module constructed through `Default`
    pub fn module<M: Module + Default>(
        &mut self,
        type_id: impl Into<ModuleTypeId>,
        descriptor: ModuleDescriptor,
    ) -> &mut Self {
        self.register(type_id, descriptor, || Ok(Box::new(M::default()) as Box<dyn Module>))
    }

    /// Register a module with an explicit constructor
    pub fn register<F>(
        &mut self,
        type_id: impl Into<ModuleTypeId>,
        descriptor: ModuleDescriptor,
        constructor: F,
    ) -> &mut Self
    where
        F: Fn() -> ModuleResult<Box<dyn Module>> + Send + Sync + 'static,
    {
        self.push(CandidateSymbol {
            type_id: type_id.into(),
            descriptor: Some(descriptor),
            constructor: Some(Arc::new(constructor)),
        })
    }

    /// Add a raw candidate, possibly missing its descriptor or constructor
    pub fn push(&mut self, candidate: CandidateSymbol) -> &mut Self {
        self.candidates.push(candidate);
        self
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn candidates(&self) -> &[CandidateSymbol] {
        &self.candidates
    }

    pub fn into_candidates(self) -> Vec<CandidateSymbol> {
        self.candidates
    }
}

/// Export the registration entry points of a module archive
///
/// ```ignore
/// fn register(table: &mut RegistrationTable) {
///     table.module::<Tracker>("acme::Tracker", ModuleDescriptor::new("Tracker"));
/// }
///
/// sideload_kernel::declare_modules!(register);
/// ```
#[macro_export]
macro_rules! declare_modules {
    ($register:path) => {
        #[unsafe(no_mangle)]
        pub extern "Rust" fn _sideload_register(
            table: &mut $crate::registration::RegistrationTable,
        ) {
            $register(table)
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn _sideload_api_version() -> u32 {
            $crate::registration::SIDELOAD_API_VERSION
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::any::Any;

    #[derive(Default)]
    struct Noop;

    impl Module for Noop {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_table_collects_candidates_in_order() {
        let mut table = RegistrationTable::new();
        table
            .module::<Noop>("acme::A", ModuleDescriptor::new("A"))
            .push(CandidateSymbol {
                type_id: ModuleTypeId::new("acme::Helper"),
                descriptor: None,
                constructor: None,
            });

        assert_eq!(table.len(), 2);
        let candidates = table.into_candidates();
        assert_eq!(candidates[0].type_id.as_str(), "acme::A");
        assert!(candidates[0].constructor.is_some());
        assert!(candidates[1].descriptor.is_none());
    }

    #[test]
    fn test_registered_constructor_builds_module() {
        let mut table = RegistrationTable::new();
        table.module::<Noop>("acme::A", ModuleDescriptor::new("A"));

        let constructor = table.candidates()[0].constructor.clone().unwrap();
        let module = constructor().unwrap();
        assert!(module.as_any().downcast_ref::<Noop>().is_some());
    }
}
