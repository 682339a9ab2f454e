//! Process-wide identifier → descriptor registry.
//!
//! [`ClassRegistry`] maps an [`Identifier`] to the [`ClassDescriptor`]
//! generated for it.  Lookups never fail: a miss is `None` so callers can pick
//! the next resolution strategy.
//!
//! # Thread safety
//!
//! The map is wrapped in a `parking_lot::RwLock`; it is the only structure in
//! this crate meant to be shared across instances and threads.  A global
//! instance lives behind a `OnceLock` (see [`ClassRegistry::global`]).

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::constants::Constants;
use crate::descriptor::ClassDescriptor;
use crate::identifier::Identifier;
use crate::library::TypeLibrary;

// ---------------------------------------------------------------------------
// Singleton
// ---------------------------------------------------------------------------

static GLOBAL: OnceLock<ClassRegistry> = OnceLock::new();

/// Shared store of generated class descriptors plus their constants.
#[derive(Debug, Default)]
pub struct ClassRegistry {
    classes: RwLock<HashMap<Identifier, Arc<ClassDescriptor>>>,
    constants: Constants,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry, created on first use.
    pub fn global() -> &'static ClassRegistry {
        GLOBAL.get_or_init(ClassRegistry::new)
    }

    /// Store `descriptor` under `identifier`.
    ///
    /// Re-registering an equal descriptor keeps the existing `Arc`; a
    /// conflicting one replaces it (later wins).
    pub fn register(
        &self,
        identifier: Identifier,
        descriptor: ClassDescriptor,
    ) -> Arc<ClassDescriptor> {
        let mut classes = self.classes.write();
        if let Some(existing) = classes.get(&identifier) {
            if **existing == descriptor {
                return Arc::clone(existing);
            }
            log::warn!(
                "ClassRegistry: replacing descriptor for {identifier} ('{}' -> '{}')",
                existing.name(),
                descriptor.name()
            );
        }
        let descriptor = Arc::new(descriptor);
        classes.insert(identifier, Arc::clone(&descriptor));
        descriptor
    }

    /// Register a descriptor under its own identifier.
    pub fn register_descriptor(&self, descriptor: ClassDescriptor) -> Arc<ClassDescriptor> {
        self.register(descriptor.identifier(), descriptor)
    }

    /// Register every class of a type library and merge its constants.
    ///
    /// Returns the number of classes registered.
    pub fn register_library(&self, library: TypeLibrary) -> usize {
        let TypeLibrary {
            name,
            classes,
            constants,
        } = library;
        let count = classes.len();
        for descriptor in classes {
            self.register_descriptor(descriptor);
        }
        if !constants.is_empty() {
            self.constants.add_table(constants);
        }
        log::debug!("ClassRegistry: loaded library '{name}' ({count} classes)");
        count
    }

    pub fn lookup(&self, identifier: &Identifier) -> Option<Arc<ClassDescriptor>> {
        self.classes.read().get(identifier).cloned()
    }

    pub fn contains(&self, identifier: &Identifier) -> bool {
        self.classes.read().contains_key(identifier)
    }

    /// Registered identifiers in ascending order.
    pub fn identifiers(&self) -> Vec<Identifier> {
        let mut ids: Vec<Identifier> = self.classes.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.classes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.read().is_empty()
    }

    /// Named constants contributed by registered libraries.
    pub fn constants(&self) -> &Constants {
        &self.constants
    }

    /// Drop every descriptor and constant table.
    pub fn clear(&self) {
        self.classes.write().clear();
        self.constants.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::VarType;
    use rayon::prelude::*;

    fn descriptor(n: u128, name: &str) -> ClassDescriptor {
        ClassDescriptor::builder(Identifier::from_u128(n), name)
            .method("Run", 1000, vec![], VarType::Void)
            .build()
            .unwrap()
    }

    #[test]
    fn test_lookup_after_register() {
        let reg = ClassRegistry::new();
        let d = descriptor(1, "One");
        reg.register(d.identifier(), d.clone());
        assert_eq!(*reg.lookup(&Identifier::from_u128(1)).unwrap(), d);
    }

    #[test]
    fn test_lookup_miss_is_none() {
        let reg = ClassRegistry::new();
        assert!(reg.lookup(&Identifier::from_u128(42)).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_reregister_equal_keeps_instance() {
        let reg = ClassRegistry::new();
        let first = reg.register_descriptor(descriptor(1, "One"));
        let second = reg.register_descriptor(descriptor(1, "One"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_conflicting_register_later_wins() {
        let reg = ClassRegistry::new();
        reg.register_descriptor(descriptor(1, "One"));
        reg.register(Identifier::from_u128(1), descriptor(1, "Replacement"));
        assert_eq!(reg.lookup(&Identifier::from_u128(1)).unwrap().name(), "Replacement");
    }

    #[test]
    fn test_lookup_survives_concurrent_registration() {
        let reg = ClassRegistry::new();
        let target = descriptor(7, "Target");
        reg.register_descriptor(target.clone());

        (100..600u128).into_par_iter().for_each(|n| {
            reg.register_descriptor(descriptor(n, "Other"));
            assert_eq!(*reg.lookup(&Identifier::from_u128(7)).unwrap(), target);
        });

        assert_eq!(reg.len(), 501);
        assert_eq!(*reg.lookup(&Identifier::from_u128(7)).unwrap(), target);
    }

    #[test]
    fn test_identifiers_sorted_and_clear() {
        let reg = ClassRegistry::new();
        reg.register_descriptor(descriptor(3, "C"));
        reg.register_descriptor(descriptor(1, "A"));
        assert_eq!(
            reg.identifiers(),
            vec![Identifier::from_u128(1), Identifier::from_u128(3)]
        );
        reg.clear();
        assert!(reg.is_empty());
    }
}
