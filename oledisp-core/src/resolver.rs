//! Picks the binding for a live object at run time.
//!
//! Resolution order for [`ClassResolver::resolve`]:
//!
//! 1. ask the object for its current identifier (failures are soft),
//! 2. prefer that identifier over the caller's hint,
//! 3. look it up in the [`ClassRegistry`],
//! 4. on a miss, run the [`DescriptorGenerator`] once, register the result
//!    and look up again,
//! 5. otherwise resolve to "no descriptor" and let the caller go dynamic.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::capability::{DescriptorGenerator, NativeHandle};
use crate::descriptor::ClassDescriptor;
use crate::errors::DispatchError;
use crate::identifier::Identifier;
use crate::object::WrappedObject;
use crate::policy::DispatchPolicy;
use crate::registry::ClassRegistry;

/// Resolver behavior knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverOptions {
    /// Run the generator when the registry has no descriptor.
    pub generate_on_demand: bool,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            generate_on_demand: true,
        }
    }
}

impl ResolverOptions {
    pub fn from_json(json: &str) -> Result<Self, DispatchError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Outcome of a resolution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// The identifier that was effectively used, if any was known.
    pub identifier: Option<Identifier>,
    pub descriptor: Option<Arc<ClassDescriptor>>,
}

impl Resolution {
    pub fn is_static(&self) -> bool {
        self.descriptor.is_some()
    }
}

pub struct ClassResolver<'r> {
    registry: &'r ClassRegistry,
    generator: Option<Box<dyn DescriptorGenerator>>,
    options: ResolverOptions,
}

impl<'r> ClassResolver<'r> {
    pub fn new(registry: &'r ClassRegistry) -> Self {
        Self {
            registry,
            generator: None,
            options: ResolverOptions::default(),
        }
    }

    pub fn with_generator(mut self, generator: impl DescriptorGenerator + 'static) -> Self {
        self.generator = Some(Box::new(generator));
        self
    }

    pub fn with_options(mut self, options: ResolverOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(&self) -> &'r ClassRegistry {
        self.registry
    }

    pub fn options(&self) -> &ResolverOptions {
        &self.options
    }

    /// Determine the best binding for `handle`.
    pub fn resolve(&self, handle: &dyn NativeHandle, hint: Option<Identifier>) -> Resolution {
        let discovered = match handle.discover_identifier() {
            Ok(found) => found,
            Err(e) => {
                log::debug!("ClassResolver: identifier discovery failed: {e}");
                None
            }
        };

        let identifier = match (discovered, hint) {
            (Some(found), Some(hinted)) if found != hinted => {
                log::debug!("ClassResolver: object reports {found}, ignoring hint {hinted}");
                Some(found)
            }
            (Some(found), _) => Some(found),
            (None, hinted) => hinted,
        };

        let mut descriptor = identifier.and_then(|id| self.lookup_or_generate(&id));

        // A discovered identifier with no binding still leaves the hint usable.
        if descriptor.is_none() && discovered.is_some() && hint != discovered {
            if let Some(hinted) = hint {
                descriptor = self.lookup_or_generate(&hinted);
                if descriptor.is_some() {
                    return Resolution {
                        identifier: Some(hinted),
                        descriptor,
                    };
                }
            }
        }

        Resolution {
            identifier,
            descriptor,
        }
    }

    /// Registry lookup with at most one generation attempt on a miss.
    pub fn lookup_or_generate(&self, identifier: &Identifier) -> Option<Arc<ClassDescriptor>> {
        if let Some(found) = self.registry.lookup(identifier) {
            return Some(found);
        }
        if !self.options.generate_on_demand {
            return None;
        }
        let generator = self.generator.as_ref()?;
        match generator.generate(identifier) {
            Ok(descriptor) => {
                log::debug!(
                    "ClassResolver: generated '{}' for {identifier}",
                    descriptor.name()
                );
                self.registry.register(*identifier, descriptor);
                self.registry.lookup(identifier)
            }
            Err(e) => {
                log::debug!("ClassResolver: {e}");
                None
            }
        }
    }

    /// Resolve and bind in one step: static when a descriptor is found,
    /// dynamic otherwise.
    pub fn dispatch<H: NativeHandle>(
        &self,
        handle: H,
        hint: Option<Identifier>,
    ) -> Result<DispatchPolicy<H>, DispatchError> {
        let resolution = self.resolve(&handle, hint);
        DispatchPolicy::bound(WrappedObject::new(handle, resolution.descriptor))
    }

    /// Descriptor of `class`'s default event source.
    pub fn event_descriptor(&self, class: &ClassDescriptor) -> Option<Arc<ClassDescriptor>> {
        let source = class.default_source()?;
        self.lookup_or_generate(&source)
    }

    /// Like [`event_descriptor`](Self::event_descriptor), starting from a
    /// class identifier.
    pub fn event_descriptor_for(&self, class: &Identifier) -> Option<Arc<ClassDescriptor>> {
        let descriptor = self.lookup_or_generate(class)?;
        self.event_descriptor(&descriptor)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Binding, Policy};
    use crate::testing::{
        sample_descriptor, sample_events_descriptor, CountingGenerator, HookObject,
        ScriptedObject, APP_EVENTS_ID, APP_ID,
    };
    use std::sync::atomic::Ordering;

    const OTHER_ID: Identifier = Identifier::from_u128(0xABCD);

    #[test]
    fn test_hint_used_when_nothing_discovered() {
        let registry = ClassRegistry::new();
        registry.register_descriptor(sample_descriptor());
        let resolver = ClassResolver::new(&registry);
        let (handle, _) = ScriptedObject::new();
        let res = resolver.resolve(&handle, Some(APP_ID));
        assert_eq!(res.identifier, Some(APP_ID));
        assert!(res.is_static());
    }

    #[test]
    fn test_discovered_identifier_wins_over_hint() {
        let registry = ClassRegistry::new();
        registry.register_descriptor(sample_descriptor());
        let other = ClassDescriptor::builder(OTHER_ID, "Other").build().unwrap();
        registry.register_descriptor(other);
        let resolver = ClassResolver::new(&registry);

        let (handle, _) = ScriptedObject::new();
        let handle = handle.with_identifier(OTHER_ID);
        let res = resolver.resolve(&handle, Some(APP_ID));
        assert_eq!(res.identifier, Some(OTHER_ID));
        assert_eq!(res.descriptor.unwrap().name(), "Other");
    }

    #[test]
    fn test_discovery_failure_is_soft() {
        let registry = ClassRegistry::new();
        registry.register_descriptor(sample_descriptor());
        let resolver = ClassResolver::new(&registry);
        let (handle, _) = ScriptedObject::new();
        let handle = handle.with_discovery_failure();
        let res = resolver.resolve(&handle, Some(APP_ID));
        assert!(res.is_static());
    }

    #[test]
    fn test_generation_runs_once_then_cached() {
        let registry = ClassRegistry::new();
        let generator = CountingGenerator::new(vec![sample_descriptor()]);
        let calls = Arc::clone(&generator.calls);
        let resolver = ClassResolver::new(&registry).with_generator(generator);

        for _ in 0..3 {
            let (handle, _) = ScriptedObject::new();
            assert!(resolver.resolve(&handle, Some(APP_ID)).is_static());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.contains(&APP_ID));
    }

    #[test]
    fn test_generation_failure_absorbed() {
        let registry = ClassRegistry::new();
        let resolver = ClassResolver::new(&registry).with_generator(CountingGenerator::new(vec![]));
        let (handle, _) = ScriptedObject::new();
        let res = resolver.resolve(&handle, Some(APP_ID));
        assert_eq!(res.identifier, Some(APP_ID));
        assert!(res.descriptor.is_none());
    }

    #[test]
    fn test_generation_disabled_by_options() {
        let registry = ClassRegistry::new();
        let generator = CountingGenerator::new(vec![sample_descriptor()]);
        let calls = Arc::clone(&generator.calls);
        let options = ResolverOptions::from_json(r#"{"generate_on_demand": false}"#).unwrap();
        let resolver = ClassResolver::new(&registry)
            .with_generator(generator)
            .with_options(options);
        let (handle, _) = ScriptedObject::new();
        assert!(!resolver.resolve(&handle, Some(APP_ID)).is_static());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_options_default_from_empty_json() {
        assert_eq!(ResolverOptions::from_json("{}").unwrap(), ResolverOptions::default());
    }

    #[test]
    fn test_dispatch_binds_static_or_dynamic() {
        let registry = ClassRegistry::new();
        registry.register_descriptor(sample_descriptor());
        let resolver = ClassResolver::new(&registry);

        let (handle, _) = ScriptedObject::new();
        let mut policy = resolver.dispatch(handle, Some(APP_ID)).unwrap();
        assert!(matches!(policy.binding(), Binding::Static(_)));
        assert_eq!(policy.get_id_for_name("quit").unwrap(), 1003);

        let (handle, _) = HookObject::new();
        let policy = resolver.dispatch(handle, None).unwrap();
        assert_eq!(policy.binding(), Binding::Dynamic);
    }

    #[test]
    fn test_dispatch_without_binding_or_hook_fails() {
        let registry = ClassRegistry::new();
        let resolver = ClassResolver::new(&registry);
        let (handle, _) = ScriptedObject::new();
        let err = resolver.dispatch(handle, None).err().expect("must fail");
        assert!(matches!(err, DispatchError::PolicyPrecondition(_)));
    }

    #[test]
    fn test_event_descriptor_generated_on_demand() {
        let registry = ClassRegistry::new();
        registry.register_descriptor(sample_descriptor());
        let resolver = ClassResolver::new(&registry)
            .with_generator(CountingGenerator::new(vec![sample_events_descriptor()]));
        let events = resolver.event_descriptor_for(&APP_ID).unwrap();
        assert_eq!(events.identifier(), APP_EVENTS_ID);
        assert!(resolver.event_descriptor_for(&OTHER_ID).is_none());
    }
}
