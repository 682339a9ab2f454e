//! The run-time binding of a native handle to a descriptor.
//!
//! A [`WrappedObject`] owns its handle exclusively; dropping the wrapper
//! releases the handle exactly once.  The descriptor is shared with the
//! registry, never owned.

use std::sync::Arc;

use crate::capability::NativeHandle;
use crate::descriptor::ClassDescriptor;
use crate::dynamic::DynamicNameTable;
use crate::errors::{DispatchError, Member};
use crate::identifier::{DispId, Identifier};

pub struct WrappedObject<H: NativeHandle> {
    handle: H,
    descriptor: Option<Arc<ClassDescriptor>>,
    names: DynamicNameTable,
}

impl<H: NativeHandle> WrappedObject<H> {
    pub fn new(handle: H, descriptor: Option<Arc<ClassDescriptor>>) -> Self {
        Self {
            handle,
            descriptor,
            names: DynamicNameTable::new(),
        }
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn descriptor(&self) -> Option<&Arc<ClassDescriptor>> {
        self.descriptor.as_ref()
    }

    pub fn identifier(&self) -> Option<Identifier> {
        self.descriptor.as_ref().map(|d| d.identifier())
    }

    pub fn names(&self) -> &DynamicNameTable {
        &self.names
    }

    pub(crate) fn names_mut(&mut self) -> &mut DynamicNameTable {
        &mut self.names
    }

    pub fn has_dynamic_hook(&self) -> bool {
        self.handle.dynamic_hook().is_some()
    }

    /// Resolve `name`: the descriptor first; then, only for objects that serve
    /// arbitrary names through a dynamic hook, the instance's name table,
    /// allocating on first sight.
    pub fn resolve_name(&mut self, name: &str) -> Result<DispId, DispatchError> {
        if let Some(id) = self.descriptor.as_ref().and_then(|d| d.id_of(name)) {
            return Ok(id);
        }
        // Without a hook the preseeded sentinel names are not members.
        if !self.has_dynamic_hook() {
            return Err(DispatchError::MemberNotFound(Member::Name(name.to_owned())));
        }
        if let Some(id) = self.names.lookup(name) {
            return Ok(id);
        }
        let descriptor = self.descriptor.as_deref();
        Ok(self.names.get_or_assign_avoiding(name, |id| {
            descriptor.is_some_and(|d| d.member_name(id).is_some())
        }))
    }
}

impl<H: NativeHandle> Drop for WrappedObject<H> {
    fn drop(&mut self) {
        match self.identifier() {
            Some(id) => log::trace!("WrappedObject: releasing {id}"),
            None => log::trace!("WrappedObject: releasing dynamic object"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::{DISPID_EVALUATE, DISPID_NEWENUM, DISPID_VALUE};
    use crate::testing::{sample_descriptor, HookObject, StaticOnly};
    use crate::value::VarType;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_descriptor_consulted_before_dynamic_allocation() {
        let (handle, _) = HookObject::new();
        let mut obj = WrappedObject::new(handle, Some(Arc::new(sample_descriptor())));
        assert_eq!(obj.resolve_name("VISIBLE").unwrap(), 1001);
        assert!(obj.names().allocated().is_empty());
        let extra = obj.resolve_name("Extra").unwrap();
        assert!(extra >= crate::identifier::DYNAMIC_DISPID_BASE);
        assert_eq!(obj.resolve_name("extra").unwrap(), extra);
        let second = obj.resolve_name("Another").unwrap();
        assert!(obj.descriptor().unwrap().member_name(second).is_none());
    }

    #[test]
    fn test_unknown_name_without_hook() {
        let (handle, _) = StaticOnly::new();
        let mut obj = WrappedObject::new(handle, Some(Arc::new(sample_descriptor())));
        assert!(obj.resolve_name("Nope").unwrap_err().is_member_not_found());
    }

    #[test]
    fn test_sentinel_names_need_declaration_or_hook() {
        let descriptor = ClassDescriptor::builder(Identifier::from_u128(0x51), "Plain")
            .property("Visible", 1, VarType::Bool)
            .build()
            .unwrap();
        let (handle, _) = StaticOnly::new();
        let mut obj = WrappedObject::new(handle, Some(Arc::new(descriptor)));
        for name in ["_NewEnum", "_value_", "_Evaluate"] {
            assert!(obj.resolve_name(name).unwrap_err().is_member_not_found(), "{name}");
        }
        assert!(obj.names().allocated().is_empty());
    }

    #[test]
    fn test_declared_sentinel_resolves_without_hook() {
        let (handle, _) = StaticOnly::new();
        let mut obj = WrappedObject::new(handle, Some(Arc::new(sample_descriptor())));
        assert_eq!(obj.resolve_name("_newenum").unwrap(), DISPID_NEWENUM);
        assert!(obj.resolve_name("_value_").unwrap_err().is_member_not_found());
    }

    #[test]
    fn test_hook_object_gets_sentinel_ids() {
        let (handle, _) = HookObject::new();
        let mut obj = WrappedObject::new(handle, None);
        assert_eq!(obj.resolve_name("_Evaluate").unwrap(), DISPID_EVALUATE);
        assert_eq!(obj.resolve_name("_NEWENUM").unwrap(), DISPID_NEWENUM);
        assert_eq!(obj.resolve_name("_value_").unwrap(), DISPID_VALUE);
        assert!(obj.names().is_empty());
    }

    #[test]
    fn test_handle_released_once_on_drop() {
        let (handle, _) = StaticOnly::new();
        let releases = handle.releases();
        drop(WrappedObject::new(handle, None));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }
}
