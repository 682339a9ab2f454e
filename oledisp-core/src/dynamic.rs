//! Run-time name allocation and the dynamic fallback policy.
//!
//! [`DynamicNameTable`] hands out sequential dispatch IDs, starting at
//! [`DYNAMIC_DISPID_BASE`], to every case-folded name it has not seen before,
//! and remembers the spelling the name was first seen with.  IDs are never
//! reused within one table.
//!
//! [`DynamicPolicy`] defers every call to the wrapped object's
//! [`DynamicHook`], passing the member *name* rather than an ID.  An object
//! without a hook cannot be wrapped at all; that is checked at construction.

use std::collections::{BTreeMap, HashMap};

use crate::capability::{DynamicHook, NativeHandle};
use crate::errors::{DispatchError, Member, NativeError, DISP_E_MEMBERNOTFOUND, DISP_E_UNKNOWNNAME};
use crate::descriptor::EVALUATE_NAME;
use crate::identifier::{DispId, DISPID_EVALUATE, DISPID_NEWENUM, DISPID_VALUE, DYNAMIC_DISPID_BASE};
use crate::object::WrappedObject;
use crate::policy::Policy;
use crate::request::{DispatchRequest, Target};
use crate::value::Value;

/// Name the default member is dispatched under.
pub const VALUE_NAME: &str = "_value_";
/// Name an enumerator request is dispatched under.
pub const NEWENUM_NAME: &str = "_NewEnum";

// ---------------------------------------------------------------------------
// Name table
// ---------------------------------------------------------------------------

/// Per-instance name ↔ ID cache that only ever grows.
#[derive(Debug, Clone)]
pub struct DynamicNameTable {
    next: DispId,
    name_to_id: HashMap<String, DispId>,
    id_to_name: BTreeMap<DispId, String>,
}

impl Default for DynamicNameTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamicNameTable {
    pub fn new() -> Self {
        let mut table = Self {
            next: DYNAMIC_DISPID_BASE,
            name_to_id: HashMap::new(),
            id_to_name: BTreeMap::new(),
        };
        let sentinels = [
            (DISPID_VALUE, VALUE_NAME),
            (DISPID_NEWENUM, NEWENUM_NAME),
            (DISPID_EVALUATE, EVALUATE_NAME),
        ];
        for (id, name) in sentinels {
            table.name_to_id.insert(name.to_lowercase(), id);
            table.id_to_name.insert(id, name.to_owned());
        }
        table
    }

    /// Existing ID for `name`, without allocating.
    pub fn lookup(&self, name: &str) -> Option<DispId> {
        self.name_to_id.get(&name.to_lowercase()).copied()
    }

    /// ID for `name`, allocating the next ordinal on first sight.
    pub fn get_or_assign(&mut self, name: &str) -> DispId {
        self.get_or_assign_avoiding(name, |_| false)
    }

    /// Like [`get_or_assign`](Self::get_or_assign), skipping any ordinal for
    /// which `reserved` is true.
    pub fn get_or_assign_avoiding(&mut self, name: &str, reserved: impl Fn(DispId) -> bool) -> DispId {
        let folded = name.to_lowercase();
        if let Some(&id) = self.name_to_id.get(&folded) {
            return id;
        }
        while reserved(self.next) {
            self.next += 1;
        }
        let id = self.next;
        self.next += 1;
        self.name_to_id.insert(folded, id);
        self.id_to_name.insert(id, name.to_owned());
        id
    }

    /// Name as first seen for `id`.
    pub fn name_of(&self, id: DispId) -> Option<&str> {
        self.id_to_name.get(&id).map(String::as_str)
    }

    /// IDs allocated at run time, ascending.
    pub fn allocated(&self) -> Vec<DispId> {
        self.id_to_name
            .range(DYNAMIC_DISPID_BASE..)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.allocated().len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_name.range(DYNAMIC_DISPID_BASE..).next().is_none()
    }
}

/// Map a hook failure to the caller-facing taxonomy: "unknown name" codes
/// become [`DispatchError::MemberNotFound`], everything else passes through.
pub(crate) fn hook_error(name: &str, err: NativeError) -> DispatchError {
    if err.code == DISP_E_MEMBERNOTFOUND || err.code == DISP_E_UNKNOWNNAME {
        DispatchError::MemberNotFound(Member::Name(name.to_owned()))
    } else {
        DispatchError::NativeCallFailed(err)
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Policy that resolves every member at call time through the object's hook.
pub struct DynamicPolicy<H: NativeHandle> {
    object: WrappedObject<H>,
}

impl<H: NativeHandle> DynamicPolicy<H> {
    /// Wrap `object`; fails with `PolicyPrecondition` if it has no hook.
    pub fn new(object: WrappedObject<H>) -> Result<Self, DispatchError> {
        if object.handle().dynamic_hook().is_none() {
            return Err(DispatchError::PolicyPrecondition(
                "object does not support the dynamic policy (no dynamic dispatch hook)".into(),
            ));
        }
        Ok(Self { object })
    }

    pub fn object(&self) -> &WrappedObject<H> {
        &self.object
    }

    pub fn into_object(self) -> WrappedObject<H> {
        self.object
    }

    pub fn get_or_assign_id(&mut self, name: &str) -> DispId {
        self.object.names_mut().get_or_assign(name)
    }

    /// Forward a call by ID to the hook under the member's recorded name.
    pub fn invoke_id(
        &self,
        id: DispId,
        request: &DispatchRequest,
        args: &[Value],
    ) -> Result<Value, DispatchError> {
        let name = self
            .object
            .names()
            .name_of(id)
            .ok_or(DispatchError::MemberNotFound(Member::Id(id)))?;
        let hook: &dyn DynamicHook = self.object.handle().dynamic_hook().ok_or_else(|| {
            DispatchError::PolicyPrecondition("dynamic dispatch hook disappeared".into())
        })?;
        log::trace!("DynamicPolicy: {name} ({id}) flags=0x{:x}", request.flags.bits());
        hook.dynamic_invoke(name, request.flags, args)
            .map_err(|e| hook_error(name, e))
    }
}

impl<H: NativeHandle> Policy for DynamicPolicy<H> {
    fn get_id_for_name(&mut self, name: &str) -> Result<DispId, DispatchError> {
        Ok(self.get_or_assign_id(name))
    }

    fn invoke(&mut self, request: DispatchRequest) -> Result<Value, DispatchError> {
        request.validate_flags()?;
        let id = match &request.target {
            Target::Default => DISPID_VALUE,
            Target::Id(id) => *id,
            Target::Name(name) => self.get_or_assign_id(name),
        };
        self.invoke_id(id, &request, &request.args)
    }

    fn member_name(&self, id: DispId) -> Result<String, DispatchError> {
        self.object
            .names()
            .name_of(id)
            .map(str::to_owned)
            .ok_or(DispatchError::MemberNotFound(Member::Id(id)))
    }

    fn dispids(&self) -> Vec<DispId> {
        self.object.names().allocated()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::InvokeFlags;
    use crate::testing::{HookObject, StaticOnly};

    #[test]
    fn test_distinct_names_get_distinct_ids_above_base() {
        let mut t = DynamicNameTable::new();
        let a = t.get_or_assign("Visible");
        let b = t.get_or_assign("Caption");
        assert_ne!(a, b);
        assert!(a >= DYNAMIC_DISPID_BASE && b >= DYNAMIC_DISPID_BASE);
    }

    #[test]
    fn test_assignment_is_idempotent_and_case_insensitive() {
        let mut t = DynamicNameTable::new();
        let a = t.get_or_assign("Visible");
        assert_eq!(t.get_or_assign("Visible"), a);
        assert_eq!(t.get_or_assign("VISIBLE"), a);
        assert_eq!(t.name_of(a), Some("Visible"));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_sequential_from_base() {
        let mut t = DynamicNameTable::new();
        assert!(t.is_empty());
        assert_eq!(t.get_or_assign("a"), DYNAMIC_DISPID_BASE);
        assert_eq!(t.get_or_assign("b"), DYNAMIC_DISPID_BASE + 1);
        assert_eq!(t.allocated(), vec![DYNAMIC_DISPID_BASE, DYNAMIC_DISPID_BASE + 1]);
    }

    #[test]
    fn test_allocation_skips_reserved_ids() {
        let mut t = DynamicNameTable::new();
        let id = t.get_or_assign_avoiding("Extra", |id| id < DYNAMIC_DISPID_BASE + 2);
        assert_eq!(id, DYNAMIC_DISPID_BASE + 2);
        assert_eq!(t.get_or_assign("Other"), DYNAMIC_DISPID_BASE + 3);
    }

    #[test]
    fn test_len_and_is_empty_agree_after_skipped_ids() {
        let mut t = DynamicNameTable::new();
        assert!(t.is_empty());
        assert_eq!(t.len(), 0);
        t.get_or_assign_avoiding("Extra", |id| id < DYNAMIC_DISPID_BASE + 5);
        assert!(!t.is_empty());
        assert_eq!(t.len(), 1);
        assert_eq!(t.allocated(), vec![DYNAMIC_DISPID_BASE + 5]);
    }

    #[test]
    fn test_sentinel_names_preseeded() {
        let t = DynamicNameTable::new();
        assert_eq!(t.name_of(DISPID_VALUE), Some(VALUE_NAME));
        assert_eq!(t.name_of(DISPID_NEWENUM), Some(NEWENUM_NAME));
        assert_eq!(t.lookup("_newenum"), Some(DISPID_NEWENUM));
        assert_eq!(t.lookup("_evaluate"), Some(DISPID_EVALUATE));
        assert!(t.is_empty());
    }

    #[test]
    fn test_construction_without_hook_fails_eagerly() {
        let (handle, calls) = StaticOnly::new();
        let err = DynamicPolicy::new(WrappedObject::new(handle, None))
            .err()
            .expect("construction must fail");
        assert!(matches!(err, DispatchError::PolicyPrecondition(_)));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn test_invoke_forwards_original_case_name() {
        let (handle, log) = HookObject::new();
        let mut policy = DynamicPolicy::new(WrappedObject::new(handle, None)).unwrap();
        let id = policy.get_id_for_name("Caption").unwrap();
        policy.get_id_for_name("CAPTION").unwrap();
        policy
            .invoke(DispatchRequest::new(id, InvokeFlags::PROPERTY_GET, vec![]))
            .unwrap();
        assert_eq!(log.lock().as_slice(), &[("Caption".to_owned(), InvokeFlags::PROPERTY_GET)]);
    }

    #[test]
    fn test_invoke_unknown_id_is_member_not_found() {
        let (handle, _) = HookObject::new();
        let mut policy = DynamicPolicy::new(WrappedObject::new(handle, None)).unwrap();
        let err = policy
            .invoke(DispatchRequest::new(4242, InvokeFlags::METHOD, vec![]))
            .unwrap_err();
        assert!(err.is_member_not_found());
    }

    #[test]
    fn test_default_target_routes_to_value_name() {
        let (handle, log) = HookObject::new();
        let mut policy = DynamicPolicy::new(WrappedObject::new(handle, None)).unwrap();
        policy
            .invoke(DispatchRequest::new(Target::Default, InvokeFlags::METHOD_OR_GET, vec![]))
            .unwrap();
        assert_eq!(log.lock()[0].0, VALUE_NAME);
    }

    #[test]
    fn test_hook_unknown_name_maps_to_member_not_found() {
        let (handle, _) = HookObject::new();
        let mut policy = DynamicPolicy::new(WrappedObject::new(handle, None)).unwrap();
        let err = policy.get_member("missing").unwrap_err();
        assert!(err.is_member_not_found());
    }

    #[test]
    fn test_next_dispid_enumerates_allocated() {
        let (handle, _) = HookObject::new();
        let mut policy = DynamicPolicy::new(WrappedObject::new(handle, None)).unwrap();
        let a = policy.get_id_for_name("a").unwrap();
        let b = policy.get_id_for_name("b").unwrap();
        assert_eq!(policy.next_dispid(crate::identifier::DISPID_STARTENUM).unwrap(), Some(a));
        assert_eq!(policy.next_dispid(a).unwrap(), Some(b));
        assert_eq!(policy.next_dispid(b).unwrap(), None);
    }
}
