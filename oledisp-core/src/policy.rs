//! The invocation engine: name→ID resolution and ID→behavior routing.
//!
//! [`Policy`] is the `IDispatch`/`IDispatchEx` contract expressed as a trait.
//! [`DispatchPolicy`] is the default implementation; it moves through
//! `Unbound → Bound(descriptor) | Bound(dynamic)` when an object is wrapped
//! and keeps no other state than the object's own ID cache.
//!
//! # Routing with a descriptor
//!
//! | Flags | Behavior |
//! |-------|----------|
//! | method | method table; a miss falls through to get only when the get flag is also set |
//! | get | getter table |
//! | put / put-ref | putter table; a getter-only member is `ReadOnlyMember` |
//!
//! When a member has both a method and a getter entry (the default member
//! is the usual case) and the caller sends method|get, the method wins.
//! A get-only request always goes to the getter.

use std::sync::Arc;

use crate::capability::NativeHandle;
use crate::descriptor::{ClassDescriptor, MemberInfo};
use crate::dynamic::{hook_error, DynamicPolicy};
use crate::errors::{DispatchError, Member};
use crate::identifier::{
    is_sentinel, DispId, Identifier, InvokeFlags, DISPID_STARTENUM, DISPID_VALUE,
};
use crate::object::WrappedObject;
use crate::request::{DispatchRequest, Target};
use crate::value::Value;

/// Hook applied to every argument list before it is routed.  A failure
/// aborts the call.
pub type ArgTransformer = Box<dyn Fn(Vec<Value>) -> Result<Vec<Value>, DispatchError> + Send>;

/// The `IDispatch` / `IDispatchEx` contract.
pub trait Policy {
    fn get_id_for_name(&mut self, name: &str) -> Result<DispId, DispatchError>;

    fn invoke(&mut self, request: DispatchRequest) -> Result<Value, DispatchError>;

    /// Declared (or first-seen) name of a member.
    fn member_name(&self, id: DispId) -> Result<String, DispatchError>;

    /// Every ID this policy can enumerate, ascending.
    fn dispids(&self) -> Vec<DispId>;

    /// `GetIDsOfNames`: only a single member name is supported; named
    /// arguments are rejected.
    fn get_ids_of_names(&mut self, names: &[&str]) -> Result<Vec<DispId>, DispatchError> {
        match names {
            [name] => Ok(vec![self.get_id_for_name(name)?]),
            [] => Err(DispatchError::InvalidRequestShape("no member name given".into())),
            _ => Err(DispatchError::InvalidRequestShape(
                "cannot support member argument names".into(),
            )),
        }
    }

    /// `GetNextDispID`: the ID after `after`, starting from
    /// [`DISPID_STARTENUM`].  `Ok(None)` marks the end.
    fn next_dispid(&self, after: DispId) -> Result<Option<DispId>, DispatchError> {
        let ids: Vec<DispId> = self
            .dispids()
            .into_iter()
            .filter(|id| *id != DISPID_STARTENUM)
            .collect();
        if after == DISPID_STARTENUM {
            return Ok(ids.first().copied());
        }
        match ids.iter().position(|id| *id == after) {
            Some(pos) => Ok(ids.get(pos + 1).copied()),
            None => Err(DispatchError::InvalidRequestShape(format!(
                "dispid {after} is not part of this object"
            ))),
        }
    }

    /// Attribute-style fetch.
    fn get_member(&mut self, name: &str) -> Result<Value, DispatchError> {
        self.invoke(DispatchRequest::get(name))
    }

    /// Attribute-style assignment.
    fn set_member(&mut self, name: &str, value: Value) -> Result<(), DispatchError> {
        self.invoke(DispatchRequest::put(name, value)).map(|_| ())
    }

    fn call_method(&mut self, name: &str, args: Vec<Value>) -> Result<Value, DispatchError> {
        self.invoke(DispatchRequest::method(name, args))
    }
}

// ---------------------------------------------------------------------------
// DispatchPolicy
// ---------------------------------------------------------------------------

enum State<H: NativeHandle> {
    Unbound,
    Static(WrappedObject<H>),
    Dynamic(DynamicPolicy<H>),
}

/// Observable binding state of a [`DispatchPolicy`].
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    Unbound,
    Static(Arc<ClassDescriptor>),
    Dynamic,
}

pub struct DispatchPolicy<H: NativeHandle> {
    state: State<H>,
    arg_transformer: Option<ArgTransformer>,
    extra_interfaces: Vec<Identifier>,
}

impl<H: NativeHandle> Default for DispatchPolicy<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: NativeHandle> DispatchPolicy<H> {
    /// An unbound policy; [`wrap`](Self::wrap) must be called before use.
    pub fn new() -> Self {
        Self {
            state: State::Unbound,
            arg_transformer: None,
            extra_interfaces: Vec::new(),
        }
    }

    /// Create a policy already bound to `object`.
    pub fn bound(object: WrappedObject<H>) -> Result<Self, DispatchError> {
        let mut policy = Self::new();
        policy.wrap(object)?;
        Ok(policy)
    }

    /// Bind to `object`: statically if it carries a descriptor, dynamically
    /// otherwise.  Dynamic binding requires a dynamic hook.
    pub fn wrap(&mut self, object: WrappedObject<H>) -> Result<(), DispatchError> {
        self.state = match object.descriptor() {
            Some(desc) => {
                log::debug!("DispatchPolicy: bound to '{}' {}", desc.name(), desc.identifier());
                State::Static(object)
            }
            None => {
                log::debug!("DispatchPolicy: no descriptor, binding dynamically");
                State::Dynamic(DynamicPolicy::new(object)?)
            }
        };
        Ok(())
    }

    pub fn set_arg_transformer(
        &mut self,
        transformer: impl Fn(Vec<Value>) -> Result<Vec<Value>, DispatchError> + Send + 'static,
    ) {
        self.arg_transformer = Some(Box::new(transformer));
    }

    /// Interfaces the wrapped object claims beyond its descriptor's.
    pub fn add_interfaces(&mut self, iids: impl IntoIterator<Item = Identifier>) {
        for iid in iids {
            if !self.extra_interfaces.contains(&iid) {
                self.extra_interfaces.push(iid);
            }
        }
    }

    pub fn binding(&self) -> Binding {
        match &self.state {
            State::Unbound => Binding::Unbound,
            State::Static(obj) => match obj.descriptor() {
                Some(desc) => Binding::Static(Arc::clone(desc)),
                None => Binding::Dynamic,
            },
            State::Dynamic(_) => Binding::Dynamic,
        }
    }

    pub fn is_bound(&self) -> bool {
        !matches!(self.state, State::Unbound)
    }

    pub fn object(&self) -> Option<&WrappedObject<H>> {
        match &self.state {
            State::Unbound => None,
            State::Static(obj) => Some(obj),
            State::Dynamic(policy) => Some(policy.object()),
        }
    }

    pub fn descriptor(&self) -> Option<&Arc<ClassDescriptor>> {
        self.object().and_then(|o| o.descriptor())
    }

    /// `QueryInterface` answered from the descriptor's declared interfaces
    /// and any added with [`add_interfaces`](Self::add_interfaces).
    pub fn query_interface(&self, iid: &Identifier) -> bool {
        self.extra_interfaces.contains(iid)
            || self
                .descriptor()
                .is_some_and(|d| d.identifier() == *iid || d.interfaces().contains(iid))
    }

    fn unbound() -> DispatchError {
        DispatchError::PolicyPrecondition("policy is not bound to an object".into())
    }

    fn resolve_target(&mut self, target: &Target) -> Result<DispId, DispatchError> {
        match target {
            Target::Default => Ok(DISPID_VALUE),
            Target::Id(id) => Ok(*id),
            Target::Name(name) => self.get_id_for_name(name),
        }
    }
}

impl<H: NativeHandle> Policy for DispatchPolicy<H> {
    fn get_id_for_name(&mut self, name: &str) -> Result<DispId, DispatchError> {
        match &mut self.state {
            State::Unbound => Err(Self::unbound()),
            State::Static(obj) => obj.resolve_name(name),
            State::Dynamic(policy) => Ok(policy.get_or_assign_id(name)),
        }
    }

    fn invoke(&mut self, mut request: DispatchRequest) -> Result<Value, DispatchError> {
        if let Some(transform) = &self.arg_transformer {
            request.args = transform(std::mem::take(&mut request.args))?;
        }
        request.validate_flags()?;
        let id = self.resolve_target(&request.target)?;

        match &self.state {
            State::Unbound => Err(Self::unbound()),
            State::Static(obj) => invoke_static(obj, id, &request),
            State::Dynamic(policy) => policy.invoke_id(id, &request, &request.args),
        }
    }

    fn member_name(&self, id: DispId) -> Result<String, DispatchError> {
        match &self.state {
            State::Unbound => Err(Self::unbound()),
            State::Static(obj) => obj
                .descriptor()
                .and_then(|d| d.member_name(id))
                .or_else(|| obj.names().name_of(id))
                .map(str::to_owned)
                .ok_or(DispatchError::MemberNotFound(Member::Id(id))),
            State::Dynamic(policy) => policy.member_name(id),
        }
    }

    fn dispids(&self) -> Vec<DispId> {
        match &self.state {
            State::Unbound => Vec::new(),
            State::Static(obj) => {
                let mut ids = obj.descriptor().map(|d| d.dispids()).unwrap_or_default();
                ids.extend(obj.names().allocated());
                ids.sort_unstable();
                ids.dedup();
                ids
            }
            State::Dynamic(policy) => policy.dispids(),
        }
    }
}

/// Route a resolved request through the descriptor's dispatch tables.
fn invoke_static<H: NativeHandle>(
    obj: &WrappedObject<H>,
    id: DispId,
    request: &DispatchRequest,
) -> Result<Value, DispatchError> {
    let Some(desc) = obj.descriptor() else {
        return Err(DispatchError::PolicyPrecondition("static binding without descriptor".into()));
    };

    if desc.member_name(id).is_none() {
        return invoke_allocated(obj, id, request);
    }

    let flags = request.flags;
    let args = request.args.clone();

    if flags.is_put() {
        let put_flags = flags & (InvokeFlags::PROPERTY_PUT | InvokeFlags::PROPERTY_PUTREF);
        return match desc.putter(id) {
            Some(info) => call_native(obj, id, put_flags, info, args).map(|_| Value::Empty),
            None => match desc.getter(id) {
                Some(getter) => Err(DispatchError::ReadOnlyMember(Member::Name(getter.name.clone()))),
                None => Err(DispatchError::MemberNotFound(Member::Id(id))),
            },
        };
    }

    if flags.contains(InvokeFlags::METHOD) {
        if let Some(info) = desc.method(id) {
            return call_native(obj, id, InvokeFlags::METHOD, info, args);
        }
        if !flags.contains(InvokeFlags::PROPERTY_GET) {
            return Err(DispatchError::MemberNotFound(Member::Id(id)));
        }
    }

    if flags.contains(InvokeFlags::PROPERTY_GET) {
        return match desc.getter(id) {
            Some(info) => call_native(obj, id, InvokeFlags::PROPERTY_GET, info, args),
            None => Err(DispatchError::MemberNotFound(Member::Id(id))),
        };
    }

    Err(DispatchError::InvalidRequestShape(format!(
        "invalid wFlags 0x{:x}",
        flags.bits()
    )))
}

/// A member the descriptor does not know: either a sentinel or a name that
/// was allocated on this instance and is served through the dynamic hook.
fn invoke_allocated<H: NativeHandle>(
    obj: &WrappedObject<H>,
    id: DispId,
    request: &DispatchRequest,
) -> Result<Value, DispatchError> {
    let not_found = || DispatchError::MemberNotFound(Member::Id(id));
    let hook = obj.handle().dynamic_hook().ok_or_else(not_found)?;
    let name = obj.names().name_of(id).ok_or_else(not_found)?;
    if is_sentinel(id) {
        log::trace!("DispatchPolicy: sentinel {id} not in descriptor, trying dynamic hook");
    }
    hook.dynamic_invoke(name, request.flags, &request.args)
        .map_err(|e| hook_error(name, e))
}

fn call_native<H: NativeHandle>(
    obj: &WrappedObject<H>,
    id: DispId,
    flags: InvokeFlags,
    info: &MemberInfo,
    args: Vec<Value>,
) -> Result<Value, DispatchError> {
    let args = info.coerce_args(args)?;
    let result = obj.handle().invoke_native(id, flags, &args)?;
    info.coerce_result(result)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::{DISPID_NEWENUM, DYNAMIC_DISPID_BASE};
    use crate::testing::{sample_descriptor, CallLog, HookObject, ScriptedObject, StaticOnly};
    use crate::value::VarType;

    fn bound_scripted() -> (DispatchPolicy<ScriptedObject>, CallLog) {
        let (handle, calls) = ScriptedObject::new();
        let obj = WrappedObject::new(handle, Some(Arc::new(sample_descriptor())));
        (DispatchPolicy::bound(obj).unwrap(), calls)
    }

    #[test]
    fn test_unbound_policy_rejects_calls() {
        let mut policy: DispatchPolicy<StaticOnly> = DispatchPolicy::new();
        assert_eq!(policy.binding(), Binding::Unbound);
        let err = policy.invoke(DispatchRequest::get("Visible")).unwrap_err();
        assert!(matches!(err, DispatchError::PolicyPrecondition(_)));
    }

    #[test]
    fn test_get_id_for_name_case_insensitive() {
        let (mut policy, _) = bound_scripted();
        assert_eq!(policy.get_id_for_name("visible").unwrap(), 1001);
        assert_eq!(policy.get_id_for_name("Visible").unwrap(), 1001);
        assert_eq!(policy.get_id_for_name("_NEWENUM").unwrap(), DISPID_NEWENUM);
    }

    #[test]
    fn test_method_call_passes_args_positionally() {
        let (mut policy, calls) = bound_scripted();
        policy
            .call_method("Move", vec![Value::Int(3), Value::Str("x".into())])
            .unwrap();
        let log = calls.lock();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, 1004);
        assert_eq!(log[0].1, InvokeFlags::METHOD);
        assert_eq!(log[0].2, vec![Value::Int(3), Value::Str("x".into())]);
    }

    #[test]
    fn test_put_on_readonly_is_readonly_not_missing() {
        let (mut policy, calls) = bound_scripted();
        let err = policy.set_member("Count", Value::Int(5)).unwrap_err();
        assert!(matches!(err, DispatchError::ReadOnlyMember(_)));
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn test_put_on_unknown_is_member_not_found() {
        let (mut policy, _) = bound_scripted();
        let err = policy
            .invoke(DispatchRequest::put(4444, Value::Int(1)))
            .unwrap_err();
        assert!(err.is_member_not_found());
    }

    #[test]
    fn test_put_routes_to_putter_and_coerces() {
        let (mut policy, calls) = bound_scripted();
        policy.set_member("Visible", Value::Int(1)).unwrap();
        let log = calls.lock();
        assert_eq!(log[0].1, InvokeFlags::PROPERTY_PUT);
        assert_eq!(log[0].2, vec![Value::Bool(true)]);
    }

    #[test]
    fn test_method_miss_without_get_flag() {
        let (mut policy, _) = bound_scripted();
        let err = policy
            .invoke(DispatchRequest::method("Visible", vec![]))
            .unwrap_err();
        assert!(err.is_member_not_found());
    }

    #[test]
    fn test_method_miss_falls_through_to_get() {
        let (mut policy, calls) = bound_scripted();
        let v = policy
            .invoke(DispatchRequest::new("Count", InvokeFlags::METHOD_OR_GET, vec![]))
            .unwrap();
        assert_eq!(v, Value::Int(1002));
        assert_eq!(calls.lock()[0].1, InvokeFlags::PROPERTY_GET);
    }

    #[test]
    fn test_default_sentinel_matches_named_call() {
        let (mut policy, calls) = bound_scripted();
        let by_default = policy
            .invoke(DispatchRequest::method(Target::Default, vec![]))
            .unwrap();
        let by_name = policy.call_method("Item", vec![]).unwrap();
        assert_eq!(by_default, by_name);
        let log = calls.lock();
        assert_eq!(log[0].0, DISPID_VALUE);
        assert_eq!(log[0], log[1]);
    }

    #[test]
    fn test_default_member_method_wins_over_getter_for_method_or_get() {
        let desc = ClassDescriptor::builder(Identifier::from_u128(9), "Both")
            .default_method("Value", vec![], VarType::Any)
            .default_property("Value", VarType::Any)
            .build()
            .unwrap();
        let (handle, calls) = ScriptedObject::new();
        let mut policy =
            DispatchPolicy::bound(WrappedObject::new(handle, Some(Arc::new(desc)))).unwrap();

        policy
            .invoke(DispatchRequest::new(Target::Default, InvokeFlags::METHOD_OR_GET, vec![]))
            .unwrap();
        policy
            .invoke(DispatchRequest::new(Target::Default, InvokeFlags::PROPERTY_GET, vec![]))
            .unwrap();
        let log = calls.lock();
        assert_eq!(log[0].1, InvokeFlags::METHOD);
        assert_eq!(log[1].1, InvokeFlags::PROPERTY_GET);
    }

    #[test]
    fn test_new_enum_sentinel() {
        let (mut policy, calls) = bound_scripted();
        policy
            .invoke(DispatchRequest::method(DISPID_NEWENUM, vec![]))
            .unwrap();
        assert_eq!(calls.lock()[0].0, DISPID_NEWENUM);
    }

    #[test]
    fn test_native_failure_passthrough() {
        let (mut policy, _) = bound_scripted();
        let err = policy.call_method("Fail", vec![]).unwrap_err();
        match err {
            DispatchError::NativeCallFailed(native) => {
                assert_eq!(native.description, "scripted failure")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_name_without_hook() {
        let (mut policy, _) = bound_scripted();
        assert!(policy.get_member("Nope").unwrap_err().is_member_not_found());
    }

    #[test]
    fn test_static_binding_falls_back_to_hook_for_unknown_names() {
        let (handle, log) = HookObject::new();
        let obj = WrappedObject::new(handle, Some(Arc::new(sample_descriptor())));
        let mut policy = DispatchPolicy::bound(obj).unwrap();
        let id = policy.get_id_for_name("Expando").unwrap();
        assert!(id >= DYNAMIC_DISPID_BASE);
        policy.get_member("Expando").unwrap();
        assert_eq!(log.lock()[0].0, "Expando");
    }

    #[test]
    fn test_dynamic_binding_without_descriptor() {
        let (handle, _) = HookObject::new();
        let policy = DispatchPolicy::bound(WrappedObject::new(handle, None)).unwrap();
        assert_eq!(policy.binding(), Binding::Dynamic);
    }

    #[test]
    fn test_binding_without_descriptor_or_hook_fails() {
        let (handle, _) = StaticOnly::new();
        let err = DispatchPolicy::bound(WrappedObject::new(handle, None))
            .err()
            .expect("binding must fail");
        assert!(matches!(err, DispatchError::PolicyPrecondition(_)));
    }

    #[test]
    fn test_get_ids_of_names_rejects_named_args() {
        let (mut policy, _) = bound_scripted();
        assert_eq!(policy.get_ids_of_names(&["Quit"]).unwrap(), vec![1003]);
        let err = policy.get_ids_of_names(&["Move", "x"]).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidRequestShape(_)));
    }

    #[test]
    fn test_member_name_and_enumeration() {
        let (policy, _) = bound_scripted();
        assert_eq!(policy.member_name(1003).unwrap(), "Quit");
        assert!(policy.member_name(777).unwrap_err().is_member_not_found());

        let first = policy.next_dispid(DISPID_STARTENUM).unwrap().unwrap();
        assert_eq!(first, DISPID_NEWENUM);
        let mut seen = vec![first];
        while let Some(next) = policy.next_dispid(*seen.last().unwrap()).unwrap() {
            seen.push(next);
        }
        assert_eq!(seen, policy.dispids());
        assert!(policy.next_dispid(31337).is_err());
    }

    #[test]
    fn test_arg_transformer_applied() {
        let (mut policy, calls) = bound_scripted();
        policy.set_arg_transformer(|args| Ok(args.into_iter().rev().collect()));
        policy
            .call_method("Move", vec![Value::Int(1), Value::Str("b".into())])
            .unwrap_err();
        policy
            .call_method("Move", vec![Value::Str("2".into()), Value::Int(7)])
            .unwrap();
        assert_eq!(calls.lock()[0].2, vec![Value::Int(7), Value::Str("2".into())]);
    }

    #[test]
    fn test_query_interface() {
        let (policy, _) = bound_scripted();
        let desc = sample_descriptor();
        assert!(policy.query_interface(&desc.identifier()));
        assert!(policy.query_interface(&desc.interfaces()[0]));
        assert!(!policy.query_interface(&Identifier::from_u128(123)));
    }

    #[test]
    fn test_added_interfaces_answer_query() {
        let (handle, _) = HookObject::new();
        let mut policy = DispatchPolicy::bound(WrappedObject::new(handle, None)).unwrap();
        let extra = Identifier::from_u128(0xABC);
        assert!(!policy.query_interface(&extra));
        policy.add_interfaces([extra, extra]);
        assert!(policy.query_interface(&extra));
        assert!(!policy.query_interface(&Identifier::from_u128(0xABD)));
    }

    #[test]
    fn test_arg_transformer_failure_aborts_call() {
        let (mut policy, calls) = bound_scripted();
        policy.set_arg_transformer(|_| {
            Err(DispatchError::PolicyPrecondition("arguments rejected".into()))
        });
        let err = policy.call_method("Quit", vec![]).unwrap_err();
        assert!(err.to_string().contains("arguments rejected"));
        assert!(calls.lock().is_empty());
    }
}
