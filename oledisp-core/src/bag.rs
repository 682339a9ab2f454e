//! An in-process dynamic object: a case-insensitive bag of properties.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::capability::{DynamicHook, NativeHandle};
use crate::errors::{NativeError, DISP_E_MEMBERNOTFOUND};
use crate::identifier::{DispId, Identifier, InvokeFlags};
use crate::value::Value;

/// Properties keyed by folded name, remembering the spelling of the first put.
#[derive(Debug, Default)]
pub struct PropertyBag {
    identifier: Option<Identifier>,
    props: Mutex<HashMap<String, (String, Value)>>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bag that reports `identifier` when asked for its class.
    pub fn with_identifier(identifier: Identifier) -> Self {
        Self {
            identifier: Some(identifier),
            ..Self::default()
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.props
            .lock()
            .get(&name.to_lowercase())
            .map(|(_, v)| v.clone())
    }

    pub fn set(&self, name: &str, value: Value) {
        let mut props = self.props.lock();
        match props.get_mut(&name.to_lowercase()) {
            Some((_, slot)) => *slot = value,
            None => {
                props.insert(name.to_lowercase(), (name.to_owned(), value));
            }
        }
    }

    /// Property names as first stored, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.props.lock().values().map(|(n, _)| n.clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.props.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.lock().is_empty()
    }
}

fn not_found(name: &str) -> NativeError {
    NativeError::new(DISP_E_MEMBERNOTFOUND, format!("no property '{name}'"))
}

impl NativeHandle for PropertyBag {
    fn invoke_native(&self, id: DispId, _: InvokeFlags, _: &[Value]) -> Result<Value, NativeError> {
        Err(NativeError::new(
            DISP_E_MEMBERNOTFOUND,
            format!("property bag has no member {id}"),
        ))
    }

    fn discover_identifier(&self) -> Result<Option<Identifier>, NativeError> {
        Ok(self.identifier)
    }

    fn dynamic_hook(&self) -> Option<&dyn DynamicHook> {
        Some(self)
    }
}

impl DynamicHook for PropertyBag {
    fn dynamic_invoke(
        &self,
        name: &str,
        flags: InvokeFlags,
        args: &[Value],
    ) -> Result<Value, NativeError> {
        if flags.is_put() {
            let value = args.first().cloned().unwrap_or_default();
            self.set(name, value);
            return Ok(Value::Empty);
        }
        if flags.contains(InvokeFlags::PROPERTY_GET) {
            return self.get(name).ok_or_else(|| not_found(name));
        }
        Err(not_found(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::WrappedObject;
    use crate::policy::{DispatchPolicy, Policy};
    use crate::request::DispatchRequest;

    #[test]
    fn test_put_then_get_any_case() {
        let mut policy = DispatchPolicy::bound(WrappedObject::new(PropertyBag::new(), None)).unwrap();
        policy.set_member("Caption", Value::from("hello")).unwrap();
        assert_eq!(policy.get_member("CAPTION").unwrap(), Value::from("hello"));
        let id = policy.get_id_for_name("caption").unwrap();
        assert_eq!(policy.member_name(id).unwrap(), "Caption");
    }

    #[test]
    fn test_get_unset_is_member_not_found() {
        let mut policy = DispatchPolicy::bound(WrappedObject::new(PropertyBag::new(), None)).unwrap();
        assert!(policy.get_member("Nothing").unwrap_err().is_member_not_found());
    }

    #[test]
    fn test_method_call_not_supported() {
        let mut policy = DispatchPolicy::bound(WrappedObject::new(PropertyBag::new(), None)).unwrap();
        policy.set_member("Run", Value::Int(1)).unwrap();
        let err = policy
            .invoke(DispatchRequest::method("Run", vec![]))
            .unwrap_err();
        assert!(err.is_member_not_found());
    }

    #[test]
    fn test_overwrite_keeps_first_spelling() {
        let bag = PropertyBag::new();
        bag.set("Name", Value::Int(1));
        bag.set("NAME", Value::Int(2));
        assert_eq!(bag.names(), vec!["Name".to_owned()]);
        assert_eq!(bag.get("name"), Some(Value::Int(2)));
    }
}
