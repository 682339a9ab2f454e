//! A single invocation attempt.

use crate::errors::DispatchError;
use crate::identifier::{DispId, InvokeFlags};
use crate::value::Value;

/// What a request is aimed at.  A name must be resolved to exactly one ID
/// before the call is made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// No name or ID given: the default member.
    Default,
    Id(DispId),
    Name(String),
}

impl From<DispId> for Target {
    fn from(id: DispId) -> Self {
        Target::Id(id)
    }
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        Target::Name(name.to_owned())
    }
}

impl From<String> for Target {
    fn from(name: String) -> Self {
        Target::Name(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub target: Target,
    pub flags: InvokeFlags,
    pub args: Vec<Value>,
}

impl DispatchRequest {
    pub fn new(target: impl Into<Target>, flags: InvokeFlags, args: Vec<Value>) -> Self {
        Self {
            target: target.into(),
            flags,
            args,
        }
    }

    pub fn method(target: impl Into<Target>, args: Vec<Value>) -> Self {
        Self::new(target, InvokeFlags::METHOD, args)
    }

    pub fn get(target: impl Into<Target>) -> Self {
        Self::new(target, InvokeFlags::PROPERTY_GET, Vec::new())
    }

    pub fn put(target: impl Into<Target>, value: Value) -> Self {
        Self::new(target, InvokeFlags::PROPERTY_PUT, vec![value])
    }

    /// Reject flag/argument combinations no policy can serve.
    pub fn validate_flags(&self) -> Result<(), DispatchError> {
        if self.flags.is_empty() {
            return Err(DispatchError::InvalidRequestShape("invalid wFlags (none set)".into()));
        }
        if self.flags.is_put() {
            if self.flags.intersects(InvokeFlags::METHOD_OR_GET) {
                return Err(DispatchError::InvalidRequestShape(format!(
                    "property put combined with method/get flags (0x{:x})",
                    self.flags.bits()
                )));
            }
            if self.args.is_empty() {
                return Err(DispatchError::InvalidRequestShape(
                    "property put requires a value argument".into(),
                ));
            }
        }
        Ok(())
    }
}
