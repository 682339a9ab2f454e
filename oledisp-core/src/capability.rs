//! Capabilities consumed from the native side.
//!
//! The engine never talks to a COM runtime directly.  Everything it needs from
//! a live object is expressed by [`NativeHandle`], whose optional
//! capabilities (identifier discovery, a dynamic-dispatch hook, a notification
//! source) default to "absent".  The code generator is a separate
//! [`DescriptorGenerator`].
//!
//! A handle is owned exclusively by the wrapper it is given to and is
//! released when that wrapper drops.

use std::sync::Arc;

use crate::descriptor::ClassDescriptor;
use crate::errors::{DispatchError, NativeError};
use crate::identifier::{DispId, Identifier, InvokeFlags};
use crate::value::Value;

/// A live native object.
pub trait NativeHandle: Send {
    /// Perform an early-bound call by dispatch ID.  Arguments are positional.
    fn invoke_native(
        &self,
        id: DispId,
        flags: InvokeFlags,
        args: &[Value],
    ) -> Result<Value, NativeError>;

    /// Ask the object for its current class identifier.
    fn discover_identifier(&self) -> Result<Option<Identifier>, NativeError> {
        Ok(None)
    }

    /// The object's by-name dispatch entry point, if it has one.
    fn dynamic_hook(&self) -> Option<&dyn DynamicHook> {
        None
    }

    /// The object's default event source, if it fires events.
    fn notifications(&self) -> Option<&dyn NotificationSource> {
        None
    }
}

impl<H: NativeHandle + ?Sized> NativeHandle for Box<H> {
    fn invoke_native(
        &self,
        id: DispId,
        flags: InvokeFlags,
        args: &[Value],
    ) -> Result<Value, NativeError> {
        (**self).invoke_native(id, flags, args)
    }

    fn discover_identifier(&self) -> Result<Option<Identifier>, NativeError> {
        (**self).discover_identifier()
    }

    fn dynamic_hook(&self) -> Option<&dyn DynamicHook> {
        (**self).dynamic_hook()
    }

    fn notifications(&self) -> Option<&dyn NotificationSource> {
        (**self).notifications()
    }
}

/// Generic by-name dispatch supplied by a dynamic object.
///
/// `name` is the member name in the case the caller first used; it may also
/// be `_value_` (default member) or `_NewEnum` (enumerator request).
pub trait DynamicHook {
    fn dynamic_invoke(
        &self,
        name: &str,
        flags: InvokeFlags,
        args: &[Value],
    ) -> Result<Value, NativeError>;
}

/// Token identifying one event connection (a connection-point cookie).
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ConnectionToken(u32);

impl ConnectionToken {
    pub fn new(cookie: u32) -> Self {
        Self(cookie)
    }

    pub fn cookie(&self) -> u32 {
        self.0
    }
}

/// Receives events fired by a source.
pub trait EventSink: Send + Sync {
    fn notify(&self, id: DispId, args: &[Value]) -> Result<Value, DispatchError>;
}

/// Native event-registration capability.
///
/// The source keeps the sink alive for as long as the connection is open,
/// which is what makes explicit disconnection necessary.
pub trait NotificationSource {
    fn connect(&self, sink: Arc<dyn EventSink>) -> Result<ConnectionToken, NativeError>;

    /// Consumes the token: a connection can only be closed once.
    fn disconnect(&self, token: ConnectionToken) -> Result<(), NativeError>;
}

/// The slow-path code generator.
pub trait DescriptorGenerator: Send + Sync {
    /// Produce the descriptor for `identifier`, or
    /// [`DispatchError::GenerationUnavailable`].
    fn generate(&self, identifier: &Identifier) -> Result<ClassDescriptor, DispatchError>;
}
