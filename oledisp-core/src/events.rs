//! Event sinks and the connection-owning proxy.
//!
//! [`EventRouter`] is the sink handed to the native event source.  It maps an
//! incoming dispatch ID to the event's name through the source interface's
//! descriptor and calls the matching user handler.  A handler registered as
//! `Quit` or `OnQuit` both receive the `Quit` event.
//!
//! [`EventProxy`] owns a bound [`DispatchPolicy`] together with the
//! connection token.  The source holds the router alive for as long as the
//! connection is open, so the connection must be closed explicitly with
//! [`EventProxy::close`]; `Drop` does the same as a backstop.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::capability::{ConnectionToken, EventSink, NativeHandle};
use crate::descriptor::ClassDescriptor;
use crate::errors::DispatchError;
use crate::identifier::DispId;
use crate::policy::{DispatchPolicy, Policy};
use crate::request::DispatchRequest;
use crate::resolver::ClassResolver;
use crate::value::Value;

pub type EventHandler = Box<dyn Fn(&[Value]) -> Result<Value, DispatchError> + Send + Sync>;

// ---------------------------------------------------------------------------
// Handler table
// ---------------------------------------------------------------------------

/// Case-insensitive event name → handler.
#[derive(Default)]
pub struct EventHandlers {
    handlers: HashMap<String, EventHandler>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for event `name` (`"Quit"` or `"OnQuit"`).
    pub fn on<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, DispatchError> + Send + Sync + 'static,
    {
        self.handlers.insert(name.to_lowercase(), Box::new(handler));
        self
    }

    pub fn get(&self, event: &str) -> Option<&EventHandler> {
        let folded = event.to_lowercase();
        self.handlers
            .get(&folded)
            .or_else(|| self.handlers.get(&format!("on{folded}")))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("EventHandlers").field("names", &names).finish()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub struct EventRouter {
    events: Option<Arc<ClassDescriptor>>,
    handlers: EventHandlers,
}

impl EventRouter {
    pub fn new(events: Option<Arc<ClassDescriptor>>, handlers: EventHandlers) -> Self {
        Self { events, handlers }
    }

    /// Descriptor of the source interface, when one could be resolved.
    pub fn events(&self) -> Option<&Arc<ClassDescriptor>> {
        self.events.as_ref()
    }

    pub fn event_name(&self, id: DispId) -> Option<&str> {
        self.events.as_ref().and_then(|d| d.member_name(id))
    }
}

impl EventSink for EventRouter {
    fn notify(&self, id: DispId, args: &[Value]) -> Result<Value, DispatchError> {
        let Some(name) = self.event_name(id) else {
            log::trace!("EventRouter: event {id} is not described, ignored");
            return Ok(Value::Empty);
        };
        match self.handlers.get(name) {
            Some(handler) => handler(args),
            None => {
                log::trace!("EventRouter: no handler for '{name}'");
                Ok(Value::Empty)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

pub struct EventProxy<H: NativeHandle> {
    policy: Option<DispatchPolicy<H>>,
    token: Option<ConnectionToken>,
    router: Arc<EventRouter>,
}

impl<H: NativeHandle> EventProxy<H> {
    /// Connect `handlers` to the default event source of `policy`'s object.
    pub fn connect(
        policy: DispatchPolicy<H>,
        handlers: EventHandlers,
        resolver: &ClassResolver<'_>,
    ) -> Result<Self, DispatchError> {
        let object = policy.object().ok_or_else(|| {
            DispatchError::PolicyPrecondition("policy is not bound to an object".into())
        })?;
        let source = object.handle().notifications().ok_or_else(|| {
            DispatchError::PolicyPrecondition("object does not fire events".into())
        })?;

        let events = policy.descriptor().and_then(|d| resolver.event_descriptor(d));
        if events.is_none() && !handlers.is_empty() {
            log::warn!("EventProxy: no event descriptor, handlers will not be reached");
        }
        let router = Arc::new(EventRouter::new(events, handlers));
        let sink: Arc<dyn EventSink> = router.clone();
        let token = source.connect(sink)?;
        log::debug!("EventProxy: connected (cookie {})", token.cookie());

        Ok(Self {
            policy: Some(policy),
            token: Some(token),
            router,
        })
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    pub fn is_connected(&self) -> bool {
        self.token.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.policy.is_none()
    }

    pub fn policy(&self) -> Result<&DispatchPolicy<H>, DispatchError> {
        self.policy.as_ref().ok_or_else(closed)
    }

    pub fn policy_mut(&mut self) -> Result<&mut DispatchPolicy<H>, DispatchError> {
        self.policy.as_mut().ok_or_else(closed)
    }

    /// Disconnect from the event source, then release the object.
    ///
    /// Safe to call more than once; only the first call does anything.  The
    /// object is released even if the disconnect fails.
    pub fn close(&mut self) -> Result<(), DispatchError> {
        let token = self.token.take();
        let Some(policy) = self.policy.take() else {
            return Ok(());
        };

        let mut result = Ok(());
        if let Some(token) = token {
            let source = policy.object().and_then(|o| o.handle().notifications());
            if let Some(source) = source {
                result = source.disconnect(token).map_err(DispatchError::from);
            }
        }
        drop(policy);
        result
    }
}

fn closed() -> DispatchError {
    DispatchError::PolicyPrecondition("event proxy is closed".into())
}

impl<H: NativeHandle> Policy for EventProxy<H> {
    fn get_id_for_name(&mut self, name: &str) -> Result<DispId, DispatchError> {
        self.policy_mut()?.get_id_for_name(name)
    }

    fn invoke(&mut self, request: DispatchRequest) -> Result<Value, DispatchError> {
        self.policy_mut()?.invoke(request)
    }

    fn member_name(&self, id: DispId) -> Result<String, DispatchError> {
        self.policy()?.member_name(id)
    }

    fn dispids(&self) -> Vec<DispId> {
        self.policy.as_ref().map(|p| p.dispids()).unwrap_or_default()
    }
}

impl<H: NativeHandle> Drop for EventProxy<H> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("EventProxy: disconnect failed during drop: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
