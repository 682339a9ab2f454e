//! In-process stand-ins for native objects, shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::capability::{
    ConnectionToken, DescriptorGenerator, DynamicHook, EventSink, NativeHandle, NotificationSource,
};
use crate::descriptor::{ClassDescriptor, ParamDesc};
use crate::errors::{DispatchError, NativeError, DISP_E_UNKNOWNNAME, E_FAIL};
use crate::identifier::{DispId, Identifier, InvokeFlags, DISPID_NEWENUM};
use crate::value::{Value, VarType};

pub(crate) const APP_ID: Identifier = Identifier::from_u128(0x0006F03A_0000_0000_C000_000000000046);
pub(crate) const APP_EVENTS_ID: Identifier =
    Identifier::from_u128(0x0006F03B_0000_0000_C000_000000000046);
pub(crate) const IDISPATCH_ID: Identifier =
    Identifier::from_u128(0x00020400_0000_0000_C000_000000000046);

/// `Visible` (1001, rw), `Count` (1002, ro), `Quit` (1003), `Move` (1004),
/// `Fail` (1005), default `Item`, and `_NewEnum`.
pub(crate) fn sample_descriptor() -> ClassDescriptor {
    ClassDescriptor::builder(APP_ID, "Application")
        .property("Visible", 1001, VarType::Bool)
        .readonly_property("Count", 1002, VarType::Int)
        .method("Quit", 1003, vec![], VarType::Void)
        .method(
            "Move",
            1004,
            vec![
                ParamDesc::new("count", VarType::Int),
                ParamDesc::new("name", VarType::String),
            ],
            VarType::Void,
        )
        .method("Fail", 1005, vec![], VarType::Any)
        .default_method("Item", vec![ParamDesc::optional("index", VarType::Int)], VarType::Any)
        .new_enum()
        .default_source(APP_EVENTS_ID)
        .interface(IDISPATCH_ID)
        .build()
        .unwrap()
}

/// `OnStartup` (1), `OnQuit` (2) as fired by the sample's event source.
pub(crate) fn sample_events_descriptor() -> ClassDescriptor {
    ClassDescriptor::builder(APP_EVENTS_ID, "ApplicationEvents")
        .method("Startup", 1, vec![], VarType::Void)
        .method("Quit", 2, vec![ParamDesc::optional("code", VarType::Int)], VarType::Void)
        .build()
        .unwrap()
}

// ---------------------------------------------------------------------------
// StaticOnly
// ---------------------------------------------------------------------------

/// Object with no optional capabilities at all.
pub(crate) struct StaticOnly {
    calls: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
}

impl StaticOnly {
    pub(crate) fn new() -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = Self {
            calls: Arc::clone(&calls),
            releases: Arc::new(AtomicUsize::new(0)),
        };
        (handle, calls)
    }

    pub(crate) fn releases(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.releases)
    }
}

impl NativeHandle for StaticOnly {
    fn invoke_native(&self, _: DispId, _: InvokeFlags, _: &[Value]) -> Result<Value, NativeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Value::Empty)
    }
}

impl Drop for StaticOnly {
    fn drop(&mut self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// HookObject
// ---------------------------------------------------------------------------

pub(crate) type HookLog = Arc<Mutex<Vec<(String, InvokeFlags)>>>;

/// Object that serves every name through its dynamic hook, except `missing`.
pub(crate) struct HookObject {
    log: HookLog,
}

impl HookObject {
    pub(crate) fn new() -> (Self, HookLog) {
        let log: HookLog = Arc::default();
        (Self { log: Arc::clone(&log) }, log)
    }
}

impl NativeHandle for HookObject {
    fn invoke_native(&self, id: DispId, _: InvokeFlags, _: &[Value]) -> Result<Value, NativeError> {
        Ok(Value::Int(i64::from(id)))
    }

    fn dynamic_hook(&self) -> Option<&dyn DynamicHook> {
        Some(self)
    }
}

impl DynamicHook for HookObject {
    fn dynamic_invoke(
        &self,
        name: &str,
        flags: InvokeFlags,
        _args: &[Value],
    ) -> Result<Value, NativeError> {
        if name.eq_ignore_ascii_case("missing") {
            return Err(NativeError::new(DISP_E_UNKNOWNNAME, format!("no member {name}")));
        }
        self.log.lock().push((name.to_owned(), flags));
        Ok(Value::Str(name.to_owned()))
    }
}

// ---------------------------------------------------------------------------
// ScriptedObject
// ---------------------------------------------------------------------------

pub(crate) type CallLog = Arc<Mutex<Vec<(DispId, InvokeFlags, Vec<Value>)>>>;

/// Object that records every early-bound call and answers from a script.
///
/// Unscripted IDs answer with their own number.  `_NewEnum` answers with an
/// object handle and 1005 fails.
pub(crate) struct ScriptedObject {
    calls: CallLog,
    results: HashMap<DispId, Result<Value, NativeError>>,
    discovered: Result<Option<Identifier>, NativeError>,
    source: Option<ScriptedSource>,
}

impl ScriptedObject {
    pub(crate) fn new() -> (Self, CallLog) {
        let calls: CallLog = Arc::default();
        let mut results = HashMap::new();
        results.insert(DISPID_NEWENUM, Ok(Value::Object { handle: 1 }));
        results.insert(1005, Err(NativeError::new(E_FAIL, "scripted failure")));
        let handle = Self {
            calls: Arc::clone(&calls),
            results,
            discovered: Ok(None),
            source: None,
        };
        (handle, calls)
    }

    pub(crate) fn with_identifier(mut self, identifier: Identifier) -> Self {
        self.discovered = Ok(Some(identifier));
        self
    }

    pub(crate) fn with_discovery_failure(mut self) -> Self {
        self.discovered = Err(NativeError::new(E_FAIL, "type info unavailable"));
        self
    }

    pub(crate) fn with_events(mut self) -> (Self, Arc<SourceState>) {
        let state = Arc::new(SourceState::default());
        self.source = Some(ScriptedSource {
            state: Arc::clone(&state),
        });
        (self, state)
    }
}

impl NativeHandle for ScriptedObject {
    fn invoke_native(
        &self,
        id: DispId,
        flags: InvokeFlags,
        args: &[Value],
    ) -> Result<Value, NativeError> {
        self.calls.lock().push((id, flags, args.to_vec()));
        match self.results.get(&id) {
            Some(result) => result.clone(),
            None => Ok(Value::Int(i64::from(id))),
        }
    }

    fn discover_identifier(&self) -> Result<Option<Identifier>, NativeError> {
        self.discovered.clone()
    }

    fn notifications(&self) -> Option<&dyn NotificationSource> {
        self.source.as_ref().map(|s| s as &dyn NotificationSource)
    }
}

// ---------------------------------------------------------------------------
// Event source
// ---------------------------------------------------------------------------

/// Shared view of a scripted connection point.
#[derive(Default)]
pub(crate) struct SourceState {
    pub(crate) connects: AtomicUsize,
    pub(crate) disconnects: AtomicUsize,
    sink: Mutex<Option<Arc<dyn EventSink>>>,
}

impl SourceState {
    /// Fire event `id` at the connected sink, if any.
    pub(crate) fn fire(&self, id: DispId, args: &[Value]) -> Option<Result<Value, DispatchError>> {
        let sink = self.sink.lock().clone();
        sink.map(|s| s.notify(id, args))
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.sink.lock().is_some()
    }
}

pub(crate) struct ScriptedSource {
    state: Arc<SourceState>,
}

impl NotificationSource for ScriptedSource {
    fn connect(&self, sink: Arc<dyn EventSink>) -> Result<ConnectionToken, NativeError> {
        let n = self.state.connects.fetch_add(1, Ordering::SeqCst);
        *self.state.sink.lock() = Some(sink);
        Ok(ConnectionToken::new(n as u32 + 1))
    }

    fn disconnect(&self, _token: ConnectionToken) -> Result<(), NativeError> {
        self.state.disconnects.fetch_add(1, Ordering::SeqCst);
        *self.state.sink.lock() = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

/// Generator that knows a fixed set of descriptors and counts its calls.
pub(crate) struct CountingGenerator {
    known: HashMap<Identifier, ClassDescriptor>,
    pub(crate) calls: Arc<AtomicUsize>,
}

impl CountingGenerator {
    pub(crate) fn new(descriptors: Vec<ClassDescriptor>) -> Self {
        Self {
            known: descriptors.into_iter().map(|d| (d.identifier(), d)).collect(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl DescriptorGenerator for CountingGenerator {
    fn generate(&self, identifier: &Identifier) -> Result<ClassDescriptor, DispatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.known
            .get(identifier)
            .cloned()
            .ok_or_else(|| DispatchError::GenerationUnavailable {
                identifier: *identifier,
                reason: "not scripted".into(),
            })
    }
}
