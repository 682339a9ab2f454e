//! Native COM backend (Windows only).
//!
//! [`ComGuard`] keeps the thread in the multithreaded apartment for as long
//! as it lives.  [`ComObject`] adapts a live `IDispatch` to
//! [`NativeHandle`]:
//!
//! - calls go through `IDispatch::Invoke` with positional arguments marshalled
//!   into `VARIANT`s (reversed, as `DISPPARAMS` expects),
//! - the class identifier comes from `GetTypeInfo` / `GetTypeAttr`,
//! - the dynamic hook resolves names through `GetIDsOfNames`,
//! - events are delivered through `IConnectionPointContainer`.
//!
//! Object-valued results are kept alive by the `ComObject` that returned them
//! and surface as [`Value::Object`] handles indexing its child table.

use std::collections::HashMap;
use std::mem::ManuallyDrop;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use windows::core::{implement, Interface, BSTR, GUID, HSTRING, PCWSTR};
use windows::Win32::Foundation::{VARIANT_FALSE, VARIANT_TRUE};
use windows::Win32::System::Com::{
    CLSIDFromProgID, CoCreateInstance, CoInitializeEx, CoUninitialize, IConnectionPoint,
    IConnectionPointContainer, IDispatch, IDispatch_Impl, ITypeInfo, CLSCTX_ALL,
    COINIT_MULTITHREADED, DISPATCH_FLAGS, DISPPARAMS, EXCEPINFO,
};
use windows::Win32::System::Ole::DISPID_PROPERTYPUT;
use windows::Win32::System::Variant::{
    VariantClear, VARIANT, VT_BOOL, VT_BSTR, VT_DATE, VT_DISPATCH, VT_EMPTY, VT_I2, VT_I4, VT_I8,
    VT_INT, VT_NULL, VT_R4, VT_R8, VT_UI1, VT_UI2, VT_UI4, VT_UI8, VT_UINT,
};

use crate::capability::{ConnectionToken, DynamicHook, EventSink, NativeHandle, NotificationSource};
use crate::dynamic::{NEWENUM_NAME, VALUE_NAME};
use crate::errors::{
    DispatchError, NativeError, DISP_E_TYPEMISMATCH, DISP_E_UNKNOWNNAME, E_FAIL, E_NOTIMPL,
};
use crate::identifier::{DispId, Identifier, InvokeFlags, DISPID_NEWENUM, DISPID_VALUE};
use crate::value::Value;

const RPC_E_CHANGED_MODE: u32 = 0x8001_0106;

// ---------------------------------------------------------------------------
// Apartment guard
// ---------------------------------------------------------------------------

/// RAII apartment membership; `CoUninitialize` runs on drop when a balancing
/// call is owed.  Not `Send`: the guard belongs to the thread that made it.
#[must_use = "ComGuard must be kept alive for the duration of COM usage"]
pub struct ComGuard {
    should_uninit: bool,
    _not_send: std::marker::PhantomData<*const ()>,
}

impl ComGuard {
    /// Join the multithreaded apartment.  A thread that already lives in a
    /// single-threaded apartment keeps it (logged at `warn`).
    pub fn init() -> Result<Self, DispatchError> {
        let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
        let code = hr.0 as u32;
        match code {
            0x0 | 0x1 => Ok(Self {
                should_uninit: true,
                _not_send: std::marker::PhantomData,
            }),
            RPC_E_CHANGED_MODE => {
                log::warn!("ComGuard: thread already has an STA apartment, using it");
                Ok(Self {
                    should_uninit: false,
                    _not_send: std::marker::PhantomData,
                })
            }
            _ => Err(NativeError::new(hr.0, "CoInitializeEx failed").into()),
        }
    }
}

impl Drop for ComGuard {
    fn drop(&mut self) {
        if self.should_uninit {
            unsafe { CoUninitialize() };
        }
    }
}

// ---------------------------------------------------------------------------
// VARIANT marshalling
// ---------------------------------------------------------------------------

unsafe fn to_variant(value: &Value, children: &[IDispatch]) -> Result<VARIANT, NativeError> {
    let mut variant = VARIANT::default();
    {
        let inner = &mut *variant.Anonymous.Anonymous;
        match value {
            Value::Empty => inner.vt = VT_EMPTY,
            Value::Bool(b) => {
                inner.vt = VT_BOOL;
                inner.Anonymous.boolVal = if *b { VARIANT_TRUE } else { VARIANT_FALSE };
            }
            Value::Int(i) => match i32::try_from(*i) {
                Ok(small) => {
                    inner.vt = VT_I4;
                    inner.Anonymous.lVal = small;
                }
                Err(_) => {
                    inner.vt = VT_I8;
                    inner.Anonymous.llVal = *i;
                }
            },
            Value::Float(f) => {
                inner.vt = VT_R8;
                inner.Anonymous.dblVal = *f;
            }
            Value::Str(s) => {
                inner.vt = VT_BSTR;
                inner.Anonymous.bstrVal = ManuallyDrop::new(BSTR::from(s.as_str()));
            }
            Value::Object { handle } => {
                let child = usize::try_from(*handle)
                    .ok()
                    .and_then(|i| children.get(i))
                    .ok_or_else(|| {
                        NativeError::new(DISP_E_TYPEMISMATCH, format!("unknown object handle {handle}"))
                    })?;
                inner.vt = VT_DISPATCH;
                inner.Anonymous.pdispVal = ManuallyDrop::new(Some(child.clone()));
            }
            Value::Array(_) => {
                return Err(NativeError::new(
                    DISP_E_TYPEMISMATCH,
                    "array arguments are not marshalled",
                ))
            }
        }
    }
    Ok(variant)
}

/// Convert a result.  Objects are appended to `children` when a table is
/// given and dropped to `Empty` otherwise.
unsafe fn from_variant(variant: &VARIANT, children: Option<&Mutex<Vec<IDispatch>>>) -> Value {
    let inner = &*variant.Anonymous.Anonymous;
    let data = &inner.Anonymous;
    match inner.vt {
        VT_EMPTY | VT_NULL => Value::Empty,
        VT_BOOL => Value::Bool(data.boolVal.0 != 0),
        VT_UI1 => Value::Int(i64::from(data.bVal)),
        VT_I2 => Value::Int(i64::from(data.iVal)),
        VT_UI2 => Value::Int(i64::from(data.uiVal)),
        VT_I4 | VT_INT => Value::Int(i64::from(data.lVal)),
        VT_UI4 | VT_UINT => Value::Int(i64::from(data.ulVal)),
        VT_I8 => Value::Int(data.llVal),
        VT_UI8 => Value::Int(data.ullVal as i64),
        VT_R4 => Value::Float(f64::from(data.fltVal)),
        VT_R8 => Value::Float(data.dblVal),
        VT_DATE => Value::Float(data.date),
        VT_BSTR => Value::Str((*data.bstrVal).to_string()),
        VT_DISPATCH => match (&*data.pdispVal, children) {
            (Some(object), Some(table)) => {
                let mut table = table.lock();
                table.push(object.clone());
                Value::Object {
                    handle: (table.len() - 1) as u64,
                }
            }
            _ => Value::Empty,
        },
        other => {
            log::debug!("ComObject: VARIANT type {} returned as empty", other.0);
            Value::Empty
        }
    }
}

fn clear_all(variants: &mut [VARIANT]) {
    for variant in variants {
        let _ = unsafe { VariantClear(variant) };
    }
}

// ---------------------------------------------------------------------------
// ComObject
// ---------------------------------------------------------------------------

pub struct ComObject {
    dispatch: IDispatch,
    event_interface: Option<Identifier>,
    children: Mutex<Vec<IDispatch>>,
    connections: Mutex<HashMap<u32, IConnectionPoint>>,
}

// SAFETY: objects are created and used from the multithreaded apartment
// (see `ComGuard::init`), where interface pointers may cross threads.
unsafe impl Send for ComObject {}

impl ComObject {
    pub fn new(dispatch: IDispatch) -> Self {
        Self {
            dispatch,
            event_interface: None,
            children: Mutex::new(Vec::new()),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Instantiate a class by its identifier.
    pub fn create(class: &Identifier) -> Result<Self, DispatchError> {
        let clsid = GUID::from_u128(class.as_u128());
        let dispatch: IDispatch = unsafe { CoCreateInstance(&clsid, None, CLSCTX_ALL) }?;
        Ok(Self::new(dispatch))
    }

    /// Instantiate a class by ProgID, e.g. `"Outlook.Application"`.
    pub fn from_prog_id(prog_id: &str) -> Result<(Self, Identifier), DispatchError> {
        let clsid = unsafe { CLSIDFromProgID(&HSTRING::from(prog_id)) }?;
        let class = Identifier::from_u128(clsid.to_u128());
        Ok((Self::create(&class)?, class))
    }

    /// The outgoing interface to advise on when events are connected.
    pub fn with_event_interface(mut self, iid: Identifier) -> Self {
        self.event_interface = Some(iid);
        self
    }

    pub fn dispatch(&self) -> &IDispatch {
        &self.dispatch
    }

    /// Detach an object returned by an earlier call as its own wrapper.
    pub fn child(&self, handle: u64) -> Option<ComObject> {
        let index = usize::try_from(handle).ok()?;
        self.children.lock().get(index).cloned().map(ComObject::new)
    }

    fn id_of_name(&self, name: &str) -> Result<DispId, NativeError> {
        if name == VALUE_NAME {
            return Ok(DISPID_VALUE);
        }
        if name.eq_ignore_ascii_case(NEWENUM_NAME) {
            return Ok(DISPID_NEWENUM);
        }
        let wide = HSTRING::from(name);
        let names = [PCWSTR(wide.as_ptr())];
        let mut id: DispId = 0;
        unsafe {
            self.dispatch
                .GetIDsOfNames(&GUID::zeroed(), names.as_ptr(), 1, 0, &mut id)
        }
        .map_err(|e| NativeError::new(DISP_E_UNKNOWNNAME, format!("{name}: {}", e.message())))?;
        Ok(id)
    }
}

impl NativeHandle for ComObject {
    fn invoke_native(
        &self,
        id: DispId,
        flags: InvokeFlags,
        args: &[Value],
    ) -> Result<Value, NativeError> {
        let mut variants: Vec<VARIANT> = Vec::with_capacity(args.len());
        {
            let children = self.children.lock();
            for arg in args.iter().rev() {
                match unsafe { to_variant(arg, &children) } {
                    Ok(v) => variants.push(v),
                    Err(e) => {
                        clear_all(&mut variants);
                        return Err(e);
                    }
                }
            }
        }

        let mut named_put = DISPID_PROPERTYPUT;
        let is_put = flags.is_put();
        let params = DISPPARAMS {
            rgvarg: if variants.is_empty() {
                std::ptr::null_mut()
            } else {
                variants.as_mut_ptr()
            },
            rgdispidNamedArgs: if is_put {
                &mut named_put
            } else {
                std::ptr::null_mut()
            },
            cArgs: variants.len() as u32,
            cNamedArgs: u32::from(is_put),
        };

        let mut result = VARIANT::default();
        let outcome = unsafe {
            self.dispatch.Invoke(
                id,
                &GUID::zeroed(),
                0,
                DISPATCH_FLAGS(flags.bits()),
                &params,
                Some(&mut result),
                None,
                None,
            )
        };
        clear_all(&mut variants);
        outcome?;

        let value = unsafe { from_variant(&result, Some(&self.children)) };
        let _ = unsafe { VariantClear(&mut result) };
        Ok(value)
    }

    fn discover_identifier(&self) -> Result<Option<Identifier>, NativeError> {
        if unsafe { self.dispatch.GetTypeInfoCount() }? == 0 {
            return Ok(None);
        }
        let info: ITypeInfo = unsafe { self.dispatch.GetTypeInfo(0, 0) }?;
        let attr = unsafe { info.GetTypeAttr() }?;
        if attr.is_null() {
            return Ok(None);
        }
        let guid = unsafe { (*attr).guid };
        unsafe { info.ReleaseTypeAttr(attr) };
        Ok(Some(Identifier::from_u128(guid.to_u128())))
    }

    fn dynamic_hook(&self) -> Option<&dyn DynamicHook> {
        Some(self)
    }

    fn notifications(&self) -> Option<&dyn NotificationSource> {
        self.event_interface.map(|_| self as &dyn NotificationSource)
    }
}

impl DynamicHook for ComObject {
    fn dynamic_invoke(
        &self,
        name: &str,
        flags: InvokeFlags,
        args: &[Value],
    ) -> Result<Value, NativeError> {
        let id = self.id_of_name(name)?;
        self.invoke_native(id, flags, args)
    }
}

impl NotificationSource for ComObject {
    fn connect(&self, sink: Arc<dyn EventSink>) -> Result<ConnectionToken, NativeError> {
        let iid = self
            .event_interface
            .ok_or_else(|| NativeError::new(E_NOTIMPL, "no event interface configured"))?;
        let container: IConnectionPointContainer = self.dispatch.cast()?;
        let point =
            unsafe { container.FindConnectionPoint(&GUID::from_u128(iid.as_u128())) }?;
        let sink: IDispatch = EventDispatch { sink }.into();
        let cookie = unsafe { point.Advise(&sink) }?;
        self.connections.lock().insert(cookie, point);
        Ok(ConnectionToken::new(cookie))
    }

    fn disconnect(&self, token: ConnectionToken) -> Result<(), NativeError> {
        let point = self
            .connections
            .lock()
            .remove(&token.cookie())
            .ok_or_else(|| NativeError::new(E_FAIL, format!("unknown cookie {}", token.cookie())))?;
        unsafe { point.Unadvise(token.cookie()) }?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Event sink
// ---------------------------------------------------------------------------

/// `IDispatch` implementation handed to `IConnectionPoint::Advise`.
#[implement(IDispatch)]
struct EventDispatch {
    sink: Arc<dyn EventSink>,
}

impl IDispatch_Impl for EventDispatch_Impl {
    fn GetTypeInfoCount(&self) -> windows::core::Result<u32> {
        Ok(0)
    }

    fn GetTypeInfo(&self, _itinfo: u32, _lcid: u32) -> windows::core::Result<ITypeInfo> {
        Err(windows::core::Error::from(windows::core::HRESULT(E_NOTIMPL)))
    }

    fn GetIDsOfNames(
        &self,
        _riid: *const GUID,
        _rgsznames: *const PCWSTR,
        _cnames: u32,
        _lcid: u32,
        _rgdispid: *mut i32,
    ) -> windows::core::Result<()> {
        Err(windows::core::Error::from(windows::core::HRESULT(DISP_E_UNKNOWNNAME)))
    }

    fn Invoke(
        &self,
        dispidmember: i32,
        _riid: *const GUID,
        _lcid: u32,
        _wflags: DISPATCH_FLAGS,
        pdispparams: *const DISPPARAMS,
        pvarresult: *mut VARIANT,
        _pexcepinfo: *mut EXCEPINFO,
        _puargerr: *mut u32,
    ) -> windows::core::Result<()> {
        let args = unsafe { event_args(pdispparams) };
        let outcome = catch_unwind(AssertUnwindSafe(|| self.sink.notify(dispidmember, &args)));
        match outcome {
            Ok(Ok(value)) => {
                if !pvarresult.is_null() {
                    if let Ok(variant) = unsafe { to_variant(&value, &[]) } {
                        unsafe { *pvarresult = variant };
                    }
                }
                Ok(())
            }
            Ok(Err(e)) => {
                log::warn!("EventDispatch: handler for event {dispidmember} failed: {e}");
                Err(windows::core::Error::from(windows::core::HRESULT(e.scode())))
            }
            Err(_) => {
                log::error!("EventDispatch: panic prevented from crossing the COM boundary");
                Err(windows::core::Error::from(windows::core::HRESULT(E_FAIL)))
            }
        }
    }
}

/// Positional event arguments, undoing `DISPPARAMS`' reversed order.
unsafe fn event_args(params: *const DISPPARAMS) -> Vec<Value> {
    if params.is_null() {
        return Vec::new();
    }
    let params = &*params;
    if params.rgvarg.is_null() {
        return Vec::new();
    }
    (0..params.cArgs as usize)
        .rev()
        .map(|i| from_variant(&*params.rgvarg.add(i), None))
        .collect()
}
