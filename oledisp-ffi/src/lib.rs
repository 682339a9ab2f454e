//! C ABI DLL for oledisp -- loadable by ctypes, C#, or any FFI consumer.
//!
//! All exported functions follow the convention:
//! - Return `i32` status code: `OLEDISP_OK=0`, `OLEDISP_ERROR=-1`,
//!   `OLEDISP_NOT_FOUND=-2` (no such member / descriptor / constant)
//! - String outputs allocated by Rust, freed via `oledisp_free_string()`
//! - Last error retrievable via `oledisp_last_error()`
//! - Opaque handles are freed by their matching `*_free` function

use std::cell::RefCell;
use std::ffi::{c_char, CStr, CString};
use std::path::Path;
use std::ptr;

use oledisp_core::bag::PropertyBag;
use oledisp_core::dynamic::DynamicNameTable;
use oledisp_core::errors::DispatchError;
use oledisp_core::identifier::{DispId, Identifier, InvokeFlags};
use oledisp_core::library::TypeLibrary;
use oledisp_core::object::WrappedObject;
use oledisp_core::policy::{DispatchPolicy, Policy};
use oledisp_core::registry::ClassRegistry;
use oledisp_core::request::{DispatchRequest, Target};
use oledisp_core::value::Value;

pub const OLEDISP_OK: i32 = 0;
pub const OLEDISP_ERROR: i32 = -1;
pub const OLEDISP_NOT_FOUND: i32 = -2;

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

fn fail(e: DispatchError) -> i32 {
    set_last_error(&e.to_string());
    if e.is_member_not_found() {
        OLEDISP_NOT_FOUND
    } else {
        OLEDISP_ERROR
    }
}

/// Borrow a C string argument, recording an error for null / bad UTF-8.
unsafe fn str_arg<'a>(ptr: *const c_char, what: &str) -> Result<&'a str, i32> {
    if ptr.is_null() {
        set_last_error(&format!("{what} is null"));
        return Err(OLEDISP_ERROR);
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().map_err(|e| {
        set_last_error(&format!("{what}: invalid UTF-8: {e}"));
        OLEDISP_ERROR
    })
}

/// Hand a string to the caller through `out`.
unsafe fn write_string(out: *mut *mut c_char, text: String) -> i32 {
    if out.is_null() {
        set_last_error("output pointer is null");
        return OLEDISP_ERROR;
    }
    match CString::new(text) {
        Ok(cstr) => {
            unsafe { *out = cstr.into_raw() };
            OLEDISP_OK
        }
        Err(e) => {
            set_last_error(&format!("CString conversion failed: {e}"));
            OLEDISP_ERROR
        }
    }
}

unsafe fn write_json<T: serde::Serialize + ?Sized>(out: *mut *mut c_char, value: &T) -> i32 {
    match serde_json::to_string(value) {
        Ok(json) => unsafe { write_string(out, json) },
        Err(e) => {
            set_last_error(&format!("JSON serialization failed: {e}"));
            OLEDISP_ERROR
        }
    }
}

/// Retrieve the last error message (thread-local).
///
/// Returns a pointer valid until the next oledisp_* call on this thread.
/// Returns null if no error has occurred.
#[no_mangle]
pub extern "C" fn oledisp_last_error() -> *const c_char {
    LAST_ERROR.with(|e| {
        e.borrow()
            .as_ref()
            .map(|s| s.as_ptr())
            .unwrap_or(ptr::null())
    })
}

/// Free a string previously allocated by an oledisp_* function.
///
/// # Safety
///
/// `ptr` must be a pointer returned by an oledisp_* function or null.
#[no_mangle]
pub unsafe extern "C" fn oledisp_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(unsafe { CString::from_raw(ptr) });
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Load a JSON type library from `path` into the process registry.
///
/// # Safety
///
/// `path` must be a valid null-terminated UTF-8 C string.  `out_count` may
/// be null; otherwise it receives the number of classes registered.
#[no_mangle]
pub unsafe extern "C" fn oledisp_load_library(path: *const c_char, out_count: *mut usize) -> i32 {
    let path = match unsafe { str_arg(path, "path") } {
        Ok(p) => p,
        Err(code) => return code,
    };
    match TypeLibrary::from_path(Path::new(path)) {
        Ok(library) => {
            let count = ClassRegistry::global().register_library(library);
            if !out_count.is_null() {
                unsafe { *out_count = count };
            }
            OLEDISP_OK
        }
        Err(e) => fail(e),
    }
}

/// Register a type library given as JSON text.
///
/// # Safety
///
/// Same contract as [`oledisp_load_library`].
#[no_mangle]
pub unsafe extern "C" fn oledisp_register_library(
    json: *const c_char,
    out_count: *mut usize,
) -> i32 {
    let json = match unsafe { str_arg(json, "json") } {
        Ok(j) => j,
        Err(code) => return code,
    };
    match TypeLibrary::from_json(json) {
        Ok(library) => {
            let count = ClassRegistry::global().register_library(library);
            if !out_count.is_null() {
                unsafe { *out_count = count };
            }
            OLEDISP_OK
        }
        Err(e) => fail(e),
    }
}

/// Look up the descriptor registered for `identifier` and return it as JSON.
///
/// Returns `OLEDISP_NOT_FOUND` when nothing is registered.
///
/// # Safety
///
/// `identifier` must be a valid C string; `out_json` a valid pointer.  Free
/// the result with `oledisp_free_string()`.
#[no_mangle]
pub unsafe extern "C" fn oledisp_lookup(
    identifier: *const c_char,
    out_json: *mut *mut c_char,
) -> i32 {
    let text = match unsafe { str_arg(identifier, "identifier") } {
        Ok(t) => t,
        Err(code) => return code,
    };
    let identifier: Identifier = match text.parse() {
        Ok(id) => id,
        Err(e) => return fail(e),
    };
    match ClassRegistry::global().lookup(&identifier) {
        Some(descriptor) => unsafe { write_json(out_json, &*descriptor) },
        None => {
            set_last_error(&format!("no descriptor registered for {identifier}"));
            OLEDISP_NOT_FOUND
        }
    }
}

/// Named constant from the loaded libraries, as JSON.
///
/// # Safety
///
/// `name` must be a valid C string; `out_json` a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn oledisp_constant(name: *const c_char, out_json: *mut *mut c_char) -> i32 {
    let name = match unsafe { str_arg(name, "name") } {
        Ok(n) => n,
        Err(code) => return code,
    };
    match ClassRegistry::global().constants().get(name) {
        Ok(value) => unsafe { write_json(out_json, &value) },
        Err(e) => fail(e),
    }
}

// ---------------------------------------------------------------------------
// Dynamic name tables
// ---------------------------------------------------------------------------

/// Create an empty name table.  Free with `oledisp_names_free()`.
#[no_mangle]
pub extern "C" fn oledisp_names_new() -> *mut DynamicNameTable {
    Box::into_raw(Box::new(DynamicNameTable::new()))
}

/// ID for `name`, allocating one on first sight.
///
/// # Safety
///
/// `table` must come from `oledisp_names_new()`; `name` must be a valid C
/// string; `out_id` a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn oledisp_names_assign(
    table: *mut DynamicNameTable,
    name: *const c_char,
    out_id: *mut DispId,
) -> i32 {
    if table.is_null() || out_id.is_null() {
        set_last_error("null pointer argument");
        return OLEDISP_ERROR;
    }
    let name = match unsafe { str_arg(name, "name") } {
        Ok(n) => n,
        Err(code) => return code,
    };
    let id = unsafe { &mut *table }.get_or_assign(name);
    unsafe { *out_id = id };
    OLEDISP_OK
}

/// Name recorded for `id`.  Free the result with `oledisp_free_string()`.
///
/// # Safety
///
/// `table` must come from `oledisp_names_new()`; `out_name` must be valid.
#[no_mangle]
pub unsafe extern "C" fn oledisp_names_name_of(
    table: *const DynamicNameTable,
    id: DispId,
    out_name: *mut *mut c_char,
) -> i32 {
    if table.is_null() {
        set_last_error("table is null");
        return OLEDISP_ERROR;
    }
    match unsafe { &*table }.name_of(id) {
        Some(name) => unsafe { write_string(out_name, name.to_owned()) },
        None => {
            set_last_error(&format!("no name for dispid {id}"));
            OLEDISP_NOT_FOUND
        }
    }
}

/// # Safety
///
/// `table` must come from `oledisp_names_new()` and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn oledisp_names_free(table: *mut DynamicNameTable) {
    if !table.is_null() {
        drop(unsafe { Box::from_raw(table) });
    }
}

// ---------------------------------------------------------------------------
// Property bags
// ---------------------------------------------------------------------------

/// A property bag served through the dynamic policy.
pub struct BagHandle {
    policy: DispatchPolicy<PropertyBag>,
}

/// Create a property bag.  Returns null on failure (see last error).
#[no_mangle]
pub extern "C" fn oledisp_bag_new() -> *mut BagHandle {
    match DispatchPolicy::bound(WrappedObject::new(PropertyBag::new(), None)) {
        Ok(policy) => Box::into_raw(Box::new(BagHandle { policy })),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

/// Invoke a member of the bag.
///
/// `name` selects the member by name; when null, `dispid` is used.  `args_json`
/// is a JSON array of positional arguments (null means none).  On success
/// `*out_json` receives the JSON result.
///
/// # Safety
///
/// `bag` must come from `oledisp_bag_new()`; string arguments must be valid
/// C strings or null as described; `out_json` must be a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn oledisp_bag_invoke(
    bag: *mut BagHandle,
    name: *const c_char,
    dispid: DispId,
    flags: u16,
    args_json: *const c_char,
    out_json: *mut *mut c_char,
) -> i32 {
    if bag.is_null() {
        set_last_error("bag is null");
        return OLEDISP_ERROR;
    }
    let target = if name.is_null() {
        Target::Id(dispid)
    } else {
        match unsafe { str_arg(name, "name") } {
            Ok(n) => Target::Name(n.to_owned()),
            Err(code) => return code,
        }
    };
    let args: Vec<Value> = if args_json.is_null() {
        Vec::new()
    } else {
        let text = match unsafe { str_arg(args_json, "args_json") } {
            Ok(t) => t,
            Err(code) => return code,
        };
        match serde_json::from_str(text) {
            Ok(args) => args,
            Err(e) => return fail(e.into()),
        }
    };

    let request = DispatchRequest::new(target, InvokeFlags::from_bits(flags), args);
    match unsafe { &mut *bag }.policy.invoke(request) {
        Ok(value) => unsafe { write_json(out_json, &value) },
        Err(e) => fail(e),
    }
}

/// # Safety
///
/// `bag` must come from `oledisp_bag_new()` and not be used afterwards.
#[no_mangle]
pub unsafe extern "C" fn oledisp_bag_free(bag: *mut BagHandle) {
    if !bag.is_null() {
        drop(unsafe { Box::from_raw(bag) });
    }
}
