//! `oledisp` -- Thin PyO3 wrappers around `oledisp_core`.
//!
//! A Python object becomes a dispatch server by wrapping it in
//! [`PyDispatch`].  Objects listing `_public_methods_` (and optionally
//! `_public_attrs_` / `_readonly_attrs_`) are served through the designated
//! tables; objects with a `_dynamic_` method are served dynamically.
//! `_com_interfaces_` lists extra interfaces answered by `query_interface`,
//! and a callable `_arg_transformer_` rewrites every argument list before it
//! is routed.  All routing logic lives in `oledisp_core`.
//!
//! Unit tests embed an interpreter, so they run without the
//! `extension-module` feature: `cargo test -p oledisp-pyo3 --no-default-features`.

use std::sync::Arc;

use pyo3::exceptions::{PyAttributeError, PyRuntimeError, PyTypeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyBool, PyDict, PyFloat, PyInt, PyList, PyString, PyTuple};

use oledisp_core::capability::{DynamicHook, NativeHandle};
use oledisp_core::descriptor::{ClassDescriptor, PublicMembers};
use oledisp_core::errors::{DispatchError, NativeError, DISP_E_MEMBERNOTFOUND, E_FAIL};
use oledisp_core::identifier::{
    DispId, Identifier, InvokeFlags, DISPID_EVALUATE, DISPID_NEWENUM, DISPID_PROPERTYPUT,
    DISPID_STARTENUM, DISPID_VALUE,
};
use oledisp_core::library::TypeLibrary;
use oledisp_core::object::WrappedObject;
use oledisp_core::policy::{ArgTransformer, Binding, DispatchPolicy, Policy};
use oledisp_core::registry::ClassRegistry;
use oledisp_core::request::{DispatchRequest, Target};
use oledisp_core::resolver::ClassResolver;
use oledisp_core::value::Value;

// ---------------------------------------------------------------------------
// Error conversion helpers
// ---------------------------------------------------------------------------

fn to_py_err(e: DispatchError) -> PyErr {
    if e.is_member_not_found() {
        PyAttributeError::new_err(e.to_string())
    } else {
        PyRuntimeError::new_err(e.to_string())
    }
}

fn to_native_err(py: Python<'_>, e: PyErr) -> NativeError {
    if e.is_instance_of::<PyAttributeError>(py) {
        NativeError::new(DISP_E_MEMBERNOTFOUND, e.to_string())
    } else {
        NativeError::new(E_FAIL, e.to_string())
    }
}

fn parse_identifier(text: &str) -> PyResult<Identifier> {
    text.parse().map_err(|e: DispatchError| PyValueError::new_err(e.to_string()))
}

// ---------------------------------------------------------------------------
// Value <-> Python conversion
// ---------------------------------------------------------------------------

fn value_to_py(py: Python<'_>, value: &Value) -> PyResult<PyObject> {
    Ok(match value {
        Value::Empty => py.None(),
        Value::Bool(b) => PyBool::new(py, *b).to_owned().into_any().unbind(),
        Value::Int(i) => i.into_pyobject(py)?.into_any().unbind(),
        Value::Float(f) => PyFloat::new(py, *f).into_any().unbind(),
        Value::Str(s) => PyString::new(py, s).into_any().unbind(),
        Value::Array(items) => {
            let list = PyList::empty(py);
            for item in items {
                list.append(value_to_py(py, item)?)?;
            }
            list.into_any().unbind()
        }
        Value::Object { handle } => {
            let dict = PyDict::new(py);
            dict.set_item("handle", handle)?;
            dict.into_any().unbind()
        }
    })
}

fn value_from_py(obj: &Bound<'_, PyAny>) -> PyResult<Value> {
    if obj.is_none() {
        return Ok(Value::Empty);
    }
    // bool before int: Python's bool is an int subclass.
    if let Ok(b) = obj.downcast::<PyBool>() {
        return Ok(Value::Bool(b.is_true()));
    }
    if let Ok(i) = obj.downcast::<PyInt>() {
        return Ok(Value::Int(i.extract()?));
    }
    if let Ok(f) = obj.downcast::<PyFloat>() {
        return Ok(Value::Float(f.value()));
    }
    if let Ok(s) = obj.downcast::<PyString>() {
        return Ok(Value::Str(s.extract()?));
    }
    if let Ok(list) = obj.downcast::<PyList>() {
        let items = list.iter().map(|item| value_from_py(&item));
        return items.collect::<PyResult<_>>().map(Value::Array);
    }
    if let Ok(tuple) = obj.downcast::<PyTuple>() {
        let items = tuple.iter().map(|item| value_from_py(&item));
        return items.collect::<PyResult<_>>().map(Value::Array);
    }
    if let Ok(dict) = obj.downcast::<PyDict>() {
        if let Some(handle) = dict.get_item("handle")? {
            return Ok(Value::Object {
                handle: handle.extract()?,
            });
        }
    }
    Err(PyTypeError::new_err(format!(
        "cannot pass {} across the dispatch boundary",
        obj.get_type().name()?
    )))
}

fn args_to_py<'py>(py: Python<'py>, args: &[Value]) -> PyResult<Bound<'py, PyTuple>> {
    let items = args
        .iter()
        .map(|a| value_to_py(py, a))
        .collect::<PyResult<Vec<PyObject>>>()?;
    PyTuple::new(py, items)
}

// ---------------------------------------------------------------------------
// Python object as a native handle
// ---------------------------------------------------------------------------

/// Serves dispatch calls from a Python object.
struct PyServer {
    object: Py<PyAny>,
    descriptor: Option<Arc<ClassDescriptor>>,
    dynamic: bool,
}

impl PyServer {
    fn call(&self, py: Python<'_>, id: DispId, flags: InvokeFlags, args: &[Value]) -> PyResult<Value> {
        let missing = || PyAttributeError::new_err(format!("no member with dispid {id}"));
        let desc = self.descriptor.as_ref().ok_or_else(missing)?;
        let object = self.object.bind(py);

        if flags.is_put() {
            let name = &desc.putter(id).ok_or_else(missing)?.name;
            let value = args.first().map(|v| value_to_py(py, v)).transpose()?;
            object.setattr(name.as_str(), value.unwrap_or_else(|| py.None()))?;
            return Ok(Value::Empty);
        }
        let found = if flags.contains(InvokeFlags::METHOD) {
            desc.method(id).or_else(|| desc.getter(id))
        } else {
            desc.getter(id)
        };
        let member = found.ok_or_else(missing)?;

        let attr = object.getattr(member.name.as_str())?;
        // Methods are called; so is a method fetched as a property.
        let result = if attr.is_callable() {
            attr.call1(args_to_py(py, args)?)?
        } else {
            attr
        };
        value_from_py(&result)
    }
}

impl NativeHandle for PyServer {
    fn invoke_native(
        &self,
        id: DispId,
        flags: InvokeFlags,
        args: &[Value],
    ) -> Result<Value, NativeError> {
        Python::with_gil(|py| self.call(py, id, flags, args).map_err(|e| to_native_err(py, e)))
    }

    fn dynamic_hook(&self) -> Option<&dyn DynamicHook> {
        if self.dynamic {
            Some(self)
        } else {
            None
        }
    }
}

impl DynamicHook for PyServer {
    fn dynamic_invoke(
        &self,
        name: &str,
        flags: InvokeFlags,
        args: &[Value],
    ) -> Result<Value, NativeError> {
        Python::with_gil(|py| {
            let call = || -> PyResult<Value> {
                let py_args = args_to_py(py, args)?;
                let result = self
                    .object
                    .bind(py)
                    .call_method1("_dynamic_", (name, 0, flags.bits(), py_args))?;
                value_from_py(&result)
            };
            call().map_err(|e| to_native_err(py, e))
        })
    }
}

/// `_com_interfaces_` entries, each an identifier in registry format.
fn com_interfaces(obj: &Bound<'_, PyAny>) -> PyResult<Vec<Identifier>> {
    if !obj.hasattr("_com_interfaces_")? {
        return Ok(Vec::new());
    }
    let names: Vec<String> = obj.getattr("_com_interfaces_")?.extract()?;
    names.iter().map(|n| parse_identifier(n)).collect()
}

/// Wrap a Python callable taking and returning an argument sequence.
fn py_arg_transformer(callable: Py<PyAny>) -> ArgTransformer {
    Box::new(move |args| {
        Python::with_gil(|py| {
            let transform = || -> PyResult<Vec<Value>> {
                let result = callable.bind(py).call1((args_to_py(py, &args)?,))?;
                let items: Vec<Bound<'_, PyAny>> = result.extract()?;
                items.iter().map(value_from_py).collect()
            };
            transform().map_err(|e| DispatchError::from(to_native_err(py, e)))
        })
    })
}

fn public_members(obj: &Bound<'_, PyAny>) -> PyResult<PublicMembers> {
    let names = |attr: &str| -> PyResult<Vec<String>> {
        match obj.getattr(attr) {
            Ok(list) => list.extract(),
            Err(_) => Ok(Vec::new()),
        }
    };
    Ok(PublicMembers {
        methods: names("_public_methods_")?,
        attrs: names("_public_attrs_")?,
        readonly: names("_readonly_attrs_")?,
        interfaces: com_interfaces(obj)?,
        value: obj.hasattr("_value_")?,
        new_enum: obj.hasattr("_NewEnum")?,
        evaluate: obj.hasattr("_Evaluate")?,
    })
}

fn type_name(obj: &Bound<'_, PyAny>) -> String {
    obj.get_type()
        .name()
        .map(|n| n.to_string())
        .unwrap_or_else(|_| "object".to_owned())
}

// ---------------------------------------------------------------------------
// Dispatch class
// ---------------------------------------------------------------------------

/// A Python object served through the dispatch policy.
#[pyclass(name = "Dispatch", module = "oledisp", unsendable)]
struct PyDispatch {
    policy: DispatchPolicy<PyServer>,
}

fn target_from_py(target: Option<&Bound<'_, PyAny>>) -> PyResult<Target> {
    match target {
        None => Ok(Target::Default),
        Some(t) if t.is_none() => Ok(Target::Default),
        Some(t) => match t.extract::<DispId>() {
            Ok(id) => Ok(Target::Id(id)),
            Err(_) => Ok(Target::Name(t.extract()?)),
        },
    }
}

#[pymethods]
impl PyDispatch {
    /// Wrap `obj`.  A descriptor registered for `identifier` takes precedence;
    /// otherwise `_public_methods_` selects the designated tables and
    /// `_dynamic_` the dynamic policy.
    #[new]
    #[pyo3(signature = (obj, identifier=None))]
    fn new(obj: &Bound<'_, PyAny>, identifier: Option<&str>) -> PyResult<Self> {
        let hint = identifier.map(parse_identifier).transpose()?;
        let mut server = PyServer {
            object: obj.clone().unbind(),
            descriptor: None,
            dynamic: obj.hasattr("_dynamic_")?,
        };

        let resolver = ClassResolver::new(ClassRegistry::global());
        let mut descriptor = resolver.resolve(&server, hint).descriptor;
        if descriptor.is_none() && obj.hasattr("_public_methods_")? {
            let built = public_members(obj)?
                .into_descriptor(hint.unwrap_or(Identifier::from_u128(0)), type_name(obj))
                .map_err(to_py_err)?;
            descriptor = Some(Arc::new(built));
        }
        server.descriptor = descriptor.clone();

        let object = WrappedObject::new(server, descriptor);
        let mut policy = DispatchPolicy::bound(object).map_err(to_py_err)?;
        policy.add_interfaces(com_interfaces(obj)?);
        if obj.hasattr("_arg_transformer_")? {
            let transformer = obj.getattr("_arg_transformer_")?;
            if !transformer.is_callable() {
                return Err(PyTypeError::new_err("_arg_transformer_ must be callable"));
            }
            policy.set_arg_transformer(py_arg_transformer(transformer.unbind()));
        }
        Ok(Self { policy })
    }

    /// `"static"` or `"dynamic"`.
    #[getter]
    fn binding(&self) -> &'static str {
        match self.policy.binding() {
            Binding::Static(_) => "static",
            Binding::Dynamic => "dynamic",
            Binding::Unbound => "unbound",
        }
    }

    fn get_id_for_name(&mut self, name: &str) -> PyResult<DispId> {
        self.policy.get_id_for_name(name).map_err(to_py_err)
    }

    fn get_ids_of_names(&mut self, names: Vec<String>) -> PyResult<Vec<DispId>> {
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        self.policy.get_ids_of_names(&names).map_err(to_py_err)
    }

    fn member_name(&self, id: DispId) -> PyResult<String> {
        self.policy.member_name(id).map_err(to_py_err)
    }

    #[pyo3(signature = (after=DISPID_STARTENUM))]
    fn next_dispid(&self, after: DispId) -> PyResult<Option<DispId>> {
        self.policy.next_dispid(after).map_err(to_py_err)
    }

    fn dispids(&self) -> Vec<DispId> {
        self.policy.dispids()
    }

    /// Raw `Invoke`: `target` is a dispid, a name, or `None` for the default
    /// member.
    #[pyo3(signature = (target, flags, *args))]
    fn invoke(
        &mut self,
        py: Python<'_>,
        target: Option<&Bound<'_, PyAny>>,
        flags: u16,
        args: &Bound<'_, PyTuple>,
    ) -> PyResult<PyObject> {
        let target = target_from_py(target)?;
        let args = args.iter().map(|a| value_from_py(&a)).collect::<PyResult<Vec<_>>>()?;
        let request = DispatchRequest::new(target, InvokeFlags::from_bits(flags), args);
        let result = self.policy.invoke(request).map_err(to_py_err)?;
        value_to_py(py, &result)
    }

    fn get(&mut self, py: Python<'_>, name: &str) -> PyResult<PyObject> {
        let result = self.policy.get_member(name).map_err(to_py_err)?;
        value_to_py(py, &result)
    }

    fn put(&mut self, name: &str, value: &Bound<'_, PyAny>) -> PyResult<()> {
        let value = value_from_py(value)?;
        self.policy.set_member(name, value).map_err(to_py_err)
    }

    #[pyo3(signature = (name, *args))]
    fn call(&mut self, py: Python<'_>, name: &str, args: &Bound<'_, PyTuple>) -> PyResult<PyObject> {
        let args = args.iter().map(|a| value_from_py(&a)).collect::<PyResult<Vec<_>>>()?;
        let result = self.policy.call_method(name, args).map_err(to_py_err)?;
        value_to_py(py, &result)
    }

    fn query_interface(&self, iid: &str) -> PyResult<bool> {
        Ok(self.policy.query_interface(&parse_identifier(iid)?))
    }
}

// ---------------------------------------------------------------------------
// Registry functions
// ---------------------------------------------------------------------------

/// Register every class of a JSON type library; returns the class count.
#[pyfunction]
fn register_library(py: Python<'_>, json: &str) -> PyResult<usize> {
    let json = json.to_owned();
    py.allow_threads(move || {
        let library = TypeLibrary::from_json(&json)?;
        Ok(ClassRegistry::global().register_library(library))
    })
    .map_err(to_py_err)
}

/// Load a JSON type library from disk.
#[pyfunction]
fn load_library(py: Python<'_>, path: &str) -> PyResult<usize> {
    let path = std::path::PathBuf::from(path);
    py.allow_threads(move || {
        let library = TypeLibrary::from_path(&path)?;
        Ok(ClassRegistry::global().register_library(library))
    })
    .map_err(to_py_err)
}

/// Descriptor registered for `identifier`, as JSON, or `None`.
#[pyfunction]
fn lookup(identifier: &str) -> PyResult<Option<String>> {
    let identifier = parse_identifier(identifier)?;
    ClassRegistry::global()
        .lookup(&identifier)
        .map(|d| serde_json::to_string(&*d).map_err(|e| to_py_err(e.into())))
        .transpose()
}

#[pyfunction]
fn registered() -> Vec<String> {
    ClassRegistry::global()
        .identifiers()
        .iter()
        .map(Identifier::to_string)
        .collect()
}

/// Named constant from the loaded libraries.
#[pyfunction]
fn constant(py: Python<'_>, name: &str) -> PyResult<PyObject> {
    let value = ClassRegistry::global()
        .constants()
        .get(name)
        .map_err(to_py_err)?;
    value_to_py(py, &value)
}

#[pyfunction]
fn clear_registry() {
    ClassRegistry::global().clear();
}

// ---------------------------------------------------------------------------
// Module registration
// ---------------------------------------------------------------------------

/// Register the `oledisp` Python module.
#[pymodule]
fn oledisp(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyDispatch>()?;
    m.add_function(wrap_pyfunction!(register_library, m)?)?;
    m.add_function(wrap_pyfunction!(load_library, m)?)?;
    m.add_function(wrap_pyfunction!(lookup, m)?)?;
    m.add_function(wrap_pyfunction!(registered, m)?)?;
    m.add_function(wrap_pyfunction!(constant, m)?)?;
    m.add_function(wrap_pyfunction!(clear_registry, m)?)?;

    m.add("DISPATCH_METHOD", InvokeFlags::METHOD.bits())?;
    m.add("DISPATCH_PROPERTYGET", InvokeFlags::PROPERTY_GET.bits())?;
    m.add("DISPATCH_PROPERTYPUT", InvokeFlags::PROPERTY_PUT.bits())?;
    m.add("DISPATCH_PROPERTYPUTREF", InvokeFlags::PROPERTY_PUTREF.bits())?;
    m.add("DISPID_VALUE", DISPID_VALUE)?;
    m.add("DISPID_PROPERTYPUT", DISPID_PROPERTYPUT)?;
    m.add("DISPID_NEWENUM", DISPID_NEWENUM)?;
    m.add("DISPID_EVALUATE", DISPID_EVALUATE)?;
    m.add("DISPID_STARTENUM", DISPID_STARTENUM)?;

    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    m.add("__doc__", "Late-bound dispatch resolution and invocation policy.")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
