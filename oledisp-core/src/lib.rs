//! `oledisp_core` -- Pure Rust dispatch-resolution and invocation-policy engine.
//!
//! This crate contains all binding logic with **no PyO3 dependency**.
//! It can be consumed by:
//! - `oledisp-pyo3` (PyO3 Python extension)
//! - `oledisp-ffi` (C ABI DLL for ctypes / other languages)
//! - `oledisp-cli` (standalone CLI tools)
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`errors`] | `DispatchError` / `NativeError` via `thiserror` |
//! | [`identifier`] | `Identifier`, `DispId` sentinels, `InvokeFlags` |
//! | [`value`] | `Value` and declared-type coercion |
//! | [`descriptor`] | `ClassDescriptor` dispatch tables |
//! | [`registry`] | Process-wide identifier → descriptor registry |
//! | [`constants`] | Layered named-constant tables |
//! | [`library`] | JSON type libraries and the directory generator |
//! | [`capability`] | Traits for native handles, hooks, event sources |
//! | [`object`] | `WrappedObject` binding a handle to a descriptor |
//! | [`request`] | `DispatchRequest` |
//! | [`policy`] | `Policy` trait and `DispatchPolicy` routing |
//! | [`dynamic`] | Dynamic name table and fallback policy |
//! | [`resolver`] | `ClassResolver` choosing static vs dynamic binding |
//! | [`events`] | Event routing and the connection-owning `EventProxy` |
//! | [`bag`] | `PropertyBag` in-process dynamic object |
//! | `com` | `IDispatch` backend and apartment guard (Windows only) |

pub mod bag;
pub mod capability;
#[cfg(windows)]
pub mod com;
pub mod constants;
pub mod descriptor;
pub mod dynamic;
pub mod errors;
pub mod events;
pub mod identifier;
pub mod library;
pub mod object;
pub mod policy;
pub mod registry;
pub mod request;
pub mod resolver;
pub mod value;

#[cfg(test)]
pub(crate) mod testing;

pub use capability::{DescriptorGenerator, DynamicHook, EventSink, NativeHandle, NotificationSource};
pub use descriptor::{ClassDescriptor, ParamDesc};
pub use errors::{DispatchError, NativeError};
pub use identifier::{DispId, Identifier, InvokeFlags};
pub use policy::{DispatchPolicy, Policy};
pub use registry::ClassRegistry;
pub use resolver::ClassResolver;
pub use value::{Value, VarType};
