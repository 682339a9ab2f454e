//! JSON-RPC IPC worker for out-of-process dispatch.
//!
//! Reads line-delimited JSON requests from stdin, dispatches to oledisp_core,
//! writes JSON responses to stdout.  Objects created by the worker live until
//! `release` (or process exit) and are addressed by the integer handle
//! returned from `create`.

use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::path::Path;

use clap::Parser;
use serde::{Deserialize, Serialize};

use oledisp_core::bag::PropertyBag;
use oledisp_core::capability::NativeHandle;
use oledisp_core::identifier::{DispId, Identifier, InvokeFlags};
use oledisp_core::library::{LibraryDirectory, TypeLibrary};
use oledisp_core::policy::{Binding, DispatchPolicy, Policy};
use oledisp_core::registry::ClassRegistry;
use oledisp_core::request::{DispatchRequest, Target};
use oledisp_core::resolver::ClassResolver;
use oledisp_core::value::Value;

#[derive(Parser)]
#[command(name = "oledisp-worker", about = "oledisp IPC dispatch worker process")]
struct Args {
    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Directory of JSON type libraries used to generate missing descriptors
    #[arg(long)]
    library_dir: Option<std::path::PathBuf>,
}

#[derive(Deserialize)]
struct Request {
    id: u64,
    method: String,
    #[serde(default)]
    params: serde_json::Value,
}

#[derive(Serialize)]
struct Response {
    id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

type Handle = Box<dyn NativeHandle>;

fn str_param<'a>(params: &'a serde_json::Value, key: &str) -> Result<&'a str, String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("missing string parameter '{key}'"))
}

fn identifier_param(params: &serde_json::Value, key: &str) -> Result<Option<Identifier>, String> {
    match params.get(key).and_then(|v| v.as_str()) {
        Some(text) => text.parse().map(Some).map_err(|e: oledisp_core::DispatchError| e.to_string()),
        None => Ok(None),
    }
}

fn args_param(params: &serde_json::Value) -> Result<Vec<Value>, String> {
    match params.get("args") {
        Some(args) => serde_json::from_value(args.clone()).map_err(|e| e.to_string()),
        None => Ok(Vec::new()),
    }
}

fn target_param(params: &serde_json::Value) -> Result<Target, String> {
    if let Some(name) = params.get("name").and_then(|v| v.as_str()) {
        return Ok(Target::Name(name.to_owned()));
    }
    match params.get("dispid").and_then(|v| v.as_i64()) {
        Some(id) => DispId::try_from(id)
            .map(Target::Id)
            .map_err(|_| format!("dispid {id} out of range")),
        None => Ok(Target::Default),
    }
}

fn binding_json(binding: Binding) -> serde_json::Value {
    match binding {
        Binding::Unbound => serde_json::json!({ "kind": "unbound" }),
        Binding::Dynamic => serde_json::json!({ "kind": "dynamic" }),
        Binding::Static(d) => serde_json::json!({
            "kind": "static",
            "class": d.name(),
            "identifier": d.identifier().to_string(),
        }),
    }
}

fn to_json<T: Serialize>(value: T) -> Result<serde_json::Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

/// Instantiate the native object named by `params`.
#[cfg(windows)]
fn instantiate(params: &serde_json::Value) -> Result<(Handle, Option<Identifier>), String> {
    use oledisp_core::com::ComObject;

    if let Some(prog_id) = params.get("prog_id").and_then(|v| v.as_str()) {
        let (object, class) = ComObject::from_prog_id(prog_id).map_err(|e| e.to_string())?;
        return Ok((Box::new(object), Some(class)));
    }
    if let Some(class) = identifier_param(params, "class")? {
        let object = ComObject::create(&class).map_err(|e| e.to_string())?;
        return Ok((Box::new(object), Some(class)));
    }
    bag(params)
}

#[cfg(not(windows))]
fn instantiate(params: &serde_json::Value) -> Result<(Handle, Option<Identifier>), String> {
    if params.get("prog_id").is_some() || params.get("class").is_some() {
        return Err("native classes are only available on Windows".to_owned());
    }
    bag(params)
}

fn bag(params: &serde_json::Value) -> Result<(Handle, Option<Identifier>), String> {
    let identifier = identifier_param(params, "identifier")?;
    let bag = match identifier {
        Some(id) => PropertyBag::with_identifier(id),
        None => PropertyBag::new(),
    };
    Ok((Box::new(bag), identifier))
}

struct Worker {
    library_dir: Option<std::path::PathBuf>,
    objects: HashMap<u64, DispatchPolicy<Handle>>,
    next_handle: u64,
}

impl Worker {
    fn new(library_dir: Option<std::path::PathBuf>) -> Self {
        Self {
            library_dir,
            objects: HashMap::new(),
            next_handle: 1,
        }
    }

    fn object(&mut self, params: &serde_json::Value) -> Result<&mut DispatchPolicy<Handle>, String> {
        let handle = params
            .get("handle")
            .and_then(|v| v.as_u64())
            .ok_or("missing integer parameter 'handle'")?;
        self.objects
            .get_mut(&handle)
            .ok_or_else(|| format!("no object with handle {handle}"))
    }

    fn create(&mut self, params: &serde_json::Value) -> Result<serde_json::Value, String> {
        let (native, hint) = instantiate(params)?;
        let resolver = match &self.library_dir {
            Some(dir) => ClassResolver::new(ClassRegistry::global())
                .with_generator(LibraryDirectory::new(dir.clone())),
            None => ClassResolver::new(ClassRegistry::global()),
        };
        let policy = resolver.dispatch(native, hint).map_err(|e| e.to_string())?;

        let handle = self.next_handle;
        self.next_handle += 1;
        let binding = binding_json(policy.binding());
        self.objects.insert(handle, policy);
        Ok(serde_json::json!({ "handle": handle, "binding": binding }))
    }

    fn dispatch(&mut self, method: &str, params: &serde_json::Value) -> Result<serde_json::Value, String> {
        match method {
            "load_library" => {
                let path = str_param(params, "path")?;
                let library = TypeLibrary::from_path(Path::new(path)).map_err(|e| e.to_string())?;
                Ok(serde_json::Value::from(ClassRegistry::global().register_library(library)))
            }
            "register_library" => {
                let library: TypeLibrary = params
                    .get("library")
                    .ok_or("missing parameter 'library'")
                    .and_then(|v| serde_json::from_value(v.clone()).map_err(|_| "invalid library"))?;
                Ok(serde_json::Value::from(ClassRegistry::global().register_library(library)))
            }
            "lookup" => {
                let id = identifier_param(params, "identifier")?.ok_or("missing parameter 'identifier'")?;
                match ClassRegistry::global().lookup(&id) {
                    Some(descriptor) => to_json(&*descriptor),
                    None => Ok(serde_json::Value::Null),
                }
            }
            "constant" => {
                let name = str_param(params, "name")?;
                let value = ClassRegistry::global()
                    .constants()
                    .get(name)
                    .map_err(|e| e.to_string())?;
                to_json(value)
            }
            "create" => self.create(params),
            "binding" => Ok(binding_json(self.object(params)?.binding())),
            "get_id" => {
                let name = str_param(params, "name")?.to_owned();
                let id = self.object(params)?.get_id_for_name(&name).map_err(|e| e.to_string())?;
                Ok(serde_json::Value::from(id))
            }
            "member_name" => {
                let id = params
                    .get("dispid")
                    .and_then(|v| v.as_i64())
                    .and_then(|v| DispId::try_from(v).ok())
                    .ok_or("missing integer parameter 'dispid'")?;
                let name = self.object(params)?.member_name(id).map_err(|e| e.to_string())?;
                Ok(serde_json::Value::String(name))
            }
            "dispids" => to_json(self.object(params)?.dispids()),
            "invoke" => {
                let target = target_param(params)?;
                let flags = params
                    .get("flags")
                    .and_then(|v| v.as_u64())
                    .and_then(|v| u16::try_from(v).ok())
                    .map(InvokeFlags::from_bits)
                    .unwrap_or(InvokeFlags::METHOD_OR_GET);
                let args = args_param(params)?;
                let request = DispatchRequest::new(target, flags, args);
                let value = self.object(params)?.invoke(request).map_err(|e| e.to_string())?;
                to_json(value)
            }
            "get" => {
                let name = str_param(params, "name")?.to_owned();
                let value = self.object(params)?.get_member(&name).map_err(|e| e.to_string())?;
                to_json(value)
            }
            "put" => {
                let name = str_param(params, "name")?.to_owned();
                let value: Value = params
                    .get("value")
                    .map(|v| serde_json::from_value(v.clone()))
                    .transpose()
                    .map_err(|e| e.to_string())?
                    .unwrap_or_default();
                self.object(params)?.set_member(&name, value).map_err(|e| e.to_string())?;
                Ok(serde_json::Value::Null)
            }
            "call" => {
                let name = str_param(params, "name")?.to_owned();
                let args = args_param(params)?;
                let value = self.object(params)?.call_method(&name, args).map_err(|e| e.to_string())?;
                to_json(value)
            }
            "query_interface" => {
                let iid = identifier_param(params, "iid")?.ok_or("missing parameter 'iid'")?;
                Ok(serde_json::Value::Bool(self.object(params)?.query_interface(&iid)))
            }
            "release" => {
                let handle = params
                    .get("handle")
                    .and_then(|v| v.as_u64())
                    .ok_or("missing integer parameter 'handle'")?;
                Ok(serde_json::Value::Bool(self.objects.remove(&handle).is_some()))
            }
            "ping" => Ok(serde_json::Value::String("pong".to_owned())),
            _ => Err(format!("unknown method: {method}")),
        }
    }
}

fn main() {
    let args = Args::parse();
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    #[cfg(windows)]
    let _com = match oledisp_core::com::ComGuard::init() {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("oledisp-worker: COM initialization failed: {e}");
            None
        }
    };

    let mut worker = Worker::new(args.library_dir);

    if args.verbose {
        eprintln!("oledisp-worker: ready");
    }

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                if args.verbose {
                    eprintln!("oledisp-worker: stdin read error: {e}");
                }
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let req: Request = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                // Parse error -- use id=0 since we can't extract it.
                let resp = Response {
                    id: 0,
                    result: None,
                    error: Some(format!("invalid JSON: {e}")),
                };
                if let Ok(json) = serde_json::to_string(&resp) {
                    let _ = writeln!(stdout, "{json}");
                    let _ = stdout.flush();
                }
                continue;
            }
        };

        if args.verbose {
            eprintln!("oledisp-worker: {} #{}", req.method, req.id);
        }

        let resp = match worker.dispatch(&req.method, &req.params) {
            Ok(result) => Response {
                id: req.id,
                result: Some(result),
                error: None,
            },
            Err(error) => Response {
                id: req.id,
                result: None,
                error: Some(error),
            },
        };

        if let Ok(json) = serde_json::to_string(&resp) {
            let _ = writeln!(stdout, "{json}");
        } else {
            // Serialization failed -- send minimal error response.
            let _ = writeln!(
                stdout,
                r#"{{"id":{},"error":"response serialization failed"}}"#,
                req.id
            );
        }
        let _ = stdout.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bag_lifecycle() {
        let mut worker = Worker::new(None);
        let created = worker.dispatch("create", &json!({})).unwrap();
        assert_eq!(created["binding"]["kind"], "dynamic");
        let handle = created["handle"].as_u64().unwrap();

        worker
            .dispatch("put", &json!({ "handle": handle, "name": "Title", "value": "doc" }))
            .unwrap();
        let value = worker
            .dispatch("get", &json!({ "handle": handle, "name": "TITLE" }))
            .unwrap();
        assert_eq!(value, json!("doc"));

        let id = worker
            .dispatch("get_id", &json!({ "handle": handle, "name": "title" }))
            .unwrap();
        let name = worker
            .dispatch("member_name", &json!({ "handle": handle, "dispid": id }))
            .unwrap();
        assert_eq!(name, json!("Title"));

        assert_eq!(worker.dispatch("release", &json!({ "handle": handle })).unwrap(), json!(true));
        assert!(worker.dispatch("get", &json!({ "handle": handle, "name": "Title" })).is_err());
    }

    #[test]
    fn test_invoke_by_dispid_with_flags() {
        let mut worker = Worker::new(None);
        let handle = worker.dispatch("create", &json!({})).unwrap()["handle"].clone();
        let put = InvokeFlags::PROPERTY_PUT.bits();
        worker
            .dispatch("invoke", &json!({ "handle": handle, "name": "Size", "flags": put, "args": [3] }))
            .unwrap();
        let id = worker.dispatch("get_id", &json!({ "handle": handle, "name": "Size" })).unwrap();
        let get = InvokeFlags::PROPERTY_GET.bits();
        let value = worker
            .dispatch("invoke", &json!({ "handle": handle, "dispid": id, "flags": get }))
            .unwrap();
        assert_eq!(value, json!(3));
    }

    #[test]
    fn test_errors_are_strings() {
        let mut worker = Worker::new(None);
        assert_eq!(worker.dispatch("ping", &json!(null)).unwrap(), json!("pong"));
        assert!(worker.dispatch("bogus", &json!({})).unwrap_err().contains("unknown method"));
        assert!(worker.dispatch("get", &json!({ "handle": 99, "name": "x" })).is_err());
        let err = worker.dispatch("lookup", &json!({ "identifier": "not-a-guid" })).unwrap_err();
        assert!(err.contains("InvalidIdentifier"));
    }
}
