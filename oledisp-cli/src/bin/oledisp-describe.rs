//! Standalone CLI tool for dumping the dispatch tables of a JSON type library.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use oledisp_core::descriptor::ClassDescriptor;
use oledisp_core::identifier::Identifier;
use oledisp_core::library::TypeLibrary;
use serde_json::json;

#[derive(Parser)]
#[command(name = "oledisp-describe", about = "Dump dispatch tables from a type library as JSON")]
struct Args {
    /// Path to the JSON type library
    path: PathBuf,

    /// Only describe this class (identifier in registry format)
    #[arg(long)]
    class: Option<Identifier>,

    /// Include the library's named constants
    #[arg(long)]
    constants: bool,

    /// Compact JSON output (no pretty-printing)
    #[arg(long)]
    compact: bool,
}

fn describe(class: &ClassDescriptor) -> serde_json::Value {
    let members: Vec<serde_json::Value> = class
        .entries()
        .map(|(kind, dispid, info)| {
            json!({
                "kind": kind,
                "dispid": dispid,
                "name": info.name,
                "params": info.params,
                "result": info.result,
                "variadic": info.variadic,
            })
        })
        .collect();
    json!({
        "name": class.name(),
        "identifier": class.identifier().to_string(),
        "default_source": class.default_source().map(|s| s.to_string()),
        "interfaces": class.interfaces().iter().map(ToString::to_string).collect::<Vec<_>>(),
        "members": members,
    })
}

fn main() -> ExitCode {
    let args = Args::parse();

    let library = match TypeLibrary::from_path(&args.path) {
        Ok(lib) => lib,
        Err(e) => {
            eprintln!("Failed to load {}: {e}", args.path.display());
            return ExitCode::FAILURE;
        }
    };

    let classes: Vec<serde_json::Value> = match args.class {
        Some(id) => match library.class(&id) {
            Some(class) => vec![describe(class)],
            None => {
                eprintln!("{id} is not described by {}", library.name);
                return ExitCode::FAILURE;
            }
        },
        None => library.classes.iter().map(describe).collect(),
    };

    let mut output = json!({
        "library": library.name,
        "classes": classes,
    });
    if args.constants {
        output["constants"] = json!(library.constants);
    }

    let rendered = if args.compact {
        serde_json::to_string(&output)
    } else {
        serde_json::to_string_pretty(&output)
    };
    match rendered {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to render JSON: {e}");
            ExitCode::FAILURE
        }
    }
}
