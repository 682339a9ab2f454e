//! JSON type libraries and the directory-backed generator.
//!
//! A [`TypeLibrary`] is the serialized output of the binding generator: the
//! class descriptors of one library plus its named constants.
//! [`LibraryDirectory`] plays the role of the generated-module cache: asked
//! for an identifier, it scans a directory of `*.json` libraries and returns
//! the matching class.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::capability::DescriptorGenerator;
use crate::descriptor::ClassDescriptor;
use crate::errors::DispatchError;
use crate::identifier::Identifier;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeLibrary {
    pub name: String,
    #[serde(default)]
    pub classes: Vec<ClassDescriptor>,
    #[serde(default)]
    pub constants: HashMap<String, Value>,
}

impl TypeLibrary {
    pub fn from_json(json: &str) -> Result<Self, DispatchError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, DispatchError> {
        let text = fs::read_to_string(path)
            .map_err(|e| DispatchError::Library(format!("{}: {e}", path.display())))?;
        Self::from_json(&text)
            .map_err(|e| DispatchError::Library(format!("{}: {e}", path.display())))
    }

    pub fn class(&self, identifier: &Identifier) -> Option<&ClassDescriptor> {
        self.classes.iter().find(|c| c.identifier() == *identifier)
    }
}

/// Generator that finds descriptors in a directory of JSON type libraries.
#[derive(Debug, Clone)]
pub struct LibraryDirectory {
    root: PathBuf,
}

impl LibraryDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Library files in name order, so a scan is deterministic.
    fn library_files(&self) -> Result<Vec<PathBuf>, DispatchError> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.root)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();
        Ok(files)
    }
}

impl DescriptorGenerator for LibraryDirectory {
    fn generate(&self, identifier: &Identifier) -> Result<ClassDescriptor, DispatchError> {
        let unavailable = |reason: String| DispatchError::GenerationUnavailable {
            identifier: *identifier,
            reason,
        };

        let files = self
            .library_files()
            .map_err(|e| unavailable(e.to_string()))?;

        for path in files {
            match TypeLibrary::from_path(&path) {
                Ok(library) => {
                    if let Some(class) = library.class(identifier) {
                        log::debug!(
                            "LibraryDirectory: {identifier} found in {}",
                            path.display()
                        );
                        return Ok(class.clone());
                    }
                }
                Err(e) => log::warn!("LibraryDirectory: skipping unreadable library: {e}"),
            }
        }

        Err(unavailable(format!(
            "no library under {} describes it",
            self.root.display()
        )))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
