//! Workflow Documents
//!
//! A parsed document is an optional root action (global declarations run
//! before the start function) plus a table of named functions. Documents
//! are immutable once built and are shared between jobs through the
//! document cache; every action in them is a prototype that is cloned
//! before it runs.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: smoke
//! default_function: main
//! functions:
//!   - name: main
//!     body:
//!       kind: sequence
//!       children:
//!         - kind: script
//!           text: "RESULT = 0"
//!         - kind: call
//!           attributes: { function: check }
//!   - name: check
//!     body:
//!       kind: script
//!       text: "RESULT = RESULT + 1"
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::action::Action;
use super::registry::{ActionRegistry, ActionSpec};
use crate::error::{EngineError, Result};

/// A named function in a document's function table.
#[derive(Clone)]
pub struct FunctionDef {
    pub name: String,
    pub description: Option<String>,
    pub body: Arc<dyn Action>,
}

/// A parsed workflow document.
#[derive(Clone, Default)]
pub struct Document {
    name: String,
    root: Option<Arc<dyn Action>>,
    functions: BTreeMap<String, FunctionDef>,
    default_function: Option<String>,
}

impl Document {
    /// Creates an empty document.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the root action run before the start function.
    pub fn with_root(mut self, root: impl Action) -> Self {
        self.root = Some(Arc::new(root));
        self
    }

    /// Adds a function whose body is `body`.
    pub fn with_function(mut self, name: impl Into<String>, body: impl Action) -> Self {
        self.add_function(name, None, Arc::new(body));
        self
    }

    /// Sets the function started when a submission names none.
    pub fn with_default_function(mut self, name: impl Into<String>) -> Self {
        self.default_function = Some(name.into());
        self
    }

    /// Adds or replaces a function.
    pub fn add_function(
        &mut self,
        name: impl Into<String>,
        description: Option<String>,
        body: Arc<dyn Action>,
    ) {
        let name = name.into();
        self.functions.insert(
            name.clone(),
            FunctionDef {
                name,
                description,
                body,
            },
        );
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> Option<&Arc<dyn Action>> {
        self.root.as_ref()
    }

    pub fn function(&self, name: &str) -> Option<&FunctionDef> {
        self.functions.get(name)
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn default_function(&self) -> Option<&str> {
        self.default_function.as_deref()
    }

    /// Function names in sorted order.
    pub fn function_names(&self) -> Vec<&str> {
        self.functions.keys().map(String::as_str).collect()
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("name", &self.name)
            .field("root", &self.root.as_ref().map(|r| r.describe()))
            .field("functions", &self.function_names())
            .field("default_function", &self.default_function)
            .finish()
    }
}

/// Function entry in a [`DocumentSpec`].
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FunctionSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub body: ActionSpec,
}

/// Structural description of a document, as produced by a front-end parser.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct DocumentSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<ActionSpec>,
    #[serde(default)]
    pub functions: Vec<FunctionSpec>,
}

impl DocumentSpec {
    /// Parses a spec from YAML (JSON is accepted too).
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Builds the executable document through `registry`.
    pub fn build(&self, registry: &ActionRegistry) -> Result<Document> {
        let mut document = Document::new(self.name.clone());

        if let Some(root) = &self.root {
            document.root = Some(Arc::from(registry.build(root)?));
        }

        for function in &self.functions {
            if document.has_function(&function.name) {
                return Err(EngineError::InvalidAction {
                    kind: "function".to_string(),
                    message: format!("duplicate function '{}'", function.name),
                });
            }
            let body: Arc<dyn Action> = Arc::from(registry.build(&function.body)?);
            document.add_function(function.name.clone(), function.description.clone(), body);
        }

        if let Some(default) = &self.default_function {
            if !document.has_function(default) {
                return Err(EngineError::InvalidStartFunction(default.clone()));
            }
            document.default_function = Some(default.clone());
        }

        debug!(
            "Built document '{}' with {} functions",
            document.name,
            document.functions.len()
        );
        Ok(document)
    }
}

/// Reads a document spec file and builds it.
pub fn load_document(path: impl AsRef<Path>, registry: &ActionRegistry) -> Result<Document> {
    let path = path.as_ref();
    info!("Loading document from: {}", path.display());

    let content = fs::read_to_string(path)?;
    let mut spec = DocumentSpec::from_yaml(&content)?;
    if spec.name.is_empty() {
        spec.name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("document")
            .to_string();
    }
    spec.build(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SPEC: &str = r#"
name: smoke
default_function: main
functions:
  - name: main
    description: entry point
    body:
      kind: sequence
      children:
        - kind: script
          text: "RESULT = 0"
        - kind: call
          attributes: { function: check }
  - name: check
    body:
      kind: script
      text: "RESULT = RESULT + 1"
"#;

    #[test]
    fn test_build_from_yaml() {
        let registry = ActionRegistry::with_builtins();
        let document = DocumentSpec::from_yaml(SPEC).unwrap().build(&registry).unwrap();

        assert_eq!(document.name(), "smoke");
        assert_eq!(document.default_function(), Some("main"));
        assert_eq!(document.function_names(), vec!["check", "main"]);
        assert_eq!(
            document.function("main").unwrap().description.as_deref(),
            Some("entry point")
        );
        assert_eq!(document.function("main").unwrap().body.kind(), "sequence");
    }

    #[test]
    fn test_unknown_default_function() {
        let registry = ActionRegistry::with_builtins();
        let mut spec = DocumentSpec::from_yaml(SPEC).unwrap();
        spec.default_function = Some("nope".to_string());

        assert!(matches!(
            spec.build(&registry),
            Err(EngineError::InvalidStartFunction(name)) if name == "nope"
        ));
    }

    #[test]
    fn test_duplicate_function_rejected() {
        let registry = ActionRegistry::with_builtins();
        let mut spec = DocumentSpec::from_yaml(SPEC).unwrap();
        let copy = spec.functions[0].clone();
        spec.functions.push(copy);

        assert!(matches!(
            spec.build(&registry),
            Err(EngineError::InvalidAction { .. })
        ));
    }

    #[test]
    fn test_load_document_names_from_file_stem() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nightly.yaml");
        fs::write(&path, SPEC.replace("name: smoke\n", "")).unwrap();

        let registry = ActionRegistry::with_builtins();
        let document = load_document(&path, &registry).unwrap();
        assert_eq!(document.name(), "nightly");
    }

    #[test]
    fn test_load_document_missing_file() {
        let registry = ActionRegistry::with_builtins();
        assert!(load_document("/nonexistent/doc.yaml", &registry).is_err());
    }
}
