//! Action Registry
//!
//! Maps element kind tags to factories. A front-end parser produces
//! [`ActionSpec`] trees; the registry turns each node into the action
//! registered for its kind.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::action::{Action, SourceLocation};
use super::actions::{
    CallAction, CommandAction, RaiseAction, ScriptAction, SequenceAction, SpawnAction,
    TerminateAction, TerminateScope,
};
use crate::error::{EngineError, Result};

/// Structural description of one action node.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ActionSpec {
    pub kind: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ActionSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
}

impl ActionSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_child(mut self, child: ActionSpec) -> Self {
        self.children.push(child);
        self
    }

    pub fn at(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Required attribute, or an invalid-action error naming it.
    pub fn require(&self, name: &str) -> Result<&str> {
        self.attribute(name).ok_or_else(|| self.invalid(format!("missing '{}' attribute", name)))
    }

    pub fn invalid(&self, message: impl Into<String>) -> EngineError {
        EngineError::InvalidAction {
            kind: self.kind.clone(),
            message: message.into(),
        }
    }
}

/// Builds an action from its spec; nested children are built through the
/// registry passed in.
pub type ActionFactory =
    Arc<dyn Fn(&ActionSpec, &ActionRegistry) -> Result<Box<dyn Action>> + Send + Sync>;

/// Kind tag to factory table.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    factories: HashMap<String, ActionFactory>,
}

impl ActionRegistry {
    /// Creates a registry with no kinds registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with every built-in kind registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("call", |spec, _| {
            let mut call = CallAction::new(spec.require("function")?);
            if let Some(args) = spec.attribute("args") {
                call = call.with_args(args);
            }
            Ok(Box::new(call.at_location(spec.location.clone())))
        });
        registry.register("sequence", |spec, registry| {
            let children = registry.build_children(spec)?;
            Ok(Box::new(SequenceAction::new(children).at_location(spec.location.clone())))
        });
        registry.register("script", |spec, _| {
            let code = match (&spec.text, spec.attribute("code")) {
                (Some(text), _) => text.as_str(),
                (None, Some(code)) => code,
                (None, None) => return Err(spec.invalid("no script code")),
            };
            Ok(Box::new(ScriptAction::new(code).at_location(spec.location.clone())))
        });
        registry.register("raise", |spec, _| {
            let mut raise = RaiseAction::new(spec.require("signal")?);
            if let Some(message) = spec.attribute("message") {
                raise = raise.with_message(message);
            }
            Ok(Box::new(raise))
        });
        registry.register("terminate", |spec, _| {
            let scope = match spec.attribute("scope").unwrap_or("job") {
                "job" => TerminateScope::Job,
                "thread" => TerminateScope::Thread,
                other => return Err(spec.invalid(format!("unknown scope '{}'", other))),
            };
            let code = match spec.attribute("code") {
                Some(code) => code
                    .parse()
                    .map_err(|_| spec.invalid(format!("invalid code '{}'", code)))?,
                None => 0,
            };
            Ok(Box::new(TerminateAction::new(scope, code)))
        });
        registry.register("spawn", |spec, registry| {
            let share = match spec.attribute("share") {
                Some(value) => value
                    .parse()
                    .map_err(|_| spec.invalid(format!("invalid share flag '{}'", value)))?,
                None => false,
            };
            let branches = registry.build_children(spec)?;
            Ok(Box::new(SpawnAction::new(branches, share)))
        });
        registry.register("command", |spec, _| {
            Ok(Box::new(CommandAction::new(
                spec.require("machine")?,
                spec.require("service")?,
                spec.require("request")?,
            )))
        });
        registry
    }

    /// Registers (or replaces) the factory for `kind`.
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&ActionSpec, &ActionRegistry) -> Result<Box<dyn Action>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered kinds in sorted order.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Builds the action described by `spec`.
    pub fn build(&self, spec: &ActionSpec) -> Result<Box<dyn Action>> {
        let factory = self
            .factories
            .get(&spec.kind)
            .ok_or_else(|| EngineError::UnknownActionKind(spec.kind.clone()))?;
        factory(spec, self)
    }

    /// Builds every child of `spec` as a shareable prototype.
    pub fn build_children(&self, spec: &ActionSpec) -> Result<Vec<Arc<dyn Action>>> {
        spec.children
            .iter()
            .map(|child| self.build(child).map(Arc::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_kinds() {
        let registry = ActionRegistry::with_builtins();
        assert_eq!(
            registry.kinds(),
            vec!["call", "command", "raise", "script", "sequence", "spawn", "terminate"]
        );
    }

    #[test]
    fn test_unknown_kind() {
        let registry = ActionRegistry::with_builtins();
        let err = registry.build(&ActionSpec::new("loop")).err().unwrap();
        assert!(matches!(err, EngineError::UnknownActionKind(kind) if kind == "loop"));
    }

    #[test]
    fn test_call_requires_function() {
        let registry = ActionRegistry::with_builtins();
        let err = registry.build(&ActionSpec::new("call")).err().unwrap();
        assert!(err.to_string().contains("missing 'function' attribute"));
    }

    #[test]
    fn test_call_carries_location() {
        let registry = ActionRegistry::with_builtins();
        let spec = ActionSpec::new("call")
            .with_attribute("function", "setup")
            .at(SourceLocation::new("suite.xml", 40));
        let action = registry.build(&spec).unwrap();

        assert_eq!(action.function_name(), Some("setup"));
        assert_eq!(action.location().map(|l| l.line), Some(40));
    }

    #[test]
    fn test_nested_children() {
        let registry = ActionRegistry::with_builtins();
        let spec = ActionSpec::new("sequence")
            .with_child(ActionSpec::new("script").with_text("x = 1"))
            .with_child(ActionSpec::new("raise").with_attribute("signal", "Done"));
        let action = registry.build(&spec).unwrap();
        assert_eq!(action.describe(), "sequence (2 children)");
    }

    #[test]
    fn test_invalid_terminate_scope() {
        let registry = ActionRegistry::with_builtins();
        let spec = ActionSpec::new("terminate").with_attribute("scope", "galaxy");
        assert!(registry.build(&spec).is_err());
    }

    #[test]
    fn test_custom_kind_overrides() {
        let mut registry = ActionRegistry::with_builtins();
        registry.register("script", |_, _| Ok(Box::new(ScriptAction::new("custom = 1"))));
        let action = registry.build(&ActionSpec::new("script")).unwrap();
        assert_eq!(action.kind(), "script");
        assert!(registry.contains("script"));
    }
}
