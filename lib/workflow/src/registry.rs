//! The action registry.
//!
//! Maps stable action names such as `shipment.update_status` to a declared
//! config schema and either a handler or a structural kind. The registry is
//! filled once at startup and frozen before the engine shares it.

use crate::error::RegistryError;
use crate::handler::ActionHandler;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// The JSON type a config field must have.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Bool,
    Object,
    Array,
    Any,
    /// A string restricted to the listed values.
    OneOf(Vec<String>),
}

impl FieldType {
    /// Builds a `OneOf` from any list of names.
    #[must_use]
    pub fn one_of<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::OneOf(values.into_iter().map(Into::into).collect())
    }

    fn matches(&self, value: &JsonValue) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
            Self::OneOf(allowed) => value
                .as_str()
                .is_some_and(|s| allowed.iter().any(|a| a == s)),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::String => "a string".to_string(),
            Self::Number => "a number".to_string(),
            Self::Bool => "a boolean".to_string(),
            Self::Object => "an object".to_string(),
            Self::Array => "an array".to_string(),
            Self::Any => "any value".to_string(),
            Self::OneOf(allowed) => format!("one of {}", allowed.join(", ")),
        }
    }
}

/// One declared config field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub ty: FieldType,
    pub required: bool,
}

/// A config field that does not satisfy its schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub field: String,
    pub message: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config.{}: {}", self.field, self.message)
    }
}

/// The declared shape of an action's config object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSchema {
    fields: Vec<FieldSpec>,
}

impl ConfigSchema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn required(mut self, name: &'static str, ty: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name,
            ty,
            required: true,
        });
        self
    }

    #[must_use]
    pub fn optional(mut self, name: &'static str, ty: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name,
            ty,
            required: false,
        });
        self
    }

    #[must_use]
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Checks a resolved config.
    #[must_use]
    pub fn validate(&self, config: &JsonValue) -> Vec<SchemaViolation> {
        self.check(config, false)
    }

    /// Checks a config as written in a document.
    ///
    /// Strings containing `{{ }}` placeholders are only typed once resolved,
    /// so they pass the type check here.
    #[must_use]
    pub fn validate_static(&self, config: &JsonValue) -> Vec<SchemaViolation> {
        self.check(config, true)
    }

    fn check(&self, config: &JsonValue, allow_placeholders: bool) -> Vec<SchemaViolation> {
        let violation = |field: &str, message: String| SchemaViolation {
            field: field.to_string(),
            message,
        };

        let Some(map) = config.as_object() else {
            return vec![violation("", "config must be an object".to_string())];
        };

        let mut violations = Vec::new();
        for key in map.keys() {
            if self.field(key).is_none() {
                violations.push(violation(key, "unknown field".to_string()));
            }
        }
        for spec in &self.fields {
            match map.get(spec.name) {
                None | Some(JsonValue::Null) if spec.required => {
                    violations.push(violation(spec.name, "required field is missing".to_string()));
                }
                None | Some(JsonValue::Null) => {}
                Some(value) => {
                    let deferred = allow_placeholders
                        && value.as_str().is_some_and(|s| s.contains("{{"));
                    if !deferred && !spec.ty.matches(value) {
                        violations.push(violation(
                            spec.name,
                            format!("expected {}", spec.ty.describe()),
                        ));
                    }
                }
            }
        }
        violations
    }
}

/// Actions the runtime implements itself rather than through a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuralKind {
    WaitForEvent,
    Approval,
    Parallel,
    Delay,
}

/// What a registered action does when a step names it.
#[derive(Clone)]
pub enum ActionKind {
    Handler(Arc<dyn ActionHandler>),
    Structural(StructuralKind),
}

impl fmt::Debug for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handler(_) => f.write_str("Handler"),
            Self::Structural(kind) => f.debug_tuple("Structural").field(kind).finish(),
        }
    }
}

/// A registered action.
#[derive(Debug, Clone)]
pub struct ActionEntry {
    pub name: String,
    pub schema: ConfigSchema,
    pub kind: ActionKind,
}

impl ActionEntry {
    #[must_use]
    pub fn handler(&self) -> Option<&Arc<dyn ActionHandler>> {
        match &self.kind {
            ActionKind::Handler(handler) => Some(handler),
            ActionKind::Structural(_) => None,
        }
    }

    #[must_use]
    pub fn structural(&self) -> Option<StructuralKind> {
        match self.kind {
            ActionKind::Structural(kind) => Some(kind),
            ActionKind::Handler(_) => None,
        }
    }
}

/// Name to action lookup, frozen after startup.
#[derive(Debug, Default)]
pub struct ActionRegistry {
    entries: BTreeMap<String, ActionEntry>,
    frozen: bool,
}

impl ActionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler-backed action.
    ///
    /// # Errors
    ///
    /// Returns `RegistryFrozen` after [`freeze`](Self::freeze), or
    /// `DuplicateAction` if the name is taken.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        schema: ConfigSchema,
        handler: Arc<dyn ActionHandler>,
    ) -> Result<(), RegistryError> {
        self.insert(name.into(), schema, ActionKind::Handler(handler))
    }

    /// Registers an action the runtime executes structurally.
    ///
    /// # Errors
    ///
    /// Same as [`register`](Self::register).
    pub fn register_structural(
        &mut self,
        name: impl Into<String>,
        schema: ConfigSchema,
        kind: StructuralKind,
    ) -> Result<(), RegistryError> {
        self.insert(name.into(), schema, ActionKind::Structural(kind))
    }

    fn insert(
        &mut self,
        name: String,
        schema: ConfigSchema,
        kind: ActionKind,
    ) -> Result<(), RegistryError> {
        if self.frozen {
            return Err(RegistryError::RegistryFrozen { action: name });
        }
        if self.entries.contains_key(&name) {
            return Err(RegistryError::DuplicateAction { action: name });
        }
        self.entries.insert(
            name.clone(),
            ActionEntry { name, schema, kind },
        );
        Ok(())
    }

    /// Looks up an action by name.
    ///
    /// # Errors
    ///
    /// Returns `UnknownAction` for unregistered names.
    pub fn lookup(&self, name: &str) -> Result<&ActionEntry, RegistryError> {
        self.entries
            .get(name)
            .ok_or_else(|| RegistryError::UnknownAction {
                action: name.to_string(),
            })
    }

    /// Validates a resolved config against the action's schema.
    ///
    /// # Errors
    ///
    /// Returns `UnknownAction` for unregistered names.
    pub fn validate(
        &self,
        name: &str,
        config: &JsonValue,
    ) -> Result<Vec<SchemaViolation>, RegistryError> {
        Ok(self.lookup(name)?.schema.validate(config))
    }

    /// Rejects every later registration.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}
