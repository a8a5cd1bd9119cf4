//! Command Schemas
//!
//! Validation contracts for the commands a model may embed in its output.
//! Each contract is a typed payload struct: serde enforces required fields,
//! field types, enumerated value sets and defaults, while [`Validate`] adds the
//! range and non-emptiness rules serde cannot express on its own.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Name of the built-in "store knowledge" command.
pub const CONTEXT_STORE: &str = "context_store";
/// Name of the built-in "create task" command.
pub const TASK_CREATE: &str = "task_create";

/// Why a payload was rejected by a schema.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("payload does not match schema: {0}")]
    Shape(#[from] serde_json::Error),
    #[error("field '{field}' {reason}")]
    Constraint { field: &'static str, reason: String },
}

/// Constraints that go beyond what deserialization checks.
pub trait Validate {
    fn validate(&self) -> Result<(), SchemaError> {
        Ok(())
    }
}

/// A named validation contract for an embedded command payload.
pub trait CommandSchema: Send + Sync {
    /// The command name this schema validates.
    fn name(&self) -> &str;

    /// Validates a raw payload, returning the normalized object with
    /// defaults applied and unknown fields dropped.
    fn validate(&self, payload: Value) -> Result<Map<String, Value>, SchemaError>;

    /// Describes the payload as a JSON Schema document.
    fn json_schema(&self) -> Value;
}

/// A [`CommandSchema`] backed by a serde/schemars payload type.
pub struct TypedSchema<T> {
    name: String,
    _payload: PhantomData<fn() -> T>,
}

impl<T> TypedSchema<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _payload: PhantomData,
        }
    }
}

impl<T> CommandSchema for TypedSchema<T>
where
    T: DeserializeOwned + Serialize + JsonSchema + Validate,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, payload: Value) -> Result<Map<String, Value>, SchemaError> {
        let typed: T = serde_json::from_value(payload)?;
        typed.validate()?;
        match serde_json::to_value(&typed)? {
            Value::Object(map) => Ok(map),
            _ => Err(SchemaError::Constraint {
                field: "payload",
                reason: "must be a JSON object".to_string(),
            }),
        }
    }

    fn json_schema(&self) -> Value {
        serde_json::to_value(schemars::schema_for!(T)).unwrap_or_default()
    }
}

/// Maps command names to their validation contracts.
///
/// A lookup miss is not an error here; callers decide whether an unknown
/// command matters.
#[derive(Clone, Default)]
pub struct CommandSchemaRegistry {
    schemas: HashMap<String, Arc<dyn CommandSchema>>,
}

impl CommandSchemaRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the `context_store` and `task_create` schemas.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(TypedSchema::<StoreContextArgs>::new(CONTEXT_STORE));
        registry.register(TypedSchema::<CreateTaskArgs>::new(TASK_CREATE));
        registry
    }

    /// Adds a schema, replacing any existing schema with the same name.
    pub fn register(&mut self, schema: impl CommandSchema + 'static) {
        self.schemas
            .insert(schema.name().to_string(), Arc::new(schema));
    }

    pub fn get(&self, name: &str) -> Option<&dyn CommandSchema> {
        self.schemas.get(name).map(|s| s.as_ref())
    }

    /// Registered command names in alphabetical order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.schemas.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

// --- Built-in payloads ---

/// Category of a stored knowledge entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ContextType {
    Code,
    Decision,
    Error,
    Discussion,
    Planning,
    Completion,
    Milestone,
    Reflections,
    Handoff,
}

impl fmt::Display for ContextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContextType::Code => "code",
            ContextType::Decision => "decision",
            ContextType::Error => "error",
            ContextType::Discussion => "discussion",
            ContextType::Planning => "planning",
            ContextType::Completion => "completion",
            ContextType::Milestone => "milestone",
            ContextType::Reflections => "reflections",
            ContextType::Handoff => "handoff",
        };
        f.write_str(name)
    }
}

/// Payload of the `context_store` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StoreContextArgs {
    /// The knowledge to store.
    pub content: String,
    #[serde(rename = "type")]
    pub context_type: ContextType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(description = "Relevance between 0 and 10, inclusive")]
    pub relevance_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl StoreContextArgs {
    pub fn new(content: impl Into<String>, context_type: ContextType) -> Self {
        Self {
            content: content.into(),
            context_type,
            tags: None,
            relevance_score: None,
            session_id: None,
            metadata: None,
        }
    }
}

impl Validate for StoreContextArgs {
    fn validate(&self) -> Result<(), SchemaError> {
        if self.content.trim().is_empty() {
            return Err(SchemaError::Constraint {
                field: "content",
                reason: "must not be empty".to_string(),
            });
        }
        if let Some(score) = self.relevance_score {
            if !(0.0..=10.0).contains(&score) {
                return Err(SchemaError::Constraint {
                    field: "relevanceScore",
                    reason: format!("must be between 0 and 10, got {}", score),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    #[default]
    General,
    Feature,
    Bugfix,
    Refactor,
    Test,
    Review,
    Documentation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

/// Payload of the `task_create` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskArgs {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type", default)]
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl CreateTaskArgs {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
            task_type: TaskType::default(),
            priority: TaskPriority::default(),
            assigned_to: None,
            dependencies: None,
            tags: None,
            metadata: None,
        }
    }
}

impl Validate for CreateTaskArgs {
    fn validate(&self) -> Result<(), SchemaError> {
        if self.title.trim().is_empty() {
            return Err(SchemaError::Constraint {
                field: "title",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
