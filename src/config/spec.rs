//! Stack file types.
//!
//! This module defines the structs that map to `keelson.stack.yaml`. A stack
//! declares resources by logical name; references to another resource's
//! outputs are written as `{ ref: <name>, output: <key> }`.

use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::graph::{PropertyMap, ResourceDecl, ResourceId, Value};
use crate::planner::RetryPolicy;
use crate::provider::TypeDescriptor;
use crate::state::STATE_DIR;

/// The root structure of a stack file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// Snapshot storage configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Executor settings.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Local provider settings.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Per-type replacement settings.
    #[serde(default)]
    pub types: BTreeMap<String, TypeConfig>,
    /// Declared resources keyed by logical name.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceConfig>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Snapshot storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// State directory, relative to the stack file. Defaults to `.keelson`.
    #[serde(default)]
    pub path: Option<String>,
}

/// Executor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum number of provider calls in flight.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Attempts per change, first try included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound on any retry delay, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// Local provider settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Directory resource documents are written to, relative to the stack
    /// file. Defaults to `<state dir>/resources`.
    #[serde(default)]
    pub root: Option<String>,
}

/// Replacement settings for one resource type.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypeConfig {
    /// Properties whose change forces a replacement.
    #[serde(default)]
    pub immutable: Vec<String>,
    /// Whether replacements create the new object first.
    #[serde(default)]
    pub create_before_delete: bool,
}

/// A declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Resource type name.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Desired properties.
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
    /// Logical names of resources this one must follow.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// A property value as written in the stack file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PropertyValue {
    /// Output of another declared resource.
    Reference(RefConfig),
    /// Explicit null.
    Null,
    /// Boolean literal.
    Bool(bool),
    /// Integer literal.
    Integer(i64),
    /// Floating point literal.
    Float(f64),
    /// String literal.
    String(String),
    /// List of values.
    List(Vec<PropertyValue>),
}

/// A `{ ref, output }` reference.
///
/// Only the mapping form is accepted, so a short list such as `[egress, dev]`
/// stays a list instead of being read as a reference.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RefConfig {
    /// Logical name of the referenced resource.
    #[serde(rename = "ref")]
    pub target: String,
    /// Output key, `id` by default.
    pub output: String,
}

impl<'de> Deserialize<'de> for RefConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_map(RefConfigVisitor)
    }
}

struct RefConfigVisitor;

impl<'de> Visitor<'de> for RefConfigVisitor {
    type Value = RefConfig;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a mapping with a `ref` key and an optional `output` key")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<RefConfig, A::Error> {
        let mut target: Option<String> = None;
        let mut output: Option<String> = None;
        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "ref" => {
                    if target.is_some() {
                        return Err(de::Error::duplicate_field("ref"));
                    }
                    target = Some(map.next_value()?);
                }
                "output" => {
                    if output.is_some() {
                        return Err(de::Error::duplicate_field("output"));
                    }
                    output = Some(map.next_value()?);
                }
                other => return Err(de::Error::unknown_field(other, &["ref", "output"])),
            }
        }
        Ok(RefConfig {
            target: target.ok_or_else(|| de::Error::missing_field("ref"))?,
            output: output.unwrap_or_else(default_output),
        })
    }
}

impl StackConfig {
    /// Returns the identity a logical name resolves to.
    #[must_use]
    pub fn resource_id(&self, name: &str) -> Option<ResourceId> {
        self.resources
            .get(name)
            .map(|resource| ResourceId::new(&resource.resource_type, name))
    }

    /// Converts the declared resources into graph declarations.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownReference`] if a reference or
    /// `depends_on` entry names an undeclared resource.
    pub fn to_declarations(&self) -> Result<Vec<ResourceDecl>> {
        self.resources
            .iter()
            .map(|(name, resource)| {
                let mut properties = PropertyMap::new();
                for (key, value) in &resource.properties {
                    properties.insert(key.clone(), self.convert_value(name, value)?);
                }

                let depends_on = resource
                    .depends_on
                    .iter()
                    .map(|target| self.lookup(name, target))
                    .collect::<Result<Vec<_>>>()?;

                Ok(ResourceDecl {
                    id: ResourceId::new(&resource.resource_type, name),
                    properties,
                    depends_on,
                })
            })
            .collect()
    }

    /// Returns a descriptor for every type that is declared or used.
    #[must_use]
    pub fn descriptors(&self) -> Vec<TypeDescriptor> {
        let mut descriptors: BTreeMap<&str, TypeDescriptor> = self
            .types
            .iter()
            .map(|(type_name, config)| (type_name.as_str(), config.descriptor(type_name)))
            .collect();
        for resource in self.resources.values() {
            descriptors
                .entry(resource.resource_type.as_str())
                .or_insert_with(|| TypeDescriptor::new(&resource.resource_type));
        }
        descriptors.into_values().collect()
    }

    /// Resolves the state directory against the stack file's directory.
    #[must_use]
    pub fn state_dir(&self, base: &Path) -> PathBuf {
        base.join(self.state.path.as_deref().unwrap_or(STATE_DIR))
    }

    /// Resolves the provider root against the stack file's directory.
    #[must_use]
    pub fn provider_root(&self, base: &Path) -> PathBuf {
        self.provider
            .root
            .as_deref()
            .map_or_else(|| self.state_dir(base).join("resources"), |root| base.join(root))
    }

    fn lookup(&self, from: &str, target: &str) -> Result<ResourceId> {
        self.resource_id(target).ok_or_else(|| {
            ConfigError::UnknownReference {
                resource: from.to_string(),
                target: target.to_string(),
            }
            .into()
        })
    }

    fn convert_value(&self, from: &str, value: &PropertyValue) -> Result<Value> {
        Ok(match value {
            PropertyValue::Reference(reference) => {
                self.lookup(from, &reference.target)?.output(&reference.output)
            }
            PropertyValue::Null => Value::Null,
            PropertyValue::Bool(b) => Value::Bool(*b),
            PropertyValue::Integer(i) => Value::Integer(*i),
            PropertyValue::Float(x) if x.is_finite() => Value::Float(*x),
            PropertyValue::Float(x) => {
                return Err(ConfigError::validation(
                    format!("{x} is not a finite number"),
                    format!("resources.{from}.properties"),
                )
                .into());
            }
            PropertyValue::String(s) => Value::String(s.clone()),
            PropertyValue::List(items) => Value::List(
                items
                    .iter()
                    .map(|item| self.convert_value(from, item))
                    .collect::<Result<Vec<_>>>()?,
            ),
        })
    }
}

impl EngineConfig {
    /// Builds the retry policy these settings describe.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl TypeConfig {
    /// Builds the descriptor for `type_name`.
    #[must_use]
    pub fn descriptor(&self, type_name: &str) -> TypeDescriptor {
        TypeDescriptor::new(type_name)
            .with_immutable(self.immutable.iter().cloned())
            .with_create_before_delete(self.create_before_delete)
    }
}

fn default_environment() -> String {
    String::from("dev")
}

const fn default_workers() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_initial_backoff_ms() -> u64 {
    200
}

const fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_output() -> String {
    String::from("id")
}
