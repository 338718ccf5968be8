//! Stack validation.
//!
//! Checks names, references and engine settings before anything is planned.
//! Cycles are left to the graph builder, which reports the offending path.

use crate::error::{ConfigError, KeelsonError, Result};
use std::collections::BTreeSet;
use tracing::debug;

use super::spec::{EngineConfig, ProjectConfig, PropertyValue, ResourceConfig, StackConfig};

/// Validator for stack files.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a stack.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any check fails.
    pub fn validate(&self, stack: &StackConfig) -> Result<ValidationResult> {
        let result = self.check(stack);

        if let Some(first_error) = result.errors.first() {
            return Err(KeelsonError::Config(ConfigError::validation(
                first_error.message.clone(),
                first_error.field.clone(),
            )));
        }

        debug!("Stack validation passed");
        Ok(result)
    }

    /// Runs every check and collects all errors and warnings.
    #[must_use]
    pub fn check(&self, stack: &StackConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&stack.project, &mut result);
        Self::validate_engine(&stack.engine, &mut result);
        Self::validate_types(stack, &mut result);
        Self::validate_resources(stack, &mut result);

        result
    }

    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        }
    }

    fn validate_engine(engine: &EngineConfig, result: &mut ValidationResult) {
        if engine.workers == 0 {
            result.error("engine.workers", "At least one worker is required");
        }
        if engine.max_attempts == 0 {
            result.error("engine.max_attempts", "At least one attempt is required");
        }
        if engine.initial_backoff_ms > engine.max_backoff_ms {
            result.warnings.push(format!(
                "engine.initial_backoff_ms ({}) exceeds engine.max_backoff_ms ({}); every retry waits {}ms",
                engine.initial_backoff_ms, engine.max_backoff_ms, engine.max_backoff_ms
            ));
        }
    }

    fn validate_types(stack: &StackConfig, result: &mut ValidationResult) {
        let used: BTreeSet<&str> = stack
            .resources
            .values()
            .map(|resource| resource.resource_type.as_str())
            .collect();

        for (type_name, config) in &stack.types {
            if !is_valid_type_name(type_name) {
                result.error(
                    format!("types.{type_name}"),
                    format!("Type name '{type_name}' is invalid"),
                );
            }
            if !used.contains(type_name.as_str()) {
                result
                    .warnings
                    .push(format!("Type '{type_name}' is configured but no resource uses it"));
            }
            let mut seen = BTreeSet::new();
            for key in &config.immutable {
                if !seen.insert(key) {
                    result.warnings.push(format!(
                        "types.{type_name}.immutable lists '{key}' more than once"
                    ));
                }
            }
        }
    }

    fn validate_resources(stack: &StackConfig, result: &mut ValidationResult) {
        if stack.resources.is_empty() {
            result.warnings.push(String::from("No resources defined in stack"));
            return;
        }

        for (name, resource) in &stack.resources {
            let field = format!("resources.{name}");

            if !is_valid_name(name) {
                result.error(
                    &field,
                    format!(
                        "Resource name '{name}' is invalid. Must be lowercase alphanumeric with hyphens."
                    ),
                );
            }

            if !is_valid_type_name(&resource.resource_type) {
                result.error(
                    format!("{field}.type"),
                    format!("Resource type '{}' is invalid", resource.resource_type),
                );
            }

            Self::validate_references(stack, name, resource, result);

            let mut non_finite = Vec::new();
            for (key, value) in &resource.properties {
                collect_non_finite(value, &format!("{field}.properties.{key}"), &mut non_finite);
            }
            for property in non_finite {
                result.error(property, "NaN and infinite numbers cannot be stored");
            }
        }
    }

    fn validate_references(
        stack: &StackConfig,
        name: &str,
        resource: &ResourceConfig,
        result: &mut ValidationResult,
    ) {
        let mut targets = Vec::new();
        for (key, value) in &resource.properties {
            collect_targets(value, &format!("resources.{name}.properties.{key}"), &mut targets);
        }
        for (i, target) in resource.depends_on.iter().enumerate() {
            targets.push((format!("resources.{name}.depends_on[{i}]"), target.as_str()));
        }

        for (field, target) in targets {
            if target == name {
                result.error(field, format!("Resource '{name}' cannot depend on itself"));
            } else if !stack.resources.contains_key(target) {
                result.error(
                    field,
                    format!("Resource '{name}' refers to undeclared resource '{target}'"),
                );
            }
        }

        let mut seen = BTreeSet::new();
        for target in &resource.depends_on {
            if !seen.insert(target) {
                result.warnings.push(format!(
                    "resources.{name}.depends_on lists '{target}' more than once"
                ));
            }
        }
    }
}

fn collect_targets<'a>(value: &'a PropertyValue, field: &str, out: &mut Vec<(String, &'a str)>) {
    match value {
        PropertyValue::Reference(reference) => out.push((field.to_string(), &reference.target)),
        PropertyValue::List(items) => {
            for (i, item) in items.iter().enumerate() {
                collect_targets(item, &format!("{field}[{i}]"), out);
            }
        }
        _ => {}
    }
}

fn collect_non_finite(value: &PropertyValue, field: &str, out: &mut Vec<String>) {
    match value {
        PropertyValue::Float(x) if !x.is_finite() => out.push(field.to_string()),
        PropertyValue::List(items) => {
            for (i, item) in items.iter().enumerate() {
                collect_non_finite(item, &format!("{field}[{i}]"), out);
            }
        }
        _ => {}
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    // First character must be a letter
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    // Rest must be lowercase alphanumeric or hyphen
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

/// Type names follow the name convention but may also use underscores.
fn is_valid_type_name(type_name: &str) -> bool {
    is_valid_name(&type_name.replace('_', "-"))
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
