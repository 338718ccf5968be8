//! Stack file parser.
//!
//! This module handles loading stacks from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, KeelsonError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::StackConfig;

/// Parser for loading stack files.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving the `.env` file.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a stack from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let path = path.as_ref();
        info!("Loading stack from: {}", path.display());

        if !path.exists() {
            return Err(KeelsonError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            KeelsonError::Config(ConfigError::Parse {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a stack from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackConfig> {
        debug!("Parsing YAML stack");

        let stack: StackConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            KeelsonError::Config(ConfigError::Parse {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed stack for project {} with {} resources",
            stack.project.name,
            stack.resources.len()
        );
        Ok(stack)
    }

    /// Loads a stack with environment variable overrides.
    ///
    /// Recognised variables: `KEELSON_PROJECT_NAME`,
    /// `KEELSON_PROJECT_ENVIRONMENT`, `KEELSON_STATE_PATH` and `KEELSON_WORKERS`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if an
    /// override has an invalid value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let mut stack = self.load_file(path)?;
        Self::apply_env_overrides(&mut stack)?;
        Ok(stack)
    }

    /// Applies environment variable overrides to the stack.
    fn apply_env_overrides(stack: &mut StackConfig) -> Result<()> {
        if let Ok(name) = std::env::var("KEELSON_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            stack.project.name = name;
        }

        if let Ok(env) = std::env::var("KEELSON_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            stack.project.environment = env;
        }

        if let Ok(path) = std::env::var("KEELSON_STATE_PATH") {
            debug!("Overriding state.path from environment");
            stack.state.path = Some(path);
        }

        if let Ok(workers) = std::env::var("KEELSON_WORKERS") {
            debug!("Overriding engine.workers from environment");
            stack.engine.workers = workers.trim().parse().map_err(|_| ConfigError::MissingEnvVar {
                name: String::from("KEELSON_WORKERS"),
            })?;
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                KeelsonError::Config(ConfigError::Parse {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Default stack file names to search for.
pub const DEFAULT_STACK_FILES: &[&str] = &[
    "keelson.stack.yaml",
    "keelson.stack.yml",
    "stack.yaml",
    "stack.yml",
];

/// Finds the stack file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no stack file is found.
pub fn find_stack_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_STACK_FILES {
            let stack_path = current.join(filename);
            if stack_path.exists() {
                info!("Found stack file: {}", stack_path.display());
                return Ok(stack_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(KeelsonError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_STACK_FILES[0]),
    }))
}
