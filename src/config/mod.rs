//! Stack file configuration.
//!
//! This module handles the declaration layer used by the CLI:
//! - Parsing and deserializing `keelson.stack.yaml`
//! - Validation of names, references and engine settings
//! - Digests for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{find_stack_file, ConfigParser, DEFAULT_STACK_FILES};
pub use spec::{
    EngineConfig, ProjectConfig, PropertyValue, ProviderConfig, RefConfig, ResourceConfig,
    StackConfig, StateConfig, TypeConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
