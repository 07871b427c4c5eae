//! Configuration Module
//!
//! Process settings from the environment and source definitions from YAML.
//! Both are loaded before the engine is built; any error here is fatal.

mod settings;
mod sources;

pub use settings::{ConfigError, EngineSettings};
pub use sources::{load_sources, load_sources_from_str};
