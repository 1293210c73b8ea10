//! Configuration management
//!
//! Runtime settings come from the environment (`GLOBAL_CONFIG`); consensus
//! and resource policy comes from an optional TOML file (`NodePolicy`).

pub mod settings;

pub use settings::{Config, NodePolicy, GLOBAL_CONFIG};
