//! Configuration module for tablesync
//!
//! Provides the CLI arguments and the JSON settings file layer.

mod settings;

pub use settings::*;
