//! Configuration management
//!
//! Data directory, wallet file, mining and logging settings for the binary.

pub mod settings;

pub use settings::Settings;
