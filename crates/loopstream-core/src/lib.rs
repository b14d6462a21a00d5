//! # loopstream-core
//!
//! Core types, configuration, and error handling for the loopstream engine.

pub mod config;
pub mod error;
pub mod stream;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use stream::StreamInfo;
