//! Hearth - streaming relay to a local inference backend
//!
//! The crate forwards generate, chat and pull streams from an Ollama-style
//! backend as typed events, and keeps conversation records encrypted at rest.

pub mod backend;
pub mod config;
pub mod error;
pub mod progress;
pub mod server;
pub mod stream;
pub mod vault;

pub use error::{HearthError, Result};
