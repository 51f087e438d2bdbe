//! Inference backend access: transport, typed client, wire types

mod client;
mod transport;
pub mod types;

pub use client::{OllamaClient, validate_digest};
pub use transport::{DualTimeoutTransport, TimeoutClass};
pub use types::{ModelInfo, RunningModel};
