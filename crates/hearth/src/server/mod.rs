//! HTTP daemon exposing the relay and the conversation vault

mod http;
mod ndjson;

pub use http::{AppState, CONVERSATIONS, HearthServer, create_error_response, create_router};
pub use ndjson::STREAM_ID_HEADER;
