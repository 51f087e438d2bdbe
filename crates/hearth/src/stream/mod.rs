//! Streaming relay: NDJSON framing, events and the relay state machine

mod event;
mod frame;
mod relay;

pub use event::{RelayOutcome, RelayState, StreamEvent};
pub use frame::{FrameDecoder, FrameStream};
pub use relay::{EventSink, RelayHandle, RelayKind, RelayRequest, SinkError, StreamRelay};
