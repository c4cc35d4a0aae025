//! Server-Sent Events wire decoding.
//!
//! [`SseDecoder`] is a push decoder over raw bytes; [`EventStream`] wraps a
//! byte-chunk [`Stream`](futures_core::Stream) (such as a response body) and
//! yields [`SseFrame`]s.

mod decoder;
mod event;
mod stream;

pub use decoder::{DEFAULT_MAX_SIZE, DecodeError, SseDecoder};
pub use event::{SseEvent, SseFrame};
pub use stream::{EventStream, EventStreamError};
