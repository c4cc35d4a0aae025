//! Incremental `text/event-stream` decoder.
//!
//! Follows the [HTML Living Standard] interpretation rules: LF, CR and CRLF
//! line endings, a leading BOM, `data` lines joined with `\n`, `id` persisting
//! across events and `retry` taking effect as soon as it is read. Unlike a
//! plain event parser it also yields comment lines, which servers commonly
//! use as keep-alive pings.
//!
//! [HTML Living Standard]: https://html.spec.whatwg.org/multipage/server-sent-events.html

use core::{
    fmt::{self, Display, Formatter},
    str::Utf8Error,
};
use std::time::Duration;

use bytes::{Buf, BytesMut};

use super::event::{SseEvent, SseFrame};

const LF: u8 = b'\n';
const CR: u8 = b'\r';
const BOM: &[u8; 3] = b"\xEF\xBB\xBF";
const DEFAULT_EVENT: &str = "message";
/// Default cap on a single line or a buffered event.
pub const DEFAULT_MAX_SIZE: usize = 1024 * 1024;

/// Errors from [`SseDecoder::next_frame`]. Decoding can continue after
/// either one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// A line was not valid UTF-8. The line was skipped.
    Utf8(Utf8Error),
    /// A line or event grew past `limit` bytes. It was discarded.
    TooLarge { limit: usize },
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Utf8(e) => e.fmt(f),
            Self::TooLarge { limit } => write!(f, "line or event exceeds {limit} bytes"),
        }
    }
}

impl core::error::Error for DecodeError {}

#[derive(Debug, Default)]
struct EventBuilder {
    event: String,
    data: Option<String>,
}

impl EventBuilder {
    fn len(&self) -> usize {
        self.event.len() + self.data.as_ref().map_or(0, String::len)
    }

    fn push_data(&mut self, value: &str) {
        match self.data.as_mut() {
            Some(data) => {
                data.push('\n');
                data.push_str(value);
            }
            None => self.data = Some(value.to_string()),
        }
    }

    fn dispatch(&mut self, last_event_id: &str) -> Option<SseEvent> {
        let EventBuilder { event, data } = core::mem::take(self);
        let data = data?;
        Some(SseEvent {
            event: if event.is_empty() {
                DEFAULT_EVENT.to_string()
            } else {
                event
            },
            data,
            id: last_event_id.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BomState {
    Pending,
    Done,
}

/// Push-based decoder: [`feed`](SseDecoder::feed) bytes, then drain frames
/// with [`next_frame`](SseDecoder::next_frame).
#[derive(Debug)]
pub struct SseDecoder {
    buffer: BytesMut,
    builder: EventBuilder,
    last_event_id: String,
    bom: BomState,
    finished: bool,
    max_size: usize,
    // Dropping the rest of an oversized line.
    discarding: bool,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            builder: EventBuilder::default(),
            last_event_id: String::new(),
            bom: BomState::Pending,
            finished: false,
            max_size: DEFAULT_MAX_SIZE,
            discarding: false,
        }
    }

    /// Cap the size of a single line and of a buffered event.
    #[must_use]
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Start from the id a previous stream left off at, so events without
    /// an `id` field carry it until the server sets a new one.
    #[must_use]
    pub fn with_last_event_id(mut self, id: impl Into<String>) -> Self {
        self.last_event_id = id.into();
        self
    }

    /// The last event id seen, used for `Last-Event-ID` on reconnect.
    pub fn last_event_id(&self) -> &str {
        &self.last_event_id
    }

    /// Append received bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.buffer.extend_from_slice(bytes);
        if self.bom == BomState::Pending {
            let n = self.buffer.len().min(BOM.len());
            if self.buffer[..n] != BOM[..n] {
                self.bom = BomState::Done;
            } else if n == BOM.len() {
                self.buffer.advance(BOM.len());
                self.bom = BomState::Done;
            }
        }
    }

    /// Mark end of input. A trailing lone CR terminates its line.
    pub fn finish(&mut self) {
        self.finished = true;
        self.bom = BomState::Done;
        if self.buffer.last() == Some(&CR) {
            self.buffer.extend_from_slice(&[LF]);
        }
    }

    /// Decode the next complete frame, if the buffer holds one.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Utf8`] for a line that is not valid UTF-8 and
    /// [`DecodeError::TooLarge`] for a line or event over the size cap. The
    /// offending input is discarded and decoding can continue.
    pub fn next_frame(&mut self) -> Result<Option<SseFrame>, DecodeError> {
        if self.bom == BomState::Pending {
            return Ok(None);
        }
        while let Some(line) = self.take_line() {
            if core::mem::take(&mut self.discarding) {
                continue;
            }
            if line.len() > self.max_size {
                return Err(self.too_large());
            }
            let line = core::str::from_utf8(&line).map_err(DecodeError::Utf8)?;
            if let Some(frame) = self.process_line(line) {
                return Ok(Some(frame));
            }
            if self.builder.len() > self.max_size {
                return Err(self.too_large());
            }
        }

        if self.discarding {
            self.buffer.clear();
        } else if self.buffer.len() > self.max_size {
            self.buffer.clear();
            self.discarding = true;
            return Err(self.too_large());
        }
        Ok(None)
    }

    fn too_large(&mut self) -> DecodeError {
        self.builder = EventBuilder::default();
        DecodeError::TooLarge {
            limit: self.max_size,
        }
    }

    fn take_line(&mut self) -> Option<BytesMut> {
        let pos = memchr::memchr2(CR, LF, &self.buffer)?;
        let terminator = match self.buffer[pos] {
            CR => match self.buffer.get(pos + 1) {
                Some(&LF) => 2,
                Some(_) => 1,
                // Could be the first half of CRLF.
                None if self.finished => 1,
                None => return None,
            },
            _ => 1,
        };
        let line = self.buffer.split_to(pos);
        self.buffer.advance(terminator);
        Some(line)
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self
                .builder
                .dispatch(&self.last_event_id)
                .map(SseFrame::Event);
        }

        if let Some(comment) = line.strip_prefix(':') {
            return Some(SseFrame::Comment(strip_space(comment).to_string()));
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, strip_space(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.builder.event = value.to_string(),
            "data" => self.builder.push_data(value),
            "id" => {
                if !value.contains('\0') {
                    self.last_event_id = value.to_string();
                }
            }
            "retry" => {
                if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
                    if let Ok(ms) = value.parse::<u64>() {
                        return Some(SseFrame::Retry(Duration::from_millis(ms)));
                    }
                }
            }
            _ => {}
        }
        None
    }
}

fn strip_space(value: &str) -> &str {
    value.strip_prefix(' ').unwrap_or(value)
}
