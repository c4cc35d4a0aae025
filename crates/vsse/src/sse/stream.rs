//! [`Stream`] adapter turning a byte-chunk stream into [`SseFrame`]s.

use core::{
    fmt::{self, Display, Formatter},
    pin::Pin,
    str::Utf8Error,
    task::{Context, Poll, ready},
};

use futures_core::Stream;

use super::{
    decoder::{DecodeError, SseDecoder},
    event::SseFrame,
};

/// Errors produced by [`EventStream`].
#[derive(Debug, PartialEq)]
pub enum EventStreamError<E> {
    /// Something went wrong with the underlying stream.
    Transport(E),
    /// A line was not valid UTF-8. The line was skipped.
    Utf8(Utf8Error),
    /// A line or event exceeded the decoder's size cap and was discarded.
    TooLarge { limit: usize },
}

impl<E: Display> Display for EventStreamError<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => e.fmt(f),
            Self::Utf8(e) => e.fmt(f),
            Self::TooLarge { limit } => write!(f, "line or event exceeds {limit} bytes"),
        }
    }
}

impl<E> core::error::Error for EventStreamError<E> where E: core::error::Error {}

pin_project_lite::pin_project! {
    /// A [`Stream`] of decoded [`SseFrame`]s over a stream of byte chunks.
    #[derive(Debug)]
    pub struct EventStream<S> {
        #[pin]
        stream: S,
        decoder: SseDecoder,
        terminated: bool,
    }
}

impl<S> EventStream<S> {
    /// Create a new [`EventStream`] from an underlying byte stream.
    pub fn new(stream: S) -> Self {
        Self::with_decoder(stream, SseDecoder::new())
    }

    /// Create a new [`EventStream`] decoding with a preconfigured decoder.
    pub fn with_decoder(stream: S, decoder: SseDecoder) -> Self {
        Self {
            stream,
            decoder,
            terminated: false,
        }
    }

    /// The last event id seen on this stream, or the one the decoder was
    /// seeded with. Empty once the server resets it.
    pub fn last_event_id(&self) -> &str {
        self.decoder.last_event_id()
    }
}

impl<S, E, B> Stream for EventStream<S>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    type Item = Result<SseFrame, EventStreamError<E>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            match this.decoder.next_frame() {
                Ok(Some(frame)) => return Poll::Ready(Some(Ok(frame))),
                Err(DecodeError::Utf8(e)) => return Poll::Ready(Some(Err(EventStreamError::Utf8(e)))),
                Err(DecodeError::TooLarge { limit }) => {
                    return Poll::Ready(Some(Err(EventStreamError::TooLarge { limit })));
                }
                Ok(None) if *this.terminated => return Poll::Ready(None),
                Ok(None) => {}
            }

            match ready!(this.stream.as_mut().poll_next(cx)) {
                Some(Ok(bytes)) => this.decoder.feed(bytes.as_ref()),
                Some(Err(e)) => return Poll::Ready(Some(Err(EventStreamError::Transport(e)))),
                None => {
                    *this.terminated = true;
                    this.decoder.finish();
                }
            }
        }
    }
}
