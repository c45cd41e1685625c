use crate::error::ChatError;
use crate::protocol::StreamChunk;
use futures::{Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

const DATA_PREFIX: &str = "data: ";

#[derive(Debug)]
pub enum StreamEvent {
    TokenChunk(String),
    ModelAnnounced(String),
    ToolInvoked { name: String, content: String },
    Completion,
    TransportError(ChatError),
}

pub fn interpret_chunk(chunk: StreamChunk) -> Option<StreamEvent> {
    if chunk.done {
        Some(StreamEvent::Completion)
    } else if let Some(model) = chunk.model.filter(|m| !m.is_empty()) {
        Some(StreamEvent::ModelAnnounced(model))
    } else if let Some(name) = chunk.tool_name.filter(|n| !n.is_empty()) {
        Some(StreamEvent::ToolInvoked {
            name,
            content: chunk.token,
        })
    } else if !chunk.token.is_empty() {
        Some(StreamEvent::TokenChunk(chunk.token))
    } else {
        None
    }
}

#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending_bytes: Vec<u8>,
    buffer: String,
    done: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }

        self.decode_utf8(chunk);

        while let Some(idx) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=idx).collect();
            self.push_line(&line, &mut events);
            if self.done {
                self.buffer.clear();
                break;
            }
        }

        events
    }

    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.done {
            return events;
        }

        if !self.pending_bytes.is_empty() {
            self.pending_bytes.clear();
            self.buffer.push(char::REPLACEMENT_CHARACTER);
        }

        let rest = std::mem::take(&mut self.buffer);
        if !rest.is_empty() {
            self.push_line(&rest, &mut events);
        }

        if !self.done {
            self.done = true;
            events.push(StreamEvent::Completion);
        }

        events
    }

    fn decode_utf8(&mut self, chunk: &[u8]) {
        self.pending_bytes.extend_from_slice(chunk);

        loop {
            match std::str::from_utf8(&self.pending_bytes) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    self.pending_bytes.clear();
                    return;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    if let Ok(text) = std::str::from_utf8(&self.pending_bytes[..valid]) {
                        self.buffer.push_str(text);
                    }
                    match err.error_len() {
                        Some(len) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            self.pending_bytes.drain(..valid + len);
                        }
                        // Sequence continues in the next read.
                        None => {
                            self.pending_bytes.drain(..valid);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn push_line(&mut self, line: &str, events: &mut Vec<StreamEvent>) {
        let line = line.trim_end_matches(['\n', '\r']);
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            return;
        };

        let chunk = match serde_json::from_str::<StreamChunk>(payload) {
            Ok(chunk) => chunk,
            Err(err) => {
                let err = ChatError::from(err);
                tracing::warn!(error = %err, "Error parsing SSE data");
                return;
            }
        };

        if let Some(event) = interpret_chunk(chunk) {
            if matches!(event, StreamEvent::Completion) {
                self.done = true;
            }
            events.push(event);
        }
    }
}

struct DecodeState<S> {
    body: Pin<Box<S>>,
    decoder: StreamDecoder,
    pending: VecDeque<StreamEvent>,
    cancel: CancellationToken,
    finished: bool,
}

/// Decodes a response body into a lazy event stream.
///
/// Ends after a completion or transport error. Once `cancel` fires the
/// stream ends at the next suspension point without emitting anything else.
pub fn decode<S, B, E>(body: S, cancel: CancellationToken) -> impl Stream<Item = StreamEvent> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<ChatError> + Send + 'static,
{
    let state = DecodeState {
        body: Box::pin(body),
        decoder: StreamDecoder::new(),
        pending: VecDeque::new(),
        cancel,
        finished: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if state.cancel.is_cancelled() {
                return None;
            }
            if let Some(event) = state.pending.pop_front() {
                return Some((event, state));
            }
            if state.finished {
                return None;
            }

            let read = tokio::select! {
                biased;

                () = state.cancel.cancelled() => {
                    tracing::debug!("Stream decoding cancelled");
                    return None;
                }
                read = state.body.next() => read,
            };

            match read {
                Some(Ok(bytes)) => {
                    let events = state.decoder.feed(bytes.as_ref());
                    state.pending.extend(events);
                    state.finished = state.decoder.is_done();
                }
                Some(Err(err)) => {
                    state.finished = true;
                    if state.cancel.is_cancelled() {
                        return None;
                    }
                    let err = err.into();
                    tracing::error!(error = %err, "Error streaming response");
                    state.pending.push_back(StreamEvent::TransportError(err));
                }
                None => {
                    state.finished = true;
                    let events = state.decoder.finish();
                    state.pending.extend(events);
                }
            }
        }
    })
}
