use super::state::{SessionState, Status};
use crate::decoder::StreamEvent;
use crate::error::ChatError;

pub const ERROR_MESSAGE: &str = "Sorry, I encountered an error. Please try again.";

#[derive(Debug)]
pub(crate) struct ExchangeCursor {
    version_id: String,
    accumulator: String,
}

impl ExchangeCursor {
    pub(crate) fn new(version_id: impl Into<String>) -> Self {
        Self {
            version_id: version_id.into(),
            accumulator: String::new(),
        }
    }
}

#[derive(Debug)]
pub(crate) enum Folded {
    Streaming,
    Completed,
    Failed(ChatError),
}

pub(crate) fn fold(state: &mut SessionState, cursor: &mut ExchangeCursor, event: StreamEvent) -> Folded {
    match event {
        StreamEvent::TokenChunk(text) => {
            cursor.accumulator.push_str(&text);
            // Always write the whole accumulator, not the delta.
            if let Some(turn) = state.turn_with_version_mut(&cursor.version_id) {
                turn.set_content(&cursor.version_id, &cursor.accumulator);
            }
            Folded::Streaming
        }

        StreamEvent::ModelAnnounced(model) => {
            if let Some(turn) = state.turn_with_version_mut(&cursor.version_id) {
                turn.set_model(model);
            }
            Folded::Streaming
        }

        StreamEvent::ToolInvoked { name, content } => {
            if let Some(turn) = state.turn_with_version_mut(&cursor.version_id) {
                turn.push_tool(name, content);
            }
            Folded::Streaming
        }

        StreamEvent::Completion => {
            state.status = Status::Ready;
            Folded::Completed
        }

        StreamEvent::TransportError(err) => {
            state.status = Status::Error;
            if let Some(turn) = state.turn_with_version_mut(&cursor.version_id) {
                turn.set_content(&cursor.version_id, ERROR_MESSAGE);
            }
            Folded::Failed(err)
        }
    }
}
