use super::turn::{Role, Turn};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Idle,
    Submitted,
    Streaming,
    Ready,
    Error,
}

impl Status {
    pub fn is_busy(self) -> bool {
        matches!(self, Status::Submitted | Status::Streaming)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionState {
    pub turns: Vec<Turn>,
    pub status: Status,
}

impl SessionState {
    pub fn last_answer(&self) -> Option<&Turn> {
        self.turns.iter().rev().find(|t| t.role == Role::Assistant)
    }

    pub(crate) fn turn_with_version_mut(&mut self, version_id: &str) -> Option<&mut Turn> {
        self.turns.iter_mut().find(|t| t.has_version(version_id))
    }
}
