mod fold;
mod state;
mod turn;

pub use fold::ERROR_MESSAGE;
pub use state::{SessionState, Status};
pub use turn::{Role, Turn};

use crate::client::{ChatTransport, EventStream};
use crate::decoder::StreamEvent;
use crate::protocol::ChatRequest;
use fold::{fold, ExchangeCursor, Folded};
use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

pub const ERROR_RECOVERY_DELAY: Duration = Duration::from_secs(2);

pub fn new_conversation_id() -> String {
    turn::new_id()
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn ChatTransport>,
    state: watch::Sender<SessionState>,
    control: Mutex<Control>,
}

struct Control {
    conversation: CancellationToken,
    active: Option<ActiveExchange>,
    next_exchange: u64,
}

struct ActiveExchange {
    id: u64,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self {
            inner: Arc::new(Inner {
                transport,
                state,
                control: Mutex::new(Control {
                    conversation: CancellationToken::new(),
                    active: None,
                    next_exchange: 0,
                }),
            }),
        }
    }

    pub fn snapshot(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    pub fn status(&self) -> Status {
        self.inner.state.borrow().status
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn updates(&self) -> WatchStream<SessionState> {
        WatchStream::new(self.subscribe())
    }

    pub fn is_in_flight(&self) -> bool {
        self.inner.control().active.is_some()
    }

    /// Returns whether an exchange was dispatched. Must be called from
    /// within a tokio runtime.
    pub fn send(&self, text: &str, model: &str, conversation_id: &str) -> bool {
        if text.trim().is_empty() {
            return false;
        }

        let user = Turn::user(text);
        self.inner.state.send_modify(|state| {
            state.turns.push(user);
            state.status = Status::Submitted;
        });

        let placeholder = Turn::assistant_placeholder();
        let cursor = ExchangeCursor::new(placeholder.canonical().id.clone());
        let turn_key = placeholder.key.clone();
        self.inner
            .state
            .send_modify(|state| state.turns.push(placeholder));

        let (exchange, cancel) = {
            let mut control = self.inner.control();
            control.next_exchange += 1;
            let id = control.next_exchange;
            let cancel = control.conversation.child_token();
            control.active = Some(ActiveExchange {
                id,
                cancel: cancel.clone(),
            });
            (id, cancel)
        };

        let request = ChatRequest {
            message: text.to_string(),
            model: model.to_string(),
            chat_id: conversation_id.to_string(),
        };
        let events = self.inner.transport.stream_chat(request, cancel.clone());
        self.inner
            .state
            .send_modify(|state| state.status = Status::Streaming);

        tracing::info!(exchange, turn = %turn_key, model, chat_id = conversation_id, "Exchange dispatched");
        tokio::spawn(run_exchange(
            Arc::clone(&self.inner),
            exchange,
            cancel,
            cursor,
            events,
        ));

        true
    }

    pub fn stop(&self) -> bool {
        let Some(active) = self.inner.control().active.take() else {
            return false;
        };

        active.cancel.cancel();
        self.inner
            .state
            .send_modify(|state| state.status = Status::Ready);
        tracing::info!(exchange = active.id, "Exchange stopped");
        true
    }

    pub fn regenerate(&self, turn_key: &str, model: &str, conversation_id: &str) -> bool {
        let Some(text) = self.regeneration_text(turn_key) else {
            tracing::debug!(turn = %turn_key, "Nothing to regenerate");
            return false;
        };
        self.send(&text, model, conversation_id)
    }

    pub fn clear(&self) {
        {
            let mut control = self.inner.control();
            control.active = None;
            control.conversation.cancel();
            control.conversation = CancellationToken::new();
        }

        self.inner.state.send_modify(|state| {
            state.turns.clear();
            state.status = Status::Ready;
        });
        tracing::debug!("Session cleared");
    }

    pub fn new_conversation(&self) -> String {
        self.clear();
        new_conversation_id()
    }

    fn regeneration_text(&self, turn_key: &str) -> Option<String> {
        let state = self.inner.state.borrow();
        let index = state.turns.iter().position(|t| t.key == turn_key)?;
        if index == 0 || state.turns[index].role != Role::Assistant {
            return None;
        }

        let previous = &state.turns[index - 1];
        (previous.role == Role::User).then(|| previous.canonical().content.clone())
    }
}

impl Inner {
    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, exchange: u64) {
        let mut control = self.control();
        if control.active.as_ref().is_some_and(|a| a.id == exchange) {
            control.active = None;
        }
    }
}

async fn run_exchange(
    inner: Arc<Inner>,
    exchange: u64,
    cancel: CancellationToken,
    mut cursor: ExchangeCursor,
    mut events: EventStream,
) {
    loop {
        // End of stream without a completion record still completes.
        let event = events.next().await.unwrap_or(StreamEvent::Completion);

        let mut folded = None;
        inner.state.send_if_modified(|state| {
            // Checked under the state lock so a stale event can't land
            // after stop() or clear().
            if cancel.is_cancelled() {
                return false;
            }
            let outcome = fold(state, &mut cursor, event);
            // Released before the new status is published.
            if !matches!(outcome, Folded::Streaming) {
                inner.release(exchange);
            }
            folded = Some(outcome);
            true
        });

        match folded {
            Some(Folded::Streaming) => {}
            Some(Folded::Completed) => {
                tracing::info!(exchange, "Exchange completed");
                return;
            }
            Some(Folded::Failed(err)) => {
                tracing::error!(exchange, error = %err, "Exchange failed");
                recover_after_error(&inner).await;
                return;
            }
            None => {
                tracing::debug!(exchange, "Exchange cancelled");
                return;
            }
        }
    }
}

async fn recover_after_error(inner: &Inner) {
    tokio::time::sleep(ERROR_RECOVERY_DELAY).await;
    inner.state.send_if_modified(|state| {
        if state.status == Status::Error {
            state.status = Status::Ready;
            true
        } else {
            false
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatError;
    use futures::stream;
    use reqwest::StatusCode;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    #[derive(Default)]
    struct ScriptedTransport {
        scripts: Mutex<VecDeque<EventStream>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedTransport {
        fn push(&self, events: EventStream) {
            self.scripts.lock().unwrap().push_back(events);
        }

        fn script(&self, events: Vec<StreamEvent>) {
            self.push(stream::iter(events).boxed());
        }

        fn live(&self) -> mpsc::UnboundedSender<StreamEvent> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.push(UnboundedReceiverStream::new(rx).boxed());
            tx
        }

        fn requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl ChatTransport for ScriptedTransport {
        fn stream_chat(&self, request: ChatRequest, _cancel: CancellationToken) -> EventStream {
            self.requests.lock().unwrap().push(request);
            self.scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| stream::pending().boxed())
        }
    }

    fn session() -> (Session, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::default());
        let session = Session::new(transport.clone());
        (session, transport)
    }

    async fn wait_for_status(session: &Session, status: Status) -> SessionState {
        session
            .subscribe()
            .wait_for(|state| state.status == status)
            .await
            .unwrap()
            .clone()
    }

    async fn wait_for_content(session: &Session, content: &str) {
        session
            .subscribe()
            .wait_for(|state| {
                state
                    .last_answer()
                    .is_some_and(|turn| turn.canonical().content == content)
            })
            .await
            .unwrap();
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn blank_messages_are_ignored() {
        let (session, transport) = session();

        assert!(!session.send("", "gpt-4o-mini", "c1"));
        assert!(!session.send("   ", "gpt-4o-mini", "c1"));

        let state = session.snapshot();
        assert!(state.turns.is_empty());
        assert_eq!(state.status, Status::Idle);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn streams_answer_into_placeholder() {
        let (session, transport) = session();
        let tx = transport.live();

        assert!(session.send("What is SQL?", "gpt-4o-mini", "c1"));

        let state = session.snapshot();
        assert_eq!(state.turns.len(), 2);
        assert_eq!(state.turns[0].role, Role::User);
        assert_eq!(state.turns[0].canonical().content, "What is SQL?");
        assert_eq!(state.turns[1].role, Role::Assistant);
        assert_eq!(state.turns[1].canonical().content, "");
        assert_eq!(state.status, Status::Streaming);
        assert!(session.is_in_flight());

        let request = &transport.requests()[0];
        assert_eq!(request.message, "What is SQL?");
        assert_eq!(request.model, "gpt-4o-mini");
        assert_eq!(request.chat_id, "c1");

        tx.send(StreamEvent::TokenChunk("SQL ".to_string())).unwrap();
        tx.send(StreamEvent::TokenChunk("is...".to_string())).unwrap();
        tx.send(StreamEvent::ModelAnnounced("gpt-4o-mini".to_string())).unwrap();
        tx.send(StreamEvent::Completion).unwrap();

        let state = wait_for_status(&session, Status::Ready).await;
        let answer = &state.turns[1];
        assert_eq!(answer.canonical().content, "SQL is...");
        assert_eq!(answer.model(), Some("gpt-4o-mini"));

        assert!(!session.is_in_flight());
        assert!(!session.stop());
        assert_eq!(session.status(), Status::Ready);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn handle_is_released_before_ready_is_published() {
        let (session, transport) = session();

        for round in 0..500 {
            transport.script(vec![StreamEvent::Completion]);
            assert!(session.send("ping", "gpt-4o-mini", "c1"));
            session
                .subscribe()
                .wait_for(|state| state.status == Status::Ready && state.turns.len() == 2 * (round + 1))
                .await
                .unwrap();
            assert!(!session.is_in_flight(), "handle held after ready in round {round}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn handle_is_released_before_error_is_published() {
        let (session, transport) = session();
        transport.script(vec![StreamEvent::TransportError(ChatError::Status(
            StatusCode::BAD_GATEWAY,
        ))]);

        session.send("What is SQL?", "gpt-4o-mini", "c1");
        wait_for_status(&session, Status::Error).await;
        assert!(!session.is_in_flight());
        assert!(!session.stop());
    }

    #[tokio::test]
    async fn end_of_stream_counts_as_completion() {
        let (session, transport) = session();
        transport.script(vec![StreamEvent::TokenChunk("done".to_string())]);

        session.send("hi", "gpt-4o", "c1");
        let state = wait_for_status(&session, Status::Ready).await;
        assert_eq!(state.turns[1].canonical().content, "done");
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_shows_message_then_recovers() {
        let (session, transport) = session();
        transport.script(vec![StreamEvent::TransportError(ChatError::Status(
            StatusCode::INTERNAL_SERVER_ERROR,
        ))]);

        session.send("What is SQL?", "gpt-4o-mini", "c1");
        let failed_at = tokio::time::Instant::now();

        let state = wait_for_status(&session, Status::Error).await;
        assert_eq!(state.turns[1].canonical().content, ERROR_MESSAGE);

        tokio::time::advance(Duration::from_millis(1500)).await;
        settle().await;
        assert_eq!(session.status(), Status::Error);

        wait_for_status(&session, Status::Ready).await;
        assert!(failed_at.elapsed() >= ERROR_RECOVERY_DELAY);
        assert!(!session.is_in_flight());
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_does_not_override_newer_exchange() {
        let (session, transport) = session();
        transport.script(vec![StreamEvent::TransportError(ChatError::Status(
            StatusCode::BAD_GATEWAY,
        ))]);
        let _tx = transport.live();

        session.send("first", "gpt-4o", "c1");
        wait_for_status(&session, Status::Error).await;

        session.send("second", "gpt-4o", "c1");
        tokio::time::advance(ERROR_RECOVERY_DELAY * 2).await;
        settle().await;
        assert_eq!(session.status(), Status::Streaming);
    }

    #[tokio::test]
    async fn stop_cancels_without_error_message() {
        let (session, transport) = session();
        let tx = transport.live();

        session.send("Explain JOINs", "gpt-4o-mini", "c1");
        tx.send(StreamEvent::TokenChunk("A JOIN".to_string())).unwrap();
        wait_for_content(&session, "A JOIN").await;

        assert!(session.stop());
        assert_eq!(session.status(), Status::Ready);

        tx.send(StreamEvent::TokenChunk(" combines".to_string())).ok();
        tx.send(StreamEvent::TransportError(ChatError::Status(StatusCode::BAD_GATEWAY)))
            .ok();
        settle().await;

        let state = session.snapshot();
        assert_eq!(state.turns[1].canonical().content, "A JOIN");
        assert_eq!(state.status, Status::Ready);
        assert!(!session.stop());
    }

    #[tokio::test]
    async fn clear_discards_turns_and_late_events() {
        let (session, transport) = session();
        let tx = transport.live();

        session.send("What is SQL?", "gpt-4o-mini", "c1");
        session.clear();

        let state = session.snapshot();
        assert!(state.turns.is_empty());
        assert_eq!(state.status, Status::Ready);
        assert!(!session.is_in_flight());

        tx.send(StreamEvent::TokenChunk("stale".to_string())).ok();
        tx.send(StreamEvent::Completion).ok();
        settle().await;
        assert!(session.snapshot().turns.is_empty());
    }

    #[tokio::test]
    async fn clear_from_idle_is_ready() {
        let (session, _transport) = session();
        session.clear();
        assert_eq!(session.status(), Status::Ready);
        assert!(session.snapshot().turns.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn clear_during_error_window_stays_ready() {
        let (session, transport) = session();
        transport.script(vec![StreamEvent::TransportError(ChatError::Status(
            StatusCode::INTERNAL_SERVER_ERROR,
        ))]);

        session.send("What is SQL?", "gpt-4o-mini", "c1");
        wait_for_status(&session, Status::Error).await;

        session.clear();
        let state = session.snapshot();
        assert!(state.turns.is_empty());
        assert_eq!(state.status, Status::Ready);

        tokio::time::advance(ERROR_RECOVERY_DELAY * 2).await;
        settle().await;
        let state = session.snapshot();
        assert!(state.turns.is_empty());
        assert_eq!(state.status, Status::Ready);
    }

    #[tokio::test]
    async fn new_conversation_resets_and_issues_fresh_id() {
        let (session, transport) = session();
        transport.script(vec![StreamEvent::Completion]);
        session.send("hello", "gpt-4o", "c1");
        wait_for_status(&session, Status::Ready).await;

        let id = session.new_conversation();
        assert!(!id.is_empty());
        assert_ne!(id, new_conversation_id());
        assert!(session.snapshot().turns.is_empty());
    }

    #[tokio::test]
    async fn regenerate_resends_preceding_user_text() {
        let (session, transport) = session();
        transport.script(vec![
            StreamEvent::TokenChunk("first answer".to_string()),
            StreamEvent::Completion,
        ]);
        session.send("How do I write a JOIN query?", "gpt-4o", "c1");
        let state = wait_for_status(&session, Status::Ready).await;
        let user_key = state.turns[0].key.clone();
        let answer_key = state.turns[1].key.clone();

        assert!(!session.regenerate(&user_key, "gpt-4o", "c1"));
        assert!(!session.regenerate("missing", "gpt-4o", "c1"));
        assert_eq!(session.snapshot().turns.len(), 2);

        transport.script(vec![
            StreamEvent::TokenChunk("second answer".to_string()),
            StreamEvent::Completion,
        ]);
        assert!(session.regenerate(&answer_key, "gpt-3.5-turbo", "c1"));
        let state = wait_for_status(&session, Status::Ready).await;

        assert_eq!(state.turns.len(), 4);
        assert_eq!(state.turns[1].canonical().content, "first answer");
        assert_eq!(state.turns[2].canonical().content, "How do I write a JOIN query?");
        assert_eq!(state.turns[3].canonical().content, "second answer");
        assert_eq!(transport.requests()[1].model, "gpt-3.5-turbo");
    }

    #[tokio::test]
    async fn tool_invocations_land_on_assistant_turn() {
        let (session, transport) = session();
        transport.script(vec![
            StreamEvent::ToolInvoked {
                name: "search_schema".to_string(),
                content: "table list".to_string(),
            },
            StreamEvent::TokenChunk("There are 3 tables.".to_string()),
            StreamEvent::Completion,
        ]);

        session.send("List my tables", "gpt-4o", "c1");
        let state = wait_for_status(&session, Status::Ready).await;

        let answer = &state.turns[1];
        assert_eq!(answer.canonical().content, "There are 3 tables.");
        assert_eq!(answer.tools().len(), 1);
        assert_eq!(answer.tools()[0].name, "search_schema");
        assert_eq!(answer.tools()[0].content, "table list");
        assert!(state.turns[0].tools().is_empty());
    }

    #[tokio::test]
    async fn concurrent_exchanges_fold_into_their_own_turns() {
        let (session, transport) = session();
        let first = transport.live();
        let second = transport.live();

        session.send("one", "gpt-4o", "c1");
        session.send("two", "gpt-4o", "c1");

        first.send(StreamEvent::TokenChunk("alpha".to_string())).unwrap();
        second.send(StreamEvent::TokenChunk("beta".to_string())).unwrap();
        wait_for_content(&session, "beta").await;

        // Only the most recent exchange holds the handle.
        assert!(session.stop());
        first.send(StreamEvent::TokenChunk(" gamma".to_string())).unwrap();
        first.send(StreamEvent::Completion).unwrap();
        second.send(StreamEvent::TokenChunk(" delta".to_string())).ok();
        session
            .subscribe()
            .wait_for(|state| state.turns[1].canonical().content == "alpha gamma")
            .await
            .unwrap();
        settle().await;

        let state = session.snapshot();
        assert_eq!(state.turns.len(), 4);
        assert_eq!(state.turns[3].canonical().content, "beta");
        assert_eq!(state.status, Status::Ready);
    }
}
