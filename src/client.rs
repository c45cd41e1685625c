use crate::decoder::{decode, StreamEvent};
use crate::error::ChatError;
use crate::protocol::{ChatRequest, QuerySuggestion, SuggestionsResponse};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::Client as HttpClient;
use tokio_util::sync::CancellationToken;

pub type EventStream = BoxStream<'static, StreamEvent>;

pub trait ChatTransport: Send + Sync {
    /// Opens one exchange. Nothing is sent until the stream is first polled;
    /// cancelling `cancel` ends the stream without further events.
    fn stream_chat(&self, request: ChatRequest, cancel: CancellationToken) -> EventStream;
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
}

#[derive(Clone)]
pub struct ChatClient {
    base_url: String,
    http: HttpClient,
}

impl ChatClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            base_url: normalize_base_url(&config.base_url),
            http: HttpClient::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn fetch_suggestions(&self) -> Result<Vec<QuerySuggestion>, ChatError> {
        let response = self
            .http
            .get(format!("{}/api/v1/chat/suggestions", self.base_url))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ChatError::Status(response.status()));
        }

        let body: SuggestionsResponse = response.json().await?;
        Ok(body.suggestions)
    }
}

impl ChatTransport for ChatClient {
    fn stream_chat(&self, request: ChatRequest, cancel: CancellationToken) -> EventStream {
        let http = self.http.clone();
        let url = format!("{}/api/v1/chat", self.base_url);

        let opened = async move {
            tracing::debug!(model = %request.model, chat_id = %request.chat_id, "Sending chat request");
            let send = http.post(url).json(&request).send();

            let response = tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    tracing::debug!("Chat request cancelled before response");
                    return stream::empty::<StreamEvent>().boxed();
                }
                response = send => response,
            };

            match response {
                Ok(response) if response.status().is_success() => {
                    decode(response.bytes_stream(), cancel).boxed()
                }
                Ok(response) => {
                    let status = response.status();
                    tracing::error!(%status, "Chat request rejected");
                    stream::iter([StreamEvent::TransportError(ChatError::Status(status))]).boxed()
                }
                Err(err) => {
                    tracing::error!(error = %err, "Chat request failed");
                    stream::iter([StreamEvent::TransportError(err.into())]).boxed()
                }
            }
        };

        stream::once(opened).flatten().boxed()
    }
}

fn normalize_base_url(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}
