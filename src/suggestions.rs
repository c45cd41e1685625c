use crate::client::ChatClient;
use crate::error::ChatError;
use crate::protocol::QuerySuggestion;
use std::future::Future;
use tokio::sync::OnceCell;

const FETCH_RETRIES: u32 = 2;

pub const FALLBACK_SUGGESTIONS: [&str; 4] = [
    "What is SQL?",
    "Explain database normalization",
    "How do I write a JOIN query?",
    "What's the difference between SQL and NoSQL?",
];

#[derive(Default)]
pub struct SuggestionCache {
    cell: OnceCell<Vec<QuerySuggestion>>,
}

impl SuggestionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, client: &ChatClient) -> Result<&[QuerySuggestion], ChatError> {
        self.get_with(|| client.fetch_suggestions()).await
    }

    pub async fn get_or_fallback(&self, client: &ChatClient) -> Vec<String> {
        match self.get(client).await {
            Ok(suggestions) => suggestions.iter().map(|s| s.question.clone()).collect(),
            Err(err) => {
                tracing::warn!(error = %err, "Using built-in suggestions");
                FALLBACK_SUGGESTIONS.iter().map(|s| s.to_string()).collect()
            }
        }
    }

    async fn get_with<F, Fut>(&self, mut fetch: F) -> Result<&[QuerySuggestion], ChatError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Vec<QuerySuggestion>, ChatError>>,
    {
        let suggestions = self
            .cell
            .get_or_try_init(|| async move {
                let mut attempt = 0;
                loop {
                    match fetch().await {
                        Ok(suggestions) => return Ok(suggestions),
                        Err(err) if attempt < FETCH_RETRIES => {
                            attempt += 1;
                            tracing::debug!(attempt, error = %err, "Retrying suggestions fetch");
                        }
                        Err(err) => return Err(err),
                    }
                }
            })
            .await?;
        Ok(suggestions.as_slice())
    }
}
