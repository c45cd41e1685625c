mod client;
mod decoder;
mod error;
mod models;
mod protocol;
mod repl;
mod session;
mod suggestions;

use clap::{Parser, Subcommand};
use client::{ChatClient, ClientConfig};
use session::{new_conversation_id, Session};
use std::error::Error;
use std::sync::Arc;
use suggestions::SuggestionCache;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

type MainResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// Terminal client for the NLP2SQL chat backend
#[derive(Parser, Debug)]
#[command(name = "sqlchat", version, about, long_about = None)]
struct Cli {
    /// Base URL of the chat backend
    #[arg(long, global = true, env = "SQLCHAT_API_URL", default_value = "http://localhost:8000")]
    api_url: String,

    /// Model requested for each answer
    #[arg(long, global = true, env = "SQLCHAT_MODEL", default_value = models::DEFAULT_MODEL)]
    model: String,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interactive chat (default)
    Chat,
    /// Ask a single question and print the answer
    Ask {
        question: String,

        /// Print the final transcript as JSON instead of streaming text
        #[arg(long)]
        json: bool,
    },
    /// Print the backend's suggested starter questions
    Suggestions,
}

#[tokio::main]
async fn main() -> MainResult<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let client = ChatClient::new(ClientConfig {
        base_url: cli.api_url,
    });
    tracing::debug!(base_url = client.base_url(), model = %cli.model, "Client configured");

    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => {
            let session = Session::new(Arc::new(client.clone()));
            let repl = repl::Repl::new(session, client, cli.model, new_conversation_id());
            repl.run().await
        }
        Command::Ask { question, json } => {
            let session = Session::new(Arc::new(client));
            let conversation_id = new_conversation_id();
            let answered = if json {
                let answered = session.send(&question, &cli.model, &conversation_id);
                if !answered {
                    return Err("question is empty".into());
                }
                let state = session
                    .subscribe()
                    .wait_for(|state| !state.status.is_busy())
                    .await?
                    .clone();
                println!("{}", serde_json::to_string_pretty(&state)?);
                state.status != session::Status::Error
            } else {
                repl::ask(&session, &question, &cli.model, &conversation_id).await?
            };

            if !answered {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Suggestions => {
            let cache = SuggestionCache::new();
            for suggestion in cache.get(&client).await? {
                println!("{}", suggestion.question);
            }
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sqlchat=info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
