use crate::client::ChatClient;
use crate::models::{all_models, find_model};
use crate::session::{Role, Session, SessionState, Status};
use crate::suggestions::SuggestionCache;
use futures::StreamExt;
use std::error::Error;
use std::io::{self, Write};
use tokio::io::{AsyncBufReadExt, BufReader};

type ReplResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

const HELP: &str = "\
Commands:
  /new              start a new conversation
  /regenerate [n]   ask question n again (default: the last one)
  /stop             stop the answer being streamed (or Ctrl-C)
  /model [id]       show or switch the model
  /models           list models
  /suggestions      show example questions
  /quit             exit";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Send(String),
    New,
    Regenerate(Option<usize>),
    Stop,
    Model(Option<String>),
    Models,
    Suggestions,
    Help,
    Quit,
    Unknown(String),
}

fn parse_command(line: &str) -> Command {
    let trimmed = line.trim();
    let Some(rest) = trimmed.strip_prefix('/') else {
        return Command::Send(line.to_string());
    };

    let mut parts = rest.split_whitespace();
    let name = parts.next().unwrap_or_default();
    match name {
        "new" => Command::New,
        "regenerate" | "retry" => Command::Regenerate(parts.next().and_then(|n| n.parse().ok())),
        "stop" => Command::Stop,
        "model" => Command::Model(parts.next().map(str::to_string)),
        "models" => Command::Models,
        "suggestions" => Command::Suggestions,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        _ => Command::Unknown(name.to_string()),
    }
}

#[derive(Debug, Default)]
struct TranscriptPrinter {
    turn: Option<String>,
    printed: String,
    tools: usize,
    finished: bool,
}

impl TranscriptPrinter {
    fn render(&mut self, state: &SessionState) -> String {
        let mut out = String::new();
        let Some(turn) = state.last_answer() else {
            *self = Self::default();
            return out;
        };

        if self.turn.as_deref() != Some(turn.key.as_str()) {
            *self = Self {
                turn: Some(turn.key.clone()),
                ..Self::default()
            };
        }
        if self.finished {
            return out;
        }

        for tool in &turn.tools()[self.tools..] {
            out.push_str(&format!("\n[tool: {}] {}\n", tool.name, tool.content));
        }
        self.tools = turn.tools().len();

        let content = &turn.canonical().content;
        if let Some(delta) = content.strip_prefix(self.printed.as_str()) {
            out.push_str(delta);
        } else {
            out.push('\n');
            out.push_str(content);
        }
        self.printed.clone_from(content);

        if !state.status.is_busy() {
            self.finished = true;
            match turn.model() {
                Some(model) => out.push_str(&format!("\n[{}]\n", model)),
                None => out.push('\n'),
            }
        }

        out
    }
}

fn answer_key(state: &SessionState, nth: Option<usize>) -> Option<String> {
    let turn = match nth {
        Some(n) => state
            .turns
            .iter()
            .filter(|t| t.role == Role::Assistant)
            .nth(n.checked_sub(1)?),
        None => state.last_answer(),
    };
    turn.map(|t| t.key.clone())
}

fn emit(text: &str) -> io::Result<()> {
    if text.is_empty() {
        return Ok(());
    }
    let mut stdout = io::stdout();
    stdout.write_all(text.as_bytes())?;
    stdout.flush()
}

pub async fn ask(session: &Session, question: &str, model: &str, conversation_id: &str) -> ReplResult<bool> {
    if !session.send(question, model, conversation_id) {
        return Err("question is empty".into());
    }

    let mut updates = session.subscribe();
    let mut printer = TranscriptPrinter::default();

    loop {
        let state = updates.borrow_and_update().clone();
        emit(&printer.render(&state))?;
        if !state.status.is_busy() {
            return Ok(state.status != Status::Error);
        }

        tokio::select! {
            changed = updates.changed() => changed?,
            _ = tokio::signal::ctrl_c() => {
                session.stop();
            }
        }
    }
}

pub struct Repl {
    session: Session,
    client: ChatClient,
    suggestions: SuggestionCache,
    model: String,
    conversation_id: String,
}

impl Repl {
    pub fn new(session: Session, client: ChatClient, model: String, conversation_id: String) -> Self {
        Self {
            session,
            client,
            suggestions: SuggestionCache::new(),
            model,
            conversation_id,
        }
    }

    pub async fn run(mut self) -> ReplResult<()> {
        println!("sqlchat connected to {} (model: {})", self.client.base_url(), self.model);
        println!("Type a question, or /help for commands.");
        self.print_suggestions().await;

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut updates = self.session.updates();
        let mut printer = TranscriptPrinter::default();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    if !self.handle(parse_command(&line), &mut printer).await {
                        break;
                    }
                }
                Some(state) = updates.next() => {
                    emit(&printer.render(&state))?;
                }
                _ = tokio::signal::ctrl_c() => {
                    if !self.session.stop() {
                        break;
                    }
                    println!("\n[stopped]");
                }
            }
        }

        if self.session.is_in_flight() {
            self.session.stop();
        }
        Ok(())
    }

    async fn handle(&mut self, command: Command, printer: &mut TranscriptPrinter) -> bool {
        match command {
            Command::Send(text) => {
                if text.trim().is_empty() {
                    return true;
                }
                if self.session.status().is_busy() {
                    println!("Still answering; /stop first.");
                    return true;
                }
                self.session.send(&text, &self.model, &self.conversation_id);
            }
            Command::New => {
                self.conversation_id = self.session.new_conversation();
                *printer = TranscriptPrinter::default();
                tracing::info!(chat_id = %self.conversation_id, "New conversation");
                println!("New conversation.");
                self.print_suggestions().await;
            }
            Command::Regenerate(nth) => {
                if self.session.status().is_busy() {
                    println!("Still answering; /stop first.");
                    return true;
                }
                let answer = answer_key(&self.session.snapshot(), nth);
                let regenerated = answer
                    .is_some_and(|key| self.session.regenerate(&key, &self.model, &self.conversation_id));
                if !regenerated {
                    println!("Nothing to regenerate.");
                }
            }
            Command::Stop => {
                if self.session.stop() {
                    println!("\n[stopped]");
                } else {
                    println!("Nothing to stop.");
                }
            }
            Command::Model(None) => println!("Model: {}", self.model),
            Command::Model(Some(id)) => {
                if find_model(&id).is_none() {
                    println!("Unknown model {id}; the backend will use its default.");
                }
                self.model = id;
            }
            Command::Models => {
                for model in all_models() {
                    let marker = if model.id == self.model { "*" } else { " " };
                    println!("{} {:<14} {} ({})", marker, model.id, model.name, model.provider);
                }
            }
            Command::Suggestions => self.print_suggestions().await,
            Command::Help => println!("{HELP}"),
            Command::Quit => return false,
            Command::Unknown(name) => println!("Unknown command /{name}; try /help."),
        }
        true
    }

    async fn print_suggestions(&self) {
        let suggestions = self.suggestions.get_or_fallback(&self.client).await;
        println!("Try asking:");
        for suggestion in suggestions {
            println!("  - {}", suggestion);
        }
    }
}
