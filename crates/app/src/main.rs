//! Parley - terminal chat client for a local or remote Ollama server.

mod commands;
mod config;

use anyhow::{Context, Result};
use chat_host::{ChatHost, SharedSession};
use commands::{Command, HELP};
use providers::BackendConnection;
use services::{ChatStore, SqliteStore};
use shared::events::{SessionEvent, TurnOutcome};
use shared::message::{Attachment, AttachmentKind, Role};
use shared::settings::AppSettings;
use shared::ChatError;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Turn an error into something a person can act on
fn describe_error(error: &ChatError) -> String {
    match error {
        ChatError::Startup { reason } => format!(
            "Couldn't start the local Ollama server.\n\n{}\n\n\
            Make sure `ollama` is installed, or connect to a server with /remote.",
            reason
        ),
        ChatError::Network { reason } => {
            let lower = reason.to_lowercase();
            if lower.contains("401") || lower.contains("unauthorized") {
                format!("The server rejected the bearer token.\n\nError: {}", reason)
            } else {
                format!(
                    "I'm having trouble reaching the server. Check the connection and try again.\n\n\
                    Error: {}",
                    reason
                )
            }
        }
        ChatError::MissingModel => "Pick a model first with /model <name>.".to_string(),
        other => other.to_string(),
    }
}

enum Flow {
    Continue,
    Quit,
}

struct App {
    host: ChatHost,
    connection: Arc<BackendConnection>,
    settings: AppSettings,
    /// Id of the open chat; names change when titles are generated
    current: String,
    quick_ask: Option<SharedSession>,
    pending: Vec<Attachment>,
}

impl App {
    fn current_name(&mut self) -> Result<String, ChatError> {
        let registry = self.host.registry();
        let session = match registry.get_by_id(&self.current) {
            Some(session) => session,
            None => match registry.first() {
                Some(session) => session,
                None => registry.create(None)?,
            },
        };
        let session = session.lock();
        self.current = session.id().to_string();
        Ok(session.name().to_string())
    }

    fn open(&mut self, name: &str) -> Result<(), ChatError> {
        let session = self
            .host
            .registry()
            .get(name)
            .ok_or_else(|| ChatError::NotFound {
                name: name.to_string(),
            })?;
        let session = session.lock();
        self.current = session.id().to_string();
        println!("== {} ==", session.name());
        for message in session.messages() {
            let who = match message.role {
                Role::User => "you".to_string(),
                Role::System => "system".to_string(),
                Role::Assistant => message.model.clone().unwrap_or_default(),
            };
            println!("{}: {}", who, message.content);
        }
        Ok(())
    }

    async fn handle(&mut self, command: Command) -> Result<Flow, ChatError> {
        match command {
            Command::Say(text) => {
                let name = self.current_name()?;
                let attachments = std::mem::take(&mut self.pending);
                self.host.send_user_message(&name, &text, attachments)?;
            }
            Command::New(name) => {
                let session = self.host.registry().create(name.as_deref())?;
                let name = session.lock().name().to_string();
                self.open(&name)?;
            }
            Command::List => {
                for chat in self.host.registry().list() {
                    let marker = if chat.id == self.current { "*" } else { " " };
                    let busy = if chat.busy { " (replying)" } else { "" };
                    println!("{} {} [{}]{}", marker, chat.name, chat.message_count, busy);
                }
            }
            Command::Switch(name) => self.open(&name)?,
            Command::Rename(new_name) => {
                let name = self.current_name()?;
                self.host.registry().rename(&name, &new_name)?;
            }
            Command::Delete(name) => {
                let name = match name {
                    Some(name) => name,
                    None => self.current_name()?,
                };
                self.host.registry().delete(&name)?;
                let current = self.current_name()?;
                println!("deleted '{}', now in '{}'", name, current);
            }
            Command::Duplicate => {
                let name = self.current_name()?;
                let copy = self.host.registry().duplicate(&name)?;
                let copy = copy.lock().name().to_string();
                self.open(&copy)?;
            }
            Command::System(text) => {
                let name = self.current_name()?;
                self.host.send_system_message(&name, &text)?;
            }
            Command::Attach(path) => match std::fs::read_to_string(&path) {
                Ok(text) => {
                    let file_name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| path.display().to_string());
                    self.pending
                        .push(Attachment::text(AttachmentKind::PlainText, file_name, text));
                    println!("{} file(s) attached to the next message", self.pending.len());
                }
                Err(e) => eprintln!("can't read {}: {}", path.display(), e),
            },
            Command::Retry => {
                let name = self.current_name()?;
                self.host.regenerate(&name)?;
            }
            Command::Stop => {
                let name = self.current_name()?;
                if !self.host.stop(&name)? {
                    println!("nothing to stop");
                }
            }
            Command::Search(pattern) => {
                let name = self.current_name()?;
                for message in self.host.search(&name, &pattern)? {
                    println!("[{}] {}", message.role.as_str(), message.content);
                }
            }
            Command::Export { format, path } => {
                let name = self.current_name()?;
                let text = self.host.export(&name, format)?;
                match path {
                    Some(path) => match std::fs::write(&path, text) {
                        Ok(()) => println!("exported to {}", path.display()),
                        Err(e) => eprintln!("can't write {}: {}", path.display(), e),
                    },
                    None => println!("{}", text),
                }
            }
            Command::ExportDb(path) => {
                let name = self.current_name()?;
                self.host.export_db(&name, &path)?;
                println!("exported to {}", path.display());
            }
            Command::Import(path) => {
                for session in self.host.import_db(&path)? {
                    println!("imported '{}'", session.lock().name());
                }
            }
            Command::Model(None) => {
                let current = self.host.model().unwrap_or_default();
                for model in self.connection.list_models().await? {
                    let marker = if model == current { "*" } else { " " };
                    println!("{} {}", marker, model);
                }
            }
            Command::Model(Some(model)) => {
                self.host.set_model(Some(model.clone()));
                self.settings.default_model = Some(model);
                config::save_settings(&self.settings);
            }
            Command::Ask(text) => {
                let (session, handle) = self.host.quick_ask(&text)?;
                self.quick_ask = Some(session);
                drop(handle);
            }
            Command::Save => {
                let Some(session) = self.quick_ask.take() else {
                    println!("no quick question to save; ask one with /ask");
                    return Ok(Flow::Continue);
                };
                match self.host.save_quick_ask(&session) {
                    Ok(saved) => {
                        let name = saved.lock().name().to_string();
                        self.open(&name)?;
                    }
                    Err(e) => {
                        self.quick_ask = Some(session);
                        return Err(e);
                    }
                }
            }
            Command::Remote { url, token } => {
                self.connection.set_remote(url, token).await;
                self.save_backend();
            }
            Command::Local => {
                let result = self.connection.set_local().await;
                self.save_backend();
                result?;
            }
            Command::Idle(minutes) => {
                self.connection.set_idle_timeout(minutes);
                self.save_backend();
            }
            Command::Help => println!("{}", HELP),
            Command::Quit => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }

    fn save_backend(&mut self) {
        self.settings.backend = self.connection.settings();
        config::save_settings(&self.settings);
    }

    fn is_visible(&self, session_id: &str) -> bool {
        session_id == self.current
            || self
                .quick_ask
                .as_ref()
                .is_some_and(|s| s.lock().id() == session_id)
    }

    async fn on_event(&mut self, event: SessionEvent) {
        let visible = self.is_visible(event.session_id());
        match event {
            SessionEvent::TurnStarted { .. } => {}
            SessionEvent::Chunk { content, .. } if visible => {
                print!("{}", content);
                let _ = std::io::stdout().flush();
            }
            SessionEvent::Chunk { .. } => {}
            SessionEvent::TurnFinished { outcome, .. } if visible => match outcome {
                TurnOutcome::Completed => println!(),
                TurnOutcome::Cancelled => println!(" [stopped]"),
            },
            SessionEvent::TurnFinished { .. } => {}
            SessionEvent::TurnFailed { error, .. } => {
                println!();
                eprintln!("{}", error);
                if visible {
                    eprintln!("(/retry to ask again)");
                }
                if let Err(e) = self.host.recover().await {
                    tracing::error!(error = %e, "backend recovery failed");
                }
            }
            SessionEvent::TitleGenerated { title, .. } if visible => {
                println!("(chat is now called '{}')", title);
            }
            SessionEvent::TitleGenerated { .. } => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let (settings, fresh) = config::load_settings_or_default();
    if fresh {
        config::save_settings(&settings);
    }

    let connection = Arc::new(BackendConnection::new(settings.backend.clone()));
    let store: Arc<dyn ChatStore> =
        Arc::new(SqliteStore::new(&config::data_dir()).context("opening chat history")?);
    let (host, mut events) = ChatHost::new(connection.clone(), store, &settings)?;

    let current = settings
        .selected_chat
        .as_deref()
        .and_then(|name| host.registry().get(name))
        .or_else(|| host.registry().first())
        .map(|session| session.lock().id().to_string())
        .unwrap_or_default();

    let mut app = App {
        host,
        connection: connection.clone(),
        settings,
        current,
        quick_ask: None,
        pending: Vec::new(),
    };
    let name = app.current_name()?;
    app.open(&name)?;
    println!("Type a message, or /help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let command = match commands::parse(&line) {
                    Ok(command) => command,
                    Err(e) => {
                        eprintln!("{}", e);
                        continue;
                    }
                };
                match app.handle(command).await {
                    Ok(Flow::Quit) => break,
                    Ok(Flow::Continue) => {}
                    Err(e) => eprintln!("{}", describe_error(&e)),
                }
            }
            Some(event) = events.recv() => app.on_event(event).await,
        }
    }

    app.settings.selected_chat = app.current_name().ok();
    config::save_settings(&app.settings);
    connection.stop().await;
    Ok(())
}
