//! Slash commands understood by the prompt. Anything else is sent as a message.

use chat_host::ExportFormat;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Say(String),
    New(Option<String>),
    List,
    Switch(String),
    Rename(String),
    Delete(Option<String>),
    Duplicate,
    System(String),
    Attach(PathBuf),
    Stop,
    Search(String),
    Export {
        format: ExportFormat,
        path: Option<PathBuf>,
    },
    /// Copy the open chat into a database file
    ExportDb(PathBuf),
    Import(PathBuf),
    /// Answer the last message again
    Retry,
    /// Show available models, or select one
    Model(Option<String>),
    Ask(String),
    /// Keep the last quick question as a chat
    Save,
    Remote {
        url: String,
        token: String,
    },
    Local,
    Idle(u64),
    Help,
    Quit,
}

pub const HELP: &str = "\
/new [name]            start a chat
/list                  list chats
/switch <name>         open a chat
/rename <name>         rename the open chat
/delete [name]         delete a chat (default: the open one)
/dup                   duplicate the open chat
/system <text>         add a system message
/attach <file>         attach a text file to the next message
/stop                  cancel the running reply
/retry                 replace the last reply with a new one
/search <pattern>      search the open chat
/export <md|obsidian|json|json-meta> [file]
/export db <file>      copy the chat into a database file
/import <file>         add the chats from a database file
/model [name]          list models or pick one
/ask <text>            one-off question, not saved
/save                  keep the last /ask as a chat
/remote <url> [token]  use a remote server
/local                 use the local server
/idle <minutes>        stop the local server when idle (0 = never)
/quit";

fn required(arg: &str, what: &str) -> Result<String, String> {
    if arg.is_empty() {
        Err(format!("missing {}", what))
    } else {
        Ok(arg.to_string())
    }
}

pub fn parse(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Say(line.to_string()));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    let optional = || (!arg.is_empty()).then(|| arg.to_string());

    Ok(match name {
        "new" => Command::New(optional()),
        "list" | "ls" => Command::List,
        "switch" | "open" => Command::Switch(required(arg, "chat name")?),
        "rename" => Command::Rename(required(arg, "new name")?),
        "delete" | "rm" => Command::Delete(optional()),
        "dup" | "duplicate" => Command::Duplicate,
        "system" => Command::System(arg.to_string()),
        "attach" => Command::Attach(PathBuf::from(required(arg, "file")?)),
        "stop" => Command::Stop,
        "retry" | "regen" => Command::Retry,
        "search" => Command::Search(required(arg, "pattern")?),
        "export" => {
            let (format, path) = match arg.split_once(char::is_whitespace) {
                Some((format, path)) => (format, Some(PathBuf::from(path.trim()))),
                None => (arg, None),
            };
            if format == "db" {
                let path = path.ok_or_else(|| "missing database file".to_string())?;
                return Ok(Command::ExportDb(path));
            }
            let format = ExportFormat::parse(if format.is_empty() { "md" } else { format })
                .ok_or_else(|| format!("unknown export format '{}'", format))?;
            Command::Export { format, path }
        }
        "model" => Command::Model(optional()),
        "import" => Command::Import(PathBuf::from(required(arg, "database file")?)),
        "ask" => Command::Ask(required(arg, "question")?),
        "save" => Command::Save,
        "remote" => {
            let mut parts = arg.split_whitespace();
            let url = required(parts.next().unwrap_or(""), "server url")?;
            let token = parts.next().unwrap_or("").to_string();
            Command::Remote { url, token }
        }
        "local" => Command::Local,
        "idle" => Command::Idle(
            arg.parse()
                .map_err(|_| format!("'{}' is not a number of minutes", arg))?,
        ),
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => return Err(format!("unknown command /{}", other)),
    })
}
