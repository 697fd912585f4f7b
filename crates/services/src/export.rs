//! Chat export to Markdown and JSON.

use serde_json::{json, Value};
use shared::message::{Message, Role};

const TIME_FORMAT: &str = "%Y/%m/%d %H:%M";

fn role_label(message: &Message) -> String {
    match message.role {
        Role::User => "User".to_string(),
        Role::System => "System".to_string(),
        Role::Assistant => message
            .model
            .clone()
            .unwrap_or_else(|| "Assistant".to_string()),
    }
}

/// Render a chat as Markdown.
///
/// With `obsidian` set every message becomes a callout block
/// (`> [!quote] User`), otherwise a level-3 heading followed by the text.
pub fn to_markdown(name: &str, messages: &[Message], obsidian: bool) -> String {
    let mut out = format!("# {}\n\n", name);
    for message in messages {
        let header = format!(
            "{} | {}",
            role_label(message),
            message.created_at.format(TIME_FORMAT)
        );
        if obsidian {
            let callout = match message.role {
                Role::User => "quote",
                Role::Assistant => "example",
                Role::System => "info",
            };
            out.push_str(&format!("> [!{}] {}\n", callout, header));
            for attachment in &message.attachments {
                out.push_str(&format!("> - `{}`\n", attachment.name));
            }
            for line in message.content.lines() {
                out.push_str(&format!("> {}\n", line));
            }
            out.push('\n');
        } else {
            out.push_str(&format!("### **{}**\n\n", header));
            for attachment in &message.attachments {
                out.push_str(&format!("- `{}`\n", attachment.name));
            }
            if !message.attachments.is_empty() {
                out.push('\n');
            }
            out.push_str(&message.content);
            out.push_str("\n\n---\n\n");
        }
    }
    out
}

/// Render a chat as pretty JSON. Without `metadata` only role and content are kept.
pub fn to_json(name: &str, messages: &[Message], metadata: bool) -> String {
    let messages: Vec<Value> = messages
        .iter()
        .map(|m| {
            if metadata {
                json!({
                    "id": m.id,
                    "role": m.role,
                    "model": m.model,
                    "created_at": m.created_at.to_rfc3339(),
                    "finished_at": m.finished_at.map(|t| t.to_rfc3339()),
                    "content": m.content,
                    "attachments": m.attachments.iter().map(|a| json!({
                        "id": a.id,
                        "name": a.name,
                        "type": a.kind,
                    })).collect::<Vec<_>>(),
                })
            } else {
                json!({ "role": m.role, "content": m.content })
            }
        })
        .collect();

    let doc = json!({ "name": name, "messages": messages });
    serde_json::to_string_pretty(&doc).unwrap_or_default()
}
