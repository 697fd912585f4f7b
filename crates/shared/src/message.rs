//! Conversation data model: messages and their attachments.
//!
//! A message owns its attachments; copying a message (see [`Message::duplicate`])
//! copies every attachment under fresh identifiers.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent_api::WireMessage;
use crate::naming::unique_file_name;

/// Generate an opaque, time-ordered identifier for messages, sessions and attachments.
pub fn generate_id() -> String {
    format!(
        "{}{}",
        Utc::now().format("%Y%m%d%H%M%S%6f"),
        Uuid::new_v4().simple()
    )
}

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// What an attachment contains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    PlainText,
    Code,
    Pdf,
    Odt,
    Youtube,
    Website,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::PlainText => "plain_text",
            AttachmentKind::Code => "code",
            AttachmentKind::Pdf => "pdf",
            AttachmentKind::Odt => "odt",
            AttachmentKind::Youtube => "youtube",
            AttachmentKind::Website => "website",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "image" => Some(AttachmentKind::Image),
            "plain_text" => Some(AttachmentKind::PlainText),
            "code" => Some(AttachmentKind::Code),
            "pdf" => Some(AttachmentKind::Pdf),
            "odt" => Some(AttachmentKind::Odt),
            "youtube" => Some(AttachmentKind::Youtube),
            "website" => Some(AttachmentKind::Website),
            _ => None,
        }
    }
}

/// Raw attachment payload. Images are binary, every other kind is text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttachmentContent {
    Binary(Vec<u8>),
    Text(String),
}

/// A file, transcript or excerpt attached to a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    /// Unique within the owning message
    pub name: String,
    pub kind: AttachmentKind,
    pub content: AttachmentContent,
}

impl Attachment {
    pub fn image(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            id: generate_id(),
            name: name.into(),
            kind: AttachmentKind::Image,
            content: AttachmentContent::Binary(bytes),
        }
    }

    /// Text-bearing attachment (everything except images).
    pub fn text(kind: AttachmentKind, name: impl Into<String>, text: impl Into<String>) -> Self {
        debug_assert_ne!(kind, AttachmentKind::Image);
        Self {
            id: generate_id(),
            name: name.into(),
            kind,
            content: AttachmentContent::Text(text.into()),
        }
    }

    pub fn is_image(&self) -> bool {
        self.kind == AttachmentKind::Image
    }

    /// Base64 form used in the wire `images` array.
    pub fn to_base64(&self) -> String {
        match &self.content {
            AttachmentContent::Binary(bytes) => BASE64.encode(bytes),
            AttachmentContent::Text(text) => BASE64.encode(text.as_bytes()),
        }
    }

    pub fn text_content(&self) -> String {
        match &self.content {
            AttachmentContent::Text(text) => text.clone(),
            AttachmentContent::Binary(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    /// Only set for assistant messages
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set when the message stops changing
    pub finished_at: Option<DateTime<Utc>>,
    pub content: String,
    pub attachments: Vec<Attachment>,
}

impl Message {
    pub fn new(role: Role, model: Option<String>) -> Self {
        Self {
            id: generate_id(),
            role,
            model,
            created_at: Utc::now(),
            finished_at: None,
            content: String::new(),
            attachments: Vec::new(),
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Attach a file, renaming it if the name is already used in this message.
    pub fn add_attachment(&mut self, mut attachment: Attachment) -> &Attachment {
        attachment.name = unique_file_name(&attachment.name, |candidate| {
            self.attachments.iter().any(|a| a.name == candidate)
        });
        self.attachments.push(attachment);
        &self.attachments[self.attachments.len() - 1]
    }

    /// Deep copy under fresh identifiers; content and timestamps are kept.
    pub fn duplicate(&self) -> Message {
        let mut copy = self.clone();
        copy.id = generate_id();
        for attachment in &mut copy.attachments {
            attachment.id = generate_id();
        }
        copy
    }

    /// True when both messages carry the same data, ignoring identifiers.
    pub fn same_content(&self, other: &Message) -> bool {
        self.role == other.role
            && self.model == other.model
            && self.created_at == other.created_at
            && self.finished_at == other.finished_at
            && self.content == other.content
            && self.attachments.len() == other.attachments.len()
            && self
                .attachments
                .iter()
                .zip(&other.attachments)
                .all(|(a, b)| a.name == b.name && a.kind == b.kind && a.content == b.content)
    }

    /// Backend representation: images go to `images`, other attachments are
    /// inlined ahead of the text under a filename marker.
    pub fn to_wire(&self) -> WireMessage {
        let mut content = String::new();
        let mut images = Vec::new();
        for attachment in &self.attachments {
            if attachment.is_image() {
                images.push(attachment.to_base64());
            } else {
                content.push_str(&format!(
                    "```{}\n{}\n```\n\n",
                    attachment.name,
                    attachment.text_content()
                ));
            }
        }
        content.push_str(&self.content);
        WireMessage {
            role: self.role,
            content,
            images,
        }
    }
}
