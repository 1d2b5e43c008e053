use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier for one conversation.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Creates a typed conversation identifier from raw text.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Mints a fresh identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// Stable identifier for one message, unique within its conversation.
///
/// An empty id means "not yet assigned"; the normalizer stamps one before a
/// message is shown or persisted.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Creates a typed message identifier from raw text.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Mints a fresh identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One rendered page extracted from a document attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageImage {
    pub page_number: u32,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub data_url: String,
}

/// Extracted document payload attached to a message.
///
/// This is exactly the shape the document-extraction endpoint returns; the
/// chat core treats it as opaque content plus optional page renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentData {
    pub name: String,
    pub content: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<PageImage>>,
}

/// One atomic unit of message content.
///
/// The serde tags (`text` / `file` / `data-document`) are the persisted
/// schema; changing them invalidates stored message logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessagePart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "file")]
    File {
        #[serde(rename = "mediaType")]
        media_type: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    #[serde(rename = "data-document")]
    Document { data: DocumentData },
}

impl MessagePart {
    /// Creates a plain text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Core persisted message model.
///
/// Ordering is array position within the conversation log, never timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: MessageId,
    #[serde(rename = "createdAt", default)]
    pub created_at: u64,
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

impl Message {
    /// Creates a message with an explicit id and timestamp.
    pub fn new(id: MessageId, created_at: u64, role: Role, parts: Vec<MessagePart>) -> Self {
        Self {
            id,
            created_at,
            role,
            parts,
        }
    }

    /// Creates a fully-stamped user message.
    pub fn user(parts: Vec<MessagePart>) -> Self {
        Self::new(
            MessageId::generate(),
            current_unix_timestamp_millis(),
            Role::User,
            parts,
        )
    }

    /// Creates a fully-stamped assistant message.
    pub fn assistant(parts: Vec<MessagePart>) -> Self {
        Self::new(
            MessageId::generate(),
            current_unix_timestamp_millis(),
            Role::Assistant,
            parts,
        )
    }
}

/// Reusable system-prompt configuration attachable to a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Persona {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

/// Named, independently persisted thread of messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<Persona>,
}

impl Conversation {
    /// Creates a conversation stamped at `now` with equal created/updated
    /// timestamps.
    pub fn new(id: ConversationId, title: impl Into<String>, now: u64) -> Self {
        Self {
            id,
            created_at: now,
            updated_at: now,
            title: title.into(),
            pinned: false,
            persona: None,
        }
    }

    pub fn with_persona(mut self, persona: Persona) -> Self {
        self.persona = Some(persona);
        self
    }
}

/// An image already uploaded by the composer, referenced by URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedImage {
    pub url: String,
    pub mime_type: String,
    pub name: Option<String>,
}

/// Builds the ordered part list for an outgoing user message: text first,
/// then image references, then extracted documents.
pub fn build_user_message_parts(
    text: &str,
    images: &[UploadedImage],
    documents: &[DocumentData],
) -> Vec<MessagePart> {
    let mut parts = Vec::new();

    if !text.is_empty() {
        parts.push(MessagePart::text(text));
    }

    for image in images {
        parts.push(MessagePart::File {
            media_type: image.mime_type.clone(),
            url: image.url.clone(),
            filename: image.name.clone(),
        });
    }

    for document in documents {
        parts.push(MessagePart::Document {
            data: document.clone(),
        });
    }

    parts
}

/// Flattens parts to text: text parts verbatim, documents by name, image
/// references contribute nothing.
pub fn text_from_parts(parts: &[MessagePart]) -> String {
    let mut segments = Vec::new();

    for part in parts {
        match part {
            MessagePart::Text { text } => segments.push(text.as_str()),
            MessagePart::Document { data } => segments.push(data.name.as_str()),
            MessagePart::File { .. } => {}
        }
    }

    segments.join(" ")
}

/// Returns the index of the last message with `role`, scanning from the end.
pub fn find_last_role_index(messages: &[Message], role: Role) -> Option<usize> {
    messages.iter().rposition(|message| message.role == role)
}

/// Current wall-clock time in unix milliseconds.
pub fn current_unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}
