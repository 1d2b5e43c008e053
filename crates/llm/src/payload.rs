use serde::{Deserialize, Serialize};

use vellum_chat::{
    Message, MessagePart, PageImage, Role, find_last_role_index, text_from_parts,
};

/// One content part in the provider wire format.
///
/// Outbound user turns carry these; text-only content collapses to a plain
/// string instead (see [`WireContent`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WirePart {
    Text {
        text: String,
    },
    Image {
        image: String,
        #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    Document {
        name: String,
        content: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        images: Option<Vec<PageImage>>,
    },
}

/// Message content on the wire: a plain string or a part array.
///
/// No parts serialize as `""`; a lone text part collapses to its string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireContent {
    Text(String),
    Parts(Vec<WirePart>),
}

/// One history entry in the wire request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: WireContent,
}

/// The streaming chat endpoint's request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequestBody {
    pub prompt: String,
    pub messages: Vec<WireMessage>,
    pub input: WireContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Collapses a part list to wire content. Non-image file references are
/// dropped (the endpoint only understands inline images); a single remaining
/// text part becomes a plain string.
pub fn content_from_parts(parts: &[MessagePart]) -> WireContent {
    let mut wire_parts = Vec::new();

    for part in parts {
        match part {
            MessagePart::Text { text } => wire_parts.push(WirePart::Text { text: text.clone() }),
            MessagePart::File {
                media_type, url, ..
            } => {
                if media_type.starts_with("image/") {
                    wire_parts.push(WirePart::Image {
                        image: url.clone(),
                        mime_type: Some(media_type.clone()),
                    });
                }
            }
            MessagePart::Document { data } => wire_parts.push(WirePart::Document {
                name: data.name.clone(),
                content: data.content.clone(),
                mime_type: data.mime_type.clone(),
                images: data.images.clone(),
            }),
        }
    }

    if wire_parts.is_empty() {
        return WireContent::Text(String::new());
    }

    if let [WirePart::Text { text }] = wire_parts.as_slice() {
        return WireContent::Text(text.clone());
    }

    WireContent::Parts(wire_parts)
}

/// Collapses one history message. Assistant and system turns flatten to
/// text; user turns keep their multi-part structure.
pub fn wire_message_from(message: &Message) -> WireMessage {
    match message.role {
        Role::Assistant | Role::System => WireMessage {
            role: message.role,
            content: WireContent::Text(text_from_parts(&message.parts)),
        },
        Role::User => WireMessage {
            role: message.role,
            content: content_from_parts(&message.parts),
        },
    }
}

/// Shapes the full transcript into the wire request: everything before the
/// last user message becomes history, the last user message becomes `input`.
/// Without any user message the whole transcript is history and `input` is
/// empty.
pub fn build_chat_request(
    prompt: impl Into<String>,
    messages: &[Message],
    model: Option<String>,
) -> ChatRequestBody {
    let last_user = find_last_role_index(messages, Role::User);

    let (history, input) = match last_user {
        Some(index) => (
            &messages[..index],
            content_from_parts(&messages[index].parts),
        ),
        None => (messages, WireContent::Text(String::new())),
    };

    ChatRequestBody {
        prompt: prompt.into(),
        messages: history.iter().map(wire_message_from).collect(),
        input,
        model,
    }
}

/// Rebuilds renderable message parts from wire content, the inverse of
/// [`content_from_parts`]. An empty string yields no parts.
pub fn parts_from_content(content: &WireContent) -> Vec<MessagePart> {
    match content {
        WireContent::Text(text) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![MessagePart::text(text.clone())]
            }
        }
        WireContent::Parts(wire_parts) => wire_parts
            .iter()
            .map(|part| match part {
                WirePart::Text { text } => MessagePart::text(text.clone()),
                WirePart::Image { image, mime_type } => MessagePart::File {
                    media_type: mime_type.clone().unwrap_or_else(|| "image/*".to_string()),
                    url: image.clone(),
                    filename: None,
                },
                WirePart::Document {
                    name,
                    content,
                    mime_type,
                    images,
                } => MessagePart::Document {
                    data: vellum_chat::DocumentData {
                        name: name.clone(),
                        content: content.clone(),
                        mime_type: mime_type.clone(),
                        images: images.clone(),
                    },
                },
            })
            .collect(),
    }
}
