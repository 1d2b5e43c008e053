use serde_json::Value;

use vellum_cache::{Cache, get_json};

use super::message::{
    Conversation, Message, MessageId, MessagePart, Role, current_unix_timestamp_millis,
    text_from_parts,
};
use super::store::messages_key;

/// Titles derived from content keep the first four words only.
pub const TITLE_WORD_LIMIT: usize = 4;

/// Stamps missing ids and timestamps, leaving already-stamped messages
/// untouched. Idempotent: applying it twice yields the same records.
pub fn ensure_message_ids(messages: Vec<Message>) -> Vec<Message> {
    messages
        .into_iter()
        .map(|mut message| {
            if message.id.is_empty() {
                message.id = MessageId::generate();
            }
            if message.created_at == 0 {
                message.created_at = current_unix_timestamp_millis();
            }
            message
        })
        .collect()
}

/// True when a stored record predates the multi-part schema: flat `content`
/// or `sources` fields, or a `parts` field that is not an array.
pub fn is_legacy_record(record: &Value) -> bool {
    let Some(object) = record.as_object() else {
        return true;
    };

    if object.contains_key("content") || object.contains_key("sources") {
        return true;
    }

    !object.get("parts").is_some_and(Value::is_array)
}

/// Scans every conversation's persisted message log and reports whether any
/// record anywhere is legacy-shaped. One hit invalidates the whole store;
/// the caller wipes everything rather than carrying mixed schemas.
pub fn detect_legacy_store(cache: &dyn Cache, conversations: &[Conversation]) -> bool {
    for conversation in conversations {
        if conversation.id.is_empty() {
            continue;
        }

        let raw: Value = get_json(
            cache,
            &messages_key(&conversation.id),
            Value::Array(Vec::new()),
        );
        let Some(records) = raw.as_array() else {
            return true;
        };

        if records.iter().any(is_legacy_record) {
            return true;
        }
    }

    false
}

/// Tolerantly rebuilds one message from a stored record.
///
/// Unknown or malformed parts are dropped rather than failing the whole
/// message; a record without a recognizable role is discarded entirely.
pub fn parse_stored_message(record: &Value) -> Option<Message> {
    let object = record.as_object()?;

    let role = match object.get("role").and_then(Value::as_str)? {
        "system" => Role::System,
        "user" => Role::User,
        "assistant" => Role::Assistant,
        _ => return None,
    };

    let id = object
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let created_at = object.get("createdAt").and_then(Value::as_u64).unwrap_or(0);

    let parts = object
        .get("parts")
        .and_then(Value::as_array)
        .map(|raw_parts| {
            raw_parts
                .iter()
                .filter_map(|part| serde_json::from_value::<MessagePart>(part.clone()).ok())
                .collect()
        })
        .unwrap_or_default();

    Some(Message::new(MessageId::new(id), created_at, role, parts))
}

/// Derives a conversation title from its content: the first user message's
/// flattened text (else the very first message's), stripped of markup and
/// truncated to the first four words. Falls back when nothing is left.
pub fn derive_title(messages: &[Message], fallback: &str) -> String {
    let user_text = messages
        .iter()
        .find(|message| message.role == Role::User)
        .map(|message| text_from_parts(&message.parts))
        .unwrap_or_default();

    let first_text = messages
        .first()
        .map(|message| text_from_parts(&message.parts))
        .unwrap_or_default();

    let source = if user_text.trim().is_empty() {
        first_text
    } else {
        user_text
    };

    let candidate = strip_markup(source.trim());
    let title = truncate_words(&candidate, TITLE_WORD_LIMIT);
    if title.is_empty() {
        fallback.to_string()
    } else {
        title
    }
}

/// Removes `<...>` tags; `<br>` variants become spaces so adjacent words do
/// not fuse. A lone `<` without a closing `>` is kept literally.
pub fn strip_markup(text: &str) -> String {
    let mut stripped = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find('<') {
        stripped.push_str(&rest[..start]);
        let tail = &rest[start + 1..];

        match tail.find('>') {
            Some(end) => {
                if is_br_tag(&tail[..end]) {
                    stripped.push(' ');
                }
                rest = &tail[end + 1..];
            }
            None => {
                stripped.push('<');
                rest = tail;
            }
        }
    }

    stripped.push_str(rest);
    stripped
}

fn is_br_tag(tag: &str) -> bool {
    let tag = tag.trim();
    let tag = tag.strip_suffix('/').map(str::trim_end).unwrap_or(tag);
    tag.eq_ignore_ascii_case("br")
}

/// Keeps the first `max_words` whitespace-separated words.
pub fn truncate_words(text: &str, max_words: usize) -> String {
    text.split_whitespace()
        .take(max_words)
        .collect::<Vec<_>>()
        .join(" ")
}
