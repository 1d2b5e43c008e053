#![deny(unsafe_code)]

//! Conversation state for the chat client.
//!
//! [`ConversationStore`] owns the conversation list and per-conversation
//! message logs, writing through to a [`vellum_cache::Cache`] on every
//! committing mutation. The normalizer repairs stored records on the way in;
//! [`StreamState`] tracks the lifecycle of an in-flight generation.

pub mod message;
pub mod normalize;
pub mod persona;
pub mod store;
pub mod stream;

pub use message::{
    Conversation, ConversationId, DocumentData, Message, MessageId, MessagePart, PageImage,
    Persona, Role, UploadedImage, build_user_message_parts, current_unix_timestamp_millis,
    find_last_role_index, text_from_parts,
};
pub use normalize::{
    TITLE_WORD_LIMIT, derive_title, detect_legacy_store, ensure_message_ids, is_legacy_record,
    parse_stored_message, strip_markup, truncate_words,
};
pub use persona::{DEFAULT_PERSONA_ID, PERSONAS_KEY, PersonaRegistry, default_persona, is_default_persona};
pub use store::{
    ACTIVE_CHAT_KEY, ActivateOptions, ApplyOptions, CHAT_LIST_KEY, ConversationRefresh,
    ConversationStore, DEFAULT_CHAT_TITLE, MESSAGES_KEY_PREFIX, SaveHint, StoreError, StoreResult,
    messages_key, synthesize_default_conversation,
};
pub use stream::{
    StreamSessionId, StreamState, StreamTarget, StreamTransition, StreamTransitionRejection,
    StreamTransitionResult,
};
