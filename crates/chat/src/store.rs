use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use snafu::{OptionExt, Snafu};

use vellum_cache::{Cache, get_json, set_json};

use super::message::{Conversation, ConversationId, Message, current_unix_timestamp_millis};
use super::normalize::{
    TITLE_WORD_LIMIT, detect_legacy_store, ensure_message_ids, parse_stored_message,
    truncate_words,
};
use super::persona::{default_persona, is_default_persona};
use crate::message::Persona;
use crate::normalize::derive_title;

/// Cache key holding the serialized conversation list.
pub const CHAT_LIST_KEY: &str = "chatList";
/// Cache key holding the active conversation id as a raw string.
pub const ACTIVE_CHAT_KEY: &str = "chatCurrentID";
/// Prefix for per-conversation message log keys.
pub const MESSAGES_KEY_PREFIX: &str = "ms_";
/// Title used when nothing better can be derived.
pub const DEFAULT_CHAT_TITLE: &str = "New Chat";

/// Cache key for one conversation's message log.
pub fn messages_key(id: &ConversationId) -> String {
    format!("{MESSAGES_KEY_PREFIX}{id}")
}

#[derive(Debug, Snafu)]
pub enum StoreError {
    #[snafu(display("no target conversation is active"))]
    NoTargetConversation { stage: &'static str },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Instruction for the rendering layer to swap its visible transcript.
///
/// Returned as a value instead of calling into a view handle; the session
/// controller forwards it to whatever owns the on-screen message list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRefresh {
    pub conversation_id: Option<ConversationId>,
    pub messages: Vec<Message>,
}

/// Options for [`ConversationStore::apply_state`].
#[derive(Debug, Clone, Copy)]
pub struct ApplyOptions {
    /// Whether to write through to the cache. `None` persists only once the
    /// store is hydrated, so pre-hydration normalization never clobbers the
    /// stored state it is about to load.
    pub persist: Option<bool>,
    /// Whether to emit a [`ConversationRefresh`] for the resolved active
    /// conversation. Metadata-only mutations pass `false` so an in-progress
    /// render is not interrupted.
    pub refresh_conversation: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            persist: None,
            refresh_conversation: true,
        }
    }
}

/// Options for [`ConversationStore::activate`].
#[derive(Debug, Clone, Default)]
pub struct ActivateOptions {
    /// The on-screen transcript of the outgoing conversation, flushed to the
    /// store before switching so unsaved turns are not lost.
    pub outgoing_transcript: Option<Vec<Message>>,
    /// Set while the outgoing conversation still has a stream in flight; its
    /// partial buffer must not be treated as final.
    pub outgoing_streaming: bool,
    /// Unset to skip the outgoing flush entirely.
    pub skip_persist_outgoing: bool,
}

/// Hint used when a save targets a conversation id not yet in the list.
#[derive(Debug, Clone, Default)]
pub struct SaveHint {
    pub title: Option<String>,
    pub persona: Option<Persona>,
}

impl SaveHint {
    pub fn from_conversation(conversation: &Conversation) -> Self {
        Self {
            title: (!conversation.title.is_empty()).then(|| conversation.title.clone()),
            persona: conversation.persona.clone(),
        }
    }
}

struct StoredChatData {
    conversations: Vec<Conversation>,
    active_id: Option<ConversationId>,
    messages: HashMap<ConversationId, Vec<Message>>,
}

/// The chat session state machine.
///
/// Exclusively owns the in-memory conversation list and the map from
/// conversation id to message log. Every committing mutation writes through
/// to the injected cache before returning; the cache holds a serialized
/// mirror, never the authority.
pub struct ConversationStore {
    cache: Arc<dyn Cache>,
    conversations: Vec<Conversation>,
    active_id: Option<ConversationId>,
    messages: HashMap<ConversationId, Vec<Message>>,
    hydrated: bool,
}

impl ConversationStore {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self {
            cache,
            conversations: Vec::new(),
            active_id: None,
            messages: HashMap::new(),
            hydrated: false,
        }
    }

    pub fn hydrated(&self) -> bool {
        self.hydrated
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn active_id(&self) -> Option<&ConversationId> {
        self.active_id.as_ref()
    }

    pub fn active_conversation(&self) -> Option<&Conversation> {
        let active_id = self.active_id.as_ref()?;
        self.conversations
            .iter()
            .find(|conversation| &conversation.id == active_id)
    }

    /// Returns the in-memory message log for a conversation.
    pub fn messages_for(&self, id: &ConversationId) -> &[Message] {
        self.messages.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Resolves a conversation by id, defaulting to the active one.
    pub fn get_by_id(&self, id: Option<&ConversationId>) -> Option<&Conversation> {
        let target = id.or(self.active_id.as_ref())?;
        self.conversations
            .iter()
            .find(|conversation| &conversation.id == target)
    }

    /// One-time load of persisted state.
    ///
    /// A store containing any legacy-shaped message wipes every chat key and
    /// starts empty. An empty resulting list synthesizes (and persists) one
    /// default conversation so the visible list is never empty. Subsequent
    /// calls are no-ops.
    pub fn hydrate(&mut self) -> Option<ConversationRefresh> {
        if self.hydrated {
            return None;
        }

        let stored = self.load_stored();
        self.messages = stored.messages;

        let refresh = if stored.conversations.is_empty() {
            let default_chat = synthesize_default_conversation();
            let default_id = default_chat.id.clone();
            self.apply_state(
                vec![default_chat],
                Some(default_id),
                ApplyOptions {
                    persist: Some(true),
                    refresh_conversation: true,
                },
            )
        } else {
            self.apply_state(
                stored.conversations,
                stored.active_id,
                ApplyOptions {
                    persist: Some(false),
                    refresh_conversation: true,
                },
            )
        };

        self.hydrated = true;
        refresh
    }

    /// The single choke point for list mutations: normalizes and sorts the
    /// list, resolves the active id, garbage-collects orphaned message logs,
    /// optionally persists, and optionally emits a refresh. Idempotent.
    pub fn apply_state(
        &mut self,
        next_list: Vec<Conversation>,
        requested_active_id: Option<ConversationId>,
        options: ApplyOptions,
    ) -> Option<ConversationRefresh> {
        let mut normalized = normalize_conversation_list(next_list);
        sort_pinned_then_recent(&mut normalized);

        let requested = requested_active_id.or_else(|| self.active_id.clone());
        let resolved = requested
            .filter(|id| normalized.iter().any(|conversation| &conversation.id == id))
            .or_else(|| normalized.first().map(|conversation| conversation.id.clone()));

        let persist = options.persist.unwrap_or(self.hydrated);

        let valid_ids: HashSet<&ConversationId> =
            normalized.iter().map(|conversation| &conversation.id).collect();
        let orphans: Vec<ConversationId> = self
            .messages
            .keys()
            .filter(|id| !valid_ids.contains(id))
            .cloned()
            .collect();
        for orphan in orphans {
            self.messages.remove(&orphan);
            if persist {
                self.cache.remove(&messages_key(&orphan));
            }
        }

        self.conversations = normalized;
        self.active_id = resolved.clone();

        if persist {
            set_json(self.cache.as_ref(), CHAT_LIST_KEY, &self.conversations);
            match &self.active_id {
                Some(id) => self.cache.set(ACTIVE_CHAT_KEY, id.as_str()),
                None => self.cache.remove(ACTIVE_CHAT_KEY),
            }
        }

        if options.refresh_conversation {
            let messages = resolved
                .as_ref()
                .and_then(|id| self.messages.get(id))
                .cloned()
                .unwrap_or_default();
            Some(ConversationRefresh {
                conversation_id: resolved,
                messages,
            })
        } else {
            None
        }
    }

    /// Renames a conversation. An empty title keeps the existing one. Never
    /// refreshes the visible transcript.
    pub fn update_title(&mut self, id: &ConversationId, title: &str) {
        let next_list = self
            .conversations
            .iter()
            .cloned()
            .map(|mut conversation| {
                if &conversation.id == id && !title.is_empty() {
                    conversation.title = title.to_string();
                }
                conversation
            })
            .collect();

        self.apply_state(
            next_list,
            self.active_id.clone(),
            ApplyOptions {
                persist: None,
                refresh_conversation: false,
            },
        );
    }

    /// Pins or unpins a conversation. Never refreshes the visible transcript.
    pub fn update_pinned(&mut self, id: &ConversationId, pinned: bool) {
        let next_list = self
            .conversations
            .iter()
            .cloned()
            .map(|mut conversation| {
                if &conversation.id == id {
                    conversation.pinned = pinned;
                }
                conversation
            })
            .collect();

        self.apply_state(
            next_list,
            self.active_id.clone(),
            ApplyOptions {
                persist: None,
                refresh_conversation: false,
            },
        );
    }

    /// The commit path for message logs.
    ///
    /// `updated_at` advances to "now" only when the log strictly grew; a save
    /// that keeps or shrinks the count reuses the latest message's own
    /// timestamp so clearing history does not fake recency. An empty list is
    /// a hard clear (removes the durable record and the in-memory entry).
    /// A target id not yet in the list synthesizes a conversation from the
    /// hint. Never refreshes the visible transcript; the caller decides.
    pub fn save_messages(
        &mut self,
        messages: Vec<Message>,
        conversation_id: Option<ConversationId>,
        hint: Option<&SaveHint>,
    ) -> StoreResult<()> {
        let target = conversation_id
            .or_else(|| self.active_id.clone())
            .context(NoTargetConversationSnafu {
                stage: "save-messages",
            })?;

        let previous_count = self.messages.get(&target).map_or(0, Vec::len);
        let normalized = ensure_message_ids(messages);

        let latest_timestamp = normalized
            .last()
            .map_or_else(current_unix_timestamp_millis, |message| message.created_at);
        let grew = normalized.len() > previous_count;
        let activity_timestamp = if grew {
            current_unix_timestamp_millis()
        } else {
            latest_timestamp
        };

        let cleared = normalized.is_empty();
        if cleared {
            self.cache.remove(&messages_key(&target));
            self.messages.remove(&target);
        } else {
            set_json(self.cache.as_ref(), &messages_key(&target), &normalized);
            self.messages.insert(target.clone(), normalized.clone());
        }

        let is_first_message = previous_count == 0 && !cleared;
        let exists = self
            .conversations
            .iter()
            .any(|conversation| conversation.id == target);

        let next_list: Vec<Conversation> = if exists {
            self.conversations
                .iter()
                .cloned()
                .map(|mut conversation| {
                    if conversation.id != target {
                        return conversation;
                    }

                    let on_default_persona = conversation
                        .persona
                        .as_ref()
                        .is_none_or(is_default_persona);

                    if !cleared {
                        conversation.updated_at = activity_timestamp;
                    }

                    if is_first_message && on_default_persona {
                        let fallback = resolve_fallback_title(&conversation.title, hint);
                        conversation.title = derive_title(&normalized, &fallback);
                    }

                    conversation
                })
                .collect()
        } else {
            let new_chat = Conversation {
                id: target.clone(),
                created_at: latest_timestamp,
                updated_at: latest_timestamp,
                title: resolve_fallback_title("", hint),
                pinned: false,
                persona: hint.and_then(|hint| hint.persona.clone()),
            };

            let mut list = Vec::with_capacity(self.conversations.len() + 1);
            list.push(new_chat);
            list.extend(self.conversations.iter().cloned());
            list
        };

        self.apply_state(
            next_list,
            self.active_id.clone(),
            ApplyOptions {
                persist: None,
                refresh_conversation: false,
            },
        );

        Ok(())
    }

    /// Switches the active conversation, inserting it if unknown.
    ///
    /// When the previously active conversation differs and is not streaming,
    /// its on-screen transcript is flushed to the store first so unsaved
    /// turns survive the switch.
    pub fn activate(
        &mut self,
        conversation: Conversation,
        options: ActivateOptions,
    ) -> Option<ConversationRefresh> {
        let previous = self.active_id.clone();
        let switching = previous
            .as_ref()
            .is_some_and(|previous| previous != &conversation.id);

        if switching && !options.skip_persist_outgoing && !options.outgoing_streaming {
            if let (Some(previous), Some(transcript)) = (previous, options.outgoing_transcript) {
                if let Err(error) = self.save_messages(transcript, Some(previous), None) {
                    tracing::warn!(error = %error, "failed to flush outgoing transcript");
                }
            }
        }

        let exists = self
            .conversations
            .iter()
            .any(|existing| existing.id == conversation.id);
        let next_list = if exists {
            self.conversations.clone()
        } else {
            let mut list = Vec::with_capacity(self.conversations.len() + 1);
            list.push(conversation.clone());
            list.extend(self.conversations.iter().cloned());
            list
        };

        self.apply_state(next_list, Some(conversation.id), ApplyOptions::default())
    }

    /// Allocates and activates a new conversation for `persona`, deriving a
    /// provisional title from the first message hint when present.
    pub fn create(
        &mut self,
        persona: Persona,
        first_message: Option<&str>,
    ) -> (Conversation, Option<ConversationRefresh>) {
        let quick_title = first_message
            .map(|text| truncate_words(text, TITLE_WORD_LIMIT))
            .filter(|title| !title.is_empty())
            .or_else(|| persona.name.clone())
            .unwrap_or_else(|| DEFAULT_CHAT_TITLE.to_string());

        let conversation = Conversation::new(
            ConversationId::generate(),
            quick_title,
            current_unix_timestamp_millis(),
        )
        .with_persona(persona);

        let refresh = self.activate(conversation.clone(), ActivateOptions::default());
        (conversation, refresh)
    }

    /// Removes a conversation and its durable message log. Deleting the last
    /// conversation synthesizes a fresh default one so the list never goes
    /// empty; deleting the active one selects the first remaining.
    pub fn delete(&mut self, conversation: &Conversation) -> Option<ConversationRefresh> {
        let filtered: Vec<Conversation> = self
            .conversations
            .iter()
            .filter(|existing| existing.id != conversation.id)
            .cloned()
            .collect();

        self.cache.remove(&messages_key(&conversation.id));
        self.messages.remove(&conversation.id);

        let any_left = !filtered.is_empty();
        let next_list = if any_left {
            filtered
        } else {
            vec![synthesize_default_conversation()]
        };

        let deleted_active = self.active_id.as_ref() == Some(&conversation.id);
        let next_active = if deleted_active || !any_left {
            next_list.first().map(|conversation| conversation.id.clone())
        } else {
            self.active_id.clone()
        };

        self.apply_state(next_list, next_active, ApplyOptions::default())
    }

    fn load_stored(&self) -> StoredChatData {
        let raw_list: Vec<serde_json::Value> =
            get_json(self.cache.as_ref(), CHAT_LIST_KEY, Vec::new());
        let parsed: Vec<Conversation> = raw_list
            .into_iter()
            .filter_map(|record| serde_json::from_value(record).ok())
            .collect();
        let conversations = normalize_conversation_list(parsed);

        if detect_legacy_store(self.cache.as_ref(), &conversations) {
            tracing::warn!(
                conversation_count = conversations.len(),
                "legacy message schema detected; wiping the chat store"
            );
            self.clear_stored_chats();
            return StoredChatData {
                conversations: Vec::new(),
                active_id: None,
                messages: HashMap::new(),
            };
        }

        let stored_active = self.cache.get(ACTIVE_CHAT_KEY).map(ConversationId::new);
        let mut messages = HashMap::new();

        for conversation in &conversations {
            let raw: Vec<serde_json::Value> = get_json(
                self.cache.as_ref(),
                &messages_key(&conversation.id),
                Vec::new(),
            );
            let parsed: Vec<Message> = raw.iter().filter_map(parse_stored_message).collect();
            messages.insert(conversation.id.clone(), ensure_message_ids(parsed));
        }

        let active_id = stored_active
            .filter(|id| conversations.iter().any(|conversation| &conversation.id == id))
            .or_else(|| conversations.first().map(|conversation| conversation.id.clone()));

        StoredChatData {
            conversations,
            active_id,
            messages,
        }
    }

    /// Removes the conversation list, active id, and every message log key.
    fn clear_stored_chats(&self) {
        self.cache.remove(CHAT_LIST_KEY);
        self.cache.remove(ACTIVE_CHAT_KEY);

        for key in self.cache.keys() {
            if key.starts_with(MESSAGES_KEY_PREFIX) {
                self.cache.remove(&key);
            }
        }
    }
}

fn resolve_fallback_title(existing: &str, hint: Option<&SaveHint>) -> String {
    if !existing.is_empty() {
        return existing.to_string();
    }

    hint.and_then(|hint| {
        hint.title.clone().or_else(|| {
            hint.persona
                .as_ref()
                .and_then(|persona| persona.name.clone())
        })
    })
    .filter(|title| !title.is_empty())
    .unwrap_or_else(|| DEFAULT_CHAT_TITLE.to_string())
}

/// Synthesizes the default conversation used when the list would otherwise
/// be empty.
pub fn synthesize_default_conversation() -> Conversation {
    Conversation::new(
        ConversationId::generate(),
        DEFAULT_CHAT_TITLE,
        current_unix_timestamp_millis(),
    )
    .with_persona(default_persona())
}

/// Drops records without ids, dedupes by first occurrence, and fills missing
/// timestamps, titles and pin flags.
pub fn normalize_conversation_list(list: Vec<Conversation>) -> Vec<Conversation> {
    let now = current_unix_timestamp_millis();
    let mut seen = HashSet::new();
    let mut normalized = Vec::with_capacity(list.len());

    for mut conversation in list {
        if conversation.id.is_empty() || !seen.insert(conversation.id.clone()) {
            continue;
        }

        if conversation.created_at == 0 {
            conversation.created_at = now;
        }
        if conversation.updated_at == 0 {
            conversation.updated_at = conversation.created_at;
        }
        if conversation.title.is_empty() {
            conversation.title = conversation
                .persona
                .as_ref()
                .and_then(|persona| persona.name.clone())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_CHAT_TITLE.to_string());
        }

        normalized.push(conversation);
    }

    normalized
}

/// Stable sort: pinned conversations first, then most recently updated.
pub fn sort_pinned_then_recent(list: &mut [Conversation]) {
    list.sort_by(|a, b| {
        b.pinned
            .cmp(&a.pinned)
            .then(b.updated_at.cmp(&a.updated_at))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageId, MessagePart, Role};
    use serde_json::json;
    use vellum_cache::MemoryCache;

    fn store_with_memory_cache() -> (Arc<MemoryCache>, ConversationStore) {
        let cache = Arc::new(MemoryCache::new());
        let store = ConversationStore::new(Arc::clone(&cache) as Arc<dyn Cache>);
        (cache, store)
    }

    fn conversation(id: &str, title: &str, updated_at: u64, pinned: bool) -> Conversation {
        let mut conversation = Conversation::new(ConversationId::new(id), title, 1);
        conversation.updated_at = updated_at;
        conversation.pinned = pinned;
        conversation
    }

    fn user_message(id: &str, text: &str, created_at: u64) -> Message {
        Message::new(
            MessageId::new(id),
            created_at,
            Role::User,
            vec![MessagePart::text(text)],
        )
    }

    #[test]
    fn hydrate_with_empty_cache_synthesizes_one_default_conversation() {
        let (cache, mut store) = store_with_memory_cache();

        let refresh = store.hydrate().expect("refresh emitted");
        assert!(store.hydrated());
        assert_eq!(store.conversations().len(), 1);
        assert_eq!(store.conversations()[0].title, DEFAULT_CHAT_TITLE);
        assert_eq!(refresh.conversation_id.as_ref(), store.active_id());

        // The synthesized conversation is persisted immediately.
        let persisted: Vec<Conversation> =
            get_json(cache.as_ref(), CHAT_LIST_KEY, Vec::new());
        assert_eq!(persisted.len(), 1);
        assert_eq!(
            cache.get(ACTIVE_CHAT_KEY).as_deref(),
            Some(store.active_id().expect("active id").as_str())
        );

        // Hydrate runs once.
        assert!(store.hydrate().is_none());
    }

    #[test]
    fn hydrate_restores_stored_conversations_and_active_id() {
        let (cache, mut store) = store_with_memory_cache();
        let a = conversation("a", "Alpha", 10, false);
        let b = conversation("b", "Beta", 20, false);
        set_json(cache.as_ref(), CHAT_LIST_KEY, &vec![a.clone(), b.clone()]);
        cache.set(ACTIVE_CHAT_KEY, "a");
        set_json(
            cache.as_ref(),
            &messages_key(&a.id),
            &vec![user_message("m1", "hello", 5)],
        );

        let refresh = store.hydrate().expect("refresh emitted");
        assert_eq!(store.conversations().len(), 2);
        assert_eq!(store.active_id().map(ConversationId::as_str), Some("a"));
        assert_eq!(refresh.messages.len(), 1);
        // Recency sort puts the fresher conversation first without touching
        // the requested active id.
        assert_eq!(store.conversations()[0].id.as_str(), "b");
    }

    #[test]
    fn legacy_message_anywhere_wipes_the_entire_store() {
        let (cache, mut store) = store_with_memory_cache();
        let clean = conversation("clean", "Clean", 10, false);
        let dirty = conversation("dirty", "Dirty", 20, false);
        set_json(
            cache.as_ref(),
            CHAT_LIST_KEY,
            &vec![clean.clone(), dirty.clone()],
        );
        cache.set(ACTIVE_CHAT_KEY, "clean");
        set_json(
            cache.as_ref(),
            &messages_key(&clean.id),
            &json!([{"id": "1", "role": "user", "parts": []}]),
        );
        set_json(
            cache.as_ref(),
            &messages_key(&dirty.id),
            &json!([{"id": "2", "role": "user", "content": "old schema"}]),
        );

        store.hydrate();

        // Both conversations are gone, replaced by one fresh default.
        assert_eq!(store.conversations().len(), 1);
        assert_ne!(store.conversations()[0].id.as_str(), "clean");
        assert_eq!(cache.get(&messages_key(&clean.id)), None);
        assert_eq!(cache.get(&messages_key(&dirty.id)), None);

        let persisted: Vec<Conversation> =
            get_json(cache.as_ref(), CHAT_LIST_KEY, Vec::new());
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].id, store.conversations()[0].id);
    }

    #[test]
    fn apply_state_is_idempotent() {
        let (_cache, mut store) = store_with_memory_cache();
        store.hydrate();

        let list = vec![
            conversation("a", "Alpha", 10, true),
            conversation("b", "Beta", 30, false),
            conversation("c", "Gamma", 20, false),
        ];

        store.apply_state(
            list.clone(),
            Some(ConversationId::new("b")),
            ApplyOptions::default(),
        );
        let first_order: Vec<String> = store
            .conversations()
            .iter()
            .map(|conversation| conversation.id.to_string())
            .collect();
        let first_active = store.active_id().cloned();

        store.apply_state(
            store.conversations().to_vec(),
            first_active.clone(),
            ApplyOptions::default(),
        );
        let second_order: Vec<String> = store
            .conversations()
            .iter()
            .map(|conversation| conversation.id.to_string())
            .collect();

        assert_eq!(first_order, second_order);
        assert_eq!(store.active_id().cloned(), first_active);
    }

    #[test]
    fn pinned_conversations_sort_before_unpinned_by_recency() {
        let (_cache, mut store) = store_with_memory_cache();
        store.hydrate();

        store.apply_state(
            vec![
                conversation("a", "A", 2, true),
                conversation("b", "B", 3, false),
                conversation("c", "C", 1, true),
            ],
            None,
            ApplyOptions::default(),
        );

        let order: Vec<&str> = store
            .conversations()
            .iter()
            .map(|conversation| conversation.id.as_str())
            .collect();
        assert_eq!(order, vec!["a", "c", "b"]);
    }

    #[test]
    fn apply_state_dedupes_by_id_and_falls_back_to_first_for_unknown_active() {
        let (_cache, mut store) = store_with_memory_cache();
        store.hydrate();

        store.apply_state(
            vec![
                conversation("a", "A", 2, false),
                conversation("a", "A again", 9, false),
                conversation("b", "B", 1, false),
            ],
            Some(ConversationId::new("missing")),
            ApplyOptions::default(),
        );

        assert_eq!(store.conversations().len(), 2);
        assert_eq!(store.conversations()[0].title, "A");
        assert_eq!(store.active_id().map(ConversationId::as_str), Some("a"));
    }

    #[test]
    fn save_growth_bumps_updated_at_but_steady_save_reuses_message_timestamp() {
        let (_cache, mut store) = store_with_memory_cache();
        store.hydrate();
        store.apply_state(
            vec![conversation("a", "Alpha", 10, false)],
            Some(ConversationId::new("a")),
            ApplyOptions::default(),
        );
        let id = ConversationId::new("a");

        let before = current_unix_timestamp_millis();
        store
            .save_messages(
                vec![user_message("m1", "hi", 100), user_message("m2", "there", 200)],
                Some(id.clone()),
                None,
            )
            .expect("save grows");
        let grown = store.get_by_id(Some(&id)).expect("conversation").updated_at;
        assert!(grown >= before);

        // Same-length save: updated_at falls back to the last message's own
        // timestamp instead of advancing to now.
        store
            .save_messages(
                vec![user_message("m1", "hi", 100), user_message("m2", "edited", 200)],
                Some(id.clone()),
                None,
            )
            .expect("save steady");
        let steady = store.get_by_id(Some(&id)).expect("conversation").updated_at;
        assert_eq!(steady, 200);
    }

    #[test]
    fn empty_save_clears_the_log_without_touching_updated_at() {
        let (cache, mut store) = store_with_memory_cache();
        store.hydrate();
        let id = ConversationId::new("a");
        store.apply_state(
            vec![conversation("a", "Alpha", 10, false)],
            Some(id.clone()),
            ApplyOptions::default(),
        );
        store
            .save_messages(vec![user_message("m1", "hi", 100)], Some(id.clone()), None)
            .expect("seed");
        let updated_after_seed = store.get_by_id(Some(&id)).expect("conversation").updated_at;

        store
            .save_messages(Vec::new(), Some(id.clone()), None)
            .expect("clear");

        assert!(store.messages_for(&id).is_empty());
        assert_eq!(cache.get(&messages_key(&id)), None);
        assert_eq!(
            store.get_by_id(Some(&id)).expect("conversation").updated_at,
            updated_after_seed
        );
    }

    #[test]
    fn first_message_on_default_persona_derives_the_title() {
        let (_cache, mut store) = store_with_memory_cache();
        store.hydrate();
        let active = store.active_conversation().expect("default active").clone();

        store
            .save_messages(
                vec![user_message(
                    "m1",
                    "Explain quantum computing in simple terms please",
                    100,
                )],
                Some(active.id.clone()),
                None,
            )
            .expect("save");

        assert_eq!(
            store.get_by_id(Some(&active.id)).expect("conversation").title,
            "Explain quantum computing in"
        );
    }

    #[test]
    fn custom_persona_conversations_keep_their_title() {
        let (_cache, mut store) = store_with_memory_cache();
        store.hydrate();
        let persona = Persona {
            id: Some("historian".to_string()),
            role: Role::System,
            name: Some("Historian".to_string()),
            prompt: Some("You are a historian.".to_string()),
        };
        let (created, _) = store.create(persona, None);

        store
            .save_messages(
                vec![user_message("m1", "Tell me about Rome", 100)],
                Some(created.id.clone()),
                None,
            )
            .expect("save");

        assert_eq!(
            store.get_by_id(Some(&created.id)).expect("conversation").title,
            "Historian"
        );
    }

    #[test]
    fn saving_to_an_unknown_id_synthesizes_a_conversation_from_the_hint() {
        let (_cache, mut store) = store_with_memory_cache();
        store.hydrate();
        let id = ConversationId::new("fresh");
        let hint = SaveHint {
            title: None,
            persona: Some(Persona {
                id: Some("poet".to_string()),
                role: Role::System,
                name: Some("Poet".to_string()),
                prompt: Some("You are a poet.".to_string()),
            }),
        };

        store
            .save_messages(
                vec![user_message("m1", "write a haiku", 100)],
                Some(id.clone()),
                Some(&hint),
            )
            .expect("save");

        let synthesized = store.get_by_id(Some(&id)).expect("conversation");
        assert_eq!(synthesized.title, "Poet");
        assert_eq!(synthesized.created_at, 100);
        assert!(synthesized.persona.is_some());
    }

    #[test]
    fn save_without_target_or_active_conversation_is_refused() {
        let (_cache, mut store) = store_with_memory_cache();
        let result = store.save_messages(vec![user_message("m1", "hi", 1)], None, None);
        assert!(matches!(result, Err(StoreError::NoTargetConversation { .. })));
    }

    #[test]
    fn deleting_the_only_conversation_synthesizes_a_default() {
        let (_cache, mut store) = store_with_memory_cache();
        store.hydrate();
        let only = store.conversations()[0].clone();

        let refresh = store.delete(&only).expect("refresh emitted");

        assert_eq!(store.conversations().len(), 1);
        assert_ne!(store.conversations()[0].id, only.id);
        assert_eq!(refresh.conversation_id.as_ref(), store.active_id());
    }

    #[test]
    fn deleting_the_active_conversation_selects_the_first_remaining() {
        let (cache, mut store) = store_with_memory_cache();
        store.hydrate();
        store.apply_state(
            vec![
                conversation("a", "A", 3, false),
                conversation("b", "B", 2, false),
            ],
            Some(ConversationId::new("a")),
            ApplyOptions::default(),
        );
        store
            .save_messages(vec![user_message("m1", "hi", 1)], Some(ConversationId::new("a")), None)
            .expect("seed");

        let target = store.get_by_id(Some(&ConversationId::new("a"))).expect("a").clone();
        store.delete(&target);

        assert_eq!(store.active_id().map(ConversationId::as_str), Some("b"));
        assert_eq!(cache.get(&messages_key(&target.id)), None);
    }

    #[test]
    fn activate_flushes_the_outgoing_transcript_unless_streaming() {
        let (_cache, mut store) = store_with_memory_cache();
        store.hydrate();
        store.apply_state(
            vec![
                conversation("a", "A", 3, false),
                conversation("b", "B", 2, false),
            ],
            Some(ConversationId::new("a")),
            ApplyOptions::default(),
        );
        let b = store.get_by_id(Some(&ConversationId::new("b"))).expect("b").clone();

        let transcript = vec![user_message("m1", "unsaved turn", 50)];
        store.activate(
            b.clone(),
            ActivateOptions {
                outgoing_transcript: Some(transcript),
                ..ActivateOptions::default()
            },
        );

        assert_eq!(store.active_id().map(ConversationId::as_str), Some("b"));
        assert_eq!(store.messages_for(&ConversationId::new("a")).len(), 1);

        // A streaming outgoing conversation keeps its partial buffer out of
        // the store.
        let a = store.get_by_id(Some(&ConversationId::new("a"))).expect("a").clone();
        store.activate(
            a,
            ActivateOptions {
                outgoing_transcript: Some(vec![
                    user_message("m1", "unsaved turn", 50),
                    user_message("m2", "partial", 60),
                ]),
                outgoing_streaming: true,
                ..ActivateOptions::default()
            },
        );
        assert_eq!(store.messages_for(&ConversationId::new("b")).len(), 0);
    }

    #[test]
    fn apply_state_garbage_collects_orphaned_message_logs() {
        let (cache, mut store) = store_with_memory_cache();
        store.hydrate();
        let id = ConversationId::new("doomed");
        store.apply_state(
            vec![conversation("doomed", "D", 2, false)],
            Some(id.clone()),
            ApplyOptions::default(),
        );
        store
            .save_messages(vec![user_message("m1", "hi", 1)], Some(id.clone()), None)
            .expect("seed");
        assert!(cache.get(&messages_key(&id)).is_some());

        store.apply_state(
            vec![conversation("kept", "K", 3, false)],
            None,
            ApplyOptions::default(),
        );

        assert!(store.messages_for(&id).is_empty());
        assert_eq!(cache.get(&messages_key(&id)), None);
    }
}
