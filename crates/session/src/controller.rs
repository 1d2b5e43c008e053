use std::sync::Arc;

use snafu::{OptionExt, Snafu, ensure};

use vellum_cache::Cache;
use vellum_chat::{
    ActivateOptions, Conversation, ConversationId, ConversationRefresh, ConversationStore,
    DocumentData, Message, MessageId, MessagePart, Persona, PersonaRegistry, Role, SaveHint,
    StoreError, StreamSessionId, StreamState, StreamTarget, StreamTransition, UploadedImage,
    build_user_message_parts, current_unix_timestamp_millis, default_persona, ensure_message_ids,
};
use vellum_llm::{
    ChatSource, LlmProvider, ProviderError, ProviderWorker, StreamEventMapped, StreamEventPayload,
    StreamRequest, dedupe_sources, strip_trailing_source_links,
};

#[derive(Debug, Snafu)]
pub enum SessionError {
    #[snafu(display("the chat store has not hydrated yet"))]
    NotHydrated { stage: &'static str },
    #[snafu(display("no active conversation to send into"))]
    NoActiveConversation { stage: &'static str },
    #[snafu(display("a stream is already in flight"))]
    StreamInFlight { stage: &'static str },
    #[snafu(display("the resolved persona has no prompt"))]
    MissingPersonaPrompt { stage: &'static str },
    #[snafu(display("nothing to send"))]
    EmptyDraft { stage: &'static str },
    #[snafu(display("no persona with id '{persona_id}'"))]
    UnknownPersona {
        stage: &'static str,
        persona_id: String,
    },
    #[snafu(display("provider failed on `{stage}`: {source}"))]
    Provider {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("store failed on `{stage}`: {source}"))]
    Store {
        stage: &'static str,
        source: StoreError,
    },
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Everything bound to one streaming send at launch time.
///
/// The target names the commit destination; navigation after send never
/// changes it. The transcript snapshot is what the final assistant message
/// is appended to, so edits to the visible transcript mid-stream cannot
/// corrupt the commit.
struct InflightSend {
    target: StreamTarget,
    base_transcript: Vec<Message>,
    assistant_text: String,
    sources: Vec<ChatSource>,
    placeholder_id: MessageId,
}

/// Coordinates one outstanding provider stream against the conversation
/// store.
///
/// Owns the on-screen transcript of the active conversation. `send` commits
/// the user turn optimistically and returns the provider worker for the
/// caller to spawn; stream events are pulled via [`recv_event`] and folded
/// in through [`handle_event`].
///
/// [`recv_event`]: ChatController::recv_event
/// [`handle_event`]: ChatController::handle_event
pub struct ChatController {
    store: ConversationStore,
    personas: PersonaRegistry,
    provider: Arc<dyn LlmProvider>,
    transcript: Vec<Message>,
    stream_state: StreamState,
    inflight: Option<InflightSend>,
    active_stream: Option<vellum_llm::ProviderEventStream>,
    next_session_id: u64,
    model: Option<String>,
    last_error: Option<String>,
    last_sources: Vec<ChatSource>,
}

impl ChatController {
    pub fn new(cache: Arc<dyn Cache>, provider: Arc<dyn LlmProvider>) -> Self {
        let personas = PersonaRegistry::load(Arc::clone(&cache));
        Self {
            store: ConversationStore::new(cache),
            personas,
            provider,
            transcript: Vec::new(),
            stream_state: StreamState::Idle,
            inflight: None,
            active_stream: None,
            next_session_id: 0,
            model: None,
            last_error: None,
            last_sources: Vec::new(),
        }
    }

    /// One-time load of persisted state into the store and transcript.
    pub fn hydrate(&mut self) {
        let refresh = self.store.hydrate();
        self.apply_refresh(refresh);
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn personas(&mut self) -> &mut PersonaRegistry {
        &mut self.personas
    }

    /// The on-screen message list for the active conversation.
    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    pub fn stream_state(&self) -> &StreamState {
        &self.stream_state
    }

    pub fn is_streaming(&self) -> bool {
        self.stream_state.is_in_flight()
    }

    /// The most recent recoverable stream error, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Deduplicated citations from the last finished stream.
    pub fn last_sources(&self) -> &[ChatSource] {
        &self.last_sources
    }

    /// Selects the model forwarded with subsequent sends.
    pub fn set_model(&mut self, model: Option<String>) {
        self.model = model;
    }

    /// Validates and launches a streaming send for the active conversation.
    ///
    /// The user turn is committed to the store before the request goes out,
    /// so a crash mid-stream never loses it. Returns the provider worker
    /// future; the caller must spawn it, then pump [`recv_event`] into
    /// [`handle_event`] until a terminal event arrives.
    ///
    /// [`recv_event`]: ChatController::recv_event
    /// [`handle_event`]: ChatController::handle_event
    pub fn send(
        &mut self,
        draft: &str,
        images: &[UploadedImage],
        documents: &[DocumentData],
    ) -> SessionResult<ProviderWorker> {
        ensure!(self.store.hydrated(), NotHydratedSnafu { stage: "send" });
        ensure!(
            !self.stream_state.is_in_flight(),
            StreamInFlightSnafu { stage: "send" }
        );

        let conversation = self
            .store
            .active_conversation()
            .cloned()
            .context(NoActiveConversationSnafu { stage: "send" })?;
        let prompt = self.resolve_prompt(&conversation)?;

        let parts = build_user_message_parts(draft.trim(), images, documents);
        ensure!(!parts.is_empty(), EmptyDraftSnafu { stage: "send" });

        self.last_error = None;
        self.transcript.push(Message::user(parts));
        self.store
            .save_messages(
                self.transcript.clone(),
                Some(conversation.id.clone()),
                Some(&SaveHint::from_conversation(&conversation)),
            )
            .map_err(|source| SessionError::Store {
                stage: "send-optimistic-commit",
                source,
            })?;

        self.next_session_id += 1;
        let target = StreamTarget::new(
            conversation.id.clone(),
            StreamSessionId::new(self.next_session_id),
        );

        match self
            .stream_state
            .apply(StreamTransition::Start(target.clone()))
        {
            Ok(next) => self.stream_state = next,
            Err(rejection) => {
                tracing::warn!(rejection = ?rejection, "refusing overlapping send");
                return StreamInFlightSnafu { stage: "send-start" }.fail();
            }
        }

        let mut request = StreamRequest::new(target.clone(), prompt, self.transcript.clone());
        if let Some(model) = &self.model {
            request = request.with_model(model.clone());
        }

        let handle = match self.provider.stream_chat(request) {
            Ok(handle) => handle,
            Err(source) => {
                // The committed user turn stays; the send is re-issuable.
                self.stream_state = StreamState::Idle;
                return Err(SessionError::Provider {
                    stage: "send-open-stream",
                    source,
                });
            }
        };

        tracing::debug!(
            conversation_id = %target.conversation_id,
            session_id = ?target.session_id,
            "stream submitted"
        );
        self.inflight = Some(InflightSend {
            target,
            base_transcript: self.transcript.clone(),
            assistant_text: String::new(),
            sources: Vec::new(),
            placeholder_id: MessageId::generate(),
        });
        self.active_stream = Some(handle.stream);

        Ok(handle.worker)
    }

    /// Awaits the next mapped event from the active stream.
    pub async fn recv_event(&mut self) -> Option<StreamEventMapped> {
        match self.active_stream.as_mut() {
            Some(stream) => stream.recv().await,
            None => None,
        }
    }

    /// Folds one provider event into controller state. Events whose target
    /// does not match the in-flight record are stale and dropped.
    pub fn handle_event(&mut self, event: StreamEventMapped) {
        let current = self
            .inflight
            .as_ref()
            .is_some_and(|inflight| inflight.target == event.target);
        if !current {
            tracing::debug!(target = ?event.target, "dropping stale stream event");
            return;
        }

        match event.payload {
            StreamEventPayload::Delta(text) => self.apply_delta(text),
            StreamEventPayload::Source(source) => self.apply_source(source),
            StreamEventPayload::Finish { reason, message } => self.apply_finish(reason, message),
            StreamEventPayload::Error(message) => self.apply_stream_error(message),
            StreamEventPayload::Closed => self.apply_stream_closed(),
        }
    }

    /// Signals cancellation to the transport. State is cleared when the
    /// worker acknowledges by closing the stream without a finish.
    pub fn stop(&mut self) {
        if let Some(stream) = self.active_stream.as_mut() {
            stream.cancel();
        }
    }

    /// Switches the active conversation. On an actual id change an in-flight
    /// stream is cancelled, but its commit record survives so a finish that
    /// raced the cancel still lands in the conversation it was sent from.
    /// Re-selecting the already active conversation leaves the stream alone.
    pub fn select_conversation(&mut self, conversation: Conversation) {
        let switching = self.store.active_id() != Some(&conversation.id);
        let streaming = self.stream_state.is_in_flight();
        if switching && streaming {
            self.stop();
        }

        let refresh = self.store.activate(
            conversation,
            ActivateOptions {
                outgoing_transcript: Some(self.transcript.clone()),
                outgoing_streaming: streaming,
                skip_persist_outgoing: false,
            },
        );
        self.apply_refresh(refresh);
    }

    /// Allocates and activates a new conversation for the persona.
    pub fn create_conversation(
        &mut self,
        persona_id: &str,
        first_message: Option<&str>,
    ) -> SessionResult<Conversation> {
        let persona = self
            .personas
            .get_by_id(persona_id)
            .cloned()
            .context(UnknownPersonaSnafu {
                stage: "create-conversation",
                persona_id,
            })?;

        let streaming = self.stream_state.is_in_flight();
        if streaming {
            self.stop();
        } else if self.store.active_id().is_some() && !self.transcript.is_empty() {
            if let Err(error) = self.store.save_messages(self.transcript.clone(), None, None) {
                tracing::warn!(error = %error, "failed to flush transcript before new chat");
            }
        }

        let (conversation, refresh) = self.store.create(persona, first_message);
        self.apply_refresh(refresh);
        Ok(conversation)
    }

    /// Deletes a conversation. An in-flight stream bound to it loses its
    /// commit target, so the record is dropped outright.
    pub fn delete_conversation(&mut self, conversation: &Conversation) {
        let targets_deleted = self
            .inflight
            .as_ref()
            .is_some_and(|inflight| inflight.target.conversation_id == conversation.id);
        if targets_deleted {
            self.stop();
            self.inflight = None;
            self.active_stream = None;
            self.stream_state = StreamState::Idle;
        }

        let refresh = self.store.delete(conversation);
        self.apply_refresh(refresh);
    }

    /// Hard-clears the active conversation's messages. Refused while a
    /// stream is in flight.
    pub fn clear_messages(&mut self) -> SessionResult<()> {
        ensure!(
            !self.stream_state.is_in_flight(),
            StreamInFlightSnafu {
                stage: "clear-messages"
            }
        );

        self.transcript.clear();
        self.store
            .save_messages(Vec::new(), None, None)
            .map_err(|source| SessionError::Store {
                stage: "clear-messages",
                source,
            })
    }

    pub fn rename_conversation(&mut self, id: &ConversationId, title: &str) {
        self.store.update_title(id, title);
    }

    pub fn set_pinned(&mut self, id: &ConversationId, pinned: bool) {
        self.store.update_pinned(id, pinned);
    }

    /// Resolves the persona prompt for a conversation: by-id registry lookup
    /// first so persona edits apply retroactively, the conversation's cached
    /// copy as fallback, the default persona when none is bound.
    fn resolve_prompt(&self, conversation: &Conversation) -> SessionResult<String> {
        let persona: Persona = match &conversation.persona {
            Some(cached) => cached
                .id
                .as_deref()
                .and_then(|id| self.personas.get_by_id(id))
                .cloned()
                .unwrap_or_else(|| cached.clone()),
            None => default_persona(),
        };

        persona
            .prompt
            .filter(|prompt| !prompt.trim().is_empty())
            .context(MissingPersonaPromptSnafu { stage: "send" })
    }

    fn apply_refresh(&mut self, refresh: Option<ConversationRefresh>) {
        if let Some(refresh) = refresh {
            self.transcript = refresh.messages;
        }
    }

    fn apply_delta(&mut self, text: String) {
        let Some(inflight) = self.inflight.as_mut() else {
            return;
        };

        if let Ok(next) = self
            .stream_state
            .apply(StreamTransition::FirstDelta(inflight.target.clone()))
        {
            self.stream_state = next;
        }

        inflight.assistant_text.push_str(&text);

        // The placeholder only renders while its conversation is on screen.
        if self.store.active_id() != Some(&inflight.target.conversation_id) {
            return;
        }

        let rendered = MessagePart::text(inflight.assistant_text.clone());
        match self
            .transcript
            .iter_mut()
            .find(|message| message.id == inflight.placeholder_id)
        {
            Some(existing) => existing.parts = vec![rendered],
            None => self.transcript.push(Message::new(
                inflight.placeholder_id.clone(),
                current_unix_timestamp_millis(),
                Role::Assistant,
                vec![rendered],
            )),
        }
    }

    fn apply_source(&mut self, source: ChatSource) {
        let Some(inflight) = self.inflight.as_mut() else {
            return;
        };

        if inflight
            .sources
            .iter()
            .all(|existing| existing.dedup_key() != source.dedup_key())
        {
            inflight.sources.push(source);
        }
    }

    /// Terminal success: commits to the conversation recorded at send time,
    /// regardless of which conversation is active now.
    fn apply_finish(&mut self, reason: String, message: Option<Message>) {
        let Some(inflight) = self.inflight.take() else {
            return;
        };

        if let Ok(next) = self
            .stream_state
            .apply(StreamTransition::Complete(inflight.target.clone()))
        {
            self.stream_state = next;
        }
        self.active_stream = None;

        let sources = dedupe_sources(inflight.sources);
        let assistant = message.unwrap_or_else(|| {
            let text = strip_trailing_source_links(&inflight.assistant_text, &sources);
            Message::new(
                inflight.placeholder_id.clone(),
                current_unix_timestamp_millis(),
                Role::Assistant,
                vec![MessagePart::text(text)],
            )
        });

        let mut final_list = inflight.base_transcript;
        final_list.push(assistant);
        let final_list = ensure_message_ids(final_list);

        let conversation_id = inflight.target.conversation_id.clone();
        if let Err(error) = self
            .store
            .save_messages(final_list.clone(), Some(conversation_id.clone()), None)
        {
            tracing::error!(
                error = %error,
                conversation_id = %conversation_id,
                "failed to commit finished stream"
            );
        }
        tracing::debug!(
            conversation_id = %conversation_id,
            reason = %reason,
            "stream finished"
        );

        self.last_sources = sources;
        if self.store.active_id() == Some(&conversation_id) {
            // Swap in the committed list so the placeholder is replaced by
            // the final assistant message.
            self.transcript = final_list;
        }
    }

    /// Terminal failure: nothing is persisted beyond the already-committed
    /// user turn, leaving the send re-issuable.
    fn apply_stream_error(&mut self, message: String) {
        let Some(inflight) = self.inflight.take() else {
            return;
        };

        if let Ok(next) = self.stream_state.apply(StreamTransition::Fail {
            target: inflight.target.clone(),
            message: message.clone(),
        }) {
            self.stream_state = next;
        }
        self.active_stream = None;
        self.transcript
            .retain(|existing| existing.id != inflight.placeholder_id);

        tracing::warn!(
            conversation_id = %inflight.target.conversation_id,
            error = %message,
            "stream failed"
        );
        self.last_error = Some(message);
    }

    /// The stream closed without a terminal finish: a cancellation ack or a
    /// provider hang-up. Clears the in-flight record without committing.
    fn apply_stream_closed(&mut self) {
        let Some(inflight) = self.inflight.take() else {
            return;
        };

        if let Ok(next) = self
            .stream_state
            .apply(StreamTransition::Cancel(inflight.target.clone()))
        {
            self.stream_state = next;
        }
        self.active_stream = None;
        self.transcript
            .retain(|existing| existing.id != inflight.placeholder_id);

        tracing::debug!(
            conversation_id = %inflight.target.conversation_id,
            "stream closed without commit"
        );
    }
}
