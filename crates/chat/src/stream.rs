use super::message::ConversationId;

/// Identifier for one streaming generation session.
///
/// This must change on every send so stale events can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamSessionId(pub u64);

impl StreamSessionId {
    /// Creates a typed stream session identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Stream routing key binding an in-flight send to the conversation it was
/// issued from. Captured once at send time; the terminal commit goes to this
/// conversation id regardless of later navigation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub conversation_id: ConversationId,
    pub session_id: StreamSessionId,
}

impl StreamTarget {
    /// Builds a full stream target from conversation and session IDs.
    pub fn new(conversation_id: ConversationId, session_id: StreamSessionId) -> Self {
        Self {
            conversation_id,
            session_id,
        }
    }
}

/// Stream lifecycle state for the session controller.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Submitted(StreamTarget),
    Streaming(StreamTarget),
    Done(StreamTarget),
    Error {
        target: StreamTarget,
        message: String,
    },
    Cancelled(StreamTarget),
}

/// State transition input for the stream lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransition {
    Start(StreamTarget),
    FirstDelta(StreamTarget),
    Complete(StreamTarget),
    Fail {
        target: StreamTarget,
        message: String,
    },
    Cancel(StreamTarget),
    ResetToIdle,
}

/// Rejection reason for illegal stream transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransitionRejection {
    AlreadyStreaming {
        active: StreamTarget,
        attempted: StreamTarget,
    },
    NoActiveStream,
    SessionMismatch {
        active: StreamTarget,
        attempted: StreamTarget,
    },
}

/// Result type for stream transition application.
pub type StreamTransitionResult = Result<StreamState, StreamTransitionRejection>;

impl StreamState {
    /// Returns the in-flight target while a send is submitted or streaming.
    pub fn active_target(&self) -> Option<&StreamTarget> {
        match self {
            Self::Submitted(target) | Self::Streaming(target) => Some(target),
            Self::Idle | Self::Done(_) | Self::Error { .. } | Self::Cancelled(_) => None,
        }
    }

    /// True while a send is outstanding (submitted or streaming).
    pub fn is_in_flight(&self) -> bool {
        self.active_target().is_some()
    }

    /// Returns true when incoming stream data matches the active session.
    pub fn accepts_stream_event(&self, target: &StreamTarget) -> bool {
        self.active_target() == Some(target)
    }

    /// Applies one transition deterministically.
    ///
    /// Non-in-flight states may start a new session directly. Any terminal
    /// transition (`Complete`/`Fail`/`Cancel`) must name the currently active
    /// session exactly.
    pub fn apply(&self, transition: StreamTransition) -> StreamTransitionResult {
        match transition {
            StreamTransition::Start(target) => self.apply_start(target),
            StreamTransition::FirstDelta(target) => self.apply_first_delta(target),
            StreamTransition::Complete(target) => {
                self.apply_terminal(target, |target| Self::Done(target))
            }
            StreamTransition::Fail { target, message } => {
                self.apply_terminal(target, move |target| Self::Error { target, message })
            }
            StreamTransition::Cancel(target) => {
                self.apply_terminal(target, |target| Self::Cancelled(target))
            }
            StreamTransition::ResetToIdle => Ok(Self::Idle),
        }
    }

    fn apply_start(&self, target: StreamTarget) -> StreamTransitionResult {
        match self.active_target() {
            Some(active) if *active != target => Err(StreamTransitionRejection::AlreadyStreaming {
                active: active.clone(),
                attempted: target,
            }),
            Some(_) => Ok(self.clone()),
            None => Ok(Self::Submitted(target)),
        }
    }

    fn apply_first_delta(&self, target: StreamTarget) -> StreamTransitionResult {
        match self.active_target() {
            Some(active) if *active == target => Ok(Self::Streaming(target)),
            Some(active) => Err(StreamTransitionRejection::SessionMismatch {
                active: active.clone(),
                attempted: target,
            }),
            None => Err(StreamTransitionRejection::NoActiveStream),
        }
    }

    fn apply_terminal(
        &self,
        target: StreamTarget,
        next: impl FnOnce(StreamTarget) -> Self,
    ) -> StreamTransitionResult {
        match self.active_target() {
            Some(active) if *active == target => Ok(next(target)),
            Some(active) => Err(StreamTransitionRejection::SessionMismatch {
                active: active.clone(),
                attempted: target,
            }),
            None => Err(StreamTransitionRejection::NoActiveStream),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(conversation: &str, session: u64) -> StreamTarget {
        StreamTarget::new(
            ConversationId::new(conversation),
            StreamSessionId::new(session),
        )
    }

    #[test]
    fn full_lifecycle_reaches_done() {
        let target = target("a", 1);
        let state = StreamState::Idle;

        let state = state
            .apply(StreamTransition::Start(target.clone()))
            .expect("start");
        assert!(state.is_in_flight());

        let state = state
            .apply(StreamTransition::FirstDelta(target.clone()))
            .expect("first delta");
        assert_eq!(state, StreamState::Streaming(target.clone()));

        let state = state
            .apply(StreamTransition::Complete(target.clone()))
            .expect("complete");
        assert_eq!(state, StreamState::Done(target));
    }

    #[test]
    fn terminal_transition_with_wrong_session_is_rejected() {
        let active = target("a", 1);
        let stale = target("a", 2);

        let state = StreamState::Streaming(active.clone());
        let rejection = state
            .apply(StreamTransition::Complete(stale.clone()))
            .expect_err("session mismatch");

        assert_eq!(
            rejection,
            StreamTransitionRejection::SessionMismatch {
                active,
                attempted: stale,
            }
        );
    }

    #[test]
    fn terminal_transition_without_active_stream_is_rejected() {
        let rejection = StreamState::Idle
            .apply(StreamTransition::Cancel(target("a", 1)))
            .expect_err("no active stream");
        assert_eq!(rejection, StreamTransitionRejection::NoActiveStream);
    }

    #[test]
    fn starting_over_an_in_flight_session_is_rejected() {
        let active = target("a", 1);
        let attempted = target("b", 2);

        let state = StreamState::Submitted(active.clone());
        let rejection = state
            .apply(StreamTransition::Start(attempted.clone()))
            .expect_err("already streaming");

        assert_eq!(
            rejection,
            StreamTransitionRejection::AlreadyStreaming { active, attempted }
        );
    }

    #[test]
    fn cancel_from_streaming_lands_in_cancelled() {
        let target = target("a", 3);
        let state = StreamState::Streaming(target.clone());

        let state = state
            .apply(StreamTransition::Cancel(target.clone()))
            .expect("cancel");
        assert_eq!(state, StreamState::Cancelled(target));
        assert!(!state.is_in_flight());
    }
}
