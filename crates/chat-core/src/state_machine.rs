use crate::{
    error::ChatError,
    types::{ConversationCommand, ConversationEvent, SessionLifecycleState},
};

#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    state: SessionLifecycleState,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self {
            state: SessionLifecycleState::Idle,
        }
    }
}

impl SessionStateMachine {
    pub fn state(&self) -> SessionLifecycleState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionLifecycleState::Active
    }

    pub fn apply(
        &mut self,
        command: &ConversationCommand,
    ) -> Result<Vec<ConversationEvent>, ChatError> {
        use ConversationCommand::*;

        match command {
            Open { .. } => self.transition_from_any_of(
                &[
                    SessionLifecycleState::Idle,
                    SessionLifecycleState::Active,
                    SessionLifecycleState::Closed,
                ],
                SessionLifecycleState::Opening,
                "open",
            ),
            Close => self.transition_from_any_of(
                &[SessionLifecycleState::Opening, SessionLifecycleState::Active],
                SessionLifecycleState::Closed,
                "close",
            ),
            LoadOlder { .. }
            | Send { .. }
            | Edit { .. }
            | Delete { .. }
            | MarkRead { .. }
            | StartTyping
            | StopTyping => {
                if self.is_active() {
                    Ok(Vec::new())
                } else {
                    Err(ChatError::invalid_state(self.state, "timeline command"))
                }
            }
        }
    }

    pub fn on_open_result(&mut self, success: bool) -> Result<ConversationEvent, ChatError> {
        if self.state != SessionLifecycleState::Opening {
            return Err(ChatError::invalid_state(self.state, "on_open_result"));
        }

        let next = if success {
            SessionLifecycleState::Active
        } else {
            SessionLifecycleState::Idle
        };

        self.state = next;
        Ok(ConversationEvent::StateChanged { state: next })
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[SessionLifecycleState],
        next: SessionLifecycleState,
        action: &str,
    ) -> Result<Vec<ConversationEvent>, ChatError> {
        if !expected.contains(&self.state) {
            return Err(ChatError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(vec![ConversationEvent::StateChanged { state: next }])
    }
}
