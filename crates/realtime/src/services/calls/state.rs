//! Per-party call lifecycle.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::EndReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Idle,
    Calling,
    Incoming,
    Connected,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSignal {
    SendOffer,
    ReceiveOffer,
    SendAnswer,
    ReceiveAnswer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot apply {signal:?} while {state:?}")]
pub struct InvalidTransition {
    pub state: CallState,
    pub signal: CallSignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallStateMachine {
    state: CallState,
    ended: Option<EndReason>,
}

impl Default for CallStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl CallStateMachine {
    pub fn new() -> Self {
        Self {
            state: CallState::Idle,
            ended: None,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.ended
    }

    pub fn apply(&mut self, signal: CallSignal) -> Result<CallState, InvalidTransition> {
        let next = match (self.state, signal) {
            (CallState::Idle, CallSignal::SendOffer) => CallState::Calling,
            (CallState::Idle, CallSignal::ReceiveOffer) => CallState::Incoming,
            (CallState::Calling, CallSignal::ReceiveAnswer) => CallState::Connected,
            (CallState::Incoming, CallSignal::SendAnswer) => CallState::Connected,
            (state, signal) => return Err(InvalidTransition { state, signal }),
        };
        self.state = next;
        Ok(next)
    }

    /// Terminal transition. Returns false when the call had already ended.
    pub fn end(&mut self, reason: EndReason) -> bool {
        if self.state == CallState::Ended {
            return false;
        }
        self.state = CallState::Ended;
        self.ended = Some(reason);
        true
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self.state, CallState::Calling | CallState::Incoming)
    }

    /// ICE candidates are relayed while ringing or connected.
    pub fn accepts_ice(&self) -> bool {
        matches!(
            self.state,
            CallState::Calling | CallState::Incoming | CallState::Connected
        )
    }
}
