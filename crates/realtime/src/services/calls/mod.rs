//! Call signaling relay.
//!
//! The relay forwards opaque offer/answer/ICE payloads between exactly two
//! identities and never touches media. At most one session exists per
//! unordered identity pair. The caller side of a session is pinned to the
//! connection that placed the call; the callee side rings every device until
//! one answers and is then pinned to that device.

pub mod state;

pub use state::{CallSignal, CallState, CallStateMachine, InvalidTransition};

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use super::registry::ConnectionRegistry;
use super::Delivery;
use crate::types::{
    CallId, CallLogEntry, ConnectionId, EndReason, MediaKind, RealtimeError, RealtimeResult,
    ServerEvent, UserId,
};

type PairKey = (UserId, UserId);

fn pair_key(a: UserId, b: UserId) -> PairKey {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[derive(Debug, Clone)]
pub struct CallSession {
    pub id: CallId,
    pub caller: UserId,
    pub callee: UserId,
    pub media_kind: MediaKind,
    /// Connection that placed the call.
    pub origin: ConnectionId,
    /// Callee connection that answered, once answered.
    pub answered_by: Option<ConnectionId>,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    caller_state: CallStateMachine,
    callee_state: CallStateMachine,
}

impl CallSession {
    fn state_machine(&self, user_id: UserId) -> &CallStateMachine {
        if user_id == self.caller {
            &self.caller_state
        } else {
            &self.callee_state
        }
    }

    pub fn state_of(&self, user_id: UserId) -> CallState {
        self.state_machine(user_id).state()
    }

    pub fn is_connected(&self) -> bool {
        self.answered_by.is_some()
    }

    pub fn involves(&self, user_id: UserId) -> bool {
        self.caller == user_id || self.callee == user_id
    }

    fn log_entry(&self, outcome: EndReason) -> CallLogEntry {
        CallLogEntry {
            call_id: self.id.clone(),
            caller_id: self.caller,
            callee_id: self.callee,
            media_kind: self.media_kind,
            outcome,
            started_at: self.created_at,
            connected_at: self.connected_at,
            ended_at: Utc::now(),
        }
    }
}

/// Result of a relay operation for the hub to act on.
#[derive(Debug, Default)]
pub struct RelayOutcome {
    pub deliveries: Vec<Delivery>,
    /// Sessions that reached a terminal state during the operation.
    pub ended: Vec<CallLogEntry>,
    /// Set when a new session started ringing.
    pub ringing: Option<CallId>,
}

impl RelayOutcome {
    fn merge(&mut self, other: RelayOutcome) {
        self.deliveries.extend(other.deliveries);
        self.ended.extend(other.ended);
        if other.ringing.is_some() {
            self.ringing = other.ringing;
        }
    }
}

pub struct CallRelay {
    sessions: DashMap<CallId, CallSession>,
    pairs: DashMap<PairKey, CallId>,
    ringing_timeout: Duration,
}

impl CallRelay {
    pub fn new(ringing_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            pairs: DashMap::new(),
            ringing_timeout,
        }
    }

    pub fn ringing_timeout(&self) -> Duration {
        self.ringing_timeout
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, call_id: &str) -> Option<CallSession> {
        self.sessions.get(call_id).map(|s| s.value().clone())
    }

    pub fn session_between(&self, a: UserId, b: UserId) -> Option<CallSession> {
        let call_id = self.pairs.get(&pair_key(a, b)).map(|id| id.value().clone())?;
        self.session(&call_id)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn start(
        &self,
        origin: ConnectionId,
        caller: UserId,
        callee: UserId,
        offer: Value,
        media_kind: MediaKind,
        request_id: Option<String>,
        registry: &ConnectionRegistry,
    ) -> RealtimeResult<RelayOutcome> {
        if caller == callee {
            return Err(RealtimeError::invalid_argument("cannot call yourself"));
        }

        let call_id = Uuid::now_v7().to_string();
        let now = Utc::now();
        let mut outcome = RelayOutcome::default();

        match self.pairs.entry(pair_key(caller, callee)) {
            Entry::Occupied(_) => {
                return Err(RealtimeError::conflict(
                    "a call between these identities is already active",
                ));
            }
            Entry::Vacant(slot) => {
                if !registry.is_online(callee) {
                    info!(
                        call_id = %call_id,
                        caller,
                        callee,
                        "Callee unreachable, call ended immediately"
                    );
                    outcome.deliveries.push(Delivery::connection(
                        origin,
                        ServerEvent::CallEnded {
                            call_id: call_id.clone(),
                            peer_identity: callee,
                            reason: EndReason::Unreachable,
                        },
                    ));
                    outcome.ended.push(CallLogEntry {
                        call_id,
                        caller_id: caller,
                        callee_id: callee,
                        media_kind,
                        outcome: EndReason::Unreachable,
                        started_at: now,
                        connected_at: None,
                        ended_at: now,
                    });
                    return Ok(outcome);
                }

                let mut caller_state = CallStateMachine::new();
                let mut callee_state = CallStateMachine::new();
                caller_state
                    .apply(CallSignal::SendOffer)
                    .and_then(|_| callee_state.apply(CallSignal::ReceiveOffer))
                    .map_err(|err| RealtimeError::conflict(err.to_string()))?;

                self.sessions.insert(
                    call_id.clone(),
                    CallSession {
                        id: call_id.clone(),
                        caller,
                        callee,
                        media_kind,
                        origin,
                        answered_by: None,
                        created_at: now,
                        connected_at: None,
                        caller_state,
                        callee_state,
                    },
                );
                slot.insert(call_id.clone());
            }
        }

        info!(call_id = %call_id, caller, callee, media_kind = media_kind.as_str(), "Call ringing");
        outcome.deliveries.push(Delivery::connection(
            origin,
            ServerEvent::CallOutgoing {
                request_id,
                call_id: call_id.clone(),
                to_identity: callee,
                media_kind,
            },
        ));
        outcome.deliveries.push(Delivery::user(
            callee,
            ServerEvent::CallIncoming {
                call_id: call_id.clone(),
                from_identity: caller,
                offer,
                media_kind,
            },
        ));
        outcome.ringing = Some(call_id);
        Ok(outcome)
    }

    pub fn answer(
        &self,
        connection: ConnectionId,
        callee: UserId,
        caller: UserId,
        answer: Value,
        registry: &ConnectionRegistry,
    ) -> RealtimeResult<RelayOutcome> {
        let call_id = self
            .pairs
            .get(&pair_key(caller, callee))
            .map(|id| id.value().clone())
            .ok_or_else(|| RealtimeError::not_found("call"))?;

        let origin = {
            let mut session = self
                .sessions
                .get_mut(&call_id)
                .ok_or_else(|| RealtimeError::not_found("call"))?;
            if session.callee != callee {
                return Err(RealtimeError::forbidden("only the callee can answer"));
            }
            if session.answered_by.is_some() {
                return Err(RealtimeError::conflict("call already answered"));
            }
            if registry.is_online(caller) {
                session
                    .callee_state
                    .apply(CallSignal::SendAnswer)
                    .map_err(|err| RealtimeError::conflict(err.to_string()))?;
                session
                    .caller_state
                    .apply(CallSignal::ReceiveAnswer)
                    .map_err(|err| RealtimeError::conflict(err.to_string()))?;
                session.answered_by = Some(connection);
                session.connected_at = Some(Utc::now());
                Some(session.origin)
            } else {
                None
            }
        };

        let Some(origin) = origin else {
            return Ok(self.finish(&call_id, EndReason::Unreachable));
        };

        info!(call_id = %call_id, caller, callee, connection_id = connection, "Call connected");
        Ok(RelayOutcome {
            deliveries: vec![
                Delivery::connection(
                    origin,
                    ServerEvent::CallAccepted {
                        call_id: call_id.clone(),
                        from_identity: callee,
                        answer,
                    },
                ),
                Delivery::user_except(
                    callee,
                    connection,
                    ServerEvent::CallEnded {
                        call_id,
                        peer_identity: caller,
                        reason: EndReason::AnsweredElsewhere,
                    },
                ),
            ],
            ..RelayOutcome::default()
        })
    }

    /// Candidates for unknown or ended sessions are dropped silently.
    pub fn ice(
        &self,
        connection: ConnectionId,
        from: UserId,
        to: UserId,
        candidate: Value,
        registry: &ConnectionRegistry,
    ) -> RelayOutcome {
        let Some(call_id) = self.pairs.get(&pair_key(from, to)).map(|id| id.value().clone())
        else {
            debug!(from, to, "ICE candidate without a session discarded");
            return RelayOutcome::default();
        };

        let target = {
            let Some(session) = self.sessions.get(&call_id) else {
                return RelayOutcome::default();
            };
            if !session.state_machine(from).accepts_ice() {
                return RelayOutcome::default();
            }
            let sender_pinned = if from == session.caller {
                session.origin == connection
            } else {
                session.answered_by.map_or(true, |answered| answered == connection)
            };
            if !sender_pinned {
                debug!(
                    call_id = %call_id,
                    from,
                    connection_id = connection,
                    "ICE from a non-participating device discarded"
                );
                return RelayOutcome::default();
            }
            if !registry.is_online(to) {
                None
            } else if to == session.caller {
                Some(Delivery::connection(session.origin, ServerEvent::CallIce {
                    call_id: call_id.clone(),
                    from_identity: from,
                    candidate,
                }))
            } else {
                let event = ServerEvent::CallIce {
                    call_id: call_id.clone(),
                    from_identity: from,
                    candidate,
                };
                Some(match session.answered_by {
                    Some(answered) => Delivery::connection(answered, event),
                    None => Delivery::user(to, event),
                })
            }
        };

        match target {
            Some(delivery) => RelayOutcome {
                deliveries: vec![delivery],
                ..RelayOutcome::default()
            },
            None => self.finish(&call_id, EndReason::Unreachable),
        }
    }

    /// Ends the session between the two identities, if any.
    pub fn end(&self, from: UserId, to: UserId) -> RelayOutcome {
        let Some(session) = self.session_between(from, to) else {
            debug!(from, to, "call.end without a session ignored");
            return RelayOutcome::default();
        };
        let reason = if session.is_connected() {
            EndReason::Hangup
        } else if from == session.caller {
            EndReason::Cancelled
        } else {
            EndReason::Declined
        };
        self.finish(&session.id, reason)
    }

    /// Ringing timeout. Ends an unanswered session with `no-answer`; a session
    /// that was answered or already ended is left alone.
    pub fn expire_ringing(&self, call_id: &str) -> RelayOutcome {
        match self
            .sessions
            .remove_if(call_id, |_, session| !session.is_connected())
        {
            Some((_, session)) => self.conclude(session, EndReason::NoAnswer),
            None => RelayOutcome::default(),
        }
    }

    /// A connection went away. Ends sessions that depended on it: the caller's
    /// originating device, the callee's answering device, or the last
    /// connection of either party.
    pub fn connection_lost(
        &self,
        connection: ConnectionId,
        user_id: UserId,
        remaining: usize,
    ) -> RelayOutcome {
        let affected: Vec<CallId> = self
            .sessions
            .iter()
            .filter(|session| session.involves(user_id))
            .filter(|session| {
                remaining == 0
                    || (session.caller == user_id && session.origin == connection)
                    || (session.callee == user_id && session.answered_by == Some(connection))
            })
            .map(|session| session.id.clone())
            .collect();

        let mut outcome = RelayOutcome::default();
        for call_id in affected {
            outcome.merge(self.finish(&call_id, EndReason::Unreachable));
        }
        outcome
    }

    fn finish(&self, call_id: &str, reason: EndReason) -> RelayOutcome {
        match self.sessions.remove(call_id) {
            Some((_, session)) => self.conclude(session, reason),
            None => RelayOutcome::default(),
        }
    }

    fn conclude(&self, mut session: CallSession, reason: EndReason) -> RelayOutcome {
        self.pairs
            .remove_if(&pair_key(session.caller, session.callee), |_, id| {
                *id == session.id
            });
        session.caller_state.end(reason);
        session.callee_state.end(reason);

        info!(
            call_id = %session.id,
            caller = session.caller,
            callee = session.callee,
            reason = reason.as_str(),
            "Call ended"
        );
        let callee_ended = ServerEvent::CallEnded {
            call_id: session.id.clone(),
            peer_identity: session.caller,
            reason,
        };
        // Other callee devices already got answered-elsewhere.
        let callee_delivery = match session.answered_by {
            Some(connection) => Delivery::connection(connection, callee_ended),
            None => Delivery::user(session.callee, callee_ended),
        };
        RelayOutcome {
            deliveries: vec![
                Delivery::user(
                    session.caller,
                    ServerEvent::CallEnded {
                        call_id: session.id.clone(),
                        peer_identity: session.callee,
                        reason,
                    },
                ),
                callee_delivery,
            ],
            ended: vec![session.log_entry(reason)],
            ringing: None,
        }
    }
}
