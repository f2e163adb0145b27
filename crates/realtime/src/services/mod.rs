//! Components of the real-time core.
//!
//! Each service owns one slice of shared state. Services that decide who
//! should hear about something return [`Delivery`] values instead of writing
//! to connections themselves; the hub resolves them against the registry.

pub mod calls;
pub mod membership;
pub mod pipeline;
pub mod presence;
pub mod receipts;
pub mod registry;
pub mod typing;

pub use calls::{CallRelay, CallSession, CallState, CallStateMachine, RelayOutcome};
pub use membership::MembershipIndex;
pub use pipeline::{HistoryPage, MessagePipeline, SendOutcome, SendRequest};
pub use presence::PresenceTracker;
pub use receipts::{MarkReadOutcome, ReadBatch, ReadReceiptAggregator};
pub use registry::{ConnectionHandle, ConnectionRegistry, OutboundEvent, OutboundReceiver};
pub use typing::{TypingCoordinator, TypingExpiry, TypingStart};

use crate::types::{ConnectionId, ServerEvent, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Connection(ConnectionId),
    /// Every connection of the identity, optionally skipping one.
    User {
        user_id: UserId,
        except: Option<ConnectionId>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub audience: Audience,
    pub event: ServerEvent,
}

impl Delivery {
    pub fn connection(connection_id: ConnectionId, event: ServerEvent) -> Self {
        Self {
            audience: Audience::Connection(connection_id),
            event,
        }
    }

    pub fn user(user_id: UserId, event: ServerEvent) -> Self {
        Self {
            audience: Audience::User {
                user_id,
                except: None,
            },
            event,
        }
    }

    pub fn user_except(user_id: UserId, except: ConnectionId, event: ServerEvent) -> Self {
        Self {
            audience: Audience::User {
                user_id,
                except: Some(except),
            },
            event,
        }
    }
}
