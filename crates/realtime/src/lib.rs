//! # Quadlink Realtime
//!
//! The real-time communication core: it keeps connected clients in sync
//! about chat membership, message delivery, read state, typing state,
//! presence and call negotiation.
//!
//! ## Architecture
//!
//! - **Types**: wire commands/events, domain records, error taxonomy
//! - **Repositories**: persistence, directory and notifier contracts plus
//!   in-memory implementations
//! - **Services**: registry, presence, membership, pipeline, typing,
//!   receipts and call relay
//! - **Hub**: owns the services, dispatches commands and runs timers
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use quadlink_config::RealtimeConfig;
//! use quadlink_realtime::repositories::{InMemoryStore, LogNotifier, StaticDirectory};
//! use quadlink_realtime::Hub;
//!
//! # async fn run() {
//! let directory = Arc::new(StaticDirectory::new());
//! directory.issue_token("secret", 1).await;
//!
//! let hub = Hub::new(
//!     RealtimeConfig::default(),
//!     Arc::new(InMemoryStore::new()),
//!     directory,
//!     Arc::new(LogNotifier),
//! );
//! let session = hub.connect("secret").await.unwrap();
//! assert_eq!(session.handle.user_id(), 1);
//! # }
//! ```

pub mod hub;
pub mod repositories;
pub mod services;
pub mod types;
pub mod utils;

pub use hub::{Hub, HubStats, Session};
pub use repositories::{DirectoryService, LogNotifier, Notifier, PersistenceService, StoreError};
pub use types::{
    ClientCommand, ClientFrame, RealtimeError, RealtimeResult, ServerEvent,
};
