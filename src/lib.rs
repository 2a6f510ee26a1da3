//! Long-poll client for the Telegram Bot API
//!
//! A [`Poller`] fetches updates in the background and hands them out through
//! an [`UpdateStream`]. A [`ConversationEngine`] drives multi-step dialogues
//! per user on top of a pluggable [`SessionStore`]. All network access goes
//! through the [`Transport`] trait.

pub mod config;
pub mod conversation;
pub mod dispatch;
pub mod poller;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(test)]
pub mod testing;

pub use config::{BotConfig, ConfigError};
pub use conversation::{
    BoxError, ConversationEngine, ConversationError, Progress, StageHandler, StageOutcome, Stages,
};
pub use dispatch::Dispatcher;
pub use poller::{
    ConversationRouter, DeliverAll, Poller, PollerConfig, PollerHandle, Route, UpdateRouter,
    UpdateStream, Watermark,
};
pub use session::{InMemorySessionStore, Session, SessionStore, StoreError};
pub use transport::{
    Bot, HttpTransport, LoggingTransport, Transport, TransportError, TransportErrorKind,
};
pub use types::{Chat, ChatType, Message, Update, UpdateKind, User};
