//! palaver-core: the session engine behind the palaver IRC client.
//!
//! Turns the decoded event stream coming out of a transport into a queryable
//! model of channels, rosters and chat history, while accepting typed user
//! commands and running the post-registration automation (NickServ identify,
//! on-connect script, auto-join).
//!
//! The crate never touches sockets. A [`transport::TransportFactory`] supplies
//! live connections; everything the session learns is published as
//! [`message::Message`] values on the [`bus::MessageBus`].

pub mod bus;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod message;
pub mod reducer;
pub mod roster;
pub mod sequencer;
pub mod session;
pub mod transport;

pub use bus::MessageBus;
pub use command::{CommandIntent, parse};
pub use config::{ServerConfig, SessionOptions};
pub use error::{ConfigError, SessionError, TransportError};
pub use event::Event;
pub use message::{Message, MessageKind};
pub use session::{ConnectionSession, ConnectionState};
