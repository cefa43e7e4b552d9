//! palaver-irc: the IRC transport behind a palaver session.
//!
//! [`IrcTransportFactory`] implements `palaver_core::transport::TransportFactory`.
//! Each connection owns an I/O task that registers (CAP, SASL PLAIN,
//! PASS/NICK/USER), answers PINGs, keeps a roster cache current from NAMES,
//! JOIN, PART, MODE and friends, and delivers decoded events to the session.

pub mod connect;
pub mod irc;
pub mod protocol;
pub mod roster;
pub mod transport;

pub use roster::RosterCache;
pub use transport::{IrcTransport, IrcTransportFactory};
