//! Console automation primitives.
//!
//! - [`channel`]: byte channels to a guest console (TCP serial server, helper process)
//! - [`matcher`]: incremental pattern matching over console output
//! - [`session`]: single-owner send/expect session with guaranteed close
//! - [`exec`]: marker-delimited guest shell commands built on send/expect

pub mod ansi;
pub mod channel;
pub mod exec;
pub mod matcher;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::{ChannelRead, ChildChannel, ConsoleChannel, TcpChannel};
pub use exec::CommandResult;
pub use matcher::{ExpectSpec, MatchResult, Matcher, Pattern};
pub use session::ConsoleSession;
