//! omc-client
//!
//! Client library for driving an OpenModelica-style compiler process over
//! its interactive request/reply socket API:
//!
//! - `parser` - literal reply grammar to and from structured [`Value`]s
//! - `transport` - one-request/one-reply channel over TCP or Unix sockets
//! - `process` - compiler launch, endpoint discovery and teardown
//! - `session` - the public facade tying the three together
//!
//! # Session Module
//!
//! [`OmcSession`] is the recommended entry point:
//!
//! ```ignore
//! use omc_client::{OmcSession, SessionConfig};
//!
//! let mut session = OmcSession::open(SessionConfig::default()).await?;
//! let result = session.send_command("getVersion()").await?;
//! println!("version: {}", result.value);
//! session.close().await;
//! ```

pub mod parser;
pub mod process;
pub mod session;
pub mod transport;

pub use parser::{parse, ParseError, Value};
pub use session::{CommandResult, OmcSession, SessionConfig, SessionError, SessionState};
pub use transport::{Endpoint, TransportKind};
