//! Request/reply transport to the compiler process.
//!
//! The compiler answers exactly one reply per request; there is no
//! pipelining and no out-of-band traffic. This module provides
//! [`Channel`], which enforces that discipline over either a TCP or a
//! Unix-domain socket, and the Content-Length framing both variants share.
//!
//! # Wire Format
//!
//! Messages use HTTP-style Content-Length framing (same as LSP):
//!
//! ```text
//! Content-Length: 14\r\n
//! \r\n
//! getVersion()
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use omc_client::transport::{Channel, Endpoint};
//!
//! let mut channel = Channel::open(&Endpoint::Tcp("127.0.0.1:39581".into())).await?;
//! let reply = channel.request("getVersion()").await?;
//! channel.close();
//! ```

mod channel;
mod framing;

pub use channel::{Channel, TransportError, DEFAULT_REQUEST_TIMEOUT};
pub use framing::{read_message, write_message};

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which socket family the compiler is asked to serve on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// TCP on the loopback interface.
    #[default]
    Tcp,
    /// Unix domain socket.
    Unix,
}

impl TransportKind {
    /// The value handed to the compiler's `--interactive=` flag.
    pub fn interactive_flag(&self) -> &'static str {
        match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Unix => "unix",
        }
    }
}

/// Address the compiler process is listening on.
///
/// Discovered once per launch from the port file and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endpoint {
    /// `host:port`.
    Tcp(String),
    Unix(PathBuf),
}

impl Endpoint {
    /// Parse the single-line endpoint string the compiler writes into its
    /// port file: `tcp://host:port`, `unix:///path`, or a bare `host:port`
    /// (treated as TCP). Returns `None` for an empty line.
    pub fn parse(text: &str) -> Option<Endpoint> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        if let Some(addr) = text.strip_prefix("tcp://") {
            return Some(Endpoint::Tcp(addr.to_string()));
        }
        if let Some(path) = text.strip_prefix("unix://") {
            return Some(Endpoint::Unix(PathBuf::from(path)));
        }
        Some(Endpoint::Tcp(text.to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse() {
        assert_eq!(
            Endpoint::parse("tcp://127.0.0.1:39581\n"),
            Some(Endpoint::Tcp("127.0.0.1:39581".into()))
        );
        assert_eq!(
            Endpoint::parse("unix:///run/omc.sock"),
            Some(Endpoint::Unix(PathBuf::from("/run/omc.sock")))
        );
        // Bare host:port is TCP.
        assert_eq!(
            Endpoint::parse("127.0.0.1:7777"),
            Some(Endpoint::Tcp("127.0.0.1:7777".into()))
        );
        assert_eq!(Endpoint::parse("   \n"), None);
    }

    #[test]
    fn test_endpoint_display_round_trips() {
        let tcp = Endpoint::Tcp("127.0.0.1:1234".into());
        assert_eq!(Endpoint::parse(&tcp.to_string()), Some(tcp));
        let unix = Endpoint::Unix(PathBuf::from("/tmp/omc.sock"));
        assert_eq!(Endpoint::parse(&unix.to_string()), Some(unix));
    }
}
