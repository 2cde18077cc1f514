//! The caller-facing session: process + transport + parser, tied together.
//!
//! An [`OmcSession`] owns at most one transport channel and, when it
//! launched the compiler itself, the process handle (and the duty to
//! terminate it). There is no process-wide singleton and no hidden global
//! state: independent sessions coexist in one program, each driving its
//! own compiler instance.
//!
//! After every primary command the session transparently issues
//! `getErrorString()` and buffers whatever diagnostic text the compiler
//! accumulated. Compiler-side *logical* errors ("model not found", ...)
//! arrive that way, alongside a possibly-degraded value, and they do not
//! raise unless [`SessionConfig::strict_diagnostics`] is set, preserving
//! the tool's degrade-don't-fail convention.
//!
//! # Usage
//!
//! ```ignore
//! use omc_client::session::{OmcSession, SessionConfig};
//!
//! let mut session = OmcSession::open(SessionConfig::default()).await?;
//! let result = session.send_command("getVersion()").await?;
//! println!("{} ({})", result.value, result.diagnostics);
//! session.close().await;
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::parser::{self, ParseError, Value};
use crate::process::{LaunchError, LaunchOptions, OmcProcess};
use crate::transport::{Channel, Endpoint, TransportError, TransportKind, DEFAULT_REQUEST_TIMEOUT};

/// Connection lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Closed,
}

/// Configuration for [`OmcSession::open`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Override the compiler binary location. When unset, resolution falls
    /// back to `$OPENMODELICAHOME/bin/omc`, then to `omc` on `PATH`.
    pub executable: Option<PathBuf>,
    pub transport: TransportKind,
    /// Bound on process startup and endpoint discovery.
    pub launch_timeout: Duration,
    /// Bound on each request/reply exchange.
    pub request_timeout: Duration,
    /// Attach to an already-running compiler at [`Self::endpoint`] instead
    /// of launching one. An attached session never terminates the process.
    pub reuse_existing: bool,
    pub endpoint: Option<Endpoint>,
    /// Turn non-empty diagnostics into [`SessionError::CompilerDiagnostics`]
    /// instead of returning them alongside the value.
    pub strict_diagnostics: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            executable: None,
            transport: TransportKind::default(),
            launch_timeout: Duration::from_secs(10),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reuse_existing: false,
            endpoint: None,
            strict_diagnostics: false,
        }
    }
}

/// Errors surfaced by the session, tagged with the layer that failed.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session is not in the `Ready` state.
    #[error("session is not connected")]
    NotConnected,

    /// `reuse_existing` requires a configured endpoint.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Process launch / attach failed.
    #[error("launch failed: {0}")]
    Launch(#[from] LaunchError),

    /// The request/reply exchange failed.
    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),

    /// The reply text did not match the literal grammar.
    #[error("reply could not be parsed: {0}")]
    Parse(#[from] ParseError),

    /// Only with `strict_diagnostics`: the compiler logged error text.
    #[error("compiler reported: {0}")]
    CompilerDiagnostics(String),
}

/// A decoded reply paired with the diagnostic text the compiler logged
/// while producing it. `diagnostics` is empty for a clean call.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub value: Value,
    pub diagnostics: String,
}

/// A connection to one compiler instance.
///
/// Requests are strictly serialized: the `&mut self` receivers make a
/// second in-flight command impossible to express. The session takes no
/// lock of its own; sharing one across threads requires the caller to
/// wrap it in a mutex.
#[derive(Debug)]
pub struct OmcSession {
    state: SessionState,
    channel: Option<Channel>,
    process: Option<OmcProcess>,
    /// Diagnostics/tracing only; not part of the wire protocol.
    request_seq: u64,
    last_diagnostics: String,
    strict_diagnostics: bool,
}

impl OmcSession {
    /// Launch (or attach to) a compiler and connect to it.
    ///
    /// On failure any process spawned along the way is terminated before
    /// the error is returned, so a failed `open` leaves nothing running.
    pub async fn open(config: SessionConfig) -> Result<Self, SessionError> {
        let mut session = Self {
            state: SessionState::Disconnected,
            channel: None,
            process: None,
            request_seq: 0,
            last_diagnostics: String::new(),
            strict_diagnostics: config.strict_diagnostics,
        };
        session.state = SessionState::Connecting;

        let mut process = if config.reuse_existing {
            let Some(endpoint) = config.endpoint.clone() else {
                session.state = SessionState::Closed;
                return Err(SessionError::InvalidConfig(
                    "reuse_existing is set but no endpoint is configured".into(),
                ));
            };
            OmcProcess::attach(endpoint).await?
        } else {
            OmcProcess::launch(&LaunchOptions {
                executable: config.executable.clone(),
                transport: config.transport,
                launch_timeout: config.launch_timeout,
            })
            .await?
        };

        match Channel::open(process.endpoint()).await {
            Ok(mut channel) => {
                channel.set_timeout(config.request_timeout);
                info!(endpoint = %process.endpoint(), "session ready");
                session.channel = Some(channel);
                session.process = Some(process);
                session.state = SessionState::Ready;
                Ok(session)
            }
            Err(err) => {
                process.terminate().await;
                session.state = SessionState::Closed;
                Err(err.into())
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of commands sent so far (including error-channel reads).
    pub fn requests_sent(&self) -> u64 {
        self.request_seq
    }

    /// Diagnostic text buffered by the most recent command; cleared at the
    /// start of each request.
    pub fn last_diagnostics(&self) -> &str {
        &self.last_diagnostics
    }

    /// Send a command and decode its reply.
    ///
    /// The command string is passed through untouched; the compiler is
    /// the interpreter, not this client. After the reply, the error
    /// channel is read and its text returned in
    /// [`CommandResult::diagnostics`] (and kept in
    /// [`last_diagnostics`](Self::last_diagnostics)).
    pub async fn send_command(&mut self, command: &str) -> Result<CommandResult, SessionError> {
        let raw = self.send_command_raw(command).await?;
        let value = parser::parse(&raw)?;
        Ok(CommandResult {
            value,
            diagnostics: self.last_diagnostics.clone(),
        })
    }

    /// Like [`send_command`](Self::send_command) but returns the reply
    /// text verbatim, for replies that are not in the literal grammar.
    /// The error channel is still read and buffered.
    pub async fn send_command_raw(&mut self, command: &str) -> Result<String, SessionError> {
        if self.state != SessionState::Ready {
            return Err(SessionError::NotConnected);
        }
        let expr = command.trim();
        self.last_diagnostics.clear();

        // quit() gets no reply; fold it into an orderly close.
        if expr == "quit()" {
            self.close().await;
            return Ok(String::new());
        }

        self.request_seq += 1;
        debug!(seq = self.request_seq, expr, "send expression");
        let raw = self.request(expr).await?;

        // The error channel itself gets no follow-up read.
        if expr != "getErrorString()" {
            let diagnostics = self.fetch_diagnostics().await?;
            if !diagnostics.is_empty() {
                debug!(seq = self.request_seq, %diagnostics, "compiler diagnostics");
            }
            self.last_diagnostics = diagnostics;
            if self.strict_diagnostics && !self.last_diagnostics.is_empty() {
                return Err(SessionError::CompilerDiagnostics(
                    self.last_diagnostics.clone(),
                ));
            }
        }

        Ok(raw)
    }

    async fn request(&mut self, expr: &str) -> Result<String, SessionError> {
        let Some(channel) = self.channel.as_mut() else {
            return Err(SessionError::NotConnected);
        };
        Ok(channel.request(expr).await?)
    }

    /// Read the accumulated error text since it was last read.
    async fn fetch_diagnostics(&mut self) -> Result<String, SessionError> {
        self.request_seq += 1;
        let raw = self.request("getErrorString()").await?;
        // The reply is a quoted string; fall back to the raw text when the
        // compiler hands back something unquoted.
        let text = match parser::parse(&raw) {
            Ok(Value::Str(text)) => text,
            Ok(Value::Empty) => String::new(),
            Ok(other) => other.to_string(),
            Err(_) => raw,
        };
        Ok(text.trim().to_string())
    }

    /// Close the session: ask the compiler to quit, release the socket,
    /// terminate the process if this session owns it. Idempotent.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Some(mut channel) = self.channel.take() {
            if channel.is_open() {
                // Best effort; the compiler may exit without replying.
                channel.set_timeout(Duration::from_millis(500));
                if let Err(err) = channel.request("quit()").await {
                    debug!("quit() handshake did not complete: {err}");
                }
                channel.close();
            }
        }
        if let Some(mut process) = self.process.take() {
            process.terminate().await;
        }
        self.state = SessionState::Closed;
        info!("session closed");
    }

    // ------------------------------------------------------------------
    // Convenience wrappers. Arguments are formatted through the literal
    // grammar so quoting/escaping always matches what the compiler parses.
    // ------------------------------------------------------------------

    pub async fn get_version(&mut self) -> Result<String, SessionError> {
        let result = self.send_command("getVersion()").await?;
        Ok(match result.value {
            Value::Str(version) => version,
            other => other.to_string(),
        })
    }

    pub async fn load_file(&mut self, path: &str) -> Result<bool, SessionError> {
        let expr = format!("loadFile({})", Value::Str(path.to_string()));
        let result = self.send_command(&expr).await?;
        Ok(result.value.as_bool().unwrap_or(false))
    }

    pub async fn load_model(&mut self, class_name: &str) -> Result<bool, SessionError> {
        let expr = format!("loadModel({class_name})");
        let result = self.send_command(&expr).await?;
        Ok(result.value.as_bool().unwrap_or(false))
    }

    pub async fn get_class_names(&mut self) -> Result<Vec<String>, SessionError> {
        let result = self.send_command("getClassNames()").await?;
        let names = result
            .value
            .elements()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(names)
    }

    /// Read the error channel directly, without a primary command.
    pub async fn get_error_string(&mut self) -> Result<String, SessionError> {
        if self.state != SessionState::Ready {
            return Err(SessionError::NotConnected);
        }
        self.fetch_diagnostics().await
    }
}
