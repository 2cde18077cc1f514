//! Lifecycle of the compiler process: launch, endpoint discovery, teardown.
//!
//! The compiler is started with `--interactive=<transport>` and a fresh
//! session identifier (`-z=<id>`). It announces readiness out of band by
//! writing the endpoint it listens on into a uniquely-named port file;
//! launch completes once that file is readable and non-empty. The child's
//! stdout/stderr are captured into a per-session log file, which is quoted
//! in launch errors and removed again at termination.
//!
//! # Process Cleanup Safety
//!
//! [`OmcProcess`] owns the child it spawned and guarantees cleanup via
//! RAII: if the caller never reaches `terminate()`, `Drop` kills the
//! process, so a failed `open` leaves nothing orphaned behind.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::transport::{Channel, Endpoint, TransportError, TransportKind};

/// Interval between polls of the port file during startup.
const DISCOVERY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long `terminate` waits for a voluntary exit before killing.
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// Options controlling how the compiler process is launched.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Explicit binary location. When unset, resolution falls back to
    /// `$OPENMODELICAHOME/bin/omc`, then to a `PATH` search for `omc`.
    pub executable: Option<PathBuf>,
    pub transport: TransportKind,
    /// Bound on waiting for the port file to appear.
    pub launch_timeout: Duration,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            executable: None,
            transport: TransportKind::default(),
            launch_timeout: Duration::from_secs(10),
        }
    }
}

/// Process- and discovery-level failures.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// No usable compiler binary could be located.
    #[error(
        "compiler executable not found; set an explicit path, set OPENMODELICAHOME, \
         or install omc on PATH"
    )]
    ExecutableNotFound,

    /// The process started but never published its endpoint.
    #[error("compiler did not publish an endpoint within {timeout:?}; log tail:\n{log_tail}")]
    LaunchTimeout { timeout: Duration, log_tail: String },

    /// The process exited before publishing its endpoint.
    #[error("compiler exited during startup ({status}); log tail:\n{log_tail}")]
    LaunchFailure { status: ExitStatus, log_tail: String },

    /// `attach` found nothing answering at the given endpoint.
    #[error("endpoint {endpoint} is unreachable")]
    EndpointUnreachable {
        endpoint: Endpoint,
        #[source]
        source: TransportError,
    },

    /// The spawn itself failed for a reason other than a missing binary.
    #[error("failed to spawn compiler process: {0}")]
    Spawn(#[source] std::io::Error),
}

/// A running compiler instance and the artifacts created for it.
///
/// Obtained from [`launch`](OmcProcess::launch) (owns the child and is
/// responsible for terminating it) or [`attach`](OmcProcess::attach)
/// (no owned child; terminate only forgets the endpoint).
#[derive(Debug)]
pub struct OmcProcess {
    child: Option<Child>,
    endpoint: Endpoint,
    session_id: Option<String>,
    port_file: Option<PathBuf>,
    log_file: Option<PathBuf>,
}

impl OmcProcess {
    /// Spawn the compiler and wait for it to publish its endpoint.
    ///
    /// Each launch mints a fresh unpredictable session identifier, so
    /// concurrent sessions on one machine cannot race for the same port
    /// file.
    ///
    /// # Errors
    ///
    /// - [`LaunchError::ExecutableNotFound`] if no binary can be located
    /// - [`LaunchError::LaunchFailure`] if the process exits early
    /// - [`LaunchError::LaunchTimeout`] if the port file never appears;
    ///   the child is killed before returning
    pub async fn launch(options: &LaunchOptions) -> Result<Self, LaunchError> {
        let executable = resolve_executable(options.executable.as_deref())?;
        let session_id = Uuid::new_v4().simple().to_string();
        let user = current_user();
        // The port file location is the compiler's contract; the log file
        // is ours and goes into the per-user work directory.
        let port_file =
            std::env::temp_dir().join(format!("openmodelica.{user}.port.{session_id}"));
        let work_dir = session_work_dir();
        fs::create_dir_all(&work_dir).map_err(LaunchError::Spawn)?;
        let log_file = work_dir.join(format!("openmodelica.{session_id}.log"));

        let log_handle = fs::File::create(&log_file).map_err(LaunchError::Spawn)?;
        let err_handle = log_handle.try_clone().map_err(LaunchError::Spawn)?;

        let mut child = Command::new(&executable)
            .arg("--locale=C")
            .arg(format!(
                "--interactive={}",
                options.transport.interactive_flag()
            ))
            .arg(format!("-z={session_id}"))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_handle))
            .stderr(Stdio::from(err_handle))
            .spawn()
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => LaunchError::ExecutableNotFound,
                _ => LaunchError::Spawn(err),
            })?;

        debug!(
            executable = %executable.display(),
            %session_id,
            "compiler process spawned"
        );

        let deadline = Instant::now() + options.launch_timeout;
        let endpoint = loop {
            // An already-published endpoint wins over an exit seen in the
            // same poll interval.
            if let Ok(contents) = fs::read_to_string(&port_file) {
                if let Some(endpoint) = Endpoint::parse(&contents) {
                    break endpoint;
                }
            }

            if let Ok(Some(status)) = child.try_wait() {
                let log_tail = read_log_tail(&log_file);
                cleanup_artifacts(Some(&port_file), Some(&log_file));
                return Err(LaunchError::LaunchFailure { status, log_tail });
            }

            if Instant::now() >= deadline {
                warn!(
                    pid = child.id(),
                    "compiler never published an endpoint; killing it"
                );
                let _ = child.kill();
                let _ = child.wait();
                let log_tail = read_log_tail(&log_file);
                cleanup_artifacts(Some(&port_file), Some(&log_file));
                return Err(LaunchError::LaunchTimeout {
                    timeout: options.launch_timeout,
                    log_tail,
                });
            }

            sleep(DISCOVERY_POLL_INTERVAL).await;
        };

        info!(%endpoint, pid = child.id(), "compiler is up and running");

        Ok(Self {
            child: Some(child),
            endpoint,
            session_id: Some(session_id),
            port_file: Some(port_file),
            log_file: Some(log_file),
        })
    }

    /// Use an already-running compiler instead of spawning one.
    ///
    /// Probes the endpoint with a throwaway connection so that a dead
    /// address is reported here rather than on the first command.
    ///
    /// # Errors
    ///
    /// [`LaunchError::EndpointUnreachable`] if nothing answers.
    pub async fn attach(endpoint: Endpoint) -> Result<Self, LaunchError> {
        match Channel::open(&endpoint).await {
            Ok(mut probe) => probe.close(),
            Err(source) => {
                return Err(LaunchError::EndpointUnreachable { endpoint, source });
            }
        }
        info!(%endpoint, "attached to running compiler");
        Ok(Self {
            child: None,
            endpoint,
            session_id: None,
            port_file: None,
            log_file: None,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Whether this handle owns the process (launched, not attached).
    pub fn owns_process(&self) -> bool {
        self.child.is_some()
    }

    /// Identifier minted for this launch; `None` for attached processes.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Shut the process down and remove the artifacts this launch created.
    ///
    /// The session sends `quit()` before calling this, so the process is
    /// given a grace period to exit voluntarily before being killed.
    /// Terminating an already-terminated (or attached) handle is a no-op.
    pub async fn terminate(&mut self) {
        if let Some(mut child) = self.child.take() {
            let mut exited = false;
            let waits = TERMINATE_GRACE.as_millis() / 50;
            for _ in 0..waits {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        debug!(%status, "compiler exited cleanly");
                        exited = true;
                        break;
                    }
                    Ok(None) => sleep(Duration::from_millis(50)).await,
                    Err(err) => {
                        warn!("error waiting for compiler exit: {err}");
                        break;
                    }
                }
            }
            if !exited {
                warn!(pid = child.id(), "compiler did not exit after quit(); killing");
                let _ = child.kill();
                let _ = child.wait();
            }
        }
        cleanup_artifacts(self.port_file.take().as_deref(), self.log_file.take().as_deref());
    }
}

impl Drop for OmcProcess {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            warn!(
                pid = child.id(),
                "compiler process dropped without terminate(); killing"
            );
            let _ = child.kill();
            let _ = child.wait();
        }
        cleanup_artifacts(self.port_file.take().as_deref(), self.log_file.take().as_deref());
    }
}

fn cleanup_artifacts(port_file: Option<&Path>, log_file: Option<&Path>) {
    if let Some(path) = port_file {
        let _ = fs::remove_file(path);
    }
    if let Some(path) = log_file {
        let _ = fs::remove_file(path);
    }
}

fn resolve_executable(executable: Option<&Path>) -> Result<PathBuf, LaunchError> {
    if let Some(path) = executable {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(LaunchError::ExecutableNotFound);
    }

    if let Ok(omhome) = std::env::var("OPENMODELICAHOME") {
        let candidate = Path::new(&omhome).join("bin").join("omc");
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    search_path("omc").ok_or(LaunchError::ExecutableNotFound)
}

fn search_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

fn current_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| "nobody".to_string())
}

/// Resolve the directory for artifacts this client creates itself.
///
/// Resolution order:
/// 1. `$XDG_RUNTIME_DIR` (Linux standard, per-user)
/// 2. the user cache directory (macOS and others)
/// 3. the system temp directory (fallback)
fn session_work_dir() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir);
    }
    if let Some(cache_dir) = dirs::cache_dir() {
        return cache_dir.join("omc-client");
    }
    std::env::temp_dir()
}

fn read_log_tail(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let mut lines: Vec<&str> = contents.lines().rev().take(20).collect();
            lines.reverse();
            lines.join("\n")
        }
        Err(_) => "log not available".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_explicit_executable() {
        let err = resolve_executable(Some(Path::new("/no/such/omc"))).unwrap_err();
        assert!(matches!(err, LaunchError::ExecutableNotFound));
    }

    #[tokio::test]
    async fn test_attach_unreachable_endpoint() {
        let endpoint = Endpoint::Tcp("127.0.0.1:1".into());
        let err = OmcProcess::attach(endpoint.clone()).await.unwrap_err();
        match err {
            LaunchError::EndpointUnreachable { endpoint: e, .. } => assert_eq!(e, endpoint),
            other => panic!("expected EndpointUnreachable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn sleep");

        let mut process = OmcProcess {
            child: Some(child),
            endpoint: Endpoint::Tcp("127.0.0.1:0".into()),
            session_id: Some("test".into()),
            port_file: None,
            log_file: None,
        };

        process.terminate().await;
        assert!(!process.owns_process());
        // Second terminate must be a no-op, not an error.
        process.terminate().await;
    }
}
