//! Integration tests for the session/transport stack.
//!
//! These tests drive the full client against a mock compiler: an
//! in-process tokio server that speaks the framed request/reply protocol
//! and answers a small fixed vocabulary of expressions, plus a fake `omc`
//! shell script for the launch/discovery paths.
//!
//! No real compiler installation is required.
//!
//! # Running
//!
//! ```bash
//! cargo test --test session_integration -- --nocapture
//! ```

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use omc_client::process::{LaunchError, LaunchOptions, OmcProcess};
use omc_client::session::{OmcSession, SessionConfig, SessionError, SessionState};
use omc_client::transport::{read_message, write_message, Endpoint};
use omc_client::Value;

/// Opt-in log output for debugging: `RUST_LOG=debug cargo test ...`.
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Answer one connection's worth of expressions, with a per-connection
/// error buffer that `getErrorString()` drains.
async fn serve_expressions<R, W>(mut reader: BufReader<R>, mut writer: W)
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut error_buffer = String::new();
    while let Ok(request) = read_message(&mut reader).await {
        let reply = match request.as_str() {
            "getVersion()" => "\"MockOmc 1.24.0\"".to_string(),
            "1+1" => "2".to_string(),
            "getClassNames()" => "{Modelica.Blocks, Modelica.Electrical}".to_string(),
            "loadModel(Modelica)" => "true".to_string(),
            "badReply()" => "%%%".to_string(),
            "getErrorString()" => format!("\"{}\"", std::mem::take(&mut error_buffer)),
            "quit()" => {
                let _ = write_message(&mut writer, "").await;
                break;
            }
            other if other.starts_with("loadFile(") => "true".to_string(),
            other => {
                error_buffer = format!(
                    "[<interactive>:1:1] Error: Class {} not found in scope <global scope>.",
                    other.trim_end_matches("()")
                );
                String::new()
            }
        };
        if write_message(&mut writer, &reply).await.is_err() {
            break;
        }
    }
}

/// Mock compiler on a loopback TCP port. Accepts any number of
/// connections (the attach probe plus the real channel).
async fn spawn_mock_compiler() -> Endpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (read_half, write_half) = stream.into_split();
                serve_expressions(BufReader::new(read_half), write_half).await;
            });
        }
    });
    Endpoint::Tcp(addr.to_string())
}

/// Mock compiler on a Unix-domain socket.
async fn spawn_mock_compiler_unix(socket_path: PathBuf) -> Endpoint {
    let listener = UnixListener::bind(&socket_path).unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (read_half, write_half) = stream.into_split();
                serve_expressions(BufReader::new(read_half), write_half).await;
            });
        }
    });
    Endpoint::Unix(socket_path)
}

fn attach_config(endpoint: Endpoint) -> SessionConfig {
    SessionConfig {
        reuse_existing: true,
        endpoint: Some(endpoint),
        request_timeout: Duration::from_secs(5),
        ..SessionConfig::default()
    }
}

/// Write an executable shell script standing in for the compiler binary.
fn write_fake_omc(dir: &tempfile::TempDir, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.path().join("omc");
    std::fs::write(&path, body).expect("write fake omc");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod fake omc");
    path
}

/// A fake compiler that honours the discovery contract: it derives the
/// port file path from `-z=<id>` exactly as the client does and publishes
/// the given endpoint there, then stays alive until killed.
fn discovery_script(endpoint: &Endpoint) -> String {
    format!(
        "#!/bin/sh\n\
         for arg in \"$@\"; do\n\
           case \"$arg\" in\n\
             -z=*) suffix=\"${{arg#-z=}}\" ;;\n\
           esac\n\
         done\n\
         echo \"{endpoint}\" > \"${{TMPDIR:-/tmp}}/openmodelica.${{USER:-nobody}}.port.${{suffix}}\"\n\
         exec sleep 600\n"
    )
}

#[tokio::test]
async fn test_end_to_end_send_command() {
    init_tracing();
    let endpoint = spawn_mock_compiler().await;
    let mut session = OmcSession::open(attach_config(endpoint))
        .await
        .expect("open should succeed against the mock");
    assert_eq!(session.state(), SessionState::Ready);

    // Clean call: a value and empty diagnostics.
    let result = session.send_command("1+1").await.expect("1+1 should work");
    assert_eq!(result.value, Value::Integer(2));
    assert!(result.diagnostics.is_empty());
    assert!(session.last_diagnostics().is_empty());

    // Failed lookup: degraded value plus non-empty diagnostics, no error.
    let result = session
        .send_command("nonexistentFn()")
        .await
        .expect("logical errors must not raise");
    assert_eq!(result.value, Value::Empty);
    assert!(
        result.diagnostics.contains("nonexistentFn"),
        "diagnostics should name the failing class: {}",
        result.diagnostics
    );
    assert_eq!(session.last_diagnostics(), result.diagnostics);

    // The next clean call clears the buffer again.
    let result = session.send_command("1+1").await.unwrap();
    assert!(result.diagnostics.is_empty());
    assert!(session.last_diagnostics().is_empty());

    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);

    // Post-close commands fail with NotConnected; close stays idempotent.
    let err = session.send_command("1+1").await.unwrap_err();
    assert!(matches!(err, SessionError::NotConnected));
    session.close().await;
}

#[tokio::test]
async fn test_unix_socket_variant() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = spawn_mock_compiler_unix(dir.path().join("omc.sock")).await;

    let mut session = OmcSession::open(attach_config(endpoint)).await.unwrap();
    let result = session.send_command("1+1").await.unwrap();
    assert_eq!(result.value, Value::Integer(2));
    session.close().await;
}

#[tokio::test]
async fn test_convenience_wrappers() {
    let endpoint = spawn_mock_compiler().await;
    let mut session = OmcSession::open(attach_config(endpoint)).await.unwrap();

    assert_eq!(session.get_version().await.unwrap(), "MockOmc 1.24.0");
    assert!(session.load_model("Modelica").await.unwrap());
    assert!(session.load_file("/models/My Pump.mo").await.unwrap());
    assert_eq!(
        session.get_class_names().await.unwrap(),
        vec!["Modelica.Blocks".to_string(), "Modelica.Electrical".to_string()]
    );
    assert_eq!(session.get_error_string().await.unwrap(), "");

    session.close().await;
}

#[tokio::test]
async fn test_strict_diagnostics_raises() {
    let endpoint = spawn_mock_compiler().await;
    let config = SessionConfig {
        strict_diagnostics: true,
        ..attach_config(endpoint)
    };
    let mut session = OmcSession::open(config).await.unwrap();

    let err = session.send_command("nonexistentFn()").await.unwrap_err();
    match err {
        SessionError::CompilerDiagnostics(text) => {
            assert!(text.contains("nonexistentFn"));
        }
        other => panic!("expected CompilerDiagnostics, got {other:?}"),
    }

    session.close().await;
}

#[tokio::test]
async fn test_unparseable_reply_is_fatal_to_the_call() {
    let endpoint = spawn_mock_compiler().await;
    let mut session = OmcSession::open(attach_config(endpoint)).await.unwrap();

    let err = session.send_command("badReply()").await.unwrap_err();
    assert!(matches!(err, SessionError::Parse(_)), "got {err:?}");

    session.close().await;
}

#[tokio::test]
async fn test_quit_folds_into_close() {
    let endpoint = spawn_mock_compiler().await;
    let mut session = OmcSession::open(attach_config(endpoint)).await.unwrap();

    let result = session.send_command("quit()").await.unwrap();
    assert_eq!(result.value, Value::Empty);
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_independent_sessions_coexist() {
    // Two sessions, two compiler instances, no shared state.
    let endpoint_a = spawn_mock_compiler().await;
    let endpoint_b = spawn_mock_compiler().await;

    let mut session_a = OmcSession::open(attach_config(endpoint_a)).await.unwrap();
    let mut session_b = OmcSession::open(attach_config(endpoint_b)).await.unwrap();

    let _ = session_a.send_command("nonexistentFn()").await.unwrap();
    let clean = session_b.send_command("1+1").await.unwrap();

    // The error buffer of one session never leaks into the other.
    assert!(!session_a.last_diagnostics().is_empty());
    assert!(clean.diagnostics.is_empty());
    assert!(session_b.last_diagnostics().is_empty());

    session_a.close().await;
    session_b.close().await;
}

#[tokio::test]
async fn test_launch_discovers_endpoint() {
    init_tracing();
    let endpoint = spawn_mock_compiler().await;
    let dir = tempfile::tempdir().unwrap();
    let script = write_fake_omc(&dir, &discovery_script(&endpoint));

    let config = SessionConfig {
        executable: Some(script),
        launch_timeout: Duration::from_secs(5),
        request_timeout: Duration::from_secs(5),
        ..SessionConfig::default()
    };
    let mut session = OmcSession::open(config).await.expect("launch should succeed");
    assert_eq!(session.state(), SessionState::Ready);

    let result = session.send_command("1+1").await.unwrap();
    assert_eq!(result.value, Value::Integer(2));

    // close() also terminates the fake compiler process it launched.
    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_launch_timeout_leaves_no_orphan() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("omc.pid");
    // Never writes a port file; records its pid so we can check it died.
    let body = format!(
        "#!/bin/sh\necho $$ > \"{}\"\nexec sleep 600\n",
        pid_file.display()
    );
    let script = write_fake_omc(&dir, &body);

    let options = LaunchOptions {
        executable: Some(script),
        launch_timeout: Duration::from_millis(500),
        ..LaunchOptions::default()
    };
    let err = OmcProcess::launch(&options).await.unwrap_err();
    assert!(matches!(err, LaunchError::LaunchTimeout { .. }), "got {err:?}");

    // The child was killed and reaped before the error came back.
    let pid: u32 = std::fs::read_to_string(&pid_file)
        .expect("script should have started")
        .trim()
        .parse()
        .expect("pid file should hold a pid");
    assert!(
        !std::path::Path::new(&format!("/proc/{pid}")).exists(),
        "launch timeout must not leave the process running"
    );
}

#[tokio::test]
async fn test_launch_failure_reports_log_tail() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_fake_omc(&dir, "#!/bin/sh\necho 'license check failed' >&2\nexit 3\n");

    let options = LaunchOptions {
        executable: Some(script),
        launch_timeout: Duration::from_secs(5),
        ..LaunchOptions::default()
    };
    let err = OmcProcess::launch(&options).await.unwrap_err();
    match err {
        LaunchError::LaunchFailure { log_tail, .. } => {
            assert!(
                log_tail.contains("license check failed"),
                "log tail should carry the child's stderr: {log_tail}"
            );
        }
        other => panic!("expected LaunchFailure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_executable_not_found() {
    let options = LaunchOptions {
        executable: Some(PathBuf::from("/no/such/place/omc")),
        ..LaunchOptions::default()
    };
    let err = OmcProcess::launch(&options).await.unwrap_err();
    assert!(matches!(err, LaunchError::ExecutableNotFound));
}

#[tokio::test]
async fn test_attach_refuses_dead_endpoint() {
    let config = attach_config(Endpoint::Tcp("127.0.0.1:1".into()));
    let err = OmcSession::open(config).await.unwrap_err();
    assert!(
        matches!(
            err,
            SessionError::Launch(LaunchError::EndpointUnreachable { .. })
        ),
        "got {err:?}"
    );
}

#[tokio::test]
async fn test_mock_server_round_trips_framing() {
    // Sanity-check the harness itself with a raw connection.
    let Endpoint::Tcp(addr) = spawn_mock_compiler().await else {
        unreachable!()
    };
    let stream = TcpStream::connect(&addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_message(&mut write_half, "getVersion()").await.unwrap();
    let reply = read_message(&mut reader).await.unwrap();
    assert_eq!(reply, "\"MockOmc 1.24.0\"");
}

#[tokio::test]
async fn test_unix_socket_pair_framing() {
    // The framing helpers are transport-agnostic; exercise them over a
    // socketpair as well as over real listeners.
    let (client, server) = UnixStream::pair().unwrap();
    let (server_read, server_write) = server.into_split();
    tokio::spawn(serve_expressions(BufReader::new(server_read), server_write));

    let (client_read, mut client_write) = client.into_split();
    let mut reader = BufReader::new(client_read);
    write_message(&mut client_write, "1+1").await.unwrap();
    assert_eq!(read_message(&mut reader).await.unwrap(), "2");
}
