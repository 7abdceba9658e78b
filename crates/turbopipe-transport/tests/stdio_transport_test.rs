//! Integration tests for the stdio transport against real child processes

#![cfg(unix)]

use async_trait::async_trait;
use bytes::Bytes;
use rstest::rstest;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use turbopipe_transport::stdio::{
    Credential, ExitInfo, LaunchRequest, ProcessCommand, ProcessConstructor, SandboxAttributes,
    StdioConfig, StdioTransport, TransportState, resolve_executable,
};
use turbopipe_transport::{ConstructionError, FrameError, Framing, MessageTransport, TransportError};

fn sh(script: &str) -> StdioConfig {
    StdioConfig::new("sh").with_args(["-c", script])
}

/// Receive text frames until the child's output ends
async fn drain(transport: &StdioTransport) -> (Vec<String>, ExitInfo) {
    let mut lines = Vec::new();
    loop {
        match transport.receive().await {
            Ok(frame) => lines.push(String::from_utf8(frame.to_vec()).unwrap()),
            Err(TransportError::ProcessExited(exit)) => return (lines, exit),
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
}

#[tokio::test]
async fn test_default_constructor_passes_exactly_args_and_env() {
    // `env NAME=VALUE` prints the environment it was given plus its argument.
    let transport = StdioTransport::new(
        StdioConfig::new("env")
            .with_arg("foo=bar")
            .with_env("GREETING", "hello"),
    );
    transport.open().await.unwrap();

    let (mut lines, exit) = drain(&transport).await;
    lines.sort();
    assert_eq!(lines, vec!["GREETING=hello", "foo=bar"]);
    assert!(exit.success());
}

#[tokio::test]
async fn test_arguments_are_passed_verbatim() {
    let transport = StdioTransport::new(sh(r#"for a in "$@"; do echo "arg:$a"; done"#).with_args([
        "sh",
        "foo=bar",
        "two words",
        "",
    ]));
    transport.open().await.unwrap();

    let (lines, exit) = drain(&transport).await;
    assert_eq!(lines, vec!["arg:foo=bar", "arg:two words", "arg:"]);
    assert!(exit.success());
}

#[tokio::test]
async fn test_hook_builds_command_exactly_as_configured() {
    let called = Arc::new(AtomicBool::new(false));
    let tmp = tempfile::tempdir().unwrap();
    let chroot = tmp.path().join("sandbox-root");
    std::fs::create_dir_all(&chroot).unwrap();

    let config = {
        let called = Arc::clone(&called);
        let dir = tmp.path().to_path_buf();
        let chroot = chroot.clone();
        StdioConfig::new("echo")
            .with_arg("foo=bar")
            .with_env_entries(["hello"])
            .with_command_fn(move |_cancel, request| {
                called.store(true, Ordering::SeqCst);
                Ok(ProcessCommand::new(resolve_executable(&request.command)?)
                    .with_arg("bonjour")
                    .with_env_entries(["PATH=/usr/bin", "NODE_ENV=production"])
                    .with_current_dir(&dir)
                    .with_sandbox(
                        SandboxAttributes::new()
                            .with_credential(Credential::new(1001, 1001))
                            .with_chroot(&chroot),
                    ))
            })
    };

    let constructor = config.constructor.clone().expect("hook is set");
    let request = LaunchRequest {
        command: "echo".to_string(),
        args: Vec::new(),
        env: vec!["hello".to_string()],
    };
    let cmd = constructor
        .construct(&CancellationToken::new(), request)
        .await
        .unwrap();

    assert!(called.load(Ordering::SeqCst));
    assert_eq!(cmd.program().file_name().unwrap(), "echo");
    assert_eq!(cmd.args(), ["bonjour"]);
    assert_eq!(cmd.env().len(), 2);
    assert!(cmd.env().contains(&"PATH=/usr/bin".to_string()));
    assert!(cmd.env().contains(&"NODE_ENV=production".to_string()));
    assert_eq!(cmd.current_dir(), Some(tmp.path()));
    assert_eq!(cmd.sandbox().chroot.as_deref(), Some(chroot.as_path()));
    let credential = cmd.sandbox().credential.as_ref().unwrap();
    assert_eq!((credential.uid, credential.gid), (1001, 1001));
}

#[tokio::test]
async fn test_child_runs_as_hook_constructed_it() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().canonicalize().unwrap();

    let config = StdioConfig::new("ignored-by-hook")
        .with_arg("ignored")
        .with_env("GREETING", "ignored")
        .with_command_fn({
            let dir = dir.clone();
            move |_cancel, _request| {
                Ok(ProcessCommand::new(resolve_executable("sh")?)
                    .with_args(["-c", r#"echo "$1|$GREETING|$(pwd)""#, "sh", "bonjour"])
                    .with_env("GREETING", "production")
                    .with_current_dir(&dir))
            }
        });
    let transport = StdioTransport::new(config);
    transport.open().await.unwrap();

    let (lines, exit) = drain(&transport).await;
    assert_eq!(lines, vec![format!("bonjour|production|{}", dir.display())]);
    assert!(exit.success());
}

#[tokio::test]
async fn test_hook_error_fails_start_without_spawning() {
    let transport = StdioTransport::new(
        StdioConfig::new("cat")
            .with_command_fn(|_, _| Err(ConstructionError::hook("sandbox user missing"))),
    );

    let err = transport.open().await.unwrap_err();
    assert!(matches!(
        err,
        TransportError::Construction(ConstructionError::Hook(_))
    ));
    assert!(err.to_string().starts_with("process construction failed"));
    assert_eq!(transport.state(), TransportState::Failed);
    assert!(transport.pid().is_none());

    assert!(matches!(
        transport.send("x").await,
        Err(TransportError::Closed)
    ));
    assert!(matches!(transport.open().await, Err(TransportError::Closed)));
    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_missing_executable_is_a_construction_error() {
    let transport = StdioTransport::new(StdioConfig::new("turbopipe-no-such-binary"));
    let err = transport.open().await.unwrap_err();
    assert!(matches!(
        err,
        TransportError::Construction(ConstructionError::ExecutableNotFound { .. })
    ));
    assert_eq!(transport.state(), TransportState::Failed);
}

#[tokio::test]
async fn test_stop_on_never_started_transport() {
    let transport = StdioTransport::new(StdioConfig::new("cat"));
    transport
        .stop(&CancellationToken::new(), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(transport.state(), TransportState::Uninitialized);
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let starts = Arc::new(AtomicUsize::new(0));
    let transport = StdioTransport::new(StdioConfig::new("cat").on_start({
        let starts = Arc::clone(&starts);
        move |_| {
            starts.fetch_add(1, Ordering::SeqCst);
        }
    }));

    transport.open().await.unwrap();
    let pid = transport.pid();
    assert!(pid.is_some());

    assert!(matches!(
        transport.open().await,
        Err(TransportError::AlreadyStarted)
    ));
    assert_eq!(transport.pid(), pid);
    assert_eq!(starts.load(Ordering::SeqCst), 1);

    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_sends_arrive_whole_and_in_order() {
    const TASKS: usize = 16;
    const PER_TASK: usize = 20;

    let transport = Arc::new(StdioTransport::new(StdioConfig::new("cat")));
    transport.open().await.unwrap();

    let receiver = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move {
            let mut frames = Vec::new();
            for _ in 0..TASKS * PER_TASK {
                let frame = transport.receive().await.unwrap();
                frames.push(String::from_utf8(frame.to_vec()).unwrap());
            }
            frames
        })
    };

    let mut senders = Vec::new();
    for task in 0..TASKS {
        let transport = Arc::clone(&transport);
        senders.push(tokio::spawn(async move {
            for i in 0..PER_TASK {
                let frame = format!("{task}:{i}:{}", "x".repeat(200));
                transport.send(frame).await.unwrap();
            }
        }));
    }
    for sender in senders {
        sender.await.unwrap();
    }

    let frames = receiver.await.unwrap();
    let mut next = [0usize; TASKS];
    for frame in &frames {
        let mut parts = frame.splitn(3, ':');
        let task: usize = parts.next().unwrap().parse().unwrap();
        let i: usize = parts.next().unwrap().parse().unwrap();
        assert_eq!(parts.next().unwrap(), "x".repeat(200));
        assert_eq!(i, next[task], "frames of task {task} out of order");
        next[task] += 1;
    }
    assert!(next.iter().all(|n| *n == PER_TASK));

    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_unexpected_exit_unblocks_receive() {
    let exits = Arc::new(Mutex::new(Vec::new()));
    let transport = StdioTransport::new(
        sh(r#"read line; echo "got:$line"; exit 3"#).on_exit({
            let exits = Arc::clone(&exits);
            move |exit| exits.lock().unwrap().push(exit)
        }),
    );

    transport.send("hello").await.unwrap();
    assert_eq!(transport.receive().await.unwrap(), Bytes::from_static(b"got:hello"));

    match transport.receive().await {
        Err(TransportError::ProcessExited(exit)) => assert_eq!(exit.code(), Some(3)),
        other => panic!("expected ProcessExited, got {other:?}"),
    }
    assert!(matches!(
        transport.receive().await,
        Err(TransportError::ProcessExited(_))
    ));

    let exit = transport.wait().await.unwrap();
    assert_eq!(exit, ExitInfo::from_code(3));
    assert_eq!(transport.state(), TransportState::Failed);
    assert_eq!(*exits.lock().unwrap(), vec![ExitInfo::from_code(3)]);
    assert_eq!(transport.exit_info(), Some(ExitInfo::from_code(3)));
}

#[tokio::test]
async fn test_stderr_reaches_observer_not_message_stream() {
    let stderr_lines = Arc::new(Mutex::new(Vec::new()));
    let transport = StdioTransport::new(
        sh("echo 'diag: warming up' >&2; echo out-line; echo 'diag: done' >&2").on_stderr({
            let stderr_lines = Arc::clone(&stderr_lines);
            move |line| stderr_lines.lock().unwrap().push(line.to_string())
        }),
    );
    transport.open().await.unwrap();

    let (lines, exit) = drain(&transport).await;
    assert_eq!(lines, vec!["out-line"]);
    assert!(exit.success());

    transport.wait().await.unwrap();
    assert_eq!(transport.state(), TransportState::Stopped);
    assert_eq!(
        *stderr_lines.lock().unwrap(),
        vec!["diag: warming up", "diag: done"]
    );
}

#[tokio::test]
async fn test_truncated_trailing_frame_is_reported() {
    let transport = StdioTransport::new(sh(r#"printf 'whole\npartial'"#));
    transport.open().await.unwrap();

    assert_eq!(transport.receive().await.unwrap(), Bytes::from_static(b"whole"));
    assert!(matches!(
        transport.receive().await,
        Err(TransportError::Framing(FrameError::Truncated { remaining: 7 }))
    ));
    assert!(matches!(
        transport.receive().await,
        Err(TransportError::ProcessExited(exit)) if exit.success()
    ));
}

#[tokio::test]
async fn test_close_lets_child_exit_on_eof() {
    let transitions = Arc::new(AtomicUsize::new(0));
    let transport = StdioTransport::new(StdioConfig::new("cat").on_state_change({
        let transitions = Arc::clone(&transitions);
        move |_| {
            transitions.fetch_add(1, Ordering::SeqCst);
        }
    }));
    transport.open().await.unwrap();
    transport.send("ping").await.unwrap();
    assert_eq!(transport.receive().await.unwrap(), Bytes::from_static(b"ping"));

    transport.close().await.unwrap();

    assert_eq!(transport.state(), TransportState::Stopped);
    assert_eq!(transport.exit_info(), Some(ExitInfo::from_code(0)));
    let states: Vec<_> = transport.history().iter().map(|t| t.to).collect();
    assert_eq!(
        states,
        vec![
            TransportState::Starting,
            TransportState::Running,
            TransportState::Stopping,
            TransportState::Stopped,
        ]
    );
    assert_eq!(transitions.load(Ordering::SeqCst), 4);

    assert!(matches!(transport.send("late").await, Err(TransportError::Closed)));
    assert!(matches!(transport.receive().await, Err(TransportError::Closed)));
    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_stop_lets_child_write_while_shutting_down() {
    let stderr_lines = Arc::new(Mutex::new(Vec::new()));
    let exits = Arc::new(Mutex::new(Vec::new()));
    let transport = StdioTransport::new(
        sh("read x; sleep 0.2; echo bye >&2; echo final; exit 3")
            .on_stderr({
                let stderr_lines = Arc::clone(&stderr_lines);
                move |line| stderr_lines.lock().unwrap().push(line.to_string())
            })
            .on_exit({
                let exits = Arc::clone(&exits);
                move |exit| exits.lock().unwrap().push(exit)
            }),
    );
    transport.open().await.unwrap();

    transport
        .stop(&CancellationToken::new(), Duration::from_secs(4))
        .await
        .unwrap();

    assert_eq!(*stderr_lines.lock().unwrap(), vec!["bye"]);
    assert_eq!(*exits.lock().unwrap(), vec![ExitInfo::from_code(3)]);
    assert_eq!(transport.state(), TransportState::Stopped);
}

#[tokio::test]
async fn test_broken_stdin_fails_transport_and_kills_child() {
    let errors = Arc::new(AtomicUsize::new(0));
    let transport = StdioTransport::new(sh("exec 0<&-; sleep 5").on_error({
        let errors = Arc::clone(&errors);
        move |_| {
            errors.fetch_add(1, Ordering::SeqCst);
        }
    }));
    transport.open().await.unwrap();

    let mut result = Ok(());
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        result = transport.send("anyone there?").await;
        if result.is_err() {
            break;
        }
    }
    match result {
        Err(TransportError::Io { .. }) => {}
        other => panic!("expected an I/O error, got {other:?}"),
    }

    let exit = transport.wait().await.unwrap();
    assert_eq!(exit.signal(), Some(9));
    assert_eq!(transport.state(), TransportState::Failed);
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert!(matches!(transport.send("late").await, Err(TransportError::Closed)));
}

#[tokio::test]
async fn test_zero_channel_capacity_is_clamped() {
    let mut config = StdioConfig::new("cat");
    config.channel_capacity = 0;
    let transport = StdioTransport::new(config);
    transport.open().await.unwrap();

    transport.send("one").await.unwrap();
    transport.send("two").await.unwrap();
    assert_eq!(transport.receive().await.unwrap(), Bytes::from_static(b"one"));
    assert_eq!(transport.receive().await.unwrap(), Bytes::from_static(b"two"));
    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_empty_frame_is_refused_with_line_framing() {
    let transport = StdioTransport::new(StdioConfig::new("cat"));
    transport.open().await.unwrap();

    assert!(matches!(
        transport.send(Bytes::new()).await,
        Err(TransportError::Framing(FrameError::Empty))
    ));
    transport.send("after").await.unwrap();
    assert_eq!(transport.receive().await.unwrap(), Bytes::from_static(b"after"));
    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_stop_sends_sigterm_to_child_ignoring_eof() {
    let transport = StdioTransport::new(StdioConfig::new("sleep").with_arg("30"));
    transport.open().await.unwrap();

    transport
        .stop(&CancellationToken::new(), Duration::from_millis(400))
        .await
        .unwrap();

    assert_eq!(transport.state(), TransportState::Stopped);
    assert_eq!(transport.exit_info().unwrap().signal(), Some(15));
}

#[tokio::test]
async fn test_stop_kills_child_ignoring_sigterm() {
    let transport = StdioTransport::new(sh(r#"trap '' TERM; while :; do sleep 1; done"#));
    transport.open().await.unwrap();
    // Give the shell time to install its trap.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    transport
        .stop(&CancellationToken::new(), Duration::from_millis(400))
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(400));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(transport.state(), TransportState::Stopped);
    assert_eq!(transport.exit_info().unwrap().signal(), Some(9));
}

#[tokio::test]
async fn test_cancelled_stop_kills_immediately() {
    let transport = StdioTransport::new(sh(r#"trap '' TERM; while :; do sleep 1; done"#));
    transport.open().await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let started = Instant::now();
    let err = transport
        .stop(&cancel, Duration::from_secs(30))
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(transport.state().is_terminal());
    assert!(transport.exit_info().is_some());
}

#[tokio::test]
async fn test_lifetime_cancellation_stops_child() {
    let lifetime = CancellationToken::new();
    let transport = StdioTransport::new(StdioConfig::new("cat"));
    transport.start(&lifetime).await.unwrap();
    assert!(transport.is_connected());

    lifetime.cancel();
    let exit = tokio::time::timeout(Duration::from_secs(5), transport.wait())
        .await
        .expect("child stopped")
        .unwrap();

    assert!(exit.success());
    assert_eq!(transport.state(), TransportState::Stopped);
}

struct PatientHook;

#[async_trait]
impl ProcessConstructor for PatientHook {
    async fn construct(
        &self,
        cancel: &CancellationToken,
        _request: LaunchRequest,
    ) -> Result<ProcessCommand, ConstructionError> {
        cancel.cancelled().await;
        Err(ConstructionError::hook("construction abandoned"))
    }
}

struct StubbornHook;

#[async_trait]
impl ProcessConstructor for StubbornHook {
    async fn construct(
        &self,
        _cancel: &CancellationToken,
        request: LaunchRequest,
    ) -> Result<ProcessCommand, ConstructionError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(ProcessCommand::new(request.command))
    }
}

#[tokio::test]
async fn test_start_cancellation_abandons_construction() {
    let transport = StdioTransport::new(StdioConfig::new("cat").with_constructor(PatientHook));
    let lifetime = CancellationToken::new();
    let trigger = lifetime.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = transport.start(&lifetime).await.unwrap_err();
    assert!(matches!(err, TransportError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(transport.state(), TransportState::Failed);
}

#[tokio::test]
async fn test_start_timeout_bounds_a_stubborn_hook() {
    let transport = StdioTransport::new(
        StdioConfig::new("cat")
            .with_constructor(StubbornHook)
            .with_start_timeout(Duration::from_millis(200)),
    );

    let err = transport.open().await.unwrap_err();
    assert!(matches!(err, TransportError::Timeout(_)));
    assert_eq!(transport.state(), TransportState::Failed);
}

#[tokio::test]
async fn test_close_while_starting_aborts_start() {
    let transport = Arc::new(StdioTransport::new(
        StdioConfig::new("cat").with_constructor(PatientHook),
    ));
    let starting = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move { transport.open().await })
    };
    let mut states = transport.subscribe_state();
    states
        .wait_for(|s| *s == TransportState::Starting)
        .await
        .unwrap();

    transport.close().await.unwrap();

    assert!(matches!(
        starting.await.unwrap(),
        Err(TransportError::Cancelled)
    ));
    assert_eq!(transport.state(), TransportState::Failed);
}

#[rstest]
#[case::lines(Framing::Lines, "{\"id\":1}")]
#[case::length_prefixed(Framing::LengthPrefixed, "multi\nline\npayload")]
#[tokio::test]
async fn test_frames_round_trip_through_cat(#[case] framing: Framing, #[case] payload: &'static str) {
    let transport = StdioTransport::new(StdioConfig::new("cat").with_framing(framing));

    transport.send(payload).await.unwrap();
    assert_eq!(transport.state(), TransportState::Running);
    assert_eq!(transport.receive().await.unwrap(), Bytes::from_static(payload.as_bytes()));

    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_embedded_newline_is_rejected_but_transport_survives() {
    let transport = StdioTransport::new(StdioConfig::new("cat"));
    transport.open().await.unwrap();

    assert!(matches!(
        transport.send("two\nlines").await,
        Err(TransportError::Framing(FrameError::EmbeddedDelimiter(3)))
    ));
    transport.send("one line").await.unwrap();
    assert_eq!(transport.receive().await.unwrap(), Bytes::from_static(b"one line"));

    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_json_helpers() {
    let transport = StdioTransport::new(StdioConfig::new("cat"));

    transport
        .send_json(&serde_json::json!({"type": "ping", "id": 7}))
        .await
        .unwrap();
    let reply: serde_json::Value = transport.receive_json().await.unwrap();
    assert_eq!(reply["id"], 7);

    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_receive_cancellable() {
    let transport = StdioTransport::new(StdioConfig::new("cat"));
    transport.open().await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    assert!(matches!(
        transport.receive_cancellable(&cancel).await,
        Err(TransportError::Cancelled)
    ));

    // The transport is still usable afterwards.
    transport.send("still here").await.unwrap();
    assert_eq!(
        transport.receive().await.unwrap(),
        Bytes::from_static(b"still here")
    );
    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_usable_through_trait_object() {
    let transport: Box<dyn MessageTransport> = Box::new(StdioTransport::new(StdioConfig::new("cat")));
    transport.open().await.unwrap();
    assert!(transport.is_connected().await);

    transport.send(Bytes::from_static(b"via trait")).await.unwrap();
    assert_eq!(transport.receive().await.unwrap(), Bytes::from_static(b"via trait"));

    transport.close().await.unwrap();
    assert!(!transport.is_connected().await);
}
