// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! End-to-end lifecycle tests against an in-process mock micad.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixDatagram, UnixListener};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use micart_core::{
    Container, ContainerId, ContainerState, CreateMessage, DaemonClient, DaemonConfig,
    ForceDeleteConfig, MicaError, NotifyRegistry, OciStatus, ProcessId, ReadinessNotifier, Spec,
    StateStore,
};
use tempfile::TempDir;

type Reply = dyn Fn(&[u8]) -> Vec<u8> + Send + Sync;

/// Accepts one request per connection, records it, answers via `reply`.
struct MockDaemon {
    path: PathBuf,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MockDaemon {
    fn spawn(path: PathBuf, reply: Box<Reply>) -> Self {
        let listener = UnixListener::bind(&path).expect("Failed to bind mock socket");
        listener
            .set_nonblocking(true)
            .expect("Failed to set nonblocking");

        let received = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let (log, flag) = (received.clone(), stop.clone());

        let handle = std::thread::spawn(move || {
            while !flag.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        stream.set_nonblocking(false).ok();
                        stream.set_read_timeout(Some(Duration::from_secs(2))).ok();
                        let mut buf = [0u8; 1024];
                        let n = stream.read(&mut buf).unwrap_or(0);
                        let payload = buf[..n].to_vec();
                        let answer = reply(&payload);
                        log.lock().unwrap().push(payload);
                        if !answer.is_empty() {
                            let _ = stream.write_all(&answer);
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            path,
            received,
            stop,
            handle: Some(handle),
        }
    }

    /// Answer every control command with `reply`.
    fn replying(path: PathBuf, reply: &'static str) -> Self {
        Self::spawn(path, Box::new(move |_: &[u8]| reply.as_bytes().to_vec()))
    }

    fn commands(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect()
    }

    fn payloads(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }

    fn client(&self) -> DaemonClient {
        DaemonClient::new(&DaemonConfig {
            control_socket: self.path.clone(),
            create_socket: self.path.clone(),
            control_timeout: Duration::from_millis(500),
            create_timeout: Duration::from_millis(500),
            control_buffer_size: 1024,
            create_buffer_size: 512,
        })
    }
}

impl Drop for MockDaemon {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    fn root(&self) -> PathBuf {
        self.dir.path().join("root")
    }

    fn store(&self) -> StateStore {
        StateStore::new(self.root())
    }

    fn socket(&self) -> PathBuf {
        self.dir.path().join("mica-create.socket")
    }

    fn bundle(&self) -> PathBuf {
        self.dir.path().join("bundle")
    }

    fn create(&self, daemon: &MockDaemon, id: &str, spec: Spec) -> Container {
        Container::create(
            self.store(),
            daemon.client(),
            ContainerId::new(id).unwrap(),
            self.bundle(),
            spec,
        )
        .expect("Failed to create container")
    }
}

fn annotated_spec(pairs: &[(&str, &str)]) -> Spec {
    let mut spec = Spec::example();
    spec.annotations = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect::<BTreeMap<_, _>>();
    spec
}

fn persisted_status(root: &Path, id: &str) -> String {
    let raw = std::fs::read_to_string(root.join(id).join("state.json")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    value["status"].as_str().unwrap().to_string()
}

fn fast_force_delete() -> ForceDeleteConfig {
    ForceDeleteConfig {
        poll_interval: Duration::from_millis(1),
        max_attempts: 100,
    }
}

#[test]
fn test_create_start_stop_destroy() {
    let fx = Fixture::new();
    let daemon = MockDaemon::replying(fx.socket(), "ok");

    let c = fx.create(&daemon, "c1", Spec::example());
    assert_eq!(c.lifecycle(), ContainerState::Created);
    assert_eq!(persisted_status(&fx.root(), "c1"), "created");

    c.start().unwrap();
    let fifo = fx.root().join("c1/exec.fifo");
    assert!(std::fs::metadata(&fifo).unwrap().file_type().is_fifo());
    assert_eq!(daemon.commands(), vec!["start"]);
    assert_eq!(c.status(), OciStatus::Running);
    assert_eq!(persisted_status(&fx.root(), "c1"), "running");

    c.stop().unwrap();
    assert_eq!(c.lifecycle(), ContainerState::Stopped);

    c.destroy().unwrap();
    assert!(!fx.root().join("c1").exists());
    let rm_count = daemon.commands().iter().filter(|c| *c == "rm c1").count();
    assert_eq!(rm_count, 1);
    assert_eq!(c.lifecycle(), ContainerState::Stopped);
}

#[test]
fn test_start_recreates_stale_fifo() {
    let fx = Fixture::new();
    let daemon = MockDaemon::replying(fx.socket(), "ok");
    let c = fx.create(&daemon, "c1", Spec::example());

    std::fs::write(fx.root().join("c1/exec.fifo"), b"stale").unwrap();
    c.start().unwrap();

    let meta = std::fs::metadata(fx.root().join("c1/exec.fifo")).unwrap();
    assert!(meta.file_type().is_fifo());
    use std::os::unix::fs::PermissionsExt;
    assert_eq!(meta.permissions().mode() & 0o777, 0o622);
}

#[test]
fn test_empty_reply_is_soft_failure_and_keeps_state() {
    let fx = Fixture::new();
    let daemon = MockDaemon::replying(fx.socket(), "");
    let c = fx.create(&daemon, "c1", Spec::example());

    let err = c.start().unwrap_err();
    assert!(matches!(err, MicaError::EmptyResponse { action: "start", .. }));
    assert_eq!(c.lifecycle(), ContainerState::Created);
    assert_eq!(persisted_status(&fx.root(), "c1"), "created");
}

#[test]
fn test_missing_daemon_is_transport_error() {
    let fx = Fixture::new();
    let daemon = MockDaemon::replying(fx.dir.path().join("other.socket"), "ok");
    let client = DaemonClient::new(&DaemonConfig {
        control_socket: fx.socket(),
        create_socket: fx.socket(),
        control_timeout: Duration::from_millis(100),
        create_timeout: Duration::from_millis(100),
        control_buffer_size: 1024,
        create_buffer_size: 512,
    });
    let c = Container::create(
        fx.store(),
        client,
        ContainerId::new("c1").unwrap(),
        fx.bundle(),
        Spec::example(),
    )
    .unwrap();

    let err = c.pause().unwrap_err();
    assert!(matches!(err, MicaError::Daemon { action: "pause", .. }));
    assert_eq!(c.lifecycle(), ContainerState::Created);
    assert!(daemon.commands().is_empty());
}

#[test]
fn test_illegal_transition_sends_nothing() {
    let fx = Fixture::new();
    let daemon = MockDaemon::replying(fx.socket(), "ok");
    let c = fx.create(&daemon, "c1", Spec::example());

    assert!(matches!(c.resume(), Err(MicaError::NotPaused { .. })));
    assert!(matches!(c.exec(), Err(MicaError::NotRunning { .. })));
    assert!(matches!(
        c.restore(),
        Err(MicaError::InvalidStateTransition(_))
    ));
    assert!(daemon.commands().is_empty());
    assert_eq!(c.lifecycle(), ContainerState::Created);
}

#[test]
fn test_pause_resume_exec_restore_commands() {
    let fx = Fixture::new();
    let daemon = MockDaemon::replying(fx.socket(), "ok");
    let c = fx.create(&daemon, "c1", Spec::example());

    c.run().unwrap();
    c.exec().unwrap();
    c.pause().unwrap();
    assert_eq!(c.lifecycle(), ContainerState::Paused);
    assert_eq!(c.status(), OciStatus::Running);
    c.resume().unwrap();
    c.stop().unwrap();
    c.restore().unwrap();
    assert_eq!(c.lifecycle(), ContainerState::Restored);
    assert_eq!(persisted_status(&fx.root(), "c1"), "running");

    assert_eq!(
        daemon.commands(),
        vec!["run", "exec", "pause", "resume", "stop", "restore"]
    );
}

#[test]
fn test_destroy_refused_with_init_attached() {
    let fx = Fixture::new();
    let daemon = MockDaemon::replying(fx.socket(), "ok");
    let c = fx.create(&daemon, "c1", Spec::example());

    // Init can only be attached to a live guest.
    assert!(c.attach_init(ProcessId::new(42).unwrap()).is_err());

    c.start().unwrap();
    c.attach_init(ProcessId::new(42).unwrap()).unwrap();
    assert_eq!(c.oci_state().pid, 42);

    let err = c.destroy().unwrap_err();
    assert!(err.to_string().contains("is running"));
    assert!(fx.root().join("c1").exists());
    assert!(c.stop().is_err());

    c.pause().unwrap();
    assert!(c.destroy().is_err());
    assert!(fx.root().join("c1").exists());

    c.detach_init().unwrap();
    c.destroy().unwrap();
    assert!(!fx.root().join("c1").exists());
}

#[test]
fn test_force_delete_exhausts_attempts() {
    let fx = Fixture::new();
    let daemon = MockDaemon::replying(fx.socket(), "alive");
    let c = fx.create(&daemon, "c1", Spec::example());

    let err = c.force_delete(fast_force_delete()).unwrap_err();
    assert!(matches!(
        err,
        MicaError::InitStillRunning { attempts: 100, .. }
    ));
    assert!(err.to_string().contains("still running"));
    assert!(fx.root().join("c1").exists());

    let commands = daemon.commands();
    assert_eq!(commands.len(), 101);
    assert_eq!(commands[0], "kill c1 9");
    assert!(commands[1..].iter().all(|c| c == "kill c1 0"));
}

#[test]
fn test_force_delete_destroys_after_probe_fails() {
    let fx = Fixture::new();
    let daemon = MockDaemon::spawn(
        fx.socket(),
        Box::new(|payload: &[u8]| {
            if payload == b"kill c1 0" {
                Vec::new()
            } else {
                b"ok".to_vec()
            }
        }),
    );
    let c = fx.create(&daemon, "c1", Spec::example());
    c.start().unwrap();
    c.attach_init(ProcessId::new(7).unwrap()).unwrap();

    c.force_delete(fast_force_delete()).unwrap();

    assert!(!fx.root().join("c1").exists());
    assert_eq!(c.init_pid(), None);
    assert_eq!(
        daemon.commands(),
        vec!["start", "kill c1 9", "kill c1 0", "rm c1"]
    );
}

#[test]
fn test_force_delete_keeps_state_when_remove_fails() {
    let fx = Fixture::new();
    let daemon = MockDaemon::spawn(
        fx.socket(),
        Box::new(|payload: &[u8]| match payload {
            b"start" | b"kill c1 9" => b"ok".to_vec(),
            _ => Vec::new(),
        }),
    );
    let c = fx.create(&daemon, "c1", Spec::example());
    c.start().unwrap();
    c.attach_init(ProcessId::new(7).unwrap()).unwrap();

    let err = c.force_delete(fast_force_delete()).unwrap_err();
    assert!(matches!(err, MicaError::EmptyResponse { action: "destroy", .. }));

    assert_eq!(c.lifecycle(), ContainerState::Running);
    assert_eq!(c.init_pid(), ProcessId::new(7).ok());
    assert_eq!(persisted_status(&fx.root(), "c1"), "running");

    let reloaded = Container::load(fx.store(), daemon.client(), ContainerId::new("c1").unwrap())
        .unwrap();
    assert_eq!(reloaded.lifecycle(), c.lifecycle());
    assert_eq!(reloaded.init_pid(), c.init_pid());
    assert_eq!(
        daemon.commands(),
        vec!["start", "kill c1 9", "kill c1 0", "rm c1"]
    );
}

#[test]
fn test_exec_from_restored() {
    let fx = Fixture::new();
    let daemon = MockDaemon::replying(fx.socket(), "ok");
    let c = fx.create(&daemon, "c1", Spec::example());

    c.run().unwrap();
    c.pause().unwrap();
    assert!(matches!(c.exec(), Err(MicaError::NotRunning { .. })));
    c.stop().unwrap();
    c.restore().unwrap();
    c.exec().unwrap();

    assert_eq!(c.lifecycle(), ContainerState::Restored);
    assert_eq!(daemon.commands(), vec!["run", "pause", "stop", "restore", "exec"]);
}

#[test]
fn test_persisted_round_trip_through_load() {
    let fx = Fixture::new();
    let daemon = MockDaemon::replying(fx.socket(), "ok");
    let spec = annotated_spec(&[
        ("org.openeuler.mica.cpu", "2"),
        ("com.example.owner", "ci"),
    ]);
    let c = fx.create(&daemon, "c1", spec);
    c.start().unwrap();
    c.pause().unwrap();
    let before = c.state();

    let loaded = Container::load(fx.store(), daemon.client(), ContainerId::new("c1").unwrap())
        .unwrap();
    let after = loaded.state();

    assert_eq!(after.id, before.id);
    assert_eq!(after.status, before.status);
    assert_eq!(after.bundle, before.bundle);
    assert_eq!(after.annotations, before.annotations);
    assert_eq!(after.created, before.created);
    assert_eq!(loaded.lifecycle(), ContainerState::Paused);
}

#[test]
fn test_load_without_lifecycle_is_conservative() {
    let fx = Fixture::new();
    let daemon = MockDaemon::replying(fx.socket(), "ok");
    let root = fx.root();
    for (id, status) in [("old-running", "running"), ("old-created", "created")] {
        std::fs::create_dir_all(root.join(id)).unwrap();
        let json = format!(
            r#"{{"version":"1.0.2","id":"{id}","status":"{status}","pid":99,"bundle":"/nowhere","annotations":{{}}}}"#
        );
        std::fs::write(root.join(id).join("state.json"), json).unwrap();
    }

    let running = Container::load(
        fx.store(),
        daemon.client(),
        ContainerId::new("old-running").unwrap(),
    )
    .unwrap();
    assert_eq!(running.lifecycle(), ContainerState::Stopped);
    assert_eq!(running.init_pid(), None);

    let created = Container::load(
        fx.store(),
        daemon.client(),
        ContainerId::new("old-created").unwrap(),
    )
    .unwrap();
    assert_eq!(created.lifecycle(), ContainerState::Created);

    let missing = Container::load(fx.store(), daemon.client(), ContainerId::new("nope").unwrap());
    assert!(matches!(missing, Err(MicaError::ContainerNotFound { .. })));
}

#[test]
fn test_create_twice_fails() {
    let fx = Fixture::new();
    let daemon = MockDaemon::replying(fx.socket(), "ok");
    let _c = fx.create(&daemon, "c1", Spec::example());

    let again = Container::create(
        fx.store(),
        daemon.client(),
        ContainerId::new("c1").unwrap(),
        fx.bundle(),
        Spec::example(),
    );
    assert!(matches!(again, Err(MicaError::ContainerExists { .. })));
}

#[test]
fn test_set_requires_live_container() {
    let fx = Fixture::new();
    let daemon = MockDaemon::replying(fx.socket(), "ok");
    let c = fx.create(&daemon, "c1", Spec::example());

    c.set(annotated_spec(&[("k", "v")])).unwrap();
    assert_eq!(c.state().annotations.get("k").map(String::as_str), Some("v"));

    c.stop().unwrap();
    assert!(matches!(
        c.set(Spec::example()),
        Err(MicaError::NotRunning { .. })
    ));
}

#[test]
fn test_signal_formats_kill_command() {
    let fx = Fixture::new();
    let daemon = MockDaemon::replying(fx.socket(), "ok");
    let c = fx.create(&daemon, "c1", Spec::example());

    c.signal(Some(nix::sys::signal::Signal::SIGTERM)).unwrap();
    c.signal(None).unwrap();
    assert_eq!(daemon.commands(), vec!["kill c1 15", "kill c1 0"]);
}

#[test]
fn test_allocate_guest_sends_create_message() {
    let fx = Fixture::new();
    let daemon = MockDaemon::spawn(
        fx.socket(),
        Box::new(|payload: &[u8]| {
            if payload.len() == micart_core::daemon::CREATE_MESSAGE_SIZE {
                b"loading zephyr\nMICA-SUCCESS\n".to_vec()
            } else {
                b"MICA-FAILED".to_vec()
            }
        }),
    );
    let spec = annotated_spec(&[
        ("org.openeuler.mica.cpu", "3"),
        ("org.openeuler.mica.firmware", "/lib/firmware/zephyr.elf"),
        ("org.openeuler.mica.debug", "1"),
    ]);
    let c = fx.create(&daemon, "c1", spec);

    let reply = c.allocate_guest().unwrap();
    assert!(reply.is_success());
    assert_eq!(reply.advisory(), "loading zephyr");

    let sent = CreateMessage::unpack(&daemon.payloads()[0]).unwrap();
    assert_eq!(sent.cpu, 3);
    assert_eq!(sent.name, "c1");
    assert_eq!(sent.client_path, "/lib/firmware/zephyr.elf");
    assert!(sent.debug);
}

#[test]
fn test_allocate_guest_failed_verdict() {
    let fx = Fixture::new();
    let daemon = MockDaemon::replying(fx.socket(), "no cpu left\nMICA-FAILED\n");
    let c = fx.create(&daemon, "c1", Spec::example());

    let reply = c.allocate_guest().unwrap();
    assert!(!reply.is_success());
    assert_eq!(reply.advisory(), "no cpu left");
}

#[tokio::test]
async fn test_readiness_datagrams_in_order() {
    let fx = Fixture::new();
    let daemon = MockDaemon::replying(fx.socket(), "ok");
    let host_path = fx.dir.path().join("supervisor.sock");
    let host = UnixDatagram::bind(&host_path).unwrap();
    host.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    let mut spec = Spec::example();
    let mut notifier = ReadinessNotifier::new(
        &fx.root(),
        ContainerId::new("c1").unwrap(),
        Some(host_path.clone()),
        NotifyRegistry::new_shared(),
        Duration::from_secs(5),
    );
    notifier.setup_spec(&mut spec);

    let c = fx.create(&daemon, "c1", spec);
    notifier.setup_socket_directory().unwrap();
    notifier.bind_socket().unwrap();
    c.start().unwrap();
    c.attach_init(ProcessId::new(4321).unwrap()).unwrap();

    notifier
        .wait_for_container(&c, async {})
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    let mut received = Vec::new();
    for _ in 0..3 {
        let n = host.recv(&mut buf).unwrap();
        received.push(String::from_utf8_lossy(&buf[..n]).into_owned());
    }
    assert_eq!(received, vec!["READY=1\n", "MAINPID=4321\n", "BARRIER=1\n"]);
    assert_eq!(
        c.spec().process.unwrap().env.last().map(String::as_str),
        Some("NOTIFY_SOCKET=/run/notify/notify.sock")
    );
}

#[tokio::test]
async fn test_readiness_wait_times_out() {
    let fx = Fixture::new();
    let daemon = MockDaemon::replying(fx.socket(), "ok");
    let host_path = fx.dir.path().join("supervisor.sock");
    let _host = UnixDatagram::bind(&host_path).unwrap();

    let c = fx.create(&daemon, "c1", Spec::example());
    let mut notifier = ReadinessNotifier::new(
        &fx.root(),
        ContainerId::new("c1").unwrap(),
        Some(host_path),
        NotifyRegistry::new_shared(),
        Duration::from_millis(50),
    );

    let started = std::time::Instant::now();
    notifier
        .wait_for_container(&c, std::future::pending())
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(50));
}
