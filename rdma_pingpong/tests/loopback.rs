/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! End-to-end sessions over the loopback fabric.

use std::path::Path;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use rdma_pingpong::CancelToken;
use rdma_pingpong::ExitStatus;
use rdma_pingpong::LoopbackFabric;
use rdma_pingpong::PingPongConfig;
use rdma_pingpong::PingPongError;
use rdma_pingpong::Session;
use rdma_pingpong::SessionReport;
use rdma_pingpong::connection::ConnectionManager;
use rdma_pingpong::connection::EndpointState;
use rdma_pingpong::connection::Responder;
use rdma_pingpong::connection::RoleKind;
use rdma_pingpong::loopback::LoopbackKey;
use rdma_pingpong::memory_region::MemoryRegion;
use rdma_pingpong::memory_region::RegionMode;
use rdma_pingpong::report::Units;
use rdma_pingpong::transfer::prepare_endpoint;
use rdma_pingpong::transport::AccessFlags;

fn config(port: u16, size: usize, iterations: usize) -> PingPongConfig {
    PingPongConfig {
        size,
        iterations,
        port,
        completion_timeout: Duration::from_secs(5),
        busy_wait_timeout: Duration::from_secs(5),
        ..PingPongConfig::default()
    }
}

/// Runs a responder with `server` and an initiator with `client` over one
/// fabric and returns `(responder, initiator)` reports.
fn run_pair(
    server: PingPongConfig,
    client: PingPongConfig,
) -> (
    Result<SessionReport, PingPongError>,
    Result<SessionReport, PingPongError>,
) {
    let fabric = LoopbackFabric::new();
    let responder = Session::new(
        fabric.clone(),
        PingPongConfig {
            remote: None,
            ..server
        },
    )
    .unwrap();
    let initiator = Session::new(
        fabric,
        PingPongConfig {
            remote: Some("localhost".to_string()),
            ..client
        },
    )
    .unwrap();
    let handle = thread::spawn(move || responder.run());
    let client = initiator.run();
    (handle.join().unwrap(), client)
}

fn odd_bytes(n: u8) -> Vec<u8> {
    (0..n).map(|i| 2 * i + 1).collect()
}

fn even_bytes(n: u8) -> Vec<u8> {
    (0..n).map(|i| 2 * i + 2).collect()
}

fn window_file(dir: &Path, name: &str, len: u64) -> PathBuf {
    let path = dir.join(name);
    let file = std::fs::File::create(&path).unwrap();
    file.set_len(len).unwrap();
    path
}

/// Connects as a responder, registers a buffer, pre-posts the first
/// receive and then never sends. Held until `done` fires.
fn silent_responder(fabric: LoopbackFabric, port: u16, done: mpsc::Receiver<()>) {
    let mut region = MemoryRegion::<LoopbackKey>::acquire(16, RegionMode::Owned, None).unwrap();
    let caps = rdma_pingpong::transport::QueueCapacity::for_chunk(16, 16);
    let mut manager = ConnectionManager::new(fabric, Responder, port, caps);
    manager
        .connect(|ep| prepare_endpoint(ep, &mut region, AccessFlags::LOCAL_WRITE, true))
        .unwrap();
    done.recv().ok();
}

#[timed_test::timed_test(timeout_secs = 60)]
fn test_sixteen_by_sixteen_exchange() {
    let (server, client) = run_pair(config(100, 16, 16), config(100, 16, 16));
    let server = server.unwrap();
    let client = client.unwrap();

    assert_eq!(server.role, RoleKind::Responder);
    assert_eq!(client.role, RoleKind::Initiator);
    for report in [&server, &client] {
        assert_eq!(report.pattern, (33, 32));
        assert_eq!(report.latencies.len(), 32);
        assert_eq!(report.summary.total_bytes, 512);
        assert_eq!(report.device.as_deref(), Some("loopback"));
        let latency = report.summary.latency.as_ref().unwrap();
        assert_eq!(latency.deltas.len(), 32);
        assert!(latency.min <= latency.avg && latency.avg <= latency.max);
    }
    assert_eq!(server.received, odd_bytes(16));
    assert_eq!(client.received, even_bytes(16));

    let text = client.display(Units::Si).to_string();
    assert!(text.starts_with("initiator on loopback: cval=33 sval=32"));
    assert!(text.contains("512.00B in"));
}

#[timed_test::timed_test(timeout_secs = 60)]
fn test_busy_wait_exchange() {
    let server = PingPongConfig {
        busy_wait: true,
        ..config(101, 64, 8)
    };
    let client = PingPongConfig {
        busy_wait: true,
        ..config(101, 64, 8)
    };
    let (server, client) = run_pair(server, client);
    assert_eq!(server.unwrap().received, odd_bytes(8));
    assert_eq!(client.unwrap().received, even_bytes(8));
}

#[timed_test::timed_test(timeout_secs = 60)]
fn test_large_buffer_is_not_inline() {
    let (server, client) = run_pair(config(102, 8192, 4), config(102, 8192, 4));
    let server = server.unwrap();
    let client = client.unwrap();
    assert_eq!(server.summary.total_bytes, 2 * 4 * 8192);
    assert_eq!(server.received, odd_bytes(4));
    assert_eq!(client.received, even_bytes(4));
}

#[timed_test::timed_test(timeout_secs = 60)]
fn test_without_overwrite_sends_buffer_as_is() {
    let server = PingPongConfig {
        always_overwrite: false,
        ..config(103, 16, 4)
    };
    let client = PingPongConfig {
        always_overwrite: false,
        ..config(103, 16, 4)
    };
    let (server, client) = run_pair(server, client);
    let server = server.unwrap();
    let client = client.unwrap();
    // Nothing ever stamps the zeroed buffers.
    assert_eq!(server.received, vec![0; 4]);
    assert_eq!(client.received, vec![0; 4]);
    assert_eq!(client.pattern, (9, 8));
}

#[timed_test::timed_test(timeout_secs = 60)]
fn test_copy_through_window() {
    let dir = tempfile::tempdir().unwrap();
    let server_window = window_file(dir.path(), "server", 256);
    let client_window = window_file(dir.path(), "client", 256);
    let server = PingPongConfig {
        copy_through: true,
        window_path: Some(server_window.clone()),
        ..config(104, 256, 4)
    };
    let client = PingPongConfig {
        copy_through: true,
        window_path: Some(client_window.clone()),
        ..config(104, 256, 4)
    };
    let (server, client) = run_pair(server, client);
    assert_eq!(server.unwrap().received, odd_bytes(4));
    assert_eq!(client.unwrap().received, even_bytes(4));

    // The responder's last act stamps 8 into its window before sending;
    // the initiator's last act copies the received 8 into its window.
    assert_eq!(std::fs::read(&server_window).unwrap(), vec![8; 256]);
    assert_eq!(std::fs::read(&client_window).unwrap(), vec![8; 256]);
}

#[timed_test::timed_test(timeout_secs = 60)]
fn test_peer_direct_window() {
    let dir = tempfile::tempdir().unwrap();
    let server_window = window_file(dir.path(), "server", 4096);
    let client_window = window_file(dir.path(), "client", 4096);
    let server = PingPongConfig {
        peer_direct: true,
        window_path: Some(server_window.clone()),
        ..config(105, 1024, 4)
    };
    let client = PingPongConfig {
        peer_direct: true,
        window_path: Some(client_window.clone()),
        ..config(105, 1024, 4)
    };
    let (server, client) = run_pair(server, client);
    assert_eq!(server.unwrap().received, odd_bytes(4));
    assert_eq!(client.unwrap().received, even_bytes(4));

    // The window is the registered buffer; only its first `size` bytes move.
    let contents = std::fs::read(&client_window).unwrap();
    assert!(contents[..1024].iter().all(|b| *b == 8));
    assert!(contents[1024..].iter().all(|b| *b == 0));
}

#[test]
fn test_conflicting_modes_fail_before_connecting() {
    let config = PingPongConfig {
        copy_through: true,
        peer_direct: true,
        window_path: Some("/dev/null".into()),
        ..config(106, 16, 1)
    };
    let err = Session::new(LoopbackFabric::new(), config).err().unwrap();
    assert!(matches!(err, PingPongError::BadArgs(_)));
    assert_eq!(err.exit_status(), ExitStatus::BadArgs);
    assert_eq!(err.exit_status().code(), 2);
}

#[test]
fn test_unresolvable_remote() {
    let config = PingPongConfig {
        remote: Some("nowhere.invalid".to_string()),
        ..config(107, 16, 1)
    };
    let err = Session::new(LoopbackFabric::new(), config)
        .unwrap()
        .run()
        .unwrap_err();
    assert!(matches!(err, PingPongError::Resolution(_)));
    assert_eq!(err.exit_status(), ExitStatus::NoConnection);
    assert!(err.to_string().contains("rdma_getaddrinfo"));
}

#[timed_test::timed_test(timeout_secs = 30)]
fn test_no_responder_is_connect_failure() {
    let fabric = LoopbackFabric::new().with_connect_timeout(Duration::from_millis(50));
    let config = PingPongConfig {
        remote: Some("localhost".to_string()),
        ..config(108, 16, 1)
    };
    let err = Session::new(fabric, config).unwrap().run().unwrap_err();
    assert!(matches!(err, PingPongError::Connect(_)));
    assert!(err.exit_status().is_setup());
}

#[timed_test::timed_test(timeout_secs = 30)]
fn test_silent_peer_times_out() {
    let fabric = LoopbackFabric::new();
    let (done_tx, done_rx) = mpsc::channel();
    let peer_fabric = fabric.clone();
    let peer = thread::spawn(move || silent_responder(peer_fabric, 109, done_rx));

    let config = PingPongConfig {
        remote: Some("localhost".to_string()),
        completion_timeout: Duration::from_millis(100),
        ..config(109, 16, 2)
    };
    let err = Session::new(fabric, config).unwrap().run().unwrap_err();
    done_tx.send(()).unwrap();
    peer.join().unwrap();

    assert!(matches!(
        err,
        PingPongError::Timeout {
            operation: "receive completion",
            ..
        }
    ));
    assert_eq!(err.exit_status(), ExitStatus::RunProblem);
    assert!(!err.exit_status().is_setup());
}

#[timed_test::timed_test(timeout_secs = 30)]
fn test_cancel_stops_a_waiting_session() {
    let fabric = LoopbackFabric::new();
    let (done_tx, done_rx) = mpsc::channel();
    let peer_fabric = fabric.clone();
    let peer = thread::spawn(move || silent_responder(peer_fabric, 110, done_rx));

    let cancel = CancelToken::new();
    let canceller = {
        let cancel = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            cancel.cancel();
        })
    };
    let config = PingPongConfig {
        remote: Some("localhost".to_string()),
        ..config(110, 16, 2)
    };
    let err = Session::new(fabric, config)
        .unwrap()
        .with_cancel(cancel)
        .run()
        .unwrap_err();
    canceller.join().unwrap();
    done_tx.send(()).unwrap();
    peer.join().unwrap();

    assert!(matches!(err, PingPongError::Cancelled(_)));
    assert_eq!(err.exit_status(), ExitStatus::RunProblem);
}

#[timed_test::timed_test(timeout_secs = 60)]
fn test_roles_visit_exclusive_states() {
    let (server, client) = run_pair(config(111, 16, 1), config(111, 16, 1));
    assert_eq!(
        server.unwrap().states,
        vec![
            EndpointState::Unbound,
            EndpointState::Resolved,
            EndpointState::Listening,
            EndpointState::Connected,
            EndpointState::Closed,
        ]
    );
    assert_eq!(
        client.unwrap().states,
        vec![
            EndpointState::Unbound,
            EndpointState::Resolved,
            EndpointState::Handshaking,
            EndpointState::Connected,
            EndpointState::Closed,
        ]
    );
}

#[timed_test::timed_test(timeout_secs = 60)]
fn test_port_is_reusable_after_teardown() {
    let fabric = LoopbackFabric::new();
    for _ in 0..2 {
        let responder = Session::new(fabric.clone(), config(112, 16, 2)).unwrap();
        let initiator = Session::new(
            fabric.clone(),
            PingPongConfig {
                remote: Some("localhost".to_string()),
                ..config(112, 16, 2)
            },
        )
        .unwrap();
        let handle = thread::spawn(move || responder.run());
        assert_eq!(initiator.run().unwrap().pattern, (5, 4));
        assert_eq!(handle.join().unwrap().unwrap().pattern, (5, 4));
    }
}

#[timed_test::timed_test(timeout_secs = 60)]
fn test_peer_leaving_mid_run_is_run_problem() {
    let fabric = LoopbackFabric::new();
    let responder = Session::new(fabric.clone(), config(113, 16, 4)).unwrap();
    let initiator = Session::new(
        fabric.clone(),
        PingPongConfig {
            remote: Some("localhost".to_string()),
            ..config(113, 16, 1)
        },
    )
    .unwrap();
    let handle = thread::spawn(move || responder.run());

    // The initiator finishes its single cycle and tears down.
    assert_eq!(initiator.run().unwrap().pattern, (3, 2));
    let err = handle.join().unwrap().unwrap_err();
    match &err {
        PingPongError::ReceiveCompletion(wc) => assert!(wc.contains("status 5"), "{}", wc),
        other => panic!("unexpected error {}", other),
    }
    assert_eq!(err.exit_status(), ExitStatus::RunProblem);

    // The failed responder gave its port back.
    let caps = rdma_pingpong::transport::QueueCapacity::for_chunk(16, 16);
    let mut manager = ConnectionManager::new(fabric, Responder, 113, caps);
    manager.resolve().unwrap();
    manager.create().unwrap();
    assert_eq!(manager.state(), EndpointState::Listening);
}
