//! Integration tests: full session lifecycle against the in-crate host
//! over real TCP on localhost.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use vdi_core::{
    Capabilities, Codec, ConfigChange, ConnectError, HostConfig, HostHandle, HostService,
    InputEvent, ReconfigureOptions, ReconnectPolicy, Session, SessionConfig, SessionFailure,
    SessionManager, SessionState, SessionToken, StaticResolver, TcpConnector, VdiError,
};

const RESOURCE: &str = "desk-1";

// ── Helpers ──────────────────────────────────────────────────────

async fn start_host(config: HostConfig) -> (HostHandle, SocketAddr) {
    let service = HostService::bind("127.0.0.1:0", config).await.unwrap();
    let addr = service.local_addr().unwrap();
    (service.spawn(), addr)
}

/// Short timings so reconnect and probe paths finish quickly.
fn fast_config() -> SessionConfig {
    SessionConfig {
        connect_timeout: Duration::from_secs(2),
        negotiation_timeout: Duration::from_secs(2),
        close_timeout: Duration::from_secs(1),
        probe_interval: Duration::from_millis(100),
        probe_timeout: Duration::from_millis(200),
        reconnect: ReconnectPolicy {
            base: Duration::from_millis(40),
            cap: Duration::from_millis(160),
            max_attempts: 5,
        },
        ..SessionConfig::default()
    }
}

fn manager_for(addr: SocketAddr, config: SessionConfig) -> SessionManager {
    let resolver = StaticResolver::new().with(RESOURCE, addr.to_string());
    SessionManager::new(Arc::new(TcpConnector), Arc::new(resolver), config)
}

async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("timed out")
}

/// Poll `cond` until it holds.
async fn eventually(mut cond: impl FnMut() -> bool) {
    within(async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
}

async fn wait_state(session: &Session, want: SessionState) {
    let mut rx = session.subscribe_state();
    within(rx.wait_for(|s| *s == want)).await.unwrap();
}

async fn streaming_session(host: HostConfig) -> (HostHandle, SessionManager, Session) {
    let (handle, addr) = start_host(host).await;
    let mgr = manager_for(addr, fast_config());
    let session = mgr.connect(RESOURCE, SessionToken::new("token")).unwrap();
    within(session.established()).await.unwrap();
    (handle, mgr, session)
}

// ── Establishment ────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_reaches_streaming() {
    let (host, mgr, session) = streaming_session(HostConfig::default()).await;

    assert_eq!(session.state(), SessionState::Streaming);
    assert_eq!(mgr.current_state(session.id()).unwrap(), SessionState::Streaming);

    let caps = mgr.current_capabilities(session.id()).unwrap().unwrap();
    assert_eq!(caps.preferred_codec(), Some(Codec::H264));

    let record = host.session(session.id()).expect("host knows the session");
    assert_eq!(record.capabilities, caps);
    assert_eq!(record.token.as_str(), "token");
}

#[tokio::test]
async fn test_concurrent_connect_exactly_one_wins() {
    let (_host, addr) = start_host(HostConfig::default()).await;
    let mgr = Arc::new(manager_for(addr, fast_config()));

    let attempts: Vec<_> = (0..8)
        .map(|_| {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.connect(RESOURCE, SessionToken::new("t")) })
        })
        .collect();

    let mut ok = 0;
    let mut already = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(_) => ok += 1,
            Err(VdiError::AlreadyConnected { resource_id }) => {
                assert_eq!(resource_id, RESOURCE);
                already += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(already, 7);
    assert_eq!(mgr.sessions().len(), 1);
}

#[tokio::test]
async fn test_handshake_rejection_is_protocol_mismatch() {
    let (host, addr) = start_host(HostConfig::default()).await;
    host.set_reject(Some("maintenance window".into()));

    let mgr = manager_for(addr, fast_config());
    let session = mgr.connect(RESOURCE, SessionToken::new("t")).unwrap();
    let err = within(session.established()).await.unwrap_err();

    match err {
        VdiError::Session(SessionFailure::Connect(ConnectError::ProtocolMismatch(reason))) => {
            assert!(reason.contains("maintenance window"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(session.state(), SessionState::Failed);
    assert!(session.last_error().is_some());
}

#[tokio::test]
async fn test_silent_peer_times_out_negotiation() {
    // Accepts TCP but never answers the handshake.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let silent = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(socket);
    });

    let limit = Duration::from_millis(300);
    let mgr = manager_for(
        addr,
        SessionConfig {
            negotiation_timeout: limit,
            ..fast_config()
        },
    );
    let session = mgr.connect(RESOURCE, SessionToken::new("t")).unwrap();
    let err = within(session.established()).await.unwrap_err();

    match err {
        VdiError::Session(SessionFailure::Connect(ConnectError::Timeout(after))) => {
            assert_eq!(after, limit);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(session.state(), SessionState::Failed);
    silent.abort();
}

#[tokio::test]
async fn test_wrong_token_is_rejected() {
    let (_host, addr) = start_host(HostConfig {
        expected_token: Some("secret".into()),
        ..HostConfig::default()
    })
    .await;

    let mgr = manager_for(addr, fast_config());
    let session = mgr.connect(RESOURCE, SessionToken::new("guess")).unwrap();
    assert!(matches!(
        within(session.established()).await,
        Err(VdiError::Session(SessionFailure::Connect(
            ConnectError::ProtocolMismatch(_)
        )))
    ));
}

#[tokio::test]
async fn test_no_common_codec_fails_negotiation() {
    let (_host, addr) = start_host(HostConfig {
        capabilities: Capabilities {
            codecs: vec![Codec::Hevc],
            ..Capabilities::default()
        },
        ..HostConfig::default()
    })
    .await;

    let mgr = manager_for(addr, fast_config());
    let session = mgr.connect(RESOURCE, SessionToken::new("t")).unwrap();
    assert!(matches!(
        within(session.established()).await,
        Err(VdiError::Session(SessionFailure::Connect(
            ConnectError::ProtocolMismatch(_)
        )))
    ));
    assert_eq!(session.state(), SessionState::Failed);
}

#[tokio::test]
async fn test_refused_connection_is_not_retried() {
    // Bind and drop to get a port with nothing listening.
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let mgr = manager_for(addr, fast_config());
    let session = mgr.connect(RESOURCE, SessionToken::new("t")).unwrap();

    assert!(matches!(
        within(session.established()).await,
        Err(VdiError::Session(SessionFailure::Connect(ConnectError::Refused(_))))
    ));
    assert_eq!(session.diagnostics().reconnect_attempts, 0);
}

// ── Reconnection ─────────────────────────────────────────────────

#[tokio::test]
async fn test_transport_drop_resumes_same_session() {
    let (host, _mgr, session) = streaming_session(HostConfig::default()).await;
    let id = session.id();
    let caps = session.capabilities().unwrap();

    let mut states = session.subscribe_state();
    host.drop_connections();
    within(states.wait_for(|s| *s == SessionState::Reconnecting))
        .await
        .unwrap();
    wait_state(&session, SessionState::Streaming).await;

    assert_eq!(session.id(), id);
    assert_eq!(session.capabilities().unwrap(), caps);
    assert!(session.diagnostics().reconnect_attempts >= 1);
    eventually(|| host.session(id).is_some_and(|s| s.resumes == 1)).await;
}

#[tokio::test]
async fn test_five_failed_reconnects_end_in_failed() {
    let (host, _mgr, session) = streaming_session(HostConfig::default()).await;

    host.set_accepting(false);
    host.drop_connections();
    wait_state(&session, SessionState::Failed).await;

    match session.last_error() {
        Some(SessionFailure::ReconnectExhausted { attempts, .. }) => assert_eq!(attempts, 5),
        other => panic!("unexpected last error: {other:?}"),
    }
    assert_eq!(session.diagnostics().reconnect_attempts, 5);

    // No further attempts once failed.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(session.diagnostics().reconnect_attempts, 5);
    assert_eq!(session.state(), SessionState::Failed);
}

#[tokio::test]
async fn test_probe_timeouts_trigger_reconnect() {
    let (host, _mgr, session) = streaming_session(HostConfig::default()).await;

    host.set_echo_probes(false);
    eventually(|| session.diagnostics().reconnect_attempts >= 1).await;
    assert!(session.diagnostics().probe_timeouts >= 3);

    host.set_echo_probes(true);
    wait_state(&session, SessionState::Streaming).await;
}

#[tokio::test]
async fn test_disconnect_during_reconnect_closes() {
    let (host, _mgr, session) = streaming_session(HostConfig::default()).await;

    host.set_accepting(false);
    host.drop_connections();
    wait_state(&session, SessionState::Reconnecting).await;

    within(session.disconnect()).await;
    assert_eq!(session.state(), SessionState::Closed);
    let attempts = session.diagnostics().reconnect_attempts;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(session.diagnostics().reconnect_attempts, attempts);
}

// ── Disconnect ───────────────────────────────────────────────────

#[tokio::test]
async fn test_disconnect_twice_stays_closed() {
    let (host, mgr, session) = streaming_session(HostConfig::default()).await;

    within(mgr.disconnect(session.id())).await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    within(mgr.disconnect(session.id())).await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.last_error().is_none());

    eventually(|| host.connection_count() == 0).await;
    // A goodbye ends the session on the host too.
    assert!(host.session(session.id()).is_none());

    // A closed session no longer blocks the resource.
    let again = mgr.connect(RESOURCE, SessionToken::new("t")).unwrap();
    within(again.established()).await.unwrap();
    assert_ne!(again.id(), session.id());
}

#[tokio::test]
async fn test_streams_end_after_disconnect() {
    let (_host, mgr, session) = streaming_session(HostConfig::default()).await;

    let quality = mgr.observe_quality(session.id()).unwrap();
    let states = session.state_stream();
    within(session.disconnect()).await;

    let samples: Vec<_> = within(quality.collect()).await;
    assert!(samples.iter().all(|s| s.latency_ms < 1000));
    let seen: Vec<_> = within(states.collect()).await;
    assert_eq!(seen.last(), Some(&SessionState::Closed));
}

// ── Streaming ────────────────────────────────────────────────────

#[tokio::test]
async fn test_quality_samples_are_published() {
    let (_host, mgr, session) = streaming_session(HostConfig::default()).await;

    let mut quality = Box::pin(mgr.observe_quality(session.id()).unwrap());
    let sample = within(quality.next()).await.expect("a sample");
    assert!(sample.loss_rate >= 0.0 && sample.loss_rate <= 1.0);
    assert!(session.quality().is_some());
}

#[tokio::test]
async fn test_input_sequences_strictly_increase() {
    let (host, _mgr, session) = streaming_session(HostConfig::default()).await;

    for code in 0..20u32 {
        session.submit(InputEvent::PointerMove {
            x: code as i32,
            y: 0,
        });
        session.submit(InputEvent::KeyPress { code, modifiers: 0 });
        session.submit(InputEvent::KeyRelease { code, modifiers: 0 });
    }

    let id = session.id();
    eventually(|| {
        host.received_input(id)
            .iter()
            .filter(|m| !m.event.is_pointer_move())
            .count()
            == 40
    })
    .await;

    let received = host.received_input(id);
    assert!(received.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert!(received.iter().all(|m| m.session_id == id));
    assert_eq!(session.diagnostics().inputs_discarded, 0);
}

#[tokio::test]
async fn test_pointer_moves_coalesce_within_a_tick() {
    let (handle, addr) = start_host(HostConfig::default()).await;
    let mgr = manager_for(
        addr,
        SessionConfig {
            input_tick: Duration::from_millis(300),
            ..fast_config()
        },
    );
    let session = mgr.connect(RESOURCE, SessionToken::new("t")).unwrap();
    within(session.established()).await.unwrap();

    for i in 0..100 {
        session.submit(InputEvent::PointerMove { x: i, y: i });
    }

    let id = session.id();
    eventually(|| !handle.received_input(id).is_empty()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let received = handle.received_input(id);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].event, InputEvent::PointerMove { x: 99, y: 99 });
    assert_eq!(session.diagnostics().pointer_moves_coalesced, 99);
}

#[tokio::test]
async fn test_heavy_frame_loss_degrades_then_recovers() {
    let (host, _mgr, session) = streaming_session(HostConfig {
        frame_interval: Some(Duration::from_millis(5)),
        ..HostConfig::default()
    })
    .await;
    wait_state(&session, SessionState::Streaming).await;

    host.skip_frames(5000);
    wait_state(&session, SessionState::Degraded).await;
    assert!(session.diagnostics().frames_missing >= 5000);
    wait_state(&session, SessionState::Streaming).await;
}

#[tokio::test]
async fn test_frames_delivered_in_order_with_gap_reported() {
    let (host, _mgr, session) = streaming_session(HostConfig {
        frame_interval: Some(Duration::from_millis(5)),
        ..HostConfig::default()
    })
    .await;

    let mut frames = session.frames();
    let mut seen = Vec::new();
    host.skip_frames(3);
    while seen.len() < 20 {
        let frame = within(frames.recv()).await.unwrap();
        assert_eq!(frame.session_id, session.id());
        seen.push(frame.sequence);
    }

    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    eventually(|| session.diagnostics().frames_missing >= 3).await;
    assert!(session.diagnostics().frames_delivered >= 20);
}

#[tokio::test]
async fn test_reconfigure_round_trip() {
    let (host, mgr, session) = streaming_session(HostConfig::default()).await;

    let options = ReconfigureOptions {
        pointer_sensitivity: Some(80),
        change: ConfigChange {
            codec: Some(Codec::Jpeg),
            clipboard: Some(false),
            ..ConfigChange::default()
        },
        ..ReconfigureOptions::default()
    };
    within(mgr.reconfigure(session.id(), options)).await.unwrap();

    let settings = session.settings();
    assert_eq!(settings.codec, Some(Codec::Jpeg));
    assert!(!settings.clipboard);
    assert_eq!(settings.pointer_sensitivity, 80);
    assert_eq!(host.session(session.id()).unwrap().changes.len(), 1);

    let err = within(session.reconfigure(ReconfigureOptions {
        change: ConfigChange {
            codec: Some(Codec::Av1),
            ..ConfigChange::default()
        },
        ..ReconfigureOptions::default()
    }))
    .await
    .unwrap_err();
    assert!(matches!(err, VdiError::InvalidOption(_)));
}
