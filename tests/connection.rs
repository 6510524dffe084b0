#![cfg(feature = "ws")]
#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::StreamExt as _;
use inspection_realtime::error::Kind;
use inspection_realtime::recovery::{
    CircuitBreakerConfig, CircuitState, ErrorRecoveryManager, RecoveryConfig,
};
use inspection_realtime::ws::{
    Config, ConnectionEvent, ConnectionManager, ConnectionState, HEARTBEAT_TIMEOUT_CLOSE_CODE,
    MANUAL_CLOSE_CODE, MessageKind, OutboundMessage, ReconnectConfig, Topic, WsError,
};
use serde_json::json;
use tokio::time::{Instant, sleep};

use crate::common::{
    MockWsServer, TOKEN, collect_events, dead_endpoint, next_event, test_config, wait_until,
};

async fn connected(server: &MockWsServer, config: Config) -> ConnectionManager {
    let manager = ConnectionManager::new(&server.http_url(), config).unwrap();
    manager.connect(TOKEN.to_owned()).await.unwrap();
    manager
}

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn connect_passes_token_and_session_id() {
        let mut server = MockWsServer::start().await;
        let manager = ConnectionManager::new(&server.http_url(), test_config()).unwrap();
        let mut events = manager.events();

        manager.connect(TOKEN.to_owned()).await.unwrap();

        let uri = server.next_connection().await.unwrap();
        assert!(uri.starts_with("/ws?"), "unexpected uri {uri}");
        assert!(uri.contains("token=secret-token"), "token missing from {uri}");
        assert!(
            uri.contains(&format!("session_id={}", manager.session_id())),
            "session id missing from {uri}"
        );

        assert_eq!(
            next_event(&mut events, |_| true).await,
            ConnectionEvent::Connected
        );
        assert!(manager.state().is_open());
        assert!(manager.status().connected);

        let stats = manager.stats();
        assert!(stats.is_connected);
        assert!(!stats.url.contains(TOKEN), "stats leak the token");
    }

    #[tokio::test]
    async fn connect_twice_is_a_no_op() {
        let mut server = MockWsServer::start().await;
        let manager = connected(&server, test_config()).await;

        manager.connect(TOKEN.to_owned()).await.unwrap();

        assert!(server.next_connection().await.is_some());
        sleep(Duration::from_millis(100)).await;
        assert!(
            server.drain_frames().is_empty(),
            "no frames expected from a second connect"
        );
        assert!(manager.state().is_open());
    }

    #[tokio::test]
    async fn failed_explicit_connect_does_not_reconnect() {
        let manager = ConnectionManager::new(&dead_endpoint().await, test_config()).unwrap();
        let mut events = manager.events();

        let error = manager.connect(TOKEN.to_owned()).await.unwrap_err();

        assert_eq!(error.kind(), Kind::Connection);
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(matches!(
            next_event(&mut events, |_| true).await,
            ConnectionEvent::ConnectionError(_)
        ));

        let later = collect_events(&mut events, Duration::from_millis(300)).await;
        assert!(
            !later
                .iter()
                .any(|event| matches!(event, ConnectionEvent::ReconnectScheduled { .. })),
            "explicit connect failure must not schedule reconnects: {later:?}"
        );
        assert_eq!(manager.last_error().unwrap().kind, Kind::Connection);
    }

    #[tokio::test]
    async fn manual_disconnect_is_not_followed_by_reconnect() {
        let mut server = MockWsServer::start().await;
        let manager = connected(&server, test_config()).await;
        let mut events = manager.events();
        assert!(server.next_connection().await.is_some());

        manager.disconnect().await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(
            next_event(&mut events, |_| true).await,
            ConnectionEvent::Disconnected {
                code: MANUAL_CLOSE_CODE,
                reason: "manual disconnect".to_owned(),
                manual: true,
            }
        );

        let later = collect_events(&mut events, Duration::from_millis(300)).await;
        assert!(later.is_empty(), "unexpected events after disconnect: {later:?}");
        assert!(server.next_connection().await.is_none());
    }

    #[tokio::test]
    async fn server_close_with_sentinel_code_counts_as_manual() {
        let server = MockWsServer::start().await;
        let manager = connected(&server, test_config()).await;
        let mut events = manager.events();

        server.close_all(MANUAL_CLOSE_CODE, "bye");

        let event = next_event(&mut events, |event| {
            matches!(event, ConnectionEvent::Disconnected { .. })
        })
        .await;
        assert_eq!(
            event,
            ConnectionEvent::Disconnected {
                code: MANUAL_CLOSE_CODE,
                reason: "bye".to_owned(),
                manual: true,
            }
        );

        let later = collect_events(&mut events, Duration::from_millis(300)).await;
        assert!(
            !later
                .iter()
                .any(|event| matches!(event, ConnectionEvent::ReconnectScheduled { .. })),
            "sentinel close must not reconnect: {later:?}"
        );
    }

    #[tokio::test]
    async fn state_receiver_observes_transitions() {
        let server = MockWsServer::start().await;
        let manager = ConnectionManager::new(&server.http_url(), test_config()).unwrap();
        let mut state = manager.state_receiver();
        assert_eq!(*state.borrow_and_update(), ConnectionState::Idle);

        manager.connect(TOKEN.to_owned()).await.unwrap();
        assert!(state.borrow_and_update().is_open());

        manager.disconnect().await.unwrap();
        assert_eq!(*state.borrow_and_update(), ConnectionState::Closed);
    }
}

mod queueing {
    use super::*;

    #[tokio::test]
    async fn messages_sent_while_closed_flush_in_order() {
        let mut server = MockWsServer::start().await;
        let manager = ConnectionManager::new(&server.http_url(), test_config()).unwrap();

        for n in 1..=3 {
            manager
                .send(OutboundMessage::new("site_update").with_data(json!({ "n": n })))
                .unwrap();
        }
        wait_until(|| manager.stats().queued_messages == 3).await;

        manager.connect(TOKEN.to_owned()).await.unwrap();

        for n in 1..=3 {
            let frame = server.recv_domain_frame().await.unwrap();
            assert_eq!(frame["type"], "site_update");
            assert_eq!(frame["data"]["n"], n, "frames must arrive in send order");
            assert!(frame["timestamp"].is_string());
        }
        assert_eq!(manager.stats().queued_messages, 0);
    }

    #[tokio::test]
    async fn send_while_open_is_immediate() {
        let mut server = MockWsServer::start().await;
        let manager = connected(&server, test_config()).await;

        manager.send(OutboundMessage::new("ack")).unwrap();

        let frame = server.recv_domain_frame().await.unwrap();
        assert_eq!(frame["type"], "ack");
        assert!(frame.get("id").is_none());
    }
}

mod requests {
    use super::*;

    #[tokio::test]
    async fn response_with_matching_id_resolves_request() {
        let mut server = MockWsServer::start().await;
        let manager = connected(&server, test_config()).await;

        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        let _handle = manager.subscribe("site_status", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let request = tokio::spawn({
            let manager = manager.clone();
            async move {
                manager
                    .send_and_wait_for_response(
                        OutboundMessage::new("site_status"),
                        Duration::from_secs(2),
                    )
                    .await
            }
        });

        let frame = server.recv_domain_frame().await.unwrap();
        let id = frame["id"].as_str().unwrap().to_owned();
        server.push_json(&json!({
            "type": "site_status",
            "id": id,
            "data": { "open_findings": 4 }
        }));

        let response = request.await.unwrap().unwrap();
        assert_eq!(response.id.as_deref(), Some(id.as_str()));
        assert_eq!(response.data, Some(json!({ "open_findings": 4 })));
        assert_eq!(
            delivered.load(Ordering::SeqCst),
            0,
            "correlated responses are not dispatched"
        );
        wait_until(|| manager.stats().pending_messages == 0).await;
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let mut server = MockWsServer::start().await;
        let manager = connected(&server, test_config()).await;

        let error = manager
            .send_and_wait_for_response(
                OutboundMessage::new("site_status"),
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();

        assert_eq!(error.kind(), Kind::Timeout);
        assert!(matches!(
            error.downcast_ref::<WsError>(),
            Some(WsError::ResponseTimeout { .. })
        ));
        assert!(server.recv_domain_frame().await.is_some());

        // A late answer is handed to subscribers instead.
        let late = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&late);
        let _handle = manager.subscribe(Topic::All, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        server.push_json(&json!({ "type": "site_status", "id": "stale" }));
        wait_until(|| late.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn disconnect_rejects_every_pending_request() {
        let mut server = MockWsServer::start().await;
        let manager = connected(&server, test_config()).await;

        let requests: Vec<_> = (0..3)
            .map(|n| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    manager
                        .send_and_wait_for_response(
                            OutboundMessage::new("report").with_data(json!({ "n": n })),
                            Duration::from_secs(5),
                        )
                        .await
                })
            })
            .collect();

        for _ in 0..3 {
            assert!(server.recv_domain_frame().await.is_some());
        }
        wait_until(|| manager.stats().pending_messages == 3).await;

        manager.disconnect().await.unwrap();

        for request in requests {
            let error = request.await.unwrap().unwrap_err();
            assert_eq!(error.kind(), Kind::Disconnected);
        }
        assert_eq!(manager.stats().pending_messages, 0);
    }

    #[tokio::test]
    async fn oversized_timeout_is_rejected_and_session_survives() {
        let mut server = MockWsServer::start().await;
        let manager = connected(&server, test_config()).await;
        let three_years = Duration::from_secs(3 * 365 * 24 * 60 * 60);

        let error = manager
            .send_and_wait_for_response(OutboundMessage::new("report"), three_years)
            .await
            .unwrap_err();

        assert_eq!(error.kind(), Kind::Validation);
        assert!(manager.state().is_open());
        assert_eq!(manager.stats().pending_messages, 0);

        manager.send(OutboundMessage::new("still_here")).unwrap();
        assert_eq!(
            server.recv_domain_frame().await.unwrap()["type"],
            "still_here"
        );
    }

    #[tokio::test]
    async fn request_while_closed_fails_immediately() {
        let server = MockWsServer::start().await;
        let manager = ConnectionManager::new(&server.http_url(), test_config()).unwrap();

        let error = manager
            .send_and_wait_for_response(OutboundMessage::new("report"), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert_eq!(error.kind(), Kind::Validation);
        assert_eq!(manager.stats().queued_messages, 0, "requests are never queued");
    }
}

mod dispatch {
    use super::*;

    #[tokio::test]
    async fn server_ping_is_answered_and_not_dispatched() {
        let mut server = MockWsServer::start().await;
        let manager = connected(&server, test_config()).await;

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let _handle = manager.subscribe(Topic::All, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        server.push_json(&json!({ "type": "ping" }));

        let frame = server.recv_frame().await.unwrap();
        assert_eq!(frame["type"], "pong");
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn notifications_reach_callbacks_and_streams() {
        let server = MockWsServer::start().await;
        let manager = connected(&server, test_config()).await;

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let _handle = manager.subscribe(MessageKind::Notification, move |message| {
            assert_eq!(message.data, Some(json!({ "title": "PSV due" })));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut stream = Box::pin(manager.messages(MessageKind::Notification));

        server.push_json(&json!({ "type": "inspection_updated" }));
        server.push_json(&json!({ "type": "notification", "data": { "title": "PSV due" } }));

        let message = tokio::time::timeout(common::WAIT, stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(message.kind, MessageKind::Notification);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribed_handler_stops_receiving() {
        let server = MockWsServer::start().await;
        let manager = connected(&server, test_config()).await;

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let handle = manager.subscribe("alert_raised", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        server.push_json(&json!({ "type": "alert_raised" }));
        wait_until(|| seen.load(Ordering::SeqCst) == 1).await;

        assert!(handle.unsubscribe());
        server.push_json(&json!({ "type": "alert_raised" }));
        sleep(Duration::from_millis(100)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_frame_is_reported_and_session_survives() {
        let mut server = MockWsServer::start().await;
        let manager = connected(&server, test_config()).await;
        let mut events = manager.events();

        server.push("{not json");

        let event = next_event(&mut events, |_| true).await;
        let ConnectionEvent::ProtocolError(record) = event else {
            panic!("expected a protocol error, got {event:?}");
        };
        assert_eq!(record.kind, Kind::Protocol);
        assert!(manager.state().is_open());

        manager.send(OutboundMessage::new("still_here")).unwrap();
        assert_eq!(
            server.recv_domain_frame().await.unwrap()["type"],
            "still_here"
        );
    }
}

mod heartbeat {
    use super::*;

    fn heartbeat_config(interval: Duration) -> Config {
        Config::builder()
            .heartbeat_interval(interval)
            .reconnect(
                ReconnectConfig::builder()
                    .max_attempts(3)
                    .initial_backoff(Duration::from_millis(50))
                    .build(),
            )
            .build()
    }

    #[tokio::test]
    async fn one_ping_per_interval_and_none_after_close() {
        let interval = Duration::from_millis(200);
        let mut server = MockWsServer::start().await;
        let manager = connected(&server, heartbeat_config(interval)).await;
        let mut events = manager.events();
        let opened = Instant::now();

        let mut arrivals = Vec::new();
        for _ in 0..4 {
            next_event(&mut events, |event| {
                matches!(event, ConnectionEvent::Heartbeat { .. })
            })
            .await;
            arrivals.push(Instant::now());
        }

        let pings = server
            .drain_frames()
            .into_iter()
            .filter(|frame| frame["type"] == "ping")
            .count();
        assert_eq!(pings, 4, "one ping per elapsed interval");

        let first = arrivals[0].duration_since(opened);
        assert!(
            first >= interval / 2 && first < interval * 3 / 2,
            "first ping after one interval, got {first:?}"
        );
        for pair in arrivals.windows(2) {
            let gap = pair[1].duration_since(pair[0]);
            assert!(
                gap >= interval / 2 && gap < interval * 3 / 2,
                "pings must be one interval apart, got {gap:?}"
            );
        }

        manager.disconnect().await.unwrap();
        sleep(Duration::from_millis(50)).await;
        server.drain_frames();

        sleep(interval * 3).await;
        assert!(
            server.drain_frames().is_empty(),
            "no pings may be sent after close"
        );
    }

    #[tokio::test]
    async fn silent_server_is_force_closed() {
        let server = MockWsServer::start_silent().await;
        let manager = connected(&server, heartbeat_config(Duration::from_millis(50))).await;
        let mut events = manager.events();

        let event = next_event(&mut events, |event| {
            matches!(event, ConnectionEvent::Disconnected { .. })
        })
        .await;
        assert_eq!(
            event,
            ConnectionEvent::Disconnected {
                code: HEARTBEAT_TIMEOUT_CLOSE_CODE,
                reason: "heartbeat timeout".to_owned(),
                manual: false,
            }
        );
        assert!(matches!(
            next_event(&mut events, |_| true).await,
            ConnectionEvent::ReconnectScheduled { attempt: 1, .. }
        ));
    }

    #[tokio::test]
    async fn liveness_check_can_be_disabled() {
        let server = MockWsServer::start_silent().await;
        let config = Config::builder()
            .heartbeat_interval(Duration::from_millis(50))
            .max_missed_heartbeats(0)
            .build();
        let manager = connected(&server, config).await;
        let mut events = manager.events();

        let seen = collect_events(&mut events, Duration::from_millis(400)).await;
        assert!(seen.is_empty(), "unexpected events: {seen:?}");
        assert!(manager.state().is_open());
    }
}

mod reconnect {
    use super::*;

    #[tokio::test]
    async fn abnormal_close_reconnects_and_resets_attempts() {
        let mut server = MockWsServer::start().await;
        let manager = connected(&server, test_config()).await;
        let mut events = manager.events();
        assert!(server.next_connection().await.is_some());

        server.hangup_all();

        let disconnected = next_event(&mut events, |event| {
            matches!(event, ConnectionEvent::Disconnected { .. })
        })
        .await;
        assert!(matches!(
            disconnected,
            ConnectionEvent::Disconnected { manual: false, .. }
        ));
        assert_eq!(
            next_event(&mut events, |_| true).await,
            ConnectionEvent::ReconnectScheduled {
                attempt: 1,
                delay: Duration::from_millis(50),
            }
        );
        assert_eq!(
            next_event(&mut events, |_| true).await,
            ConnectionEvent::Connected
        );

        let uri = server.next_connection().await.unwrap();
        assert!(
            uri.contains(&format!("session_id={}", manager.session_id())),
            "reconnect keeps the session id"
        );
        wait_until(|| manager.stats().reconnect_attempts == 0).await;
        assert!(manager.state().is_open());
    }

    #[tokio::test]
    async fn queued_messages_survive_a_reconnect() {
        let mut server = MockWsServer::start().await;
        let manager = connected(&server, test_config()).await;
        let mut events = manager.events();

        server.hangup_all();
        next_event(&mut events, |event| {
            matches!(event, ConnectionEvent::Disconnected { .. })
        })
        .await;

        manager.send(OutboundMessage::new("offline_edit")).unwrap();
        next_event(&mut events, |event| matches!(event, ConnectionEvent::Connected)).await;

        assert_eq!(
            server.recv_domain_frame().await.unwrap()["type"],
            "offline_edit"
        );
    }

    #[tokio::test]
    async fn attempts_are_capped_with_growing_delays() {
        let server = MockWsServer::start().await;
        let manager = connected(&server, test_config()).await;
        let mut events = manager.events();

        server.shutdown().await;

        let exhausted = next_event(&mut events, |event| {
            matches!(event, ConnectionEvent::ReconnectExhausted { .. })
        })
        .await;
        assert_eq!(exhausted, ConnectionEvent::ReconnectExhausted { attempts: 3 });

        let later = collect_events(&mut events, Duration::from_millis(600)).await;
        assert!(
            later.is_empty(),
            "nothing is scheduled after exhaustion: {later:?}"
        );
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(manager.stats().reconnect_attempts, 3);
        assert_eq!(manager.last_error().unwrap().kind, Kind::Connection);
    }

    #[tokio::test]
    async fn reconnect_delays_follow_the_backoff_schedule() {
        let server = MockWsServer::start().await;
        let manager = connected(&server, test_config()).await;
        let mut events = manager.events();

        server.shutdown().await;

        let mut delays = Vec::new();
        loop {
            match next_event(&mut events, |_| true).await {
                ConnectionEvent::ReconnectScheduled { attempt, delay } => {
                    assert_eq!(attempt, u32::try_from(delays.len() + 1).unwrap());
                    delays.push(delay);
                }
                ConnectionEvent::ReconnectExhausted { .. } => break,
                _ => {}
            }
        }

        assert_eq!(delays.len(), 3);
        assert_eq!(delays[0], Duration::from_millis(50));
        assert!(
            delays.windows(2).all(|pair| pair[0] <= pair[1]),
            "delays must not shrink: {delays:?}"
        );
        assert!(delays[2] > delays[0]);
    }

    fn fast_reconnect(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig::builder()
            .max_attempts(max_attempts)
            .initial_backoff(Duration::from_millis(20))
            .max_backoff(Duration::from_millis(100))
            .build()
    }

    #[tokio::test]
    async fn explicit_connect_after_exhaustion_reopens_the_session() {
        let server = MockWsServer::start().await;
        let addr = server.addr();
        // Default attempts and breaker threshold are both five.
        let config = Config::builder()
            .connect_timeout(Duration::from_secs(2))
            .reconnect(fast_reconnect(5))
            .build();
        let manager = connected(&server, config).await;
        let mut events = manager.events();

        server.shutdown().await;
        drop(server);

        let exhausted = next_event(&mut events, |event| {
            matches!(event, ConnectionEvent::ReconnectExhausted { .. })
        })
        .await;
        assert_eq!(exhausted, ConnectionEvent::ReconnectExhausted { attempts: 5 });
        assert_eq!(
            manager.recovery().circuit_breaker_state(),
            CircuitState::Open
        );

        let mut restarted = MockWsServer::start_on(addr).await;
        manager.connect(TOKEN.to_owned()).await.unwrap();

        assert!(restarted.next_connection().await.is_some());
        assert!(manager.state().is_open());
        assert_eq!(
            manager.recovery().circuit_breaker_state(),
            CircuitState::Closed
        );
        assert_eq!(manager.stats().reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn breaker_rejections_do_not_use_up_attempts() {
        let server = MockWsServer::start().await;
        let recovery = ErrorRecoveryManager::new(
            RecoveryConfig::builder()
                .circuit_breaker(
                    CircuitBreakerConfig::builder()
                        .failure_threshold(2)
                        .cooldown(Duration::from_millis(150))
                        .build(),
                )
                .build(),
        );
        let config = Config::builder()
            .connect_timeout(Duration::from_secs(2))
            .reconnect(fast_reconnect(4))
            .build();
        let manager =
            ConnectionManager::with_recovery(&server.http_url(), config, recovery).unwrap();
        manager.connect(TOKEN.to_owned()).await.unwrap();
        let mut events = manager.events();

        server.shutdown().await;

        let mut scheduled = Vec::new();
        let mut dialled = 0;
        let mut rejected = 0;
        loop {
            match next_event(&mut events, |_| true).await {
                ConnectionEvent::ReconnectScheduled { attempt, .. } => scheduled.push(attempt),
                ConnectionEvent::ConnectionError(record) if record.kind == Kind::CircuitOpen => {
                    rejected += 1;
                }
                ConnectionEvent::ConnectionError(_) => dialled += 1,
                ConnectionEvent::ReconnectExhausted { attempts } => {
                    assert_eq!(attempts, 4);
                    break;
                }
                _ => {}
            }
        }

        assert!(rejected > 0, "the breaker opened between attempts");
        assert_eq!(dialled, 4, "every counted attempt reached the network");
        scheduled.dedup();
        assert_eq!(scheduled, vec![1, 2, 3, 4]);
    }
}
