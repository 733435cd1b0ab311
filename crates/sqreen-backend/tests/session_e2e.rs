// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use mockito::{Matcher, Mock, Server, ServerGuard};
use serde_json::json;
use sqreen_backend::{
    Agent, AgentConfig, Backoff, BackendClient, Event, EventBuffer, RetryPolicy, Scheduler,
    SessionOutcome, SessionState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const LOGIN_PATH: &str = "/sqreen/v1/app-login";
const BEAT_PATH: &str = "/sqreen/v1/app-beat";
const BATCH_PATH: &str = "/sqreen/v0/batch";
const LOGOUT_PATH: &str = "/sqreen/v0/app-logout";
const SESSION_KEY: &str = "session-key";
const WAIT_LIMIT: Duration = Duration::from_secs(10);

fn test_config(server: &ServerGuard) -> AgentConfig {
    AgentConfig {
        base_url: server.url(),
        token: "test-token".to_string(),
        app_name: "test-app".to_string(),
        request_timeout: Duration::from_secs(2),
        retry: RetryPolicy {
            period: Duration::from_secs(1),
            backoff: Backoff {
                rate: 2.0,
                min: Duration::from_millis(1),
                max: Duration::from_millis(50),
            },
        },
        default_heartbeat_delay: Duration::from_millis(50),
        logout_timeout: Duration::from_millis(800),
        ..Default::default()
    }
}

async fn mock_login(server: &mut ServerGuard, features: serde_json::Value) -> Mock {
    server
        .mock("POST", LOGIN_PATH)
        .match_header("x-api-key", "test-token")
        .match_header("x-app-name", "test-app")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "status": true,
                "session_id": SESSION_KEY,
                "features": features,
            })
            .to_string(),
        )
        .create_async()
        .await
}

async fn mock_heartbeat_ok(server: &mut ServerGuard) -> Mock {
    server
        .mock("POST", BEAT_PATH)
        .match_header("x-session-key", SESSION_KEY)
        .with_status(200)
        .with_body(json!({"status": true, "commands": []}).to_string())
        .create_async()
        .await
}

async fn mock_logout(server: &mut ServerGuard) -> Mock {
    server
        .mock("GET", LOGOUT_PATH)
        .match_header("x-session-key", SESSION_KEY)
        .with_status(200)
        .create_async()
        .await
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT_LIMIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition should be met in time");
}

fn scheduler_for(config: AgentConfig, shutdown: CancellationToken) -> Scheduler {
    let config = Arc::new(config);
    let client = BackendClient::new(&config).expect("client should build");
    Scheduler::new(config, client, Arc::new(EventBuffer::default()), shutdown)
}

#[tokio::test]
async fn zero_heartbeat_delay_uses_the_configured_default() {
    let mut server = Server::new_async().await;
    let _login = mock_login(&mut server, json!({"heartbeat_delay": 0})).await;
    let _beat = mock_heartbeat_ok(&mut server).await;
    let _logout = mock_logout(&mut server).await;

    let handle = Agent::new(test_config(&server))
        .start()
        .expect("agent should start");
    tokio::time::sleep(Duration::from_millis(500)).await;
    let heartbeats = handle.stats().heartbeats();
    assert_eq!(handle.stop().await, SessionOutcome::Shutdown);

    // A zero delay taken literally would produce hundreds of heartbeats.
    assert!(heartbeats >= 2, "too few heartbeats: {heartbeats}");
    assert!(heartbeats <= 20, "too many heartbeats: {heartbeats}");
}

#[tokio::test]
async fn heartbeat_exhaustion_leads_to_a_fresh_login() {
    let mut server = Server::new_async().await;
    let login = server
        .mock("POST", LOGIN_PATH)
        .with_status(200)
        .with_body(json!({"status": true, "session_id": SESSION_KEY}).to_string())
        .expect_at_least(2)
        .create_async()
        .await;
    let _beat = server
        .mock("POST", BEAT_PATH)
        .with_status(503)
        .create_async()
        .await;
    let _logout = mock_logout(&mut server).await;

    let shutdown = CancellationToken::new();
    let scheduler = scheduler_for(test_config(&server), shutdown.clone());
    let mut transitions = scheduler.subscribe();
    let stats = scheduler.stats();
    let task = tokio::spawn(scheduler.run());

    let mut seen = Vec::new();
    timeout(WAIT_LIMIT, async {
        while seen.iter().filter(|s| **s == SessionState::Active).count() < 2 {
            let state = transitions.recv().await.expect("scheduler should be running");
            seen.push(state);
        }
    })
    .await
    .expect("the scheduler should log in twice");

    assert_eq!(
        seen,
        [
            SessionState::LoggingIn,
            SessionState::Active,
            SessionState::Unauthenticated,
            SessionState::LoggingIn,
            SessionState::Active,
        ]
    );

    shutdown.cancel();
    let outcome = task.await.expect("scheduler should not panic");
    assert_eq!(outcome, SessionOutcome::Shutdown);
    assert!(stats.logins() >= 2);
    assert!(stats.failed_calls() >= 1);
    login.assert_async().await;
}

#[tokio::test]
async fn unauthorized_login_disables_the_agent() {
    let mut server = Server::new_async().await;
    let login = server
        .mock("POST", LOGIN_PATH)
        .with_status(401)
        .expect(1)
        .create_async()
        .await;
    let beat = server
        .mock("POST", BEAT_PATH)
        .expect(0)
        .create_async()
        .await;

    let scheduler = scheduler_for(test_config(&server), CancellationToken::new());
    let mut transitions = scheduler.subscribe();
    let stats = scheduler.stats();

    let outcome = timeout(WAIT_LIMIT, scheduler.run())
        .await
        .expect("login failure should end the scheduler");

    assert_eq!(outcome, SessionOutcome::Disabled);
    assert_eq!(transitions.recv().await.ok(), Some(SessionState::LoggingIn));
    assert_eq!(transitions.recv().await.ok(), Some(SessionState::Terminated));
    assert_eq!(stats.logins(), 0);
    assert_eq!(stats.failed_calls(), 1);
    login.assert_async().await;
    beat.assert_async().await;
}

#[tokio::test]
async fn refused_login_disables_the_agent() {
    let mut server = Server::new_async().await;
    let _login = server
        .mock("POST", LOGIN_PATH)
        .with_status(200)
        .with_body(json!({"status": false}).to_string())
        .create_async()
        .await;

    let scheduler = scheduler_for(test_config(&server), CancellationToken::new());
    let outcome = timeout(WAIT_LIMIT, scheduler.run())
        .await
        .expect("a refused login should end the scheduler");
    assert_eq!(outcome, SessionOutcome::Disabled);
}

#[tokio::test]
async fn shutdown_uploads_pending_events_then_logs_out() {
    let mut server = Server::new_async().await;
    let _login = mock_login(&mut server, json!({"heartbeat_delay": 3600})).await;
    let beat = server
        .mock("POST", BEAT_PATH)
        .expect(0)
        .create_async()
        .await;
    let batch = server
        .mock("POST", BATCH_PATH)
        .match_header("x-session-key", SESSION_KEY)
        .match_body(Matcher::PartialJson(json!({
            "batch": [
                {"event_type": "track", "event": "first"},
                {"event_type": "track", "event": "second"},
            ]
        })))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;
    let logout = server
        .mock("GET", LOGOUT_PATH)
        .match_header("x-session-key", SESSION_KEY)
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let handle = Agent::new(test_config(&server))
        .start()
        .expect("agent should start");
    let mut state = handle.watch_state();
    timeout(WAIT_LIMIT, state.wait_for(|s| *s == SessionState::Active))
        .await
        .expect("the agent should log in")
        .expect("scheduler should be running");

    assert!(handle.track(Event::new("first")));
    assert!(handle.track(Event::new("second")));
    let mut transitions = handle.subscribe();
    assert_eq!(handle.stop().await, SessionOutcome::Shutdown);

    batch.assert_async().await;
    logout.assert_async().await;
    beat.assert_async().await;
    assert_eq!(transitions.recv().await.ok(), Some(SessionState::LoggingOut));
    assert_eq!(transitions.recv().await.ok(), Some(SessionState::Terminated));
}

#[tokio::test]
async fn failed_batches_are_dropped_and_heartbeats_continue() {
    let mut server = Server::new_async().await;
    let _login = mock_login(&mut server, json!({})).await;
    let _beat = mock_heartbeat_ok(&mut server).await;
    let _logout = mock_logout(&mut server).await;
    let batch = server
        .mock("POST", BATCH_PATH)
        .with_status(400)
        .expect(1)
        .create_async()
        .await;

    let handle = Agent::new(test_config(&server))
        .start()
        .expect("agent should start");
    for name in ["a", "b", "c"] {
        assert!(handle.track(Event::new(name)));
    }

    wait_until(|| handle.stats().heartbeats() >= 2).await;
    assert_eq!(handle.state(), SessionState::Active);
    assert_eq!(handle.stats().batches_dropped(), 1);
    assert_eq!(handle.stats().events_dropped(), 3);
    assert_eq!(handle.stats().batches_sent(), 0);

    assert_eq!(handle.stop().await, SessionOutcome::Shutdown);
    batch.assert_async().await;
}

async fn next_states_until(
    transitions: &mut tokio::sync::broadcast::Receiver<SessionState>,
    mut done: impl FnMut(&[SessionState]) -> bool,
) -> Vec<SessionState> {
    let mut seen = Vec::new();
    timeout(WAIT_LIMIT, async {
        while !done(&seen) {
            let state = transitions.recv().await.expect("scheduler should be running");
            seen.push(state);
        }
    })
    .await
    .expect("transitions should arrive in time");
    seen
}

#[tokio::test]
async fn login_exhaustion_keeps_trying_instead_of_terminating() {
    let mut server = Server::new_async().await;
    let login = server
        .mock("POST", LOGIN_PATH)
        .with_status(503)
        .expect_at_least(2)
        .create_async()
        .await;
    let logout = server
        .mock("GET", LOGOUT_PATH)
        .expect(0)
        .create_async()
        .await;

    let config = AgentConfig {
        retry: RetryPolicy {
            period: Duration::from_millis(200),
            backoff: Backoff {
                rate: 2.0,
                min: Duration::from_millis(1),
                max: Duration::from_millis(20),
            },
        },
        logout_timeout: Duration::from_millis(100),
        ..test_config(&server)
    };
    let shutdown = CancellationToken::new();
    let scheduler = scheduler_for(config, shutdown.clone());
    let mut transitions = scheduler.subscribe();
    let stats = scheduler.stats();
    let task = tokio::spawn(scheduler.run());

    let seen = next_states_until(&mut transitions, |seen| {
        seen.iter()
            .filter(|s| **s == SessionState::LoggingIn)
            .count()
            >= 3
    })
    .await;
    assert_eq!(
        seen,
        [
            SessionState::LoggingIn,
            SessionState::Unauthenticated,
            SessionState::LoggingIn,
            SessionState::Unauthenticated,
            SessionState::LoggingIn,
        ]
    );
    assert!(!task.is_finished());
    assert_eq!(stats.logins(), 0);
    assert!(stats.failed_calls() >= 2);

    shutdown.cancel();
    let outcome = timeout(WAIT_LIMIT, task)
        .await
        .expect("shutdown should end the scheduler")
        .expect("scheduler should not panic");
    assert_eq!(outcome, SessionOutcome::Shutdown);
    login.assert_async().await;
    logout.assert_async().await;
}

#[tokio::test]
async fn refused_heartbeat_discards_the_session() {
    let mut server = Server::new_async().await;
    let login = server
        .mock("POST", LOGIN_PATH)
        .with_status(200)
        .with_body(json!({"status": true, "session_id": SESSION_KEY}).to_string())
        .expect_at_least(2)
        .create_async()
        .await;
    let _beat = server
        .mock("POST", BEAT_PATH)
        .with_status(200)
        .with_body(json!({"status": false}).to_string())
        .create_async()
        .await;
    let _logout = mock_logout(&mut server).await;

    let shutdown = CancellationToken::new();
    let scheduler = scheduler_for(test_config(&server), shutdown.clone());
    let mut transitions = scheduler.subscribe();
    let stats = scheduler.stats();
    let task = tokio::spawn(scheduler.run());

    let seen = next_states_until(&mut transitions, |seen| seen.len() >= 4).await;
    assert_eq!(
        seen,
        [
            SessionState::LoggingIn,
            SessionState::Active,
            SessionState::Unauthenticated,
            SessionState::LoggingIn,
        ]
    );

    shutdown.cancel();
    let outcome = task.await.expect("scheduler should not panic");
    assert_eq!(outcome, SessionOutcome::Shutdown);
    assert_eq!(stats.heartbeats(), 0);
    login.assert_async().await;
}

#[tokio::test]
async fn positive_heartbeat_delay_from_a_heartbeat_replaces_the_current_one() {
    let mut server = Server::new_async().await;
    let _login = mock_login(&mut server, json!({})).await;
    let beat = server
        .mock("POST", BEAT_PATH)
        .match_header("x-session-key", SESSION_KEY)
        .with_status(200)
        .with_body(json!({"status": true, "features": {"heartbeat_delay": 3600}}).to_string())
        .expect(1)
        .create_async()
        .await;
    let _logout = mock_logout(&mut server).await;

    let handle = Agent::new(test_config(&server))
        .start()
        .expect("agent should start");
    wait_until(|| handle.stats().heartbeats() >= 1).await;
    // Ten default delays: the old 50 ms delay would have ticked again.
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(handle.stats().heartbeats(), 1);
    assert_eq!(handle.stop().await, SessionOutcome::Shutdown);
    beat.assert_async().await;
}

#[tokio::test]
async fn non_positive_heartbeat_delay_from_a_heartbeat_keeps_the_current_one() {
    for delay in [0, -5] {
        let mut server = Server::new_async().await;
        let _login = mock_login(&mut server, json!({})).await;
        let _beat = server
            .mock("POST", BEAT_PATH)
            .match_header("x-session-key", SESSION_KEY)
            .with_status(200)
            .with_body(
                json!({"status": true, "features": {"heartbeat_delay": delay}}).to_string(),
            )
            .create_async()
            .await;
        let _logout = mock_logout(&mut server).await;

        let handle = Agent::new(test_config(&server))
            .start()
            .expect("agent should start");
        wait_until(|| handle.stats().heartbeats() >= 3).await;
        assert_eq!(handle.state(), SessionState::Active);
        assert_eq!(handle.stop().await, SessionOutcome::Shutdown);
    }
}

#[tokio::test]
async fn failing_shutdown_calls_are_swallowed() {
    let mut server = Server::new_async().await;
    let _login = mock_login(&mut server, json!({"heartbeat_delay": 3600})).await;
    let batch = server
        .mock("POST", BATCH_PATH)
        .with_status(500)
        .expect(1)
        .create_async()
        .await;
    let logout = server
        .mock("GET", LOGOUT_PATH)
        .with_status(500)
        .expect(1)
        .create_async()
        .await;

    let handle = Agent::new(test_config(&server))
        .start()
        .expect("agent should start");
    let mut state = handle.watch_state();
    timeout(WAIT_LIMIT, state.wait_for(|s| *s == SessionState::Active))
        .await
        .expect("the agent should log in")
        .expect("scheduler should be running");

    assert!(handle.track(Event::new("pending")));
    let stats = handle.stats();
    let mut transitions = handle.subscribe();
    assert_eq!(handle.stop().await, SessionOutcome::Shutdown);

    assert_eq!(transitions.recv().await.ok(), Some(SessionState::LoggingOut));
    assert_eq!(transitions.recv().await.ok(), Some(SessionState::Terminated));
    assert_eq!(stats.batches_dropped(), 1);
    assert_eq!(stats.events_dropped(), 1);
    assert_eq!(stats.failed_calls(), 2);
    batch.assert_async().await;
    logout.assert_async().await;
}

#[tokio::test]
async fn hanging_logout_is_bounded_by_the_logout_timeout() {
    let mut server = Server::new_async().await;
    let _login = mock_login(&mut server, json!({"heartbeat_delay": 3600})).await;
    let _logout = server
        .mock("GET", LOGOUT_PATH)
        .with_status(200)
        .with_body_from_request(|_| {
            std::thread::sleep(Duration::from_secs(2));
            Vec::new()
        })
        .create_async()
        .await;

    let config = AgentConfig {
        logout_timeout: Duration::from_millis(300),
        ..test_config(&server)
    };
    let handle = Agent::new(config).start().expect("agent should start");
    let mut state = handle.watch_state();
    timeout(WAIT_LIMIT, state.wait_for(|s| *s == SessionState::Active))
        .await
        .expect("the agent should log in")
        .expect("scheduler should be running");

    let mut transitions = handle.subscribe();
    let started = std::time::Instant::now();
    assert_eq!(handle.stop().await, SessionOutcome::Shutdown);
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_millis(1500), "stop took {elapsed:?}");
    assert_eq!(transitions.recv().await.ok(), Some(SessionState::LoggingOut));
    assert_eq!(transitions.recv().await.ok(), Some(SessionState::Terminated));
}
