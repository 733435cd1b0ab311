// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Session and heartbeat scheduler.
//!
//! A single task owns the session: it logs in, then on every heartbeat tick
//! uploads the buffered events and sends a heartbeat, and finally logs out
//! when the shutdown token fires. Every backend call goes through the retry
//! controller sharing that same token, so shutdown interrupts any backoff.

use crate::api::{AppBeatRequest, AppBeatResponse, AppLoginRequest, CommandRequest};
use crate::buffer::{EventBatch, EventBuffer};
use crate::client::{self, BackendClient};
use crate::config::AgentConfig;
use crate::errors::{self, ErrorCollection};
use crate::retry::{RetryController, RetryError};
use derive_more::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const STATE_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle of the backend session.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    LoggingIn,
    Active,
    LoggingOut,
    Terminated,
}

/// Why the scheduler stopped.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The shutdown signal was received.
    Shutdown,
    /// The backend refused the agent; it stays off until restarted.
    Disabled,
}

/// An authenticated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    session_key: String,
    heartbeat_delay: Duration,
    app_name: String,
}

impl Session {
    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn heartbeat_delay(&self) -> Duration {
        self.heartbeat_delay
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }
}

/// Heartbeat delay from a backend value in seconds. Missing, zero and
/// negative values fall back to `default`.
pub fn resolve_heartbeat_delay(seconds: Option<i64>, default: Duration) -> Duration {
    match seconds {
        Some(secs) if secs > 0 => Duration::from_secs(secs.unsigned_abs()),
        _ => default,
    }
}

/// Scheduler counters. Cancelled calls are not failures.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    logins: AtomicU64,
    heartbeats: AtomicU64,
    batches_sent: AtomicU64,
    batches_dropped: AtomicU64,
    events_sent: AtomicU64,
    events_dropped: AtomicU64,
    failed_calls: AtomicU64,
}

impl SchedulerStats {
    pub fn logins(&self) -> u64 {
        self.logins.load(Ordering::Relaxed)
    }

    pub fn heartbeats(&self) -> u64 {
        self.heartbeats.load(Ordering::Relaxed)
    }

    pub fn batches_sent(&self) -> u64 {
        self.batches_sent.load(Ordering::Relaxed)
    }

    pub fn batches_dropped(&self) -> u64 {
        self.batches_dropped.load(Ordering::Relaxed)
    }

    pub fn events_sent(&self) -> u64 {
        self.events_sent.load(Ordering::Relaxed)
    }

    /// Events lost because their batch could not be uploaded.
    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    pub fn failed_calls(&self) -> u64 {
        self.failed_calls.load(Ordering::Relaxed)
    }

    fn record_batch_sent(&self, events: usize) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.events_sent.fetch_add(events as u64, Ordering::Relaxed);
    }

    fn record_batch_dropped(&self, events: usize) {
        self.batches_dropped.fetch_add(1, Ordering::Relaxed);
        self.events_dropped.fetch_add(events as u64, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failed_calls.fetch_add(1, Ordering::Relaxed);
    }
}

enum LoginResult {
    Active(Session),
    Disabled,
    RetryLater,
    Cancelled,
}

enum SessionEnd {
    /// The backend no longer accepts the session.
    Invalidated,
    /// Shutdown requested. `pending` holds a batch whose upload was interrupted.
    Shutdown { session: Session, pending: EventBatch },
}

pub struct Scheduler {
    config: Arc<AgentConfig>,
    client: BackendClient,
    buffer: Arc<EventBuffer>,
    retry: RetryController,
    shutdown: CancellationToken,
    stats: Arc<SchedulerStats>,
    transitions: broadcast::Sender<SessionState>,
    current: watch::Sender<SessionState>,
}

impl Scheduler {
    pub fn new(
        config: Arc<AgentConfig>,
        client: BackendClient,
        buffer: Arc<EventBuffer>,
        shutdown: CancellationToken,
    ) -> Self {
        let retry = RetryController::new(config.retry.clone(), shutdown.clone());
        let (transitions, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        let (current, _) = watch::channel(SessionState::Unauthenticated);
        Self {
            config,
            client,
            buffer,
            retry,
            shutdown,
            stats: Arc::new(SchedulerStats::default()),
            transitions,
            current,
        }
    }

    /// Receives every state change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionState> {
        self.transitions.subscribe()
    }

    /// Tracks the latest state only.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.current.subscribe()
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        Arc::clone(&self.stats)
    }

    /// Drives the session until shutdown or until the backend disables the agent.
    pub async fn run(self) -> SessionOutcome {
        loop {
            self.transition(SessionState::LoggingIn);
            let session = match self.login().await {
                LoginResult::Active(session) => session,
                LoginResult::Disabled => {
                    self.transition(SessionState::Terminated);
                    return SessionOutcome::Disabled;
                }
                LoginResult::Cancelled => {
                    self.transition(SessionState::Terminated);
                    return SessionOutcome::Shutdown;
                }
                LoginResult::RetryLater => {
                    self.transition(SessionState::Unauthenticated);
                    if !self.pause(self.config.default_heartbeat_delay).await {
                        self.transition(SessionState::Terminated);
                        return SessionOutcome::Shutdown;
                    }
                    continue;
                }
            };

            self.transition(SessionState::Active);
            match self.heartbeat_loop(session).await {
                SessionEnd::Invalidated => {
                    self.transition(SessionState::Unauthenticated);
                }
                SessionEnd::Shutdown { session, pending } => {
                    self.transition(SessionState::LoggingOut);
                    self.logout(session, pending).await;
                    self.transition(SessionState::Terminated);
                    return SessionOutcome::Shutdown;
                }
            }
        }
    }

    fn transition(&self, next: SessionState) {
        let previous = self.current.send_replace(next);
        debug!(from = %previous, to = %next, "session state changed");
        // No subscriber is fine.
        let _ = self.transitions.send(next);
    }

    /// Sleeps for `delay` unless shutdown comes first. Returns false on shutdown.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn login(&self) -> LoginResult {
        let request = AppLoginRequest::for_current_process();
        let backend = &self.client;
        let token = self.config.token.as_str();
        let app_name = self.config.app_name.as_str();

        let result = self
            .retry
            .run(
                || backend.login(&request, token, app_name),
                client::is_retryable,
            )
            .await;

        let response = match result {
            Ok(response) => response,
            Err(RetryError::Cancelled) => return LoginResult::Cancelled,
            Err(RetryError::Exhausted { attempts, error }) => {
                self.stats.record_failure();
                warn!(
                    attempts,
                    error = %error,
                    retry_in_ms = self.config.default_heartbeat_delay.as_millis() as u64,
                    "could not reach the backend to log in"
                );
                return LoginResult::RetryLater;
            }
            Err(RetryError::Fatal(error)) => {
                self.stats.record_failure();
                error!(
                    error = %error,
                    info = ?errors::info(&error),
                    "login failed permanently, disabling the agent"
                );
                return LoginResult::Disabled;
            }
        };

        if !response.status {
            self.stats.record_failure();
            error!("login refused by the backend, disabling the agent");
            return LoginResult::Disabled;
        }
        if response.session_id.is_empty() {
            self.stats.record_failure();
            error!("login response carries no session key, disabling the agent");
            return LoginResult::Disabled;
        }

        self.stats.logins.fetch_add(1, Ordering::Relaxed);
        log_commands(&response.commands);
        let heartbeat_delay = resolve_heartbeat_delay(
            response.features.heartbeat_delay,
            self.config.default_heartbeat_delay,
        );
        info!(
            heartbeat_delay_ms = heartbeat_delay.as_millis() as u64,
            "logged in to the backend"
        );
        LoginResult::Active(Session {
            session_key: response.session_id,
            heartbeat_delay,
            app_name: self.config.app_name.clone(),
        })
    }

    async fn heartbeat_loop(&self, mut session: Session) -> SessionEnd {
        loop {
            if !self.pause(session.heartbeat_delay).await {
                return SessionEnd::Shutdown {
                    session,
                    pending: EventBatch::default(),
                };
            }

            let batch = self.buffer.flush();
            if !batch.is_empty() {
                let uploaded = self.upload(&batch, &session).await;
                match uploaded {
                    Ok(()) => {
                        debug!(events = batch.len(), "event batch uploaded");
                        self.stats.record_batch_sent(batch.len());
                    }
                    Err(RetryError::Cancelled) => {
                        return SessionEnd::Shutdown {
                            session,
                            pending: batch,
                        };
                    }
                    Err(err) => {
                        self.stats.record_failure();
                        self.stats.record_batch_dropped(batch.len());
                        warn!(events = batch.len(), error = %err, "dropping event batch");
                    }
                }
            }

            let beat = self.beat(&session).await;
            match beat {
                Ok(response) if !response.status => {
                    warn!("the backend no longer recognizes the session, logging in again");
                    return SessionEnd::Invalidated;
                }
                Ok(response) => {
                    self.stats.heartbeats.fetch_add(1, Ordering::Relaxed);
                    log_commands(&response.commands);
                    if let Some(secs) = response.heartbeat_delay().filter(|secs| *secs > 0) {
                        let delay = resolve_heartbeat_delay(Some(secs), session.heartbeat_delay);
                        if delay != session.heartbeat_delay {
                            debug!(
                                heartbeat_delay_ms = delay.as_millis() as u64,
                                "heartbeat delay updated"
                            );
                            session.heartbeat_delay = delay;
                        }
                    }
                }
                Err(RetryError::Cancelled) => {
                    return SessionEnd::Shutdown {
                        session,
                        pending: EventBatch::default(),
                    };
                }
                Err(RetryError::Fatal(error)) if !client::is_unauthorized(&error) => {
                    self.stats.record_failure();
                    error!(error = %error, "heartbeat failed, keeping the session");
                }
                Err(err) => {
                    self.stats.record_failure();
                    warn!(error = %err, "heartbeat failed, logging in again");
                    return SessionEnd::Invalidated;
                }
            }
        }
    }

    async fn upload(&self, batch: &EventBatch, session: &Session) -> Result<(), RetryError> {
        let backend = &self.client;
        let key = session.session_key();
        self.retry
            .run(|| backend.batch(batch, key), client::is_retryable)
            .await
    }

    async fn beat(&self, session: &Session) -> Result<AppBeatResponse, RetryError> {
        let backend = &self.client;
        let key = session.session_key();
        let request = AppBeatRequest::default();
        self.retry
            .run(|| backend.heartbeat(&request, key), client::is_retryable)
            .await
    }

    /// Best-effort flush and logout, bounded by the logout timeout.
    async fn logout(&self, session: Session, pending: EventBatch) {
        let backend = &self.client;
        let stats = &self.stats;
        let key = session.session_key();
        let batches = [pending, self.buffer.flush()];
        let sequence = async move {
            let mut errs = ErrorCollection::new();
            for batch in batches {
                if batch.is_empty() {
                    continue;
                }
                match backend.batch(&batch, key).await {
                    Ok(()) => stats.record_batch_sent(batch.len()),
                    Err(err) => {
                        stats.record_failure();
                        stats.record_batch_dropped(batch.len());
                        errs.add(errors::extend_info(err, [("attempt", "1")]));
                    }
                }
            }
            if let Err(err) = backend.logout(key).await {
                stats.record_failure();
                errs.add(errors::extend_info(err, [("attempt", "1")]));
            }
            errs
        };

        match tokio::time::timeout(self.config.logout_timeout, sequence).await {
            Ok(errs) => match errs.into_result() {
                Ok(()) => info!("logged out from the backend"),
                Err(errs) => warn!(failures = errs.len(), error = %errs, "logout sequence failed"),
            },
            Err(_) => warn!(
                timeout_ms = self.config.logout_timeout.as_millis() as u64,
                "logout sequence timed out"
            ),
        }
    }
}

fn log_commands(commands: &[CommandRequest]) {
    for command in commands {
        debug!(uuid = %command.uuid, name = %command.name, "ignoring backend command");
    }
}
