// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::buffer::EventBuffer;
use crate::client::{BackendClient, BackendError};
use crate::config::{AgentConfig, ConfigError};
use crate::event::Event;
use crate::session::{Scheduler, SchedulerStats, SessionOutcome, SessionState};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Errors that can occur when starting the agent
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build the backend client: {0}")]
    Client(#[from] BackendError),

    #[error("agent is disabled")]
    Disabled,
}

/// Entry point wiring the buffer, the backend client and the scheduler.
#[derive(Debug)]
pub struct Agent {
    config: AgentConfig,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Spawns the scheduler task on the current tokio runtime.
    ///
    /// Fails without any network call when the configuration is invalid or
    /// the agent is disabled.
    pub fn start(self) -> Result<AgentHandle, AgentError> {
        self.config.validate()?;
        if self.config.is_disabled() {
            info!("agent disabled, not connecting to the backend");
            return Err(AgentError::Disabled);
        }

        let config = Arc::new(self.config);
        let client = BackendClient::new(&config)?;
        let buffer = Arc::new(EventBuffer::new(config.max_events_per_heartbeat));
        let shutdown = CancellationToken::new();

        let scheduler = Scheduler::new(config, client, Arc::clone(&buffer), shutdown.clone());
        let transitions = scheduler.subscribe();
        let state = scheduler.watch_state();
        let stats = scheduler.stats();
        let task = tokio::spawn(scheduler.run());

        Ok(AgentHandle {
            buffer,
            shutdown,
            state,
            transitions,
            stats,
            task,
        })
    }
}

/// Handle to the running agent.
#[derive(Debug)]
pub struct AgentHandle {
    buffer: Arc<EventBuffer>,
    shutdown: CancellationToken,
    state: watch::Receiver<SessionState>,
    transitions: broadcast::Receiver<SessionState>,
    stats: Arc<SchedulerStats>,
    task: JoinHandle<SessionOutcome>,
}

impl AgentHandle {
    /// Queues `event` for the next heartbeat. Never blocks on the network.
    pub fn track(&self, event: Event) -> bool {
        self.buffer.enqueue(event)
    }

    /// Shared buffer for producers living on other threads.
    pub fn event_buffer(&self) -> Arc<EventBuffer> {
        Arc::clone(&self.buffer)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// State changes from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionState> {
        self.transitions.resubscribe()
    }

    /// Latest-state receiver, useful to wait for a given state.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Counters shared with the scheduler; still readable after [`stop`](Self::stop).
    pub fn stats(&self) -> Arc<SchedulerStats> {
        Arc::clone(&self.stats)
    }

    /// Signals shutdown and waits for the logout sequence to complete.
    pub async fn stop(self) -> SessionOutcome {
        self.shutdown.cancel();
        match self.task.await {
            Ok(outcome) => {
                info!(outcome = %outcome, "agent stopped");
                outcome
            }
            Err(e) => {
                error!("agent task failed: {}", e);
                SessionOutcome::Shutdown
            }
        }
    }
}
