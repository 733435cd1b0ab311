// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Backend synchronization core of the Sqreen agent.
//!
//! The agent logs in to the Sqreen backend, keeps its session alive with
//! periodic heartbeats and uploads the security events buffered by the host
//! application in bounded batches. Transient network failures are retried
//! with an exponential backoff; event producers never wait on the network.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent;
pub mod api;
pub mod buffer;
pub mod client;
pub mod config;
pub mod errors;
pub mod event;
pub mod retry;
pub mod session;
pub mod transport;

pub use agent::{Agent, AgentError, AgentHandle};
pub use buffer::{EventBatch, EventBuffer, MAX_EVENTS_PER_HEARTBEAT};
pub use client::{BackendClient, BackendError};
pub use config::{AgentConfig, ConfigError};
pub use errors::{ContextError, ErrorCollection};
pub use event::Event;
pub use retry::{Backoff, RetryController, RetryError, RetryPolicy};
pub use session::{Scheduler, SchedulerStats, SessionOutcome, SessionState};
