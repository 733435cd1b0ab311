// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Backend HTTP API description: endpoints, headers and JSON documents.
//!
//! The collector owns the payload schema. The types below only model the
//! fields the agent reads or needs to send; unknown response fields are
//! ignored and decoding never fails on them.

use crate::buffer::EventBatch;
use crate::event::Event;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const DEFAULT_BASE_URL: &str = "https://back.sqreen.com";

/// Header carrying the access token (login only). Header names are lowercase
/// as required by `HeaderName::from_static`.
pub const HEADER_TOKEN: &str = "x-api-key";
/// Header carrying the application name (login only).
pub const HEADER_APP_NAME: &str = "x-app-name";
/// Header carrying the session key (heartbeat, batch, logout).
pub const HEADER_SESSION: &str = "x-session-key";

/// One backend operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: &'static str,
    pub method: Method,
    pub path: &'static str,
}

pub const APP_LOGIN: Endpoint = Endpoint {
    name: "app-login",
    method: Method::POST,
    path: "/sqreen/v1/app-login",
};

pub const APP_LOGOUT: Endpoint = Endpoint {
    name: "app-logout",
    method: Method::GET,
    path: "/sqreen/v0/app-logout",
};

pub const APP_BEAT: Endpoint = Endpoint {
    name: "app-beat",
    method: Method::POST,
    path: "/sqreen/v1/app-beat",
};

pub const BATCH: Endpoint = Endpoint {
    name: "batch",
    method: Method::POST,
    path: "/sqreen/v0/batch",
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppLoginRequest {
    pub agent_type: String,
    pub agent_version: String,
    pub os_type: String,
    pub hostname: String,
    pub runtime_type: String,
    pub various_infos: VariousInfos,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariousInfos {
    pub time: DateTime<Utc>,
    pub pid: u32,
    pub name: String,
}

impl AppLoginRequest {
    /// Describes the running process.
    pub fn for_current_process() -> Self {
        let name = std::env::current_exe()
            .ok()
            .and_then(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_default();
        Self {
            agent_type: "rust".to_string(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            os_type: format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS),
            hostname: std::env::var("HOSTNAME").unwrap_or_default(),
            runtime_type: "rust".to_string(),
            various_infos: VariousInfos {
                time: Utc::now(),
                pid: std::process::id(),
                name,
            },
        }
    }
}

/// Session parameters the backend may tune.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Features {
    /// Seconds between heartbeats. Absent or non-positive means "use the default".
    pub heartbeat_delay: Option<i64>,
    pub batch_size: Option<u32>,
    pub max_staleness: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandRequest {
    pub uuid: String,
    pub name: String,
    pub params: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppLoginResponse {
    pub status: bool,
    pub session_id: String,
    pub features: Features,
    pub commands: Vec<CommandRequest>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppBeatRequest {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub command_results: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppBeatResponse {
    /// `false` when the backend no longer recognizes the session.
    pub status: bool,
    pub commands: Vec<CommandRequest>,
    pub features: Option<Features>,
}

impl AppBeatResponse {
    pub fn heartbeat_delay(&self) -> Option<i64> {
        self.features.as_ref().and_then(|f| f.heartbeat_delay)
    }
}

/// JSON body of a batch upload.
#[derive(Debug, Serialize)]
pub(crate) struct BatchRequest<'a> {
    pub batch: Vec<BatchEvent<'a>>,
}

#[derive(Debug, Serialize)]
pub(crate) struct BatchEvent<'a> {
    pub event_type: &'static str,
    pub event: &'a str,
    pub time: &'a DateTime<Utc>,
    pub options: BatchEventOptions<'a>,
}

#[derive(Debug, Serialize)]
pub(crate) struct BatchEventOptions<'a> {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub user_identifiers: &'a BTreeMap<String, String>,
}

impl<'a> From<&'a Event> for BatchEvent<'a> {
    fn from(event: &'a Event) -> Self {
        Self {
            event_type: "track",
            event: event.name(),
            time: event.timestamp(),
            options: BatchEventOptions {
                properties: event.properties(),
                user_identifiers: event.user_identifiers(),
            },
        }
    }
}

impl<'a> From<&'a EventBatch> for BatchRequest<'a> {
    fn from(batch: &'a EventBatch) -> Self {
        Self {
            batch: batch.iter().map(BatchEvent::from).collect(),
        }
    }
}
