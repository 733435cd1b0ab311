// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// A security-relevant event waiting to be uploaded.
///
/// Built by value and immutable once handed to the buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    name: String,
    timestamp: DateTime<Utc>,
    properties: BTreeMap<String, String>,
    user_identifiers: BTreeMap<String, String>,
}

impl Event {
    /// Creates an event timestamped now.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timestamp: Utc::now(),
            properties: BTreeMap::new(),
            user_identifiers: BTreeMap::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_properties(mut self, properties: BTreeMap<String, String>) -> Self {
        self.properties = properties;
        self
    }

    /// Associates the user identifiers. An empty map leaves the event unchanged.
    pub fn with_user_identifiers(mut self, user_identifiers: BTreeMap<String, String>) -> Self {
        if !user_identifiers.is_empty() {
            self.user_identifiers = user_identifiers;
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timestamp(&self) -> &DateTime<Utc> {
        &self.timestamp
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn user_identifiers(&self) -> &BTreeMap<String, String> {
        &self.user_identifiers
    }
}
