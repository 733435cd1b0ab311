// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::event::Event;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

pub const MAX_EVENTS_PER_HEARTBEAT: usize = 1000;

/// Ordered events detached from the buffer by one flush.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventBatch {
    events: Vec<Event>,
}

impl EventBatch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.events.iter()
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
    }
}

impl From<Vec<Event>> for EventBatch {
    fn from(events: Vec<Event>) -> Self {
        Self { events }
    }
}

/// Bounded accumulator shared between event producers and the scheduler.
///
/// The lock is only held to push one event or to swap the vector out, so
/// producers never wait on a network upload.
#[derive(Debug)]
pub struct EventBuffer {
    events: Mutex<Vec<Event>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Appends `event`, or drops it when the buffer is full.
    ///
    /// Returns whether the event was kept. The earliest events win so the
    /// first diagnostic context of a burst is preserved.
    pub fn enqueue(&self, event: Event) -> bool {
        {
            #[allow(clippy::expect_used)]
            let mut events = self.events.lock().expect("lock poisoned");
            if events.len() < self.capacity {
                events.push(event);
                return true;
            }
        }
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            event = event.name(),
            capacity = self.capacity,
            dropped, "event buffer full, dropping event"
        );
        false
    }

    /// Detaches everything enqueued since the previous flush.
    pub fn flush(&self) -> EventBatch {
        #[allow(clippy::expect_used)]
        let mut events = self.events.lock().expect("lock poisoned");
        EventBatch::from(std::mem::take(&mut *events))
    }

    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        let events = self.events.lock().expect("lock poisoned");
        events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of events rejected because the buffer was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new(MAX_EVENTS_PER_HEARTBEAT)
    }
}
