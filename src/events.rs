// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Correlated events and the cache the host polls them from.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Result, SnippetError};

/// Event name for a device seen during discovery.
pub const ON_DISCOVERY_RECEIVE: &str = "onDiscoveryReceive";
/// Event name for pairing requests and bond transitions.
pub const ON_PAIRING_EVENT: &str = "onPairingEvent";
/// Event name for bytes read from an RFCOMM channel.
pub const ON_RFCOMM_DATA_RECEIVED: &str = "onRfcommDataReceived";

/// One event tagged with the callback id of the operation that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnippetEvent {
    #[serde(rename = "callbackId")]
    pub callback_id: String,

    pub name: String,

    /// Creation time in milliseconds since the epoch.
    #[serde(rename = "time")]
    pub creation_time: i64,

    pub data: Map<String, Value>,
}

impl SnippetEvent {
    pub fn new(callback_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            callback_id: callback_id.into(),
            name: name.into(),
            creation_time: chrono::Utc::now().timestamp_millis(),
            data: Map::new(),
        }
    }

    /// Builder-style data insertion.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

/// Destination for events produced by sessions.
pub trait EventSink: Send + Sync {
    fn post_event(&self, event: SnippetEvent);
}

type QueueKey = (String, String);

/// In-memory event cache keyed by `(callback id, event name)`.
///
/// Each queue is FIFO and bounded; when full, the oldest event is dropped.
pub struct EventCache {
    queues: Mutex<HashMap<QueueKey, VecDeque<SnippetEvent>>>,
    notify: Notify,
    capacity: usize,
}

impl EventCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn pop(&self, callback_id: &str, name: &str) -> Option<SnippetEvent> {
        let mut queues = self.queues.lock();
        let key = (callback_id.to_string(), name.to_string());
        let queue = queues.get_mut(&key)?;
        let event = queue.pop_front();
        if queue.is_empty() {
            queues.remove(&key);
        }
        event
    }

    /// Wait for the next event with this id and name.
    pub async fn wait_and_get(
        &self,
        callback_id: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<SnippetEvent> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(event) = self.pop(callback_id, name) {
                return Ok(event);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(SnippetError::EventTimeout {
                    callback_id: callback_id.to_string(),
                    name: name.to_string(),
                });
            }
        }
    }

    /// Drain every queued event with this id and name.
    pub fn get_all(&self, callback_id: &str, name: &str) -> Vec<SnippetEvent> {
        let key = (callback_id.to_string(), name.to_string());
        self.queues
            .lock()
            .remove(&key)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Total number of queued events.
    pub fn len(&self) -> usize {
        self.queues.lock().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear_all(&self) {
        self.queues.lock().clear();
    }
}

impl Default for EventCache {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for EventCache {
    fn post_event(&self, event: SnippetEvent) {
        debug!("Posting {} for {}", event.name, event.callback_id);
        {
            let mut queues = self.queues.lock();
            let queue = queues
                .entry((event.callback_id.clone(), event.name.clone()))
                .or_default();
            if queue.len() >= self.capacity {
                warn!(
                    "Event queue for {}/{} full, dropping oldest",
                    event.callback_id, event.name
                );
                queue.pop_front();
            }
            queue.push_back(event);
        }
        self.notify.notify_waiters();
    }
}
