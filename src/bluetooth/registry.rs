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

//! Session registry keyed by callback id.
//!
//! Every asynchronous operation owns exactly one record here. A record is
//! taken out of the map before its resources are released, so a concurrent
//! caller can never release the same broadcast receiver or socket twice.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::address::Address;
use super::device::BondState;
use super::rfcomm::RfcommSession;
use crate::error::{Result, SnippetError};
use crate::platform::{BluetoothAdapter, ReceiverId};

/// Kind of session registered under a callback id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Discovery,
    Pairing,
    Rfcomm,
}

/// A broadcast registration plus the task consuming it.
pub struct ReceiverSession {
    adapter: Arc<dyn BluetoothAdapter>,
    receiver: ReceiverId,
    task: JoinHandle<()>,
}

impl ReceiverSession {
    pub fn new(adapter: Arc<dyn BluetoothAdapter>, receiver: ReceiverId, task: JoinHandle<()>) -> Self {
        Self {
            adapter,
            receiver,
            task,
        }
    }

    pub fn receiver_id(&self) -> ReceiverId {
        self.receiver
    }

    /// Unregister, then stop the consuming task.
    ///
    /// The task may be the caller itself on a terminal broadcast; aborting it
    /// only takes effect at its next await, after cleanup is complete.
    pub fn release(self) {
        if let Err(e) = self.adapter.unregister_receiver(self.receiver) {
            warn!("Receiver {:?} already unregistered: {}", self.receiver, e);
        }
        self.task.abort();
    }
}

/// Resources held on behalf of one callback id.
pub enum Session {
    Discovery(ReceiverSession),
    Pairing {
        receiver: ReceiverSession,
        address: Address,
        expected: BondState,
    },
    Rfcomm(Arc<RfcommSession>),
}

impl Session {
    pub fn kind(&self) -> SessionKind {
        match self {
            Session::Discovery(_) => SessionKind::Discovery,
            Session::Pairing { .. } => SessionKind::Pairing,
            Session::Rfcomm(_) => SessionKind::Rfcomm,
        }
    }

    /// Release every OS-level resource held by this session.
    pub async fn release(self) {
        match self {
            Session::Discovery(receiver) => receiver.release(),
            Session::Pairing { receiver, .. } => receiver.release(),
            Session::Rfcomm(session) => {
                session.close().await;
            }
        }
    }
}

/// Read-only view of a registered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: u64,
    pub kind: SessionKind,
    /// Target and expected terminal state of a pairing session.
    pub pairing: Option<(Address, BondState)>,
}

struct Record {
    session_id: u64,
    session: Session,
}

/// Concurrent map from callback id to session.
#[derive(Default)]
pub struct SessionRegistry {
    records: Mutex<HashMap<String, Record>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `session` under `callback_id`. Returns its session id.
    pub fn insert(&self, callback_id: &str, session: Session) -> Result<u64> {
        let mut records = self.records.lock();
        if records.contains_key(callback_id) {
            return Err(SnippetError::SessionExists(callback_id.to_string()));
        }
        let session_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            "Registering {:?} session {} for {}",
            session.kind(),
            session_id,
            callback_id
        );
        records.insert(
            callback_id.to_string(),
            Record {
                session_id,
                session,
            },
        );
        Ok(session_id)
    }

    pub fn get(&self, callback_id: &str) -> Option<SessionInfo> {
        let records = self.records.lock();
        let record = records.get(callback_id)?;
        let pairing = match &record.session {
            Session::Pairing {
                address, expected, ..
            } => Some((*address, *expected)),
            _ => None,
        };
        Some(SessionInfo {
            session_id: record.session_id,
            kind: record.session.kind(),
            pairing,
        })
    }

    pub fn contains(&self, callback_id: &str) -> bool {
        self.records.lock().contains_key(callback_id)
    }

    pub fn kind(&self, callback_id: &str) -> Option<SessionKind> {
        self.records
            .lock()
            .get(callback_id)
            .map(|record| record.session.kind())
    }

    /// The RFCOMM session for `callback_id`, if that is what is registered.
    pub fn rfcomm(&self, callback_id: &str) -> Option<Arc<RfcommSession>> {
        match self.records.lock().get(callback_id) {
            Some(Record {
                session: Session::Rfcomm(session),
                ..
            }) => Some(session.clone()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn callback_ids(&self) -> Vec<String> {
        self.records.lock().keys().cloned().collect()
    }

    /// Detach a session without releasing it.
    pub fn take(&self, callback_id: &str) -> Option<Session> {
        self.records
            .lock()
            .remove(callback_id)
            .map(|record| record.session)
    }

    /// Detach a session only if it has the given kind.
    pub fn take_if_kind(&self, callback_id: &str, kind: SessionKind) -> Option<Session> {
        let mut records = self.records.lock();
        match records.get(callback_id) {
            Some(record) if record.session.kind() == kind => {
                records.remove(callback_id).map(|record| record.session)
            }
            _ => None,
        }
    }

    /// Release and drop the session for `callback_id`. Idempotent.
    pub async fn remove(&self, callback_id: &str) -> bool {
        match self.take(callback_id) {
            Some(session) => {
                session.release().await;
                debug!("Removed session for {}", callback_id);
                true
            }
            None => false,
        }
    }

    /// Release and drop the session only if it has the given kind.
    pub async fn remove_if_kind(&self, callback_id: &str, kind: SessionKind) -> bool {
        match self.take_if_kind(callback_id, kind) {
            Some(session) => {
                session.release().await;
                true
            }
            None => false,
        }
    }

    /// Release and drop the session only if it is still `session_id`.
    ///
    /// Used by terminal broadcasts so a successor registered under the same
    /// callback id is left alone.
    pub async fn remove_if_current(&self, callback_id: &str, session_id: u64) -> bool {
        let session = {
            let mut records = self.records.lock();
            match records.get(callback_id) {
                Some(record) if record.session_id == session_id => {
                    records.remove(callback_id).map(|record| record.session)
                }
                _ => None,
            }
        };
        match session {
            Some(session) => {
                session.release().await;
                true
            }
            None => false,
        }
    }

    /// Release every session. The registry is empty on return.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, Record)> = self.records.lock().drain().collect();
        if drained.is_empty() {
            return;
        }
        info!("Releasing {} active session(s)", drained.len());
        for (callback_id, record) in drained {
            debug!("Releasing {:?} session for {}", record.session.kind(), callback_id);
            record.session.release().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::memory::MemoryPlatform;
    use crate::platform::BroadcastAction;

    fn receiver_session(platform: &Arc<MemoryPlatform>) -> ReceiverSession {
        let receiver = platform
            .register_receiver(&[BroadcastAction::DeviceFound])
            .unwrap();
        let id = receiver.id;
        let task = tokio::spawn(async move {
            let mut events = receiver.events;
            while events.recv().await.is_some() {}
        });
        ReceiverSession::new(platform.clone(), id, task)
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate() {
        let platform = MemoryPlatform::new();
        let registry = SessionRegistry::new();

        registry
            .insert("d1", Session::Discovery(receiver_session(&platform)))
            .unwrap();
        let duplicate = receiver_session(&platform);
        let duplicate_id = duplicate.receiver_id();
        let result = registry.insert("d1", Session::Discovery(duplicate));
        assert!(matches!(result, Err(SnippetError::SessionExists(_))));
        assert_eq!(registry.len(), 1);

        // The rejected session is dropped, not released; clean it up by hand.
        platform.unregister_receiver(duplicate_id).unwrap();
    }

    #[tokio::test]
    async fn test_remove_releases_and_is_idempotent() {
        let platform = MemoryPlatform::new();
        let registry = SessionRegistry::new();
        registry
            .insert("d1", Session::Discovery(receiver_session(&platform)))
            .unwrap();
        assert_eq!(platform.active_receivers(), 1);

        assert!(registry.remove("d1").await);
        assert_eq!(platform.active_receivers(), 0);
        assert!(registry.get("d1").is_none());
        assert!(!registry.remove("d1").await);
    }

    #[tokio::test]
    async fn test_remove_if_kind_leaves_other_kinds() {
        let platform = MemoryPlatform::new();
        let registry = SessionRegistry::new();
        registry
            .insert("d1", Session::Discovery(receiver_session(&platform)))
            .unwrap();

        assert!(!registry.remove_if_kind("d1", SessionKind::Rfcomm).await);
        assert_eq!(registry.kind("d1"), Some(SessionKind::Discovery));
        assert!(registry.remove_if_kind("d1", SessionKind::Discovery).await);
    }

    #[tokio::test]
    async fn test_remove_if_current_skips_successor() {
        let platform = MemoryPlatform::new();
        let registry = SessionRegistry::new();
        let first = registry
            .insert("d1", Session::Discovery(receiver_session(&platform)))
            .unwrap();
        registry.remove("d1").await;
        let second = registry
            .insert("d1", Session::Discovery(receiver_session(&platform)))
            .unwrap();
        assert_ne!(first, second);

        assert!(!registry.remove_if_current("d1", first).await);
        assert!(registry.contains("d1"));
        assert!(registry.remove_if_current("d1", second).await);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_tolerates_dead_receivers() {
        let platform = MemoryPlatform::new();
        let registry = SessionRegistry::new();
        let session = receiver_session(&platform);
        let id = session.receiver_id();
        registry.insert("d1", Session::Discovery(session)).unwrap();
        registry
            .insert(
                "p1",
                Session::Pairing {
                    receiver: receiver_session(&platform),
                    address: "AA:BB:CC:DD:EE:01".parse().unwrap(),
                    expected: BondState::Bonded,
                },
            )
            .unwrap();

        let mut ids = registry.callback_ids();
        ids.sort();
        assert_eq!(ids, vec!["d1".to_string(), "p1".to_string()]);
        assert_eq!(
            registry.get("p1").unwrap().pairing,
            Some(("AA:BB:CC:DD:EE:01".parse().unwrap(), BondState::Bonded))
        );
        assert_eq!(registry.get("d1").unwrap().pairing, None);

        // Unregistered behind the registry's back.
        platform.unregister_receiver(id).unwrap();

        registry.shutdown().await;
        assert!(registry.is_empty());
        assert_eq!(platform.active_receivers(), 0);
    }
}
