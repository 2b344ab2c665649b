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

//! Classic inquiry sessions.

use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::address::Address;
use super::device::{serialize_device, DeviceHandle};
use super::registry::{ReceiverSession, Session, SessionKind};
use super::SessionContext;
use crate::error::{Result, SnippetError};
use crate::events::{SnippetEvent, ON_DISCOVERY_RECEIVE};
use crate::platform::{Broadcast, BroadcastAction};

/// Devices seen since the most recent discovery start, keyed by address.
#[derive(Default)]
pub struct DiscoveryResults {
    devices: RwLock<HashMap<Address, DeviceHandle>>,
}

impl DiscoveryResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, device: DeviceHandle) {
        self.devices.write().insert(device.address(), device);
    }

    pub fn get(&self, address: &Address) -> Option<DeviceHandle> {
        self.devices.read().get(address).cloned()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.devices.read().contains_key(address)
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.devices.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    pub fn clear(&self) {
        self.devices.write().clear();
    }
}

/// Start inquiry and report every device found under `callback_id`.
pub async fn start(ctx: &SessionContext, callback_id: &str) -> Result<()> {
    if ctx.registry.contains(callback_id) {
        return Err(SnippetError::SessionExists(callback_id.to_string()));
    }

    if ctx.adapter.is_discovering().await? {
        debug!("Cancelling discovery already in progress");
        match ctx.adapter.cancel_discovery().await {
            Ok(true) => {}
            Ok(false) => warn!("Adapter refused to cancel ongoing discovery"),
            Err(e) => warn!("Failed to cancel ongoing discovery: {}", e),
        }
    }

    ctx.results.clear();

    let receiver = ctx.adapter.register_receiver(&[
        BroadcastAction::DeviceFound,
        BroadcastAction::DiscoveryFinished,
    ])?;
    let receiver_id = receiver.id;

    // Events queue on the receiver channel until the session id is known.
    let (armed_tx, armed_rx) = tokio::sync::oneshot::channel();
    let task = tokio::spawn(scan_receiver(
        ctx.clone(),
        callback_id.to_string(),
        receiver.events,
        armed_rx,
    ));

    let session_id = match ctx.registry.insert(
        callback_id,
        Session::Discovery(ReceiverSession::new(ctx.adapter.clone(), receiver_id, task)),
    ) {
        Ok(id) => id,
        Err(e) => {
            // The rejected session was dropped without release.
            if let Err(err) = ctx.adapter.unregister_receiver(receiver_id) {
                warn!("Failed to unregister receiver: {}", err);
            }
            return Err(e);
        }
    };
    let _ = armed_tx.send(session_id);

    let started = ctx.adapter.start_discovery().await;
    if !matches!(started, Ok(true)) {
        ctx.registry.remove(callback_id).await;
        if let Err(e) = started {
            warn!("Discovery start error: {}", e);
        }
        return Err(SnippetError::InitiationFailed(
            "Bluetooth discovery".to_string(),
        ));
    }

    info!("Discovery started for {}", callback_id);
    Ok(())
}

/// Cancel inquiry and drop the discovery session for `callback_id`.
pub async fn cancel(ctx: &SessionContext, callback_id: &str) -> Result<()> {
    if !ctx.adapter.is_discovering().await? {
        debug!("No ongoing bluetooth discovery.");
        return Ok(());
    }

    let cancelled = ctx.adapter.cancel_discovery().await;

    if !ctx
        .registry
        .remove_if_kind(callback_id, SessionKind::Discovery)
        .await
    {
        debug!("No discovery session registered for {}", callback_id);
    }

    match cancelled {
        Ok(true) => {
            info!("Discovery cancelled for {}", callback_id);
            Ok(())
        }
        Ok(false) => Err(SnippetError::CancelFailed(
            "bluetooth discovery".to_string(),
        )),
        Err(e) => {
            warn!("Discovery cancel error: {}", e);
            Err(SnippetError::CancelFailed(
                "bluetooth discovery".to_string(),
            ))
        }
    }
}

async fn scan_receiver(
    ctx: SessionContext,
    callback_id: String,
    mut events: mpsc::UnboundedReceiver<Broadcast>,
    armed: tokio::sync::oneshot::Receiver<u64>,
) {
    let Ok(session_id) = armed.await else {
        return;
    };

    while let Some(broadcast) = events.recv().await {
        match broadcast {
            Broadcast::DeviceFound(device) => {
                let address = device.address();
                ctx.results.insert(device.clone());
                debug!("Discovered {} for {}", address, callback_id);
                let serialized = serialize_device(device.as_ref()).await;
                ctx.sink.post_event(
                    SnippetEvent::new(&callback_id, ON_DISCOVERY_RECEIVE).with("device", serialized),
                );
            }
            Broadcast::DiscoveryFinished => {
                info!("Discovery finished for {}", callback_id);
                ctx.registry.remove_if_current(&callback_id, session_id).await;
                return;
            }
            other => debug!("Scan receiver ignoring {:?}", other),
        }
    }
}
