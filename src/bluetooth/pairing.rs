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

//! Bond and unbond sessions.
//!
//! A pairing session auto-confirms pairing requests and reports every bond
//! transition of its target device until the expected terminal state is
//! reached. There is no timeout; callers bring their own watchdog.

use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::address::Address;
use super::device::{serialize_device, serialize_device_with_state, BondState, DeviceHandle};
use super::registry::{ReceiverSession, Session};
use super::SessionContext;
use crate::error::{Result, SnippetError};
use crate::events::{SnippetEvent, ON_PAIRING_EVENT};
use crate::platform::{Broadcast, BroadcastAction};

/// Which way the bond is being moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BondOperation {
    Bond,
    Unbond,
}

impl BondOperation {
    fn expected(self) -> BondState {
        match self {
            BondOperation::Bond => BondState::Bonded,
            BondOperation::Unbond => BondState::None,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            BondOperation::Bond => "the pairing process",
            BondOperation::Unbond => "the un-pairing process",
        }
    }
}

/// Pair with a device seen during the last discovery.
pub async fn pair(ctx: &SessionContext, callback_id: &str, address: Address) -> Result<()> {
    let device = ctx.results.get(&address).ok_or_else(|| {
        SnippetError::UnknownDevice(format!(
            "No device with address {} has been discovered",
            address
        ))
    })?;

    if device.bond_state().await == BondState::Bonded {
        info!("{} is already bonded", address);
        let serialized = serialize_device(device.as_ref()).await;
        ctx.sink
            .post_event(SnippetEvent::new(callback_id, ON_PAIRING_EVENT).with("device", serialized));
        return Ok(());
    }

    begin(ctx, callback_id, device, BondOperation::Bond).await
}

/// Remove the bond with a currently bonded device.
pub async fn unpair(ctx: &SessionContext, callback_id: &str, address: Address) -> Result<()> {
    let device = ctx
        .adapter
        .bonded_devices()
        .await?
        .into_iter()
        .find(|device| device.address() == address)
        .ok_or_else(|| {
            SnippetError::UnknownDevice(format!("No device with address {} is paired", address))
        })?;

    begin(ctx, callback_id, device, BondOperation::Unbond).await
}

async fn begin(
    ctx: &SessionContext,
    callback_id: &str,
    device: DeviceHandle,
    operation: BondOperation,
) -> Result<()> {
    if ctx.registry.contains(callback_id) {
        return Err(SnippetError::SessionExists(callback_id.to_string()));
    }

    let address = device.address();
    let expected = operation.expected();

    let receiver = ctx.adapter.register_receiver(&[
        BroadcastAction::PairingRequest,
        BroadcastAction::BondStateChanged,
    ])?;
    let receiver_id = receiver.id;

    let (armed_tx, armed_rx) = oneshot::channel();
    let task = tokio::spawn(pairing_receiver(
        ctx.clone(),
        callback_id.to_string(),
        address,
        expected,
        receiver.events,
        armed_rx,
    ));

    let session = Session::Pairing {
        receiver: ReceiverSession::new(ctx.adapter.clone(), receiver_id, task),
        address,
        expected,
    };
    let session_id = match ctx.registry.insert(callback_id, session) {
        Ok(id) => id,
        Err(e) => {
            if let Err(err) = ctx.adapter.unregister_receiver(receiver_id) {
                warn!("Failed to unregister receiver: {}", err);
            }
            return Err(e);
        }
    };
    let _ = armed_tx.send(session_id);

    let initiated = match operation {
        BondOperation::Bond => device.create_bond().await,
        BondOperation::Unbond => device.remove_bond().await,
    };

    if !matches!(initiated, Ok(true)) {
        ctx.registry.remove(callback_id).await;
        if let Err(e) = initiated {
            warn!("Bond request error for {}: {}", address, e);
        }
        return Err(SnippetError::InitiationFailed(format!(
            "{} to device: {}",
            operation.describe(),
            address
        )));
    }

    info!("Started {} with {} for {}", operation.describe(), address, callback_id);
    Ok(())
}

async fn pairing_receiver(
    ctx: SessionContext,
    callback_id: String,
    target: Address,
    expected: BondState,
    mut events: mpsc::UnboundedReceiver<Broadcast>,
    armed: oneshot::Receiver<u64>,
) {
    let Ok(session_id) = armed.await else {
        return;
    };

    while let Some(broadcast) = events.recv().await {
        match broadcast {
            Broadcast::PairingRequest(device) if device.address() == target => {
                if let Err(e) = device.set_pairing_confirmation(true).await {
                    error!("Failed to confirm pairing with {}: {}", target, e);
                    continue;
                }
                info!("Confirming pairing with device: {}", target);
                let serialized = serialize_device(device.as_ref()).await;
                ctx.sink.post_event(
                    SnippetEvent::new(&callback_id, ON_PAIRING_EVENT)
                        .with("result", json!({ "pairing": "confirmed" }))
                        .with("device", serialized),
                );
            }
            Broadcast::BondStateChanged { device, state } if device.address() == target => {
                debug!("Bond state of {} is now {:?}", target, state);
                let serialized = serialize_device_with_state(device.as_ref(), state).await;
                ctx.sink.post_event(
                    SnippetEvent::new(&callback_id, ON_PAIRING_EVENT).with("device", serialized),
                );
                if state == expected {
                    info!("{} reached {:?} for {}", target, state, callback_id);
                    ctx.registry.remove_if_current(&callback_id, session_id).await;
                    return;
                }
            }
            other => debug!("Pairing receiver for {} ignoring {:?}", target, other),
        }
    }
}
