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

//! BlueZ platform backed by `bluer`.
//!
//! BlueZ has no broadcast intents, so this module synthesizes them: inquiry
//! runs for a fixed window on a background task, bond transitions are
//! reported around `Device::pair` / `Adapter::remove_device`, and pairing
//! requests come from an agent that waits for the owning receiver to confirm.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bluer::agent::{Agent, AgentHandle, ReqError, RequestConfirmation};
use bluer::rfcomm::{Profile, ProfileHandle, Role};
use bluer::AdapterEvent;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    AdapterState, BluetoothAdapter, Broadcast, BroadcastAction, BroadcastReceiver,
    RfcommChannel, RfcommLink, ReceiverId,
};
use crate::bluetooth::{Address, BondState, DeviceHandle, RemoteDevice};

/// Length of one inquiry, matching a classic 10.24 s inquiry plus name lookup.
const INQUIRY_WINDOW: Duration = Duration::from_secs(12);

/// How long the agent holds a pairing request open for confirmation.
const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for BlueZ to hand over a connected RFCOMM socket.
const PROFILE_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

fn to_bluer(address: Address) -> bluer::Address {
    bluer::Address::new(address.0)
}

fn from_bluer(address: bluer::Address) -> Address {
    Address::new(address.0)
}

struct Registration {
    actions: Vec<BroadcastAction>,
    tx: mpsc::UnboundedSender<Broadcast>,
}

struct Shared {
    session: bluer::Session,
    adapter: bluer::Adapter,
    receivers: Mutex<HashMap<ReceiverId, Registration>>,
    pending_confirmations: Mutex<HashMap<Address, oneshot::Sender<bool>>>,
    next_receiver: AtomicU64,
    inquiry: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn broadcast(&self, broadcast: Broadcast) -> usize {
        let action = broadcast.action();
        let receivers = self.receivers.lock();
        let mut delivered = 0;
        for registration in receivers.values() {
            if registration.actions.contains(&action)
                && registration.tx.send(broadcast.clone()).is_ok()
            {
                delivered += 1;
            }
        }
        debug!("Broadcast {:?} delivered to {} receiver(s)", broadcast, delivered);
        delivered
    }

    fn handle(self: &Arc<Self>, address: Address) -> Result<DeviceHandle> {
        let device = self.adapter.device(to_bluer(address))?;
        Ok(Arc::new(BluezDevice {
            address,
            device,
            shared: self.clone(),
        }))
    }
}

/// The default BlueZ adapter.
pub struct BluezPlatform {
    shared: Arc<Shared>,
    _agent: AgentHandle,
}

impl BluezPlatform {
    /// Open a BlueZ session on the default adapter and register the
    /// auto-confirming pairing agent.
    pub async fn new() -> Result<Self> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        let shared = Arc::new(Shared {
            session,
            adapter,
            receivers: Mutex::new(HashMap::new()),
            pending_confirmations: Mutex::new(HashMap::new()),
            next_receiver: AtomicU64::new(0),
            inquiry: Mutex::new(None),
        });

        let agent_shared = Arc::downgrade(&shared);
        let agent = Agent {
            request_default: true,
            request_confirmation: Some(Box::new(move |request: RequestConfirmation| {
                let shared = agent_shared.clone();
                Box::pin(async move {
                    let shared = shared.upgrade().ok_or(ReqError::Rejected)?;
                    confirm_pairing(shared, request).await
                })
            })),
            ..Default::default()
        };
        let agent = shared.session.register_agent(agent).await?;
        info!("Pairing agent registered");

        Ok(Self {
            shared,
            _agent: agent,
        })
    }
}

async fn confirm_pairing(shared: Arc<Shared>, request: RequestConfirmation) -> Result<(), ReqError> {
    let address = from_bluer(request.device);
    let device = shared.handle(address).map_err(|_| ReqError::Rejected)?;

    let (tx, rx) = oneshot::channel();
    shared.pending_confirmations.lock().insert(address, tx);

    if shared.broadcast(Broadcast::PairingRequest(device)) == 0 {
        shared.pending_confirmations.lock().remove(&address);
        warn!("Rejecting pairing request from {}: nobody is listening", address);
        return Err(ReqError::Rejected);
    }

    match tokio::time::timeout(CONFIRMATION_TIMEOUT, rx).await {
        Ok(Ok(true)) => Ok(()),
        _ => {
            shared.pending_confirmations.lock().remove(&address);
            Err(ReqError::Rejected)
        }
    }
}

#[async_trait]
impl BluetoothAdapter for BluezPlatform {
    async fn is_discovering(&self) -> Result<bool> {
        let running = self
            .shared
            .inquiry
            .lock()
            .as_ref()
            .map_or(false, |task| !task.is_finished());
        Ok(running || self.shared.adapter.is_discovering().await?)
    }

    async fn start_discovery(&self) -> Result<bool> {
        if !self.shared.adapter.is_powered().await? {
            warn!("Adapter is powered off, refusing discovery");
            return Ok(false);
        }

        let mut inquiry = self.shared.inquiry.lock();
        if inquiry.as_ref().map_or(false, |task| !task.is_finished()) {
            return Ok(false);
        }

        let shared = self.shared.clone();
        *inquiry = Some(tokio::spawn(async move {
            if let Err(e) = run_inquiry(&shared).await {
                error!("Inquiry failed: {}", e);
            }
            shared.broadcast(Broadcast::DiscoveryFinished);
        }));
        Ok(true)
    }

    async fn cancel_discovery(&self) -> Result<bool> {
        let task = self.shared.inquiry.lock().take();
        match task {
            Some(task) => {
                // Dropping the discovery stream stops inquiry in BlueZ.
                task.abort();
                self.shared.broadcast(Broadcast::DiscoveryFinished);
                Ok(true)
            }
            None => Ok(!self.shared.adapter.is_discovering().await?),
        }
    }

    async fn state(&self) -> Result<AdapterState> {
        Ok(if self.shared.adapter.is_powered().await? {
            AdapterState::On
        } else {
            AdapterState::Off
        })
    }

    async fn bonded_devices(&self) -> Result<Vec<DeviceHandle>> {
        let mut bonded = Vec::new();
        for addr in self.shared.adapter.device_addresses().await? {
            let device = self.shared.adapter.device(addr)?;
            if device.is_paired().await? {
                bonded.push(self.shared.handle(from_bluer(addr))?);
            }
        }
        Ok(bonded)
    }

    async fn remote_device(&self, address: Address) -> Result<DeviceHandle> {
        self.shared.handle(address)
    }

    fn register_receiver(&self, actions: &[BroadcastAction]) -> Result<BroadcastReceiver> {
        let id = ReceiverId(self.shared.next_receiver.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, events) = mpsc::unbounded_channel();
        self.shared.receivers.lock().insert(
            id,
            Registration {
                actions: actions.to_vec(),
                tx,
            },
        );
        Ok(BroadcastReceiver { id, events })
    }

    fn unregister_receiver(&self, id: ReceiverId) -> Result<()> {
        self.shared
            .receivers
            .lock()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| anyhow!("receiver {:?} is not registered", id))
    }
}

async fn run_inquiry(shared: &Arc<Shared>) -> Result<()> {
    let events = shared.adapter.discover_devices().await?;
    futures::pin_mut!(events);
    info!("Inquiry started");

    let deadline = tokio::time::sleep(INQUIRY_WINDOW);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.next() => match event {
                Some(AdapterEvent::DeviceAdded(addr)) => {
                    let device = shared.handle(from_bluer(addr))?;
                    shared.broadcast(Broadcast::DeviceFound(device));
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    info!("Inquiry finished");
    Ok(())
}

/// A BlueZ device object.
struct BluezDevice {
    address: Address,
    device: bluer::Device,
    shared: Arc<Shared>,
}

impl BluezDevice {
    fn self_handle(&self) -> DeviceHandle {
        Arc::new(BluezDevice {
            address: self.address,
            device: self.device.clone(),
            shared: self.shared.clone(),
        })
    }

    fn report(&self, state: BondState) {
        self.shared.broadcast(Broadcast::BondStateChanged {
            device: self.self_handle(),
            state,
        });
    }
}

#[async_trait]
impl RemoteDevice for BluezDevice {
    fn address(&self) -> Address {
        self.address
    }

    async fn name(&self) -> Option<String> {
        self.device.name().await.ok().flatten()
    }

    async fn bond_state(&self) -> BondState {
        match self.device.is_paired().await {
            Ok(true) => BondState::Bonded,
            _ => BondState::None,
        }
    }

    async fn create_bond(&self) -> Result<bool> {
        if self.device.is_paired().await? {
            return Ok(false);
        }

        let bonding = BluezDevice {
            address: self.address,
            device: self.device.clone(),
            shared: self.shared.clone(),
        };
        tokio::spawn(async move {
            bonding.report(BondState::Bonding);
            match bonding.device.pair().await {
                Ok(()) => bonding.report(BondState::Bonded),
                Err(e) => {
                    warn!("Pairing with {} failed: {}", bonding.address, e);
                    bonding.report(BondState::None);
                }
            }
        });
        Ok(true)
    }

    async fn remove_bond(&self) -> Result<bool> {
        match self.shared.adapter.remove_device(to_bluer(self.address)).await {
            Ok(()) => {
                self.report(BondState::None);
                Ok(true)
            }
            Err(e) => {
                warn!("Removing bond with {} failed: {}", self.address, e);
                Ok(false)
            }
        }
    }

    async fn set_pairing_confirmation(&self, confirm: bool) -> Result<()> {
        let pending = self.shared.pending_confirmations.lock().remove(&self.address);
        match pending {
            Some(tx) => {
                let _ = tx.send(confirm);
                Ok(())
            }
            None => Err(anyhow!("no pairing request pending for {}", self.address)),
        }
    }

    async fn connect_rfcomm(&self, uuid: Uuid) -> Result<RfcommChannel> {
        let profile = Profile {
            uuid,
            role: Some(Role::Client),
            require_authentication: Some(false),
            require_authorization: Some(false),
            auto_connect: Some(false),
            ..Default::default()
        };
        let mut handle = self.shared.session.register_profile(profile).await?;

        let device = self.device.clone();
        let connecting = tokio::spawn(async move { device.connect_profile(&uuid).await });

        let accepted = match tokio::time::timeout(PROFILE_CONNECT_TIMEOUT, handle.next()).await {
            Ok(Some(request)) => request.accept().map_err(Into::into),
            Ok(None) => Err(anyhow!("profile closed before connecting")),
            Err(_) => Err(anyhow!("timed out waiting for rfcomm connection")),
        };
        let stream = match accepted {
            Ok(stream) => stream,
            Err(e) => {
                connecting.abort();
                return Err(e);
            }
        };

        match connecting.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("connect_profile returned after accept: {}", e),
            Err(e) => debug!("connect_profile task ended: {}", e),
        }

        let (reader, writer) = stream.into_split();
        let link = Arc::new(BluezLink {
            device: self.device.clone(),
            uuid,
            connected: AtomicBool::new(true),
            profile: Mutex::new(Some(handle)),
        });

        Ok(RfcommChannel {
            reader: Box::new(reader),
            writer: Box::new(writer),
            link,
        })
    }
}

struct BluezLink {
    device: bluer::Device,
    uuid: Uuid,
    connected: AtomicBool,
    profile: Mutex<Option<ProfileHandle>>,
}

#[async_trait]
impl RfcommLink for BluezLink {
    async fn close(&self) -> Result<()> {
        let result = self.device.disconnect_profile(&self.uuid).await;
        drop(self.profile.lock().take());
        self.connected.store(false, Ordering::SeqCst);
        result.map_err(Into::into)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
