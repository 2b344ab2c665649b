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

//! In-process platform for tests and dry runs.
//!
//! Broadcasts are injected by the caller, refusals are programmable, and
//! RFCOMM channels are backed by in-memory duplex pipes whose far end is
//! handed back to the caller as an [`RfcommPeer`].

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::{
    AdapterState, BluetoothAdapter, Broadcast, BroadcastAction, BroadcastReceiver,
    RfcommChannel, RfcommLink, ReceiverId,
};
use crate::bluetooth::{Address, BondState, DeviceHandle, RemoteDevice};

const PIPE_CAPACITY: usize = 4096;

/// Link state of an in-memory RFCOMM channel.
#[derive(Debug)]
pub struct MemoryLink {
    connected: AtomicBool,
    stuck: AtomicBool,
}

impl MemoryLink {
    fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            stuck: AtomicBool::new(false),
        }
    }

    /// Make `close` leave the link reporting connected.
    pub fn set_stuck(&self, stuck: bool) {
        self.stuck.store(stuck, Ordering::SeqCst);
    }
}

#[async_trait]
impl RfcommLink for MemoryLink {
    async fn close(&self) -> Result<()> {
        if !self.stuck.load(Ordering::SeqCst) {
            self.connected.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Remote end of an in-memory RFCOMM channel.
pub struct RfcommPeer {
    pub uuid: Uuid,
    pub stream: DuplexStream,
    pub link: Arc<MemoryLink>,
}

type LinkList = Arc<Mutex<Vec<Arc<MemoryLink>>>>;

/// A scriptable remote device.
pub struct MemoryDevice {
    address: Address,
    name: Mutex<Option<String>>,
    bond_state: Mutex<BondState>,
    refuse_bond: AtomicBool,
    refuse_connect: AtomicBool,
    refuse_confirm: AtomicBool,
    confirmations: Mutex<Vec<bool>>,
    peers: Mutex<Vec<RfcommPeer>>,
    links: LinkList,
}

impl MemoryDevice {
    fn new(address: Address, name: Option<String>, bond_state: BondState, links: LinkList) -> Self {
        Self {
            address,
            name: Mutex::new(name),
            bond_state: Mutex::new(bond_state),
            refuse_bond: AtomicBool::new(false),
            refuse_connect: AtomicBool::new(false),
            refuse_confirm: AtomicBool::new(false),
            confirmations: Mutex::new(Vec::new()),
            peers: Mutex::new(Vec::new()),
            links,
        }
    }

    pub fn set_bond_state(&self, state: BondState) {
        *self.bond_state.lock() = state;
    }

    /// Make `create_bond` / `remove_bond` report refusal.
    pub fn refuse_bonding(&self, refuse: bool) {
        self.refuse_bond.store(refuse, Ordering::SeqCst);
    }

    /// Make `connect_rfcomm` fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    /// Make `set_pairing_confirmation` fail, as when no request is pending.
    pub fn refuse_confirmation(&self, refuse: bool) {
        self.refuse_confirm.store(refuse, Ordering::SeqCst);
    }

    /// Pairing confirmations answered so far.
    pub fn confirmations(&self) -> Vec<bool> {
        self.confirmations.lock().clone()
    }

    /// Take the far end of the oldest unclaimed RFCOMM channel.
    pub fn take_rfcomm_peer(&self) -> Option<RfcommPeer> {
        let mut peers = self.peers.lock();
        if peers.is_empty() {
            None
        } else {
            Some(peers.remove(0))
        }
    }
}

#[async_trait]
impl RemoteDevice for MemoryDevice {
    fn address(&self) -> Address {
        self.address
    }

    async fn name(&self) -> Option<String> {
        self.name.lock().clone()
    }

    async fn bond_state(&self) -> BondState {
        *self.bond_state.lock()
    }

    async fn create_bond(&self) -> Result<bool> {
        if self.refuse_bond.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.set_bond_state(BondState::Bonding);
        Ok(true)
    }

    async fn remove_bond(&self) -> Result<bool> {
        Ok(!self.refuse_bond.load(Ordering::SeqCst))
    }

    async fn set_pairing_confirmation(&self, confirm: bool) -> Result<()> {
        if self.refuse_confirm.load(Ordering::SeqCst) {
            return Err(anyhow!("no pairing request pending for {}", self.address));
        }
        self.confirmations.lock().push(confirm);
        Ok(())
    }

    async fn connect_rfcomm(&self, uuid: Uuid) -> Result<RfcommChannel> {
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused by {}", self.address));
        }

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let (reader, writer) = tokio::io::split(local);
        let link = Arc::new(MemoryLink::new());

        self.links.lock().push(link.clone());
        self.peers.lock().push(RfcommPeer {
            uuid,
            stream: remote,
            link: link.clone(),
        });
        debug!("In-memory rfcomm channel to {} ({})", self.address, uuid);

        Ok(RfcommChannel {
            reader: Box::new(reader),
            writer: Box::new(writer),
            link,
        })
    }
}

struct Registration {
    actions: Vec<BroadcastAction>,
    tx: mpsc::UnboundedSender<Broadcast>,
}

/// Scriptable adapter.
pub struct MemoryPlatform {
    devices: Mutex<HashMap<Address, Arc<MemoryDevice>>>,
    receivers: Mutex<HashMap<ReceiverId, Registration>>,
    links: LinkList,
    next_receiver: AtomicU64,
    discovering: AtomicBool,
    refuse_start: AtomicBool,
    refuse_cancel: AtomicBool,
    state: Mutex<AdapterState>,
}

impl MemoryPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(HashMap::new()),
            receivers: Mutex::new(HashMap::new()),
            links: Arc::new(Mutex::new(Vec::new())),
            next_receiver: AtomicU64::new(0),
            discovering: AtomicBool::new(false),
            refuse_start: AtomicBool::new(false),
            refuse_cancel: AtomicBool::new(false),
            state: Mutex::new(AdapterState::On),
        })
    }

    /// Add (or replace) a known device.
    pub fn add_device(&self, address: Address, name: &str, bond_state: BondState) -> Arc<MemoryDevice> {
        let device = Arc::new(MemoryDevice::new(
            address,
            Some(name.to_string()),
            bond_state,
            self.links.clone(),
        ));
        self.devices.lock().insert(address, device.clone());
        device
    }

    pub fn device(&self, address: Address) -> Option<Arc<MemoryDevice>> {
        self.devices.lock().get(&address).cloned()
    }

    fn device_or_new(&self, address: Address) -> Arc<MemoryDevice> {
        self.devices
            .lock()
            .entry(address)
            .or_insert_with(|| {
                Arc::new(MemoryDevice::new(
                    address,
                    None,
                    BondState::None,
                    self.links.clone(),
                ))
            })
            .clone()
    }

    pub fn set_discovering(&self, discovering: bool) {
        self.discovering.store(discovering, Ordering::SeqCst);
    }

    pub fn refuse_start_discovery(&self, refuse: bool) {
        self.refuse_start.store(refuse, Ordering::SeqCst);
    }

    pub fn refuse_cancel_discovery(&self, refuse: bool) {
        self.refuse_cancel.store(refuse, Ordering::SeqCst);
    }

    pub fn set_state(&self, state: AdapterState) {
        *self.state.lock() = state;
    }

    /// Number of live broadcast registrations.
    pub fn active_receivers(&self) -> usize {
        self.receivers.lock().len()
    }

    /// Number of RFCOMM links still reporting connected.
    pub fn open_links(&self) -> usize {
        self.links
            .lock()
            .iter()
            .filter(|link| link.is_connected())
            .count()
    }

    /// Deliver a broadcast to every receiver subscribed to its action.
    /// Returns how many receivers got it.
    pub fn broadcast(&self, broadcast: Broadcast) -> usize {
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

    pub fn emit_device_found(&self, address: Address) -> usize {
        let device: DeviceHandle = self.device_or_new(address);
        self.broadcast(Broadcast::DeviceFound(device))
    }

    /// Ends inquiry and notifies receivers.
    pub fn emit_discovery_finished(&self) -> usize {
        self.set_discovering(false);
        self.broadcast(Broadcast::DiscoveryFinished)
    }

    pub fn emit_pairing_request(&self, address: Address) -> usize {
        let device: DeviceHandle = self.device_or_new(address);
        self.broadcast(Broadcast::PairingRequest(device))
    }

    /// Moves the device to `state` and notifies receivers.
    pub fn emit_bond_state(&self, address: Address, state: BondState) -> usize {
        let device = self.device_or_new(address);
        device.set_bond_state(state);
        let device: DeviceHandle = device;
        self.broadcast(Broadcast::BondStateChanged { device, state })
    }
}

#[async_trait]
impl BluetoothAdapter for MemoryPlatform {
    async fn is_discovering(&self) -> Result<bool> {
        Ok(self.discovering.load(Ordering::SeqCst))
    }

    async fn start_discovery(&self) -> Result<bool> {
        if self.refuse_start.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.set_discovering(true);
        Ok(true)
    }

    async fn cancel_discovery(&self) -> Result<bool> {
        if self.refuse_cancel.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.emit_discovery_finished();
        Ok(true)
    }

    async fn state(&self) -> Result<AdapterState> {
        Ok(*self.state.lock())
    }

    async fn bonded_devices(&self) -> Result<Vec<DeviceHandle>> {
        let mut bonded: Vec<DeviceHandle> = Vec::new();
        for device in self.devices.lock().values() {
            if *device.bond_state.lock() == BondState::Bonded {
                bonded.push(device.clone());
            }
        }
        Ok(bonded)
    }

    async fn remote_device(&self, address: Address) -> Result<DeviceHandle> {
        let device: DeviceHandle = self.device_or_new(address);
        Ok(device)
    }

    fn register_receiver(&self, actions: &[BroadcastAction]) -> Result<BroadcastReceiver> {
        let id = ReceiverId(self.next_receiver.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, events) = mpsc::unbounded_channel();
        self.receivers.lock().insert(
            id,
            Registration {
                actions: actions.to_vec(),
                tx,
            },
        );
        Ok(BroadcastReceiver { id, events })
    }

    fn unregister_receiver(&self, id: ReceiverId) -> Result<()> {
        self.receivers
            .lock()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| anyhow!("receiver {:?} is not registered", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_respects_actions() {
        let platform = MemoryPlatform::new();
        let mut scan = platform
            .register_receiver(&[BroadcastAction::DeviceFound, BroadcastAction::DiscoveryFinished])
            .unwrap();
        let mut pairing = platform
            .register_receiver(&[BroadcastAction::BondStateChanged])
            .unwrap();

        assert_eq!(platform.emit_device_found(addr("AA:BB:CC:DD:EE:01")), 1);
        assert_eq!(
            platform.emit_bond_state(addr("AA:BB:CC:DD:EE:01"), BondState::Bonded),
            1
        );

        assert!(matches!(scan.events.recv().await, Some(Broadcast::DeviceFound(_))));
        assert!(matches!(
            pairing.events.recv().await,
            Some(Broadcast::BondStateChanged { state: BondState::Bonded, .. })
        ));
    }

    #[test]
    fn test_unregister_twice_fails() {
        let platform = MemoryPlatform::new();
        let receiver = platform.register_receiver(&[BroadcastAction::DeviceFound]).unwrap();
        platform.unregister_receiver(receiver.id).unwrap();
        assert!(platform.unregister_receiver(receiver.id).is_err());
        assert_eq!(platform.active_receivers(), 0);
    }

    #[tokio::test]
    async fn test_bonded_devices_filters_state() {
        let platform = MemoryPlatform::new();
        platform.add_device(addr("AA:BB:CC:DD:EE:01"), "one", BondState::Bonded);
        platform.add_device(addr("AA:BB:CC:DD:EE:02"), "two", BondState::None);

        let bonded = platform.bonded_devices().await.unwrap();
        assert_eq!(bonded.len(), 1);
        assert_eq!(bonded[0].address(), addr("AA:BB:CC:DD:EE:01"));
    }

    #[tokio::test]
    async fn test_rfcomm_pipe_carries_bytes_both_ways() {
        let platform = MemoryPlatform::new();
        let device = platform.add_device(addr("AA:BB:CC:DD:EE:01"), "one", BondState::Bonded);
        let mut channel = device.connect_rfcomm(Uuid::nil()).await.unwrap();
        let mut peer = device.take_rfcomm_peer().unwrap();

        channel.writer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        peer.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        peer.stream.write_all(b"pong").await.unwrap();
        channel.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        assert_eq!(platform.open_links(), 1);
        channel.link.close().await.unwrap();
        assert_eq!(platform.open_links(), 0);
    }
}
