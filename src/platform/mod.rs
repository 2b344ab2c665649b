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

//! Platform Bluetooth stack abstraction.
//!
//! The snippet core only talks to the stack through these traits. Broadcasts
//! are delivered on per-receiver channels; RFCOMM channels are split into an
//! async reader, an async writer and a link handle for close/state queries.

pub mod memory;

#[cfg(feature = "bluez")]
pub mod bluez;

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::bluetooth::{Address, BondState, DeviceHandle};

/// Power state of the local adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Off,
    TurningOn,
    On,
    TurningOff,
}

/// Kinds of system broadcasts a receiver can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BroadcastAction {
    DeviceFound,
    DiscoveryFinished,
    PairingRequest,
    BondStateChanged,
}

/// A system broadcast delivered to a registered receiver.
#[derive(Clone)]
pub enum Broadcast {
    DeviceFound(DeviceHandle),
    DiscoveryFinished,
    PairingRequest(DeviceHandle),
    BondStateChanged {
        device: DeviceHandle,
        state: BondState,
    },
}

impl Broadcast {
    pub fn action(&self) -> BroadcastAction {
        match self {
            Broadcast::DeviceFound(_) => BroadcastAction::DeviceFound,
            Broadcast::DiscoveryFinished => BroadcastAction::DiscoveryFinished,
            Broadcast::PairingRequest(_) => BroadcastAction::PairingRequest,
            Broadcast::BondStateChanged { .. } => BroadcastAction::BondStateChanged,
        }
    }
}

impl fmt::Debug for Broadcast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Broadcast::DeviceFound(device) => {
                write!(f, "DeviceFound({})", device.address())
            }
            Broadcast::DiscoveryFinished => write!(f, "DiscoveryFinished"),
            Broadcast::PairingRequest(device) => {
                write!(f, "PairingRequest({})", device.address())
            }
            Broadcast::BondStateChanged { device, state } => {
                write!(f, "BondStateChanged({}, {:?})", device.address(), state)
            }
        }
    }
}

/// Identifier of a registered broadcast receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiverId(pub u64);

/// A live broadcast registration. Events arrive in delivery order.
#[derive(Debug)]
pub struct BroadcastReceiver {
    pub id: ReceiverId,
    pub events: mpsc::UnboundedReceiver<Broadcast>,
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Control side of a connected RFCOMM socket.
#[async_trait]
pub trait RfcommLink: Send + Sync {
    /// Close the socket. A pending read on the reader half fails or hits EOF.
    async fn close(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// A connected RFCOMM client socket.
pub struct RfcommChannel {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub link: Arc<dyn RfcommLink>,
}

/// The local Bluetooth adapter and broadcast registration facility.
#[async_trait]
pub trait BluetoothAdapter: Send + Sync {
    async fn is_discovering(&self) -> Result<bool>;

    /// Start inquiry. `Ok(false)` means the adapter refused.
    async fn start_discovery(&self) -> Result<bool>;

    /// Stop inquiry. `Ok(false)` means the adapter refused.
    async fn cancel_discovery(&self) -> Result<bool>;

    async fn state(&self) -> Result<AdapterState>;

    async fn bonded_devices(&self) -> Result<Vec<DeviceHandle>>;

    /// Obtain a handle for any address, known or not.
    async fn remote_device(&self, address: Address) -> Result<DeviceHandle>;

    /// Subscribe to the given broadcast actions.
    fn register_receiver(&self, actions: &[BroadcastAction]) -> Result<BroadcastReceiver>;

    /// Drop a registration. Errors if the receiver is not registered.
    fn unregister_receiver(&self, id: ReceiverId) -> Result<()>;
}
