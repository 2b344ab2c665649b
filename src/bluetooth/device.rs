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

//! Remote device handles and their serialized form.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use super::address::Address;
use crate::platform::RfcommChannel;

/// Bond state of a remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BondState {
    #[serde(rename = "BOND_NONE")]
    None,
    #[serde(rename = "BOND_BONDING")]
    Bonding,
    #[serde(rename = "BOND_BONDED")]
    Bonded,
}

impl BondState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BondState::None => "BOND_NONE",
            BondState::Bonding => "BOND_BONDING",
            BondState::Bonded => "BOND_BONDED",
        }
    }
}

/// Platform handle to a remote device.
///
/// State is read from the platform on every call; nothing is cached here.
#[async_trait]
pub trait RemoteDevice: Send + Sync {
    fn address(&self) -> Address;

    /// Friendly name, if the platform knows one.
    async fn name(&self) -> Option<String>;

    async fn bond_state(&self) -> BondState;

    /// Ask the platform to start bonding. `Ok(false)` means it refused.
    async fn create_bond(&self) -> Result<bool>;

    /// Ask the platform to drop the bond. `Ok(false)` means it refused.
    async fn remove_bond(&self) -> Result<bool>;

    /// Answer a pending pairing request without user interaction.
    async fn set_pairing_confirmation(&self, confirm: bool) -> Result<()>;

    /// Open a client RFCOMM channel to the service record `uuid`.
    async fn connect_rfcomm(&self, uuid: Uuid) -> Result<RfcommChannel>;
}

pub type DeviceHandle = Arc<dyn RemoteDevice>;

/// Serialize a device the way the host reads it.
pub async fn serialize_device(device: &dyn RemoteDevice) -> Value {
    let state = device.bond_state().await;
    serialize_device_with_state(device, state).await
}

/// Serialize a device with an explicit bond state, used when a broadcast
/// carries the new state alongside the handle.
pub async fn serialize_device_with_state(device: &dyn RemoteDevice, state: BondState) -> Value {
    json!({
        "Name": device.name().await,
        "Address": device.address().to_string(),
        "BondState": state.as_str(),
    })
}
