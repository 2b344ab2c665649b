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

//! RPC-callable Bluetooth operations.
//!
//! Every asynchronous operation returns once the work is initiated; progress
//! arrives as events tagged with the caller's callback id.

use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::bluetooth::{discovery, pairing, rfcomm, stability};
use crate::bluetooth::{Address, DiscoveryResults, SessionContext, SessionRegistry};
use crate::config::{Config, StabilityConfig};
use crate::error::{Result, SnippetError};
use crate::events::EventSink;
use crate::platform::{AdapterState, BluetoothAdapter};

/// Operation front-end over one adapter and one event sink.
pub struct BluetoothSnippet {
    ctx: SessionContext,
    stability: StabilityConfig,
}

impl BluetoothSnippet {
    pub fn new(adapter: Arc<dyn BluetoothAdapter>, sink: Arc<dyn EventSink>) -> Self {
        Self::with_config(adapter, sink, &Config::default())
    }

    pub fn with_config(
        adapter: Arc<dyn BluetoothAdapter>,
        sink: Arc<dyn EventSink>,
        config: &Config,
    ) -> Self {
        Self {
            ctx: SessionContext::new(adapter, sink)
                .with_read_buffer_size(config.rfcomm.read_buffer_size),
            stability: config.stability.clone(),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.ctx.registry
    }

    pub fn discovery_results(&self) -> &Arc<DiscoveryResults> {
        &self.ctx.results
    }

    /// Start discovery; devices are reported as `onDiscoveryReceive`.
    pub async fn discover(&self, callback_id: &str) -> Result<()> {
        discovery::start(&self.ctx, callback_id).await
    }

    /// Cancel ongoing discovery. A no-op when the adapter is idle.
    pub async fn cancel_discover(&self, callback_id: &str) -> Result<()> {
        discovery::cancel(&self.ctx, callback_id).await
    }

    /// Pair with a discovered device; progress arrives as `onPairingEvent`.
    pub async fn pair_device(&self, callback_id: &str, address: &str) -> Result<()> {
        let address = parse_address(address)?;
        pairing::pair(&self.ctx, callback_id, address).await
    }

    /// Unpair a bonded device; progress arrives as `onPairingEvent`.
    pub async fn unpair_device(&self, callback_id: &str, address: &str) -> Result<()> {
        let address = parse_address(address)?;
        pairing::unpair(&self.ctx, callback_id, address).await
    }

    /// Connect to an RFCOMM service; inbound data arrives as
    /// `onRfcommDataReceived`.
    pub async fn rfcomm_connect(&self, callback_id: &str, address: &str, uuid: &str) -> Result<()> {
        let address = parse_address(address)?;
        let uuid = Uuid::parse_str(uuid)
            .map_err(|e| SnippetError::InvalidParams(format!("uuid {}: {}", uuid, e)))?;
        rfcomm::connect(&self.ctx, callback_id, address, uuid).await
    }

    pub async fn rfcomm_disconnect(&self, callback_id: &str) -> Result<()> {
        rfcomm::disconnect(&self.ctx, callback_id).await
    }

    pub async fn rfcomm_send(&self, callback_id: &str, data: &str) -> Result<()> {
        rfcomm::send(&self.ctx, callback_id, data).await
    }

    /// Kept for host compatibility. Received data is not pruned.
    pub fn clear_rcv_data(&self, callback_id: &str) {
        debug!("clearRcvData({}) is a no-op", callback_id);
    }

    /// Wait for the adapter power state to settle.
    pub async fn wait_for_stable_state(&self) -> Result<AdapterState> {
        stability::wait_for_stable_state(self.ctx.adapter.as_ref(), &self.stability).await
    }

    /// Release every active session. Emits no events.
    pub async fn shutdown(&self) {
        info!("Shutting down bluetooth sessions");
        self.ctx.registry.shutdown().await;
    }
}

fn parse_address(address: &str) -> Result<Address> {
    address.parse()
}
