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

//! Bluetooth session and event engine.
//!
//! Correlates platform broadcasts and RFCOMM reads with the callback id of
//! the operation that started them, and tracks the resources each operation
//! holds until it is finished, cancelled or shut down.

mod address;
mod device;
pub mod discovery;
pub mod pairing;
mod registry;
pub mod rfcomm;
pub mod stability;

use std::sync::Arc;

pub use address::Address;
pub use device::{serialize_device, serialize_device_with_state, BondState, DeviceHandle, RemoteDevice};
pub use discovery::DiscoveryResults;
pub use registry::{ReceiverSession, Session, SessionInfo, SessionKind, SessionRegistry};
pub use rfcomm::{RfcommSession, READ_BUFFER_SIZE};

use crate::events::EventSink;
use crate::platform::BluetoothAdapter;

/// Shared state handed to every session and receiver task.
#[derive(Clone)]
pub struct SessionContext {
    pub adapter: Arc<dyn BluetoothAdapter>,
    pub registry: Arc<SessionRegistry>,
    pub results: Arc<DiscoveryResults>,
    pub sink: Arc<dyn EventSink>,
    pub read_buffer_size: usize,
}

impl SessionContext {
    pub fn new(adapter: Arc<dyn BluetoothAdapter>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            adapter,
            registry: SessionRegistry::new(),
            results: Arc::new(DiscoveryResults::new()),
            sink,
            read_buffer_size: READ_BUFFER_SIZE,
        }
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }
}
