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

//! Bluetooth Classic snippet: discovery, pairing and RFCOMM sessions driven
//! over RPC, with results delivered as callback-tagged events.

pub mod bluetooth;
pub mod config;
pub mod error;
pub mod events;
pub mod platform;
pub mod rpc;
pub mod snippet;

pub use config::Config;
pub use error::{Result, SnippetError};
pub use events::{EventCache, EventSink, SnippetEvent};
pub use rpc::{RpcDispatcher, RpcRequest, RpcResponse};
pub use snippet::BluetoothSnippet;
