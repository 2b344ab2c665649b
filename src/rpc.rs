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

//! Named-RPC dispatch.
//!
//! Requests are `{"id", "method", "params"}`. Asynchronous methods are given
//! a generated callback id as their first argument; it is returned to the
//! host in `callback` so it can poll the event cache.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Result, SnippetError};
use crate::events::EventCache;
use crate::snippet::BluetoothSnippet;

/// An RPC request from the host.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

/// Reply to one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcResponse {
    pub id: u64,
    pub result: Value,
    pub callback: Option<String>,
    pub error: Option<String>,
}

/// RPC methods exposed to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcMethod {
    Discover,
    CancelDiscover,
    PairDevice,
    UnpairDevice,
    RfcommConnect,
    RfcommDisconnect,
    RfcommSend,
    ClearRcvData,
    WaitForStableState,
    Shutdown,
    EventWaitAndGet,
    EventGetAll,
}

impl RpcMethod {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "discover" => Some(Self::Discover),
            "cancelDiscover" => Some(Self::CancelDiscover),
            "pairDevice" => Some(Self::PairDevice),
            "unpairDevice" => Some(Self::UnpairDevice),
            "rfcommConnect" => Some(Self::RfcommConnect),
            "rfcommDisconnect" => Some(Self::RfcommDisconnect),
            "rfcommSend" => Some(Self::RfcommSend),
            "clearRcvData" => Some(Self::ClearRcvData),
            "waitForStableState" => Some(Self::WaitForStableState),
            "shutdown" => Some(Self::Shutdown),
            "eventWaitAndGet" => Some(Self::EventWaitAndGet),
            "eventGetAll" => Some(Self::EventGetAll),
            _ => None,
        }
    }

    /// Whether the method takes a generated callback id.
    pub fn is_async(&self) -> bool {
        matches!(
            self,
            Self::Discover | Self::PairDevice | Self::UnpairDevice | Self::RfcommConnect
        )
    }
}

fn str_param<'a>(params: &'a [Value], index: usize, name: &str) -> Result<&'a str> {
    params
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| SnippetError::InvalidParams(format!("missing string parameter '{}'", name)))
}

fn u64_param(params: &[Value], index: usize, name: &str) -> Result<u64> {
    params
        .get(index)
        .and_then(Value::as_u64)
        .ok_or_else(|| SnippetError::InvalidParams(format!("missing integer parameter '{}'", name)))
}

/// Routes requests to a snippet and its event cache.
pub struct RpcDispatcher {
    snippet: Arc<BluetoothSnippet>,
    events: Arc<EventCache>,
    next_callback: AtomicU64,
}

impl RpcDispatcher {
    pub fn new(snippet: Arc<BluetoothSnippet>, events: Arc<EventCache>) -> Self {
        Self {
            snippet,
            events,
            next_callback: AtomicU64::new(0),
        }
    }

    /// Handle one newline-delimited JSON request.
    pub async fn handle_line(&self, line: &str) -> RpcResponse {
        match serde_json::from_str::<RpcRequest>(line) {
            Ok(request) => self.handle(request).await,
            Err(e) => {
                warn!("Malformed request: {}", e);
                RpcResponse {
                    id: 0,
                    result: Value::Null,
                    callback: None,
                    error: Some(format!("Malformed request: {}", e)),
                }
            }
        }
    }

    pub async fn handle(&self, request: RpcRequest) -> RpcResponse {
        debug!("RPC {} {}", request.id, request.method);

        let outcome = match RpcMethod::parse(&request.method) {
            Some(method) => {
                let callback = method.is_async().then(|| {
                    let n = self.next_callback.fetch_add(1, Ordering::Relaxed) + 1;
                    format!("{}-{}", n, request.id)
                });
                self.call(method, callback.as_deref(), &request.params)
                    .await
                    .map(|result| (result, callback))
            }
            None => Err(SnippetError::UnknownMethod(request.method.clone())),
        };

        match outcome {
            Ok((result, callback)) => RpcResponse {
                id: request.id,
                result,
                callback,
                error: None,
            },
            Err(e) => {
                warn!("RPC {} failed: {}", request.method, e);
                RpcResponse {
                    id: request.id,
                    result: Value::Null,
                    callback: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn call(&self, method: RpcMethod, callback: Option<&str>, params: &[Value]) -> Result<Value> {
        let snippet = &self.snippet;
        let callback_id = callback.unwrap_or_default();

        match method {
            RpcMethod::Discover => snippet.discover(callback_id).await?,
            RpcMethod::PairDevice => {
                snippet
                    .pair_device(callback_id, str_param(params, 0, "address")?)
                    .await?
            }
            RpcMethod::UnpairDevice => {
                snippet
                    .unpair_device(callback_id, str_param(params, 0, "address")?)
                    .await?
            }
            RpcMethod::RfcommConnect => {
                snippet
                    .rfcomm_connect(
                        callback_id,
                        str_param(params, 0, "address")?,
                        str_param(params, 1, "uuid")?,
                    )
                    .await?
            }
            RpcMethod::CancelDiscover => {
                snippet
                    .cancel_discover(str_param(params, 0, "callbackId")?)
                    .await?
            }
            RpcMethod::RfcommDisconnect => {
                snippet
                    .rfcomm_disconnect(str_param(params, 0, "callbackId")?)
                    .await?
            }
            RpcMethod::RfcommSend => {
                snippet
                    .rfcomm_send(
                        str_param(params, 0, "callbackId")?,
                        str_param(params, 1, "data")?,
                    )
                    .await?
            }
            RpcMethod::ClearRcvData => {
                snippet.clear_rcv_data(str_param(params, 0, "callbackId")?)
            }
            RpcMethod::WaitForStableState => {
                let state = snippet.wait_for_stable_state().await?;
                return Ok(Value::String(format!("{:?}", state)));
            }
            RpcMethod::Shutdown => snippet.shutdown().await,
            RpcMethod::EventWaitAndGet => {
                let event = self
                    .events
                    .wait_and_get(
                        str_param(params, 0, "callbackId")?,
                        str_param(params, 1, "eventName")?,
                        Duration::from_millis(u64_param(params, 2, "timeoutMs")?),
                    )
                    .await?;
                return serde_json::to_value(event).map_err(|e| SnippetError::Platform(e.into()));
            }
            RpcMethod::EventGetAll => {
                let events = self.events.get_all(
                    str_param(params, 0, "callbackId")?,
                    str_param(params, 1, "eventName")?,
                );
                return serde_json::to_value(events).map_err(|e| SnippetError::Platform(e.into()));
            }
        }

        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::BondState;
    use crate::platform::memory::MemoryPlatform;
    use serde_json::json;

    fn dispatcher() -> (Arc<MemoryPlatform>, RpcDispatcher) {
        let platform = MemoryPlatform::new();
        let events = Arc::new(EventCache::default());
        let snippet = Arc::new(BluetoothSnippet::new(platform.clone(), events.clone()));
        (platform, RpcDispatcher::new(snippet, events))
    }

    #[test]
    fn test_method_names() {
        assert_eq!(RpcMethod::parse("discover"), Some(RpcMethod::Discover));
        assert_eq!(RpcMethod::parse("rfcommSend"), Some(RpcMethod::RfcommSend));
        assert_eq!(RpcMethod::parse("boseDiscover"), None);
        assert!(RpcMethod::RfcommConnect.is_async());
        assert!(!RpcMethod::RfcommSend.is_async());
    }

    #[tokio::test]
    async fn test_async_method_returns_callback() {
        let (platform, dispatcher) = dispatcher();
        let response = dispatcher
            .handle_line(r#"{"id": 7, "method": "discover", "params": []}"#)
            .await;

        assert_eq!(response.error, None);
        assert_eq!(response.callback.as_deref(), Some("1-7"));
        assert_eq!(platform.active_receivers(), 1);
    }

    #[tokio::test]
    async fn test_unknown_method_and_bad_params() {
        let (_platform, dispatcher) = dispatcher();

        let response = dispatcher
            .handle(RpcRequest {
                id: 1,
                method: "btEnable".to_string(),
                params: vec![],
            })
            .await;
        assert!(response.error.unwrap().contains("btEnable"));

        let response = dispatcher
            .handle(RpcRequest {
                id: 2,
                method: "rfcommSend".to_string(),
                params: vec![json!("c1")],
            })
            .await;
        assert!(response.error.unwrap().contains("data"));
    }

    #[tokio::test]
    async fn test_pairing_event_polled_through_cache() {
        let (platform, dispatcher) = dispatcher();
        platform.add_device("AA:BB:CC:DD:EE:01".parse().unwrap(), "Target", BondState::Bonded);

        let scan = dispatcher
            .handle_line(r#"{"id": 1, "method": "discover", "params": []}"#)
            .await;
        let scan_id = scan.callback.unwrap();
        platform.emit_device_found("AA:BB:CC:DD:EE:01".parse().unwrap());

        let found = dispatcher
            .handle(RpcRequest {
                id: 2,
                method: "eventWaitAndGet".to_string(),
                params: vec![json!(scan_id), json!("onDiscoveryReceive"), json!(5000)],
            })
            .await;
        assert_eq!(found.result["data"]["device"]["Address"], "AA:BB:CC:DD:EE:01");

        let pair = dispatcher
            .handle(RpcRequest {
                id: 3,
                method: "pairDevice".to_string(),
                params: vec![json!("AA:BB:CC:DD:EE:01")],
            })
            .await;
        let pair_id = pair.callback.unwrap();

        let events = dispatcher
            .handle(RpcRequest {
                id: 4,
                method: "eventGetAll".to_string(),
                params: vec![json!(pair_id), json!("onPairingEvent")],
            })
            .await;
        let events = events.result.as_array().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["data"]["device"]["BondState"], "BOND_BONDED");
    }
}
