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

//! Wait for the adapter power state to settle.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::StabilityConfig;
use crate::error::{Result, SnippetError};
use crate::platform::{AdapterState, BluetoothAdapter};

/// Block until the adapter state has not changed for `config.window_secs`.
///
/// The state is polled every `config.poll_interval_secs`. Fails with
/// `StabilityTimeout` if no such window is seen within `config.timeout_secs`.
pub async fn wait_for_stable_state(
    adapter: &dyn BluetoothAdapter,
    config: &StabilityConfig,
) -> Result<AdapterState> {
    let window = Duration::from_secs(config.window_secs);
    let poll = Duration::from_secs(config.poll_interval_secs.max(1));
    let deadline = Instant::now() + Duration::from_secs(config.timeout_secs);

    let mut stable_at = Instant::now() + window;
    let mut previous = adapter.state().await?;

    while Instant::now() < deadline {
        tokio::time::sleep(poll).await;

        let current = adapter.state().await?;
        if current != previous {
            debug!("Adapter state changed {:?} -> {:?}", previous, current);
            stable_at = Instant::now() + window;
        }
        if stable_at <= Instant::now() {
            info!("Adapter state settled at {:?}", current);
            return Ok(current);
        }
        previous = current;
    }

    Err(SnippetError::StabilityTimeout(config.timeout_secs))
}
