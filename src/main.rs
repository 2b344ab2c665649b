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

//! Bluetooth snippet server.
//!
//! Reads JSON requests from stdin, one per line, and writes one JSON
//! response per line to stdout. Logs go to stderr.

use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bluesnip::platform::bluez::BluezPlatform;
use bluesnip::{BluetoothSnippet, Config, EventCache, RpcDispatcher};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    // Initialize logging
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    match config.logging.default_directive.parse() {
        Ok(directive) => filter = filter.add_directive(directive),
        Err(e) => eprintln!("Ignoring bad log directive: {}", e),
    }
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    info!("Starting bluesnip v{}...", env!("CARGO_PKG_VERSION"));

    let platform = Arc::new(BluezPlatform::new().await?);
    let events = Arc::new(EventCache::new(config.events.queue_capacity));
    let snippet = Arc::new(BluetoothSnippet::with_config(
        platform,
        events.clone(),
        &config,
    ));
    let dispatcher = RpcDispatcher::new(snippet.clone(), events);

    info!("Ready. Waiting for requests on stdin.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!("Host closed stdin");
                        break;
                    }
                    Err(e) => {
                        error!("Failed to read request: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }

                let response = dispatcher.handle_line(&line).await;
                let mut out = serde_json::to_string(&response)?;
                out.push('\n');
                if let Err(e) = stdout.write_all(out.as_bytes()).await {
                    warn!("Failed to write response: {}", e);
                    break;
                }
                stdout.flush().await?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    snippet.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}
