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

//! RFCOMM client sessions.
//!
//! Each session owns one connected socket and one reader task that turns
//! inbound bytes into `onRfcommDataReceived` events. The reader never removes
//! its own session; teardown happens once, on disconnect or shutdown.

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::address::Address;
use super::device::BondState;
use super::registry::{Session, SessionKind};
use super::SessionContext;
use crate::error::{Result, SnippetError};
use crate::events::{EventSink, SnippetEvent, ON_RFCOMM_DATA_RECEIVED};
use crate::platform::{BoxedReader, BoxedWriter, RfcommChannel, RfcommLink};

/// Default read buffer size.
pub const READ_BUFFER_SIZE: usize = 1024;

/// Encode text as US-ASCII. Characters outside ASCII become `?`.
pub fn encode_ascii(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect()
}

/// Decode US-ASCII bytes. Bytes above 0x7F become U+FFFD.
pub fn decode_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { char::REPLACEMENT_CHARACTER })
        .collect()
}

/// A connected RFCOMM socket plus its reader task.
pub struct RfcommSession {
    callback_id: String,
    address: Address,
    uuid: Uuid,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    link: Arc<dyn RfcommLink>,
    reader: JoinHandle<()>,
}

impl RfcommSession {
    /// Take ownership of `channel` and spawn its reader.
    pub fn start(
        callback_id: &str,
        address: Address,
        uuid: Uuid,
        channel: RfcommChannel,
        sink: Arc<dyn EventSink>,
        buffer_size: usize,
    ) -> Arc<Self> {
        let RfcommChannel {
            reader,
            writer,
            link,
        } = channel;

        let task = tokio::spawn(read_loop(
            reader,
            callback_id.to_string(),
            address,
            uuid,
            sink,
            buffer_size.max(1),
        ));

        Arc::new(Self {
            callback_id: callback_id.to_string(),
            address,
            uuid,
            writer: tokio::sync::Mutex::new(Some(writer)),
            link,
            reader: task,
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Whether the reader task has exited, by EOF, error or abort.
    pub fn reader_finished(&self) -> bool {
        self.reader.is_finished()
    }

    /// Write `data` as US-ASCII and flush.
    pub async fn send(&self, data: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| SnippetError::UnknownSession(self.callback_id.clone()))?;

        let bytes = encode_ascii(data);
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        debug!("Sent {} bytes on {}", bytes.len(), self.callback_id);
        Ok(())
    }

    /// Close the socket, then stop the reader.
    ///
    /// Returns whether the link still reports connected afterwards.
    pub async fn close(&self) -> bool {
        if let Err(e) = self.link.close().await {
            warn!("Error closing rfcomm socket for {}: {}", self.callback_id, e);
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Writer shutdown for {}: {}", self.callback_id, e);
            }
        }

        self.reader.abort();

        self.link.is_connected()
    }
}

async fn read_loop(
    mut reader: BoxedReader,
    callback_id: String,
    address: Address,
    uuid: Uuid,
    sink: Arc<dyn EventSink>,
    buffer_size: usize,
) {
    let mut buffer = vec![0u8; buffer_size];

    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => {
                info!("Rfcomm stream for {} reached end of stream", callback_id);
                break;
            }
            Ok(n) => {
                let data = decode_ascii(&buffer[..n]);
                debug!("Received {} bytes on {}", n, callback_id);
                sink.post_event(
                    SnippetEvent::new(&callback_id, ON_RFCOMM_DATA_RECEIVED)
                        .with("Address", address.to_string())
                        .with("UUID", uuid.to_string())
                        .with("Data", data),
                );
            }
            Err(e) => {
                error!("Error reading from rfcomm stream for {}: {}", callback_id, e);
                break;
            }
        }
    }
}

/// Connect to `uuid` on a bonded device and register the session.
pub async fn connect(
    ctx: &SessionContext,
    callback_id: &str,
    address: Address,
    uuid: Uuid,
) -> Result<()> {
    if ctx.registry.contains(callback_id) {
        return Err(SnippetError::SessionExists(callback_id.to_string()));
    }

    let device = ctx.adapter.remote_device(address).await?;
    if device.bond_state().await != BondState::Bonded {
        return Err(SnippetError::NotBonded(address.to_string()));
    }

    info!("Connecting rfcomm to {} ({}) for {}", address, uuid, callback_id);
    let channel = device
        .connect_rfcomm(uuid)
        .await
        .map_err(|e| SnippetError::ConnectFailed {
            address: address.to_string(),
            uuid: uuid.to_string(),
            reason: e.to_string(),
        })?;

    if !channel.link.is_connected() {
        if let Err(e) = channel.link.close().await {
            warn!("Error closing half-open socket to {}: {}", address, e);
        }
        return Err(SnippetError::ConnectFailed {
            address: address.to_string(),
            uuid: uuid.to_string(),
            reason: "socket not connected".to_string(),
        });
    }

    let session = RfcommSession::start(
        callback_id,
        address,
        uuid,
        channel,
        ctx.sink.clone(),
        ctx.read_buffer_size,
    );

    if let Err(e) = ctx.registry.insert(callback_id, Session::Rfcomm(session.clone())) {
        session.close().await;
        return Err(e);
    }

    info!("Rfcomm connected to {} for {}", address, callback_id);
    Ok(())
}

/// Send `data` on the session for `callback_id`.
pub async fn send(ctx: &SessionContext, callback_id: &str, data: &str) -> Result<()> {
    let session = ctx
        .registry
        .rfcomm(callback_id)
        .ok_or_else(|| SnippetError::UnknownSession(callback_id.to_string()))?;
    session.send(data).await
}

/// Close the session for `callback_id` and drop it from the registry.
pub async fn disconnect(ctx: &SessionContext, callback_id: &str) -> Result<()> {
    let session = match ctx.registry.take_if_kind(callback_id, SessionKind::Rfcomm) {
        Some(Session::Rfcomm(session)) => session,
        _ => return Err(SnippetError::UnknownSession(callback_id.to_string())),
    };

    let still_connected = session.close().await;
    if still_connected {
        return Err(SnippetError::DisconnectFailed(session.address().to_string()));
    }

    info!("Rfcomm disconnected from {} for {}", session.address(), callback_id);
    Ok(())
}
