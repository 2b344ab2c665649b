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

//! Error types surfaced to RPC callers.

use thiserror::Error;

/// Errors raised synchronously by snippet operations.
#[derive(Error, Debug)]
pub enum SnippetError {
    /// The platform refused to start discovery, bonding or unbonding.
    #[error("Failed to initiate {0}")]
    InitiationFailed(String),

    /// The platform refused a cancel request. Cleanup was still performed.
    #[error("Failed to cancel {0}")]
    CancelFailed(String),

    /// Address not found in the discovery results or bonded list.
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// No active session of the required kind for this callback id.
    #[error("No active session for callback id {0}")]
    UnknownSession(String),

    /// A session is already registered under this callback id.
    #[error("Session already exists for callback id {0}")]
    SessionExists(String),

    /// RFCOMM requires a bonded device.
    #[error("Cannot connect to rfcomm on unbonded device {0}")]
    NotBonded(String),

    #[error("Could not connect to rfcomm uuid {uuid} on {address}: {reason}")]
    ConnectFailed {
        address: String,
        uuid: String,
        reason: String,
    },

    #[error("Could not disconnect rfcomm from {0}")]
    DisconnectFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Adapter power state did not settle in time.
    #[error("Failed to reach a stable Bluetooth state within {0} s")]
    StabilityTimeout(u64),

    #[error("Invalid Bluetooth address: {0}")]
    InvalidAddress(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Unknown RPC method: {0}")]
    UnknownMethod(String),

    /// No matching event arrived before the wait deadline.
    #[error("Timed out waiting for event {name} on {callback_id}")]
    EventTimeout { callback_id: String, name: String },

    #[error("Platform error: {0}")]
    Platform(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SnippetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_subject() {
        let err = SnippetError::NotBonded("AA:BB:CC:DD:EE:01".to_string());
        assert!(err.to_string().contains("AA:BB:CC:DD:EE:01"));

        let err = SnippetError::StabilityTimeout(30);
        assert_eq!(
            err.to_string(),
            "Failed to reach a stable Bluetooth state within 30 s"
        );
    }

    #[test]
    fn test_platform_errors_convert() {
        let err: SnippetError = anyhow::anyhow!("adapter gone").into();
        assert!(matches!(err, SnippetError::Platform(_)));
    }
}
