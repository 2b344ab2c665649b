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

//! Integration tests for the full session flow against the in-memory platform.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use bluesnip::bluetooth::{Address, BondState, RemoteDevice};
use bluesnip::events::{ON_DISCOVERY_RECEIVE, ON_PAIRING_EVENT, ON_RFCOMM_DATA_RECEIVED};
use bluesnip::platform::memory::MemoryPlatform;
use bluesnip::platform::RfcommLink;
use bluesnip::{BluetoothSnippet, EventCache, SnippetError};

const DEVICE: &str = "AA:BB:CC:DD:EE:01";
const SPP_UUID: &str = "00001101-0000-1000-8000-00805f9b34fb";
const WAIT: Duration = Duration::from_secs(2);

fn addr(s: &str) -> Address {
    s.parse().unwrap()
}

fn setup() -> (Arc<MemoryPlatform>, Arc<EventCache>, BluetoothSnippet) {
    let platform = MemoryPlatform::new();
    let events = Arc::new(EventCache::default());
    let snippet = BluetoothSnippet::new(platform.clone(), events.clone());
    (platform, events, snippet)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Run a discovery under `cid` that finds `DEVICE` and leave it running.
async fn discover_device(platform: &MemoryPlatform, events: &EventCache, snippet: &BluetoothSnippet, cid: &str) {
    snippet.discover(cid).await.unwrap();
    platform.emit_device_found(addr(DEVICE));
    events.wait_and_get(cid, ON_DISCOVERY_RECEIVE, WAIT).await.unwrap();
}

#[tokio::test]
async fn test_discovery_reports_device_then_finishes() {
    let (platform, events, snippet) = setup();
    platform.add_device(addr(DEVICE), "Headset", BondState::None);

    snippet.discover("d1").await.unwrap();
    assert_eq!(platform.active_receivers(), 1);

    platform.emit_device_found(addr(DEVICE));
    platform.emit_discovery_finished();

    let event = events
        .wait_and_get("d1", ON_DISCOVERY_RECEIVE, WAIT)
        .await
        .unwrap();
    assert_eq!(event.callback_id, "d1");
    assert_eq!(event.data["device"]["Address"], DEVICE);
    assert_eq!(event.data["device"]["Name"], "Headset");

    let registry = snippet.registry().clone();
    wait_until(|| registry.is_empty()).await;
    assert_eq!(platform.active_receivers(), 0);
    assert!(snippet.discovery_results().contains(&addr(DEVICE)));
    assert!(events.get_all("d1", ON_DISCOVERY_RECEIVE).is_empty());
}

#[tokio::test]
async fn test_pairing_confirms_then_reports_bonded() {
    let (platform, events, snippet) = setup();
    let device = platform.add_device(addr(DEVICE), "Headset", BondState::None);
    discover_device(&platform, &events, &snippet, "d1").await;

    snippet.pair_device("p1", DEVICE).await.unwrap();
    assert_eq!(device.bond_state().await, BondState::Bonding);

    platform.emit_pairing_request(addr(DEVICE));
    platform.emit_bond_state(addr(DEVICE), BondState::Bonded);

    let first = events.wait_and_get("p1", ON_PAIRING_EVENT, WAIT).await.unwrap();
    assert_eq!(first.data["result"]["pairing"], "confirmed");
    assert_eq!(first.data["device"]["Address"], DEVICE);

    let second = events.wait_and_get("p1", ON_PAIRING_EVENT, WAIT).await.unwrap();
    assert_eq!(second.data["device"]["BondState"], "BOND_BONDED");

    let registry = snippet.registry().clone();
    wait_until(|| !registry.contains("p1")).await;
    assert_eq!(device.confirmations(), vec![true]);
    assert!(events.get_all("p1", ON_PAIRING_EVENT).is_empty());
}

#[tokio::test]
async fn test_pairing_ignores_other_devices() {
    let (platform, events, snippet) = setup();
    platform.add_device(addr(DEVICE), "Headset", BondState::None);
    platform.add_device(addr("AA:BB:CC:DD:EE:02"), "Other", BondState::None);
    discover_device(&platform, &events, &snippet, "d1").await;

    snippet.pair_device("p1", DEVICE).await.unwrap();
    platform.emit_bond_state(addr("AA:BB:CC:DD:EE:02"), BondState::Bonded);
    platform.emit_bond_state(addr(DEVICE), BondState::Bonded);

    let event = events.wait_and_get("p1", ON_PAIRING_EVENT, WAIT).await.unwrap();
    assert_eq!(event.data["device"]["Address"], DEVICE);

    let registry = snippet.registry().clone();
    wait_until(|| !registry.contains("p1")).await;
    assert!(events.get_all("p1", ON_PAIRING_EVENT).is_empty());
}

#[tokio::test]
async fn test_pair_unknown_device_fails() {
    let (platform, _events, snippet) = setup();
    platform.add_device(addr(DEVICE), "Headset", BondState::None);

    let err = snippet.pair_device("p1", DEVICE).await.unwrap_err();
    assert!(matches!(err, SnippetError::UnknownDevice(_)));
    assert!(snippet.registry().is_empty());
    assert_eq!(platform.active_receivers(), 0);
}

#[tokio::test]
async fn test_pair_already_bonded_emits_single_event() {
    let (platform, events, snippet) = setup();
    platform.add_device(addr(DEVICE), "Headset", BondState::Bonded);
    discover_device(&platform, &events, &snippet, "d1").await;
    let receivers = platform.active_receivers();

    snippet.pair_device("p1", DEVICE).await.unwrap();

    let all = events.get_all("p1", ON_PAIRING_EVENT);
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].data["device"]["BondState"], "BOND_BONDED");
    assert!(!snippet.registry().contains("p1"));
    assert_eq!(platform.active_receivers(), receivers);
}

#[tokio::test]
async fn test_unpair_reaches_none() {
    let (platform, events, snippet) = setup();
    platform.add_device(addr(DEVICE), "Headset", BondState::Bonded);

    snippet.unpair_device("u1", DEVICE).await.unwrap();
    assert!(snippet.registry().contains("u1"));

    platform.emit_bond_state(addr(DEVICE), BondState::None);

    let event = events.wait_and_get("u1", ON_PAIRING_EVENT, WAIT).await.unwrap();
    assert_eq!(event.data["device"]["BondState"], "BOND_NONE");

    let registry = snippet.registry().clone();
    wait_until(|| registry.is_empty()).await;
    assert_eq!(platform.active_receivers(), 0);
}

#[tokio::test]
async fn test_unpair_unbonded_device_fails() {
    let (platform, _events, snippet) = setup();
    platform.add_device(addr(DEVICE), "Headset", BondState::None);

    let err = snippet.unpair_device("u1", DEVICE).await.unwrap_err();
    assert!(matches!(err, SnippetError::UnknownDevice(_)));
    assert!(snippet.registry().is_empty());
}

#[tokio::test]
async fn test_rfcomm_connect_requires_bond() {
    let (platform, _events, snippet) = setup();
    platform.add_device(addr(DEVICE), "Headset", BondState::None);

    let err = snippet.rfcomm_connect("r1", DEVICE, SPP_UUID).await.unwrap_err();
    assert!(matches!(err, SnippetError::NotBonded(_)));
    assert!(snippet.registry().is_empty());
    assert_eq!(platform.open_links(), 0);
}

#[tokio::test]
async fn test_rfcomm_session_receives_and_disconnects() {
    let (platform, events, snippet) = setup();
    let device = platform.add_device(addr(DEVICE), "Headset", BondState::Bonded);

    snippet.rfcomm_connect("r1", DEVICE, SPP_UUID).await.unwrap();
    let mut peer = device.take_rfcomm_peer().unwrap();
    assert_eq!(peer.uuid.to_string(), SPP_UUID);
    let session = snippet.registry().rfcomm("r1").unwrap();
    assert_eq!(session.uuid().to_string(), SPP_UUID);
    assert!(!session.reader_finished());

    peer.stream.write_all(b"OK\r\n").await.unwrap();
    let event = events
        .wait_and_get("r1", ON_RFCOMM_DATA_RECEIVED, WAIT)
        .await
        .unwrap();
    assert_eq!(event.data["Data"], "OK\r\n");
    assert_eq!(event.data["Address"], DEVICE);
    assert_eq!(event.data["UUID"], SPP_UUID);

    snippet.rfcomm_send("r1", "AT\u{e9}\r").await.unwrap();
    let mut buf = [0u8; 4];
    peer.stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"AT?\r");

    snippet.rfcomm_disconnect("r1").await.unwrap();
    assert!(snippet.registry().is_empty());
    assert!(!peer.link.is_connected());
    assert!(!session.is_connected());
    wait_until(|| session.reader_finished()).await;

    let mut rest = Vec::new();
    let n = tokio::time::timeout(WAIT, peer.stream.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_send_after_disconnect_is_unknown_session() {
    let (platform, _events, snippet) = setup();
    platform.add_device(addr(DEVICE), "Headset", BondState::Bonded);

    snippet.rfcomm_connect("r1", DEVICE, SPP_UUID).await.unwrap();
    snippet.rfcomm_disconnect("r1").await.unwrap();

    let err = snippet.rfcomm_send("r1", "AT\r").await.unwrap_err();
    assert!(matches!(err, SnippetError::UnknownSession(_)));

    let err = snippet.rfcomm_disconnect("r1").await.unwrap_err();
    assert!(matches!(err, SnippetError::UnknownSession(_)));
}

#[tokio::test]
async fn test_disconnect_reports_stuck_link() {
    let (platform, _events, snippet) = setup();
    let device = platform.add_device(addr(DEVICE), "Headset", BondState::Bonded);

    snippet.rfcomm_connect("r1", DEVICE, SPP_UUID).await.unwrap();
    let peer = device.take_rfcomm_peer().unwrap();
    peer.link.set_stuck(true);

    let err = snippet.rfcomm_disconnect("r1").await.unwrap_err();
    assert!(matches!(err, SnippetError::DisconnectFailed(_)));
    assert!(snippet.registry().is_empty());
}

#[tokio::test]
async fn test_rfcomm_connect_refused() {
    let (platform, _events, snippet) = setup();
    let device = platform.add_device(addr(DEVICE), "Headset", BondState::Bonded);
    device.refuse_connections(true);

    let err = snippet.rfcomm_connect("r1", DEVICE, SPP_UUID).await.unwrap_err();
    assert!(matches!(err, SnippetError::ConnectFailed { .. }));
    assert!(snippet.registry().is_empty());
}

#[tokio::test]
async fn test_shutdown_releases_everything() {
    let (platform, events, snippet) = setup();
    let device = platform.add_device(addr(DEVICE), "Headset", BondState::Bonded);

    snippet.discover("d1").await.unwrap();
    snippet.rfcomm_connect("r1", DEVICE, SPP_UUID).await.unwrap();
    let mut peer = device.take_rfcomm_peer().unwrap();
    let session = snippet.registry().rfcomm("r1").unwrap();
    assert_eq!(snippet.registry().len(), 2);
    assert_eq!(platform.active_receivers(), 1);
    assert_eq!(platform.open_links(), 1);

    snippet.shutdown().await;

    assert!(snippet.registry().is_empty());
    assert_eq!(platform.active_receivers(), 0);
    assert_eq!(platform.open_links(), 0);
    wait_until(|| session.reader_finished()).await;
    assert!(events.is_empty());

    let mut rest = Vec::new();
    let n = tokio::time::timeout(WAIT, peer.stream.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_cancel_discover_unsubscribes_even_on_refusal() {
    let (platform, _events, snippet) = setup();

    snippet.discover("d1").await.unwrap();
    platform.refuse_cancel_discovery(true);

    let err = snippet.cancel_discover("d1").await.unwrap_err();
    assert!(matches!(err, SnippetError::CancelFailed(_)));
    assert!(snippet.registry().is_empty());
    assert_eq!(platform.active_receivers(), 0);
}

#[tokio::test]
async fn test_cancel_discover_when_idle_is_noop() {
    let (platform, _events, snippet) = setup();

    snippet.cancel_discover("d1").await.unwrap();
    assert!(snippet.registry().is_empty());
    assert_eq!(platform.active_receivers(), 0);
}

#[tokio::test]
async fn test_discovery_refused_leaves_no_receiver() {
    let (platform, _events, snippet) = setup();
    platform.refuse_start_discovery(true);

    let err = snippet.discover("d1").await.unwrap_err();
    assert!(matches!(err, SnippetError::InitiationFailed(_)));
    assert!(snippet.registry().is_empty());
    assert_eq!(platform.active_receivers(), 0);
}

#[tokio::test]
async fn test_duplicate_callback_id_rejected() {
    let (platform, _events, snippet) = setup();
    platform.add_device(addr(DEVICE), "Headset", BondState::Bonded);

    snippet.discover("c1").await.unwrap();
    let err = snippet.rfcomm_connect("c1", DEVICE, SPP_UUID).await.unwrap_err();
    assert!(matches!(err, SnippetError::SessionExists(_)));
    assert_eq!(snippet.registry().len(), 1);
    assert_eq!(platform.open_links(), 0);
}

#[tokio::test]
async fn test_new_discovery_clears_results() {
    let (platform, events, snippet) = setup();
    discover_device(&platform, &events, &snippet, "d1").await;
    platform.emit_discovery_finished();

    let registry = snippet.registry().clone();
    wait_until(|| registry.is_empty()).await;
    assert!(snippet.discovery_results().contains(&addr(DEVICE)));

    snippet.discover("d2").await.unwrap();
    assert!(snippet.discovery_results().is_empty());
}

#[tokio::test]
async fn test_restarting_discovery_retires_previous_session() {
    let (platform, events, snippet) = setup();
    platform.add_device(addr(DEVICE), "Headset", BondState::None);

    snippet.discover("d1").await.unwrap();
    snippet.discover("d2").await.unwrap();

    let registry = snippet.registry().clone();
    wait_until(|| !registry.contains("d1")).await;
    assert!(registry.contains("d2"));
    assert_eq!(platform.active_receivers(), 1);

    platform.emit_device_found(addr(DEVICE));
    let event = events
        .wait_and_get("d2", ON_DISCOVERY_RECEIVE, WAIT)
        .await
        .unwrap();
    assert_eq!(event.data["device"]["Address"], DEVICE);
    assert!(events.get_all("d1", ON_DISCOVERY_RECEIVE).is_empty());
}

#[tokio::test]
async fn test_concurrent_pairings_keep_events_apart() {
    const OTHER: &str = "AA:BB:CC:DD:EE:02";
    let (platform, events, snippet) = setup();
    platform.add_device(addr(DEVICE), "Headset", BondState::None);
    platform.add_device(addr(OTHER), "Keyboard", BondState::None);

    snippet.discover("d1").await.unwrap();
    platform.emit_device_found(addr(DEVICE));
    platform.emit_device_found(addr(OTHER));
    for _ in 0..2 {
        events.wait_and_get("d1", ON_DISCOVERY_RECEIVE, WAIT).await.unwrap();
    }

    snippet.pair_device("p1", DEVICE).await.unwrap();
    snippet.pair_device("p2", OTHER).await.unwrap();
    assert_eq!(snippet.registry().len(), 3);
    assert_eq!(
        snippet.registry().get("p2").unwrap().pairing,
        Some((addr(OTHER), BondState::Bonded))
    );

    platform.emit_pairing_request(addr(OTHER));
    platform.emit_bond_state(addr(OTHER), BondState::Bonded);
    platform.emit_bond_state(addr(DEVICE), BondState::Bonded);

    let confirmed = events.wait_and_get("p2", ON_PAIRING_EVENT, WAIT).await.unwrap();
    assert_eq!(confirmed.data["result"]["pairing"], "confirmed");
    assert_eq!(confirmed.data["device"]["Address"], OTHER);
    let bonded = events.wait_and_get("p2", ON_PAIRING_EVENT, WAIT).await.unwrap();
    assert_eq!(bonded.data["device"]["Address"], OTHER);
    assert_eq!(bonded.data["device"]["BondState"], "BOND_BONDED");

    let bonded = events.wait_and_get("p1", ON_PAIRING_EVENT, WAIT).await.unwrap();
    assert_eq!(bonded.data["device"]["Address"], DEVICE);
    assert!(bonded.get("result").is_none());

    let registry = snippet.registry().clone();
    wait_until(|| !registry.contains("p1") && !registry.contains("p2")).await;
    assert_eq!(registry.callback_ids(), vec!["d1".to_string()]);
    assert_eq!(platform.active_receivers(), 1);
    assert!(events.get_all("p1", ON_PAIRING_EVENT).is_empty());
    assert!(events.get_all("p2", ON_PAIRING_EVENT).is_empty());
}

#[tokio::test]
async fn test_failed_confirmation_reports_no_confirmed_event() {
    let (platform, events, snippet) = setup();
    let device = platform.add_device(addr(DEVICE), "Headset", BondState::None);
    device.refuse_confirmation(true);
    discover_device(&platform, &events, &snippet, "d1").await;

    snippet.pair_device("p1", DEVICE).await.unwrap();
    platform.emit_pairing_request(addr(DEVICE));
    platform.emit_bond_state(addr(DEVICE), BondState::Bonded);

    let event = events.wait_and_get("p1", ON_PAIRING_EVENT, WAIT).await.unwrap();
    assert!(event.get("result").is_none());
    assert_eq!(event.data["device"]["BondState"], "BOND_BONDED");

    let registry = snippet.registry().clone();
    wait_until(|| !registry.contains("p1")).await;
    assert!(events.get_all("p1", ON_PAIRING_EVENT).is_empty());
    assert!(device.confirmations().is_empty());
}
