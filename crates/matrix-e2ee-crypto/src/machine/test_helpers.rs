// Copyright 2020 The Matrix.org Foundation C.I.C.
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

//! A set of helper functions for creating [`OlmMachine`]s, and pairs of
//! interconnected machines.

use std::{ops::Deref, sync::Arc};

use matrix_e2ee_test::{alice_device_id, bob_device_id, ALICE, BOB};
use ruma::{DeviceId, EventId, MilliSecondsSinceUnixEpoch, UserId};

use super::{CryptoConfig, OlmMachine, ProcessedToDeviceEvent};
use crate::{
    identities::LocalTrust,
    store::MemoryStore,
    transport::RecordingTransport,
    types::events::{
        room_encrypted::{EncryptedEvent, RoomEncryptedEventContent},
        ToDeviceEvent,
    },
};

/// An [`OlmMachine`] together with the transport it sends its to-device
/// events over.
#[derive(Debug)]
pub(crate) struct TestMachine {
    pub machine: OlmMachine,
    pub transport: Arc<RecordingTransport>,
}

impl Deref for TestMachine {
    type Target = OlmMachine;

    fn deref(&self) -> &Self::Target {
        &self.machine
    }
}

pub(crate) async fn get_machine_with_config(
    user_id: &UserId,
    device_id: &DeviceId,
    config: CryptoConfig,
) -> TestMachine {
    let transport = Arc::new(RecordingTransport::new());
    let machine =
        OlmMachine::with_store(user_id, device_id, MemoryStore::new(), transport.clone(), config)
            .await
            .unwrap();

    TestMachine { machine, transport }
}

pub(crate) async fn get_machine(user_id: &UserId, device_id: &DeviceId) -> TestMachine {
    get_machine_with_config(user_id, device_id, CryptoConfig::default()).await
}

/// Let both machines know about, and trust, the device of the other one.
pub(crate) async fn exchange_devices(first: &OlmMachine, second: &OlmMachine) {
    let mut first_device = first.own_device();
    first_device.set_local_trust(LocalTrust::Verified);
    second.save_device(first_device).await.unwrap();

    let mut second_device = second.own_device();
    second_device.set_local_trust(LocalTrust::Verified);
    first.save_device(second_device).await.unwrap();
}

/// Create an Olm session from `sender` to `recipient` using a fresh one-time
/// key of the recipient.
pub(crate) async fn establish_session(sender: &OlmMachine, recipient: &OlmMachine) {
    let one_time_keys = recipient.generate_one_time_keys(1).await.unwrap();
    let one_time_key = *one_time_keys.values().next().unwrap();

    sender.create_outbound_session(&recipient.own_device(), one_time_key).await.unwrap();
}

/// Alice and Bob, each knowing and trusting the device of the other.
pub(crate) async fn get_machine_pair() -> (TestMachine, TestMachine) {
    let alice = get_machine(&ALICE, alice_device_id()).await;
    let bob = get_machine(&BOB, bob_device_id()).await;

    exchange_devices(&alice, &bob).await;

    (alice, bob)
}

/// Alice and Bob, where Alice has an Olm session she can encrypt to Bob with.
pub(crate) async fn get_machine_pair_with_session() -> (TestMachine, TestMachine) {
    let (alice, bob) = get_machine_pair().await;
    establish_session(&alice, &bob).await;

    (alice, bob)
}

/// Hand every to-device event `sender` sent to the device of `recipient` over
/// to `recipient`.
pub(crate) async fn deliver(
    sender: &TestMachine,
    recipient: &TestMachine,
) -> Vec<ProcessedToDeviceEvent> {
    let to_recipient = sender.transport.take_for(recipient.user_id(), recipient.device_id());

    let mut processed = Vec::new();

    for sent in to_recipient {
        let event = ToDeviceEvent::new(sender.user_id().to_owned(), sent.event_type, sent.content);
        processed.push(recipient.receive_to_device_event(&event).await.unwrap());
    }

    processed
}

/// An encrypted room event, as it would come down the sync.
pub(crate) fn encrypted_event(
    sender: &UserId,
    event_id: &str,
    content: RoomEncryptedEventContent,
) -> EncryptedEvent {
    EncryptedEvent {
        sender: sender.to_owned(),
        event_id: EventId::parse(event_id).unwrap(),
        content,
        origin_server_ts: MilliSecondsSinceUnixEpoch::now(),
        room_id: None,
    }
}
