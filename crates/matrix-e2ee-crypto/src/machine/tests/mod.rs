// Copyright 2024 The Matrix.org Foundation C.I.C.
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

use std::{collections::BTreeSet, sync::Arc};

use assert_matches2::assert_matches;
use futures_util::future::join_all;
use matrix_e2ee_test::{
    alice_device_id, async_test, bob_device_id, ALICE, BOB, DEFAULT_TEST_ROOM_ID,
};
use ruma::{device_id, room_id};
use serde_json::json;

use super::{
    test_helpers::{
        deliver, encrypted_event, establish_session, exchange_devices, get_machine,
        get_machine_pair, get_machine_pair_with_session,
    },
    CryptoConfig, OlmMachine, ProcessedToDeviceEvent,
};
use crate::{
    encryption::{OlmEncryptor, RoomMember},
    error::{CryptoError, MegolmError, OlmError, SetRoomSettingsError},
    identities::LocalTrust,
    store::{CryptoStoreError, MemoryStore, RoomSettings},
    transport::NoopTransport,
    types::{
        events::{
            room_encrypted::{EncryptedEvent, RoomEncryptedEventContent},
            ToDeviceEvent,
        },
        EventEncryptionAlgorithm,
    },
};

fn event_session_id(event: &EncryptedEvent) -> String {
    assert_matches!(&event.content, RoomEncryptedEventContent::MegolmV1AesSha2(c));
    c.session_id.clone()
}

#[async_test]
async fn test_create_olm_machine() {
    let machine = get_machine(&ALICE, alice_device_id()).await;

    assert_eq!(machine.user_id(), *ALICE);
    assert_eq!(machine.device_id(), alice_device_id());

    let own_device = machine.get_device(&ALICE, alice_device_id()).await.unwrap().unwrap();
    assert_eq!(own_device.curve25519_key(), machine.identity_keys().curve25519);
    assert_eq!(own_device.local_trust_state(), LocalTrust::Verified);
}

#[async_test]
async fn test_machine_is_restored_from_the_store() {
    let store = Arc::new(MemoryStore::new());

    let machine = OlmMachine::with_store(
        &ALICE,
        alice_device_id(),
        store.clone(),
        Arc::new(NoopTransport),
        CryptoConfig::default(),
    )
    .await
    .unwrap();
    let identity_keys = machine.identity_keys();
    drop(machine);

    let machine = OlmMachine::with_store(
        &ALICE,
        alice_device_id(),
        store.clone(),
        Arc::new(NoopTransport),
        CryptoConfig::default(),
    )
    .await
    .unwrap();
    assert_eq!(machine.identity_keys().ed25519, identity_keys.ed25519);

    let error = OlmMachine::with_store(
        &ALICE,
        device_id!("OTHERDEVICE"),
        store,
        Arc::new(NoopTransport),
        CryptoConfig::default(),
    )
    .await
    .unwrap_err();
    assert_matches!(error, CryptoStoreError::MismatchedAccount { .. });
}

#[async_test]
async fn test_one_time_keys_are_generated() {
    let machine = get_machine(&ALICE, alice_device_id()).await;

    let keys = machine.generate_one_time_keys(5).await.unwrap();
    assert_eq!(keys.len(), 5);

    let more_keys = machine.generate_one_time_keys(2).await.unwrap();
    assert_eq!(more_keys.len(), 2);
    assert!(more_keys.keys().all(|k| !keys.contains_key(k)));
}

#[async_test]
async fn test_room_settings_cannot_be_downgraded() {
    let machine = get_machine(&ALICE, alice_device_id()).await;
    let room_id = *DEFAULT_TEST_ROOM_ID;

    assert!(machine.room_settings(room_id).await.unwrap().is_none());

    let settings = RoomSettings::default();
    machine.set_room_settings(room_id, &settings).await.unwrap();
    // Setting the same settings again is fine.
    machine.set_room_settings(room_id, &settings).await.unwrap();

    let olm = RoomSettings {
        algorithm: EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
        ..Default::default()
    };
    let error = machine.set_room_settings(room_id, &olm).await.unwrap_err();
    assert_matches!(error, SetRoomSettingsError::EncryptionDowngrade);

    let unknown = RoomSettings {
        algorithm: EventEncryptionAlgorithm::from("m.megolm.v2.aes-sha2"),
        ..Default::default()
    };
    let error =
        machine.set_room_settings(room_id!("!other:localhost"), &unknown).await.unwrap_err();
    assert_matches!(error, SetRoomSettingsError::InvalidSettings);

    assert_eq!(machine.room_settings(room_id).await.unwrap(), Some(settings));
}

#[async_test]
async fn test_encryption_settings_are_overridden_by_the_room() {
    let machine = get_machine(&ALICE, alice_device_id()).await;
    let room_id = *DEFAULT_TEST_ROOM_ID;

    let settings = RoomSettings {
        only_allow_trusted_devices: true,
        session_rotation_period_messages: Some(10),
        ..Default::default()
    };
    machine.set_room_settings(room_id, &settings).await.unwrap();

    let encryption_settings = machine.encryption_settings(room_id).await.unwrap();
    assert!(encryption_settings.only_allow_trusted_devices);
    assert_eq!(encryption_settings.rotation_period_msgs, 10);

    let defaults = machine.encryption_settings(room_id!("!other:localhost")).await.unwrap();
    assert_eq!(defaults, CryptoConfig::default().encryption_settings);
}

#[async_test]
async fn test_olm_to_device_roundtrip() {
    let (alice, bob) = get_machine_pair_with_session().await;

    // A room key is the simplest to-device event that goes over Olm.
    alice
        .encrypt_room_event(
            *DEFAULT_TEST_ROOM_ID,
            "m.room.message",
            &json!({ "body": "Hello" }),
            &[RoomMember::joined(&BOB)],
        )
        .await
        .unwrap();

    let sent = alice.transport.take_for(&BOB, bob_device_id());
    assert_eq!(sent.len(), 1);

    let event =
        ToDeviceEvent::new((**ALICE).to_owned(), &sent[0].event_type, sent[0].content.clone());
    let processed = bob.receive_to_device_event(&event).await.unwrap();

    assert_matches!(
        processed,
        ProcessedToDeviceEvent::Decrypted { sender_key, event: decrypted, inbound_group_session }
    );
    assert_eq!(sender_key, alice.identity_keys().curve25519);
    assert_eq!(decrypted.event_type, "m.room_key");
    assert_eq!(decrypted.sender.as_str(), ALICE.as_str());
    assert!(inbound_group_session.is_some());

    // The same Olm message can't be decrypted twice.
    let error = bob.receive_to_device_event(&event).await.unwrap_err();
    assert_matches!(error, OlmError::ReplayedMessage(..));
}

#[async_test]
async fn test_plaintext_to_device_events_are_passed_through() {
    let machine = get_machine(&ALICE, alice_device_id()).await;

    let event = ToDeviceEvent::new((**BOB).to_owned(), "m.custom", json!({ "foo": "bar" }));
    let processed = machine.receive_to_device_event(&event).await.unwrap();

    assert_matches!(processed, ProcessedToDeviceEvent::PlainText(event));
    assert_eq!(event.event_type, "m.custom");
}

#[async_test]
async fn test_room_key_with_a_worse_copy_is_ignored() {
    let (alice, bob) = get_machine_pair_with_session().await;
    let room_id = *DEFAULT_TEST_ROOM_ID;

    let content = alice
        .encrypt_room_event(
            room_id,
            "m.room.message",
            &json!({ "body": "Hello" }),
            &[RoomMember::joined(&BOB)],
        )
        .await
        .unwrap();
    deliver(&alice, &bob).await;

    let event = encrypted_event(alice.user_id(), "$event", content);
    bob.decrypt_room_event(&event, room_id, None).await.unwrap();

    // An export starting at a later index can't replace the full session.
    let session = bob
        .store()
        .get_inbound_group_session(&alice.identity_keys().curve25519, &event_session_id(&event))
        .await
        .unwrap()
        .unwrap();
    let later = session.export_at_index(1).await;

    let result = bob.import_room_keys(vec![later], false).await.unwrap();
    assert_eq!(result.imported_count, 0);
    assert_eq!(result.total_count, 1);

    bob.decrypt_room_event(&event, room_id, None).await.unwrap();
}

#[async_test]
async fn test_forwarded_room_keys_from_other_users_are_ignored() {
    let (alice, bob) = get_machine_pair_with_session().await;
    let other_alice = get_machine(&ALICE, device_id!("OTHERDEVICE")).await;
    let room_id = *DEFAULT_TEST_ROOM_ID;

    let content = alice
        .encrypt_room_event(
            room_id,
            "m.room.message",
            &json!({ "body": "Hello" }),
            &[RoomMember::joined(&BOB)],
        )
        .await
        .unwrap();
    deliver(&alice, &bob).await;

    let event = encrypted_event(alice.user_id(), "$event", content);
    let session = bob
        .store()
        .get_inbound_group_session(&alice.identity_keys().curve25519, &event_session_id(&event))
        .await
        .unwrap()
        .unwrap();

    // Bob, who isn't one of Alice's devices, forwards the key to her other
    // device.
    exchange_devices(&bob, &other_alice).await;
    establish_session(&bob, &other_alice).await;

    let forwarded = session.export().await.into_forwarded_room_key().unwrap();
    let recipient = other_alice.own_device();
    OlmEncryptor::new(&bob.inner)
        .send_encrypted(
            &recipient,
            "m.forwarded_room_key",
            serde_json::to_value(forwarded).unwrap(),
        )
        .await
        .unwrap();

    let processed = deliver(&bob, &other_alice).await;
    assert_eq!(processed.len(), 1);
    assert_matches!(
        &processed[0],
        ProcessedToDeviceEvent::Decrypted { inbound_group_session: None, .. }
    );

    let error = other_alice.decrypt_room_event(&event, room_id, None).await.unwrap_err();
    assert_matches!(error, CryptoError::Megolm(MegolmError::MissingRoomKey(None)));
}

#[async_test]
async fn test_withheld_notice_is_surfaced_on_decryption() {
    let (alice, bob) = get_machine_pair().await;
    let room_id = *DEFAULT_TEST_ROOM_ID;

    // No Olm session, Bob gets an `m.no_olm` notice instead of the key.
    let content = alice
        .encrypt_room_event(
            room_id,
            "m.room.message",
            &json!({ "body": "Hello" }),
            &[RoomMember::joined(&BOB)],
        )
        .await
        .unwrap();
    deliver(&alice, &bob).await;

    let event = encrypted_event(alice.user_id(), "$event", content);
    let error = bob.decrypt_room_event(&event, room_id, None).await.unwrap_err();

    assert_eq!(error.error_type().as_str(), "KEYS_WITHHELD");
    assert_matches!(error, CryptoError::Megolm(MegolmError::MissingRoomKey(Some(code))));
    assert_eq!(code.as_str(), "m.no_olm");
}

#[async_test]
async fn test_forget_inbound_group_session() {
    let (alice, bob) = get_machine_pair_with_session().await;
    let room_id = *DEFAULT_TEST_ROOM_ID;

    let content = alice
        .encrypt_room_event(
            room_id,
            "m.room.message",
            &json!({ "body": "Hello" }),
            &[RoomMember::joined(&BOB)],
        )
        .await
        .unwrap();
    deliver(&alice, &bob).await;

    let event = encrypted_event(alice.user_id(), "$event", content);
    bob.decrypt_room_event(&event, room_id, None).await.unwrap();

    let session_id = event_session_id(&event);
    assert!(bob.inner.replay_guard.entry(room_id, &session_id, 0).is_some());

    let sender_key = alice.identity_keys().curve25519;
    assert!(bob.forget_inbound_group_session(room_id, sender_key, &session_id).await.unwrap());
    assert!(!bob.forget_inbound_group_session(room_id, sender_key, &session_id).await.unwrap());
    assert!(bob.inner.replay_guard.entry(room_id, &session_id, 0).is_none());

    let error = bob.decrypt_room_event(&event, room_id, None).await.unwrap_err();
    assert_matches!(error, CryptoError::Megolm(MegolmError::MissingRoomKey(None)));
}

#[async_test]
async fn test_export_and_import_room_keys() {
    let (alice, bob) = get_machine_pair_with_session().await;
    let room_id = *DEFAULT_TEST_ROOM_ID;

    let content = alice
        .encrypt_room_event(
            room_id,
            "m.room.message",
            &json!({ "body": "Hello" }),
            &[RoomMember::joined(&BOB)],
        )
        .await
        .unwrap();
    let event = encrypted_event(alice.user_id(), "$event", content);

    let exported = alice.export_room_keys(|s| s.room_id() == room_id).await.unwrap();
    assert_eq!(exported.len(), 1);
    assert!(alice.export_room_keys(|s| s.room_id() != room_id).await.unwrap().is_empty());

    // Bob never got the room key over Olm, the export is all he has.
    let result = bob.import_room_keys(exported, false).await.unwrap();
    assert_eq!(result.imported_count, 1);
    assert_eq!(result.total_count, 1);
    assert!(result.keys[room_id][&alice.identity_keys().curve25519.to_base64()]
        .contains(&event_session_id(&event)));

    let decrypted = bob.decrypt_room_event(&event, room_id, None).await.unwrap();
    assert_eq!(decrypted.clear_event["content"]["body"], "Hello");

    // Importing the same keys again doesn't change anything.
    let exported = alice.export_room_keys(|s| s.room_id() == room_id).await.unwrap();
    let result = bob.import_room_keys(exported, false).await.unwrap();
    assert_eq!(result.imported_count, 0);
}

#[async_test]
async fn test_concurrent_encryption_shares_a_single_session() {
    let (alice, bob) = get_machine_pair_with_session().await;
    let room_id = *DEFAULT_TEST_ROOM_ID;
    let members = [RoomMember::joined(&BOB)];

    let contents: Vec<_> =
        (0..5).map(|i| json!({ "msgtype": "m.text", "body": i.to_string() })).collect();

    let encrypted = join_all(
        contents
            .iter()
            .map(|content| alice.encrypt_room_event(room_id, "m.room.message", content, &members)),
    )
    .await;

    let session_ids: BTreeSet<_> = encrypted
        .into_iter()
        .map(|content| {
            assert_matches!(content.unwrap(), RoomEncryptedEventContent::MegolmV1AesSha2(c));
            c.session_id
        })
        .collect();

    assert_eq!(session_ids.len(), 1);
    assert_eq!(alice.transport.take_for(bob.user_id(), bob.device_id()).len(), 1);
}
