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

use std::collections::{BTreeMap, BTreeSet};

use ruma::{DeviceId, OwnedDeviceId, RoomId, UserId};
use serde_json::Value;
use tracing::{debug, field::debug, info, instrument, trace, warn, Span};
use vodozemac::Curve25519PublicKey;

use super::{OlmEncryptor, Recipients, RoomMember};
use crate::{
    error::{CryptoError, EventError, MegolmError, MegolmResult, OlmError, OlmResult},
    gossiping::should_share_key,
    identities::ReadOnlyDevice,
    machine::OlmMachineInner,
    olm::{EncryptionSettings, InboundGroupSession, OutboundGroupSession, ShareState},
    store::Changes,
    types::{
        events::{
            room_encrypted::{EncryptedEvent, RoomEncryptedEventContent},
            room_key_withheld::{RoomKeyWithheldContent, WithheldCode},
            EventType,
        },
        DecryptionResult,
    },
};

/// The Megolm engine.
///
/// Room events are encrypted once with an outbound group session, the key of
/// the session is shared with every recipient device over Olm.
#[derive(Debug, Clone, Copy)]
pub struct MegolmEncryptor<'a> {
    machine: &'a OlmMachineInner,
}

impl<'a> MegolmEncryptor<'a> {
    pub(crate) fn new(machine: &'a OlmMachineInner) -> Self {
        Self { machine }
    }

    fn olm(&self) -> OlmEncryptor<'a> {
        OlmEncryptor::new(self.machine)
    }

    /// Create a new outbound group session for the room, together with the
    /// inbound group session we need to decrypt our own messages.
    fn create_outbound_session(
        &self,
        room_id: &RoomId,
        settings: &EncryptionSettings,
        changes: &mut Changes,
    ) -> OutboundGroupSession {
        let outbound = OutboundGroupSession::new(
            self.machine.device_id.clone(),
            self.machine.account.identity_keys_arc(),
            room_id,
            settings.clone(),
        );

        changes.outbound_group_sessions.push(outbound.clone());

        outbound
    }

    async fn inbound_for_outbound(
        &self,
        outbound: &OutboundGroupSession,
    ) -> InboundGroupSession {
        let identity_keys = self.machine.account.identity_keys();

        InboundGroupSession::new(
            identity_keys.curve25519,
            identity_keys.ed25519,
            outbound.room_id(),
            &outbound.session_key().await,
        )
    }

    /// Check if the recipients of the current session still match the
    /// recipients of the room.
    ///
    /// The session has to be rotated if a device it was shared with is no
    /// longer a recipient, a member left or a device got blacklisted, or if
    /// the settings of the room changed.
    fn should_rotate(
        outbound: &OutboundGroupSession,
        recipients: &Recipients,
        settings: &EncryptionSettings,
    ) -> bool {
        if outbound.settings() != settings {
            return true;
        }

        let recipients: BTreeSet<(&UserId, &DeviceId)> =
            recipients.devices.iter().map(|d| (d.user_id(), d.device_id())).collect();
        let shared_with = outbound.shared_with();

        shared_with.iter().any(|(user_id, device_id)| {
            !recipients.contains(&(&**user_id, &**device_id))
        })
    }

    /// Load the outbound session of the room, or create a new one if there is
    /// none or the current one needs to be rotated.
    async fn get_or_create_outbound_session(
        &self,
        room_id: &RoomId,
        recipients: &Recipients,
        settings: &EncryptionSettings,
        changes: &mut Changes,
    ) -> MegolmResult<OutboundGroupSession> {
        let outbound = match self.machine.store.get_outbound_group_session(room_id).await? {
            Some(outbound) if outbound.expired() => {
                debug!(
                    old_session_id = outbound.session_id(),
                    "The room key expired, rotating the room key"
                );
                None
            }
            Some(outbound) if Self::should_rotate(&outbound, recipients, settings) => {
                info!(
                    old_session_id = outbound.session_id(),
                    "A user or device has left the room since we last sent a message, or the \
                     encryption settings have changed. Rotating the room key."
                );
                None
            }
            outbound => outbound,
        };

        let outbound = match outbound {
            Some(outbound) => outbound,
            None => {
                let outbound = self.create_outbound_session(room_id, settings, changes);
                let inbound = self.inbound_for_outbound(&outbound).await;

                debug!(session_id = outbound.session_id(), "Created a new outbound group session");
                changes.inbound_group_sessions.push(inbound);

                outbound
            }
        };

        Ok(outbound)
    }

    async fn send_withheld(
        &self,
        device: &ReadOnlyDevice,
        content: RoomKeyWithheldContent,
    ) -> OlmResult<()> {
        let event_type = content.event_type();

        self.machine
            .transport
            .send_to_device(
                device.user_id(),
                device.device_id(),
                event_type,
                serde_json::to_value(content)?,
            )
            .await?;

        Ok(())
    }

    /// Share the room key with every recipient that didn't receive it yet,
    /// and tell the excluded devices why they won't get it.
    async fn share_room_key(
        &self,
        outbound: &OutboundGroupSession,
        recipients: &Recipients,
    ) -> OlmResult<()> {
        let message_index = outbound.message_index().await;
        let room_key = outbound.as_room_key_content().await;
        let event_type = room_key.event_type();
        let room_key = serde_json::to_value(room_key)?;

        let mut shared_with: BTreeMap<&UserId, BTreeSet<&DeviceId>> = BTreeMap::new();

        for device in &recipients.devices {
            if outbound.is_shared_with(device) != ShareState::NotShared {
                continue;
            }

            match self.olm().send_encrypted(device, event_type, room_key.clone()).await {
                Ok(()) => {
                    outbound.mark_shared_with(
                        device.user_id(),
                        device.device_id(),
                        device.curve25519_key(),
                        message_index,
                    );
                    shared_with.entry(device.user_id()).or_default().insert(device.device_id());
                }
                Err(OlmError::MissingSession) => {
                    self.withhold_from(outbound, device, WithheldCode::NoOlm).await?;
                }
                Err(e) => return Err(e),
            }
        }

        for (device, code) in &recipients.withheld {
            self.withhold_from(outbound, device, code.clone()).await?;
        }

        if !shared_with.is_empty() {
            info!(
                index = message_index,
                recipients = ?shared_with,
                session_id = outbound.session_id(),
                "Shared a room key"
            );
        }

        Ok(())
    }

    async fn withhold_from(
        &self,
        outbound: &OutboundGroupSession,
        device: &ReadOnlyDevice,
        code: WithheldCode,
    ) -> OlmResult<()> {
        if outbound.withheld_code_for(device.user_id(), device.device_id()).as_ref() == Some(&code)
        {
            return Ok(());
        }

        debug!(
            user_id = %device.user_id(),
            device_id = %device.device_id(),
            %code,
            "Withholding the room key from a device"
        );

        self.send_withheld(device, outbound.withheld_code(code.clone())).await?;
        outbound.mark_withheld_from(device.user_id(), device.device_id(), code);

        Ok(())
    }

    /// Encrypt a room event, sharing the room key with the recipient devices
    /// first.
    #[instrument(skip_all, fields(%room_id, event_type, session_id))]
    pub async fn encrypt(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &Value,
        members: &[RoomMember],
        settings: &EncryptionSettings,
    ) -> Result<RoomEncryptedEventContent, CryptoError> {
        let _guard = self.machine.room_sequencer.acquire(room_id.to_owned()).await;

        let recipients = Recipients::collect(self.machine, members, settings).await?;
        let mut changes = Changes::default();

        let outbound =
            self.get_or_create_outbound_session(room_id, &recipients, settings, &mut changes)
                .await?;

        Span::current().record("session_id", outbound.session_id());

        // Share records and the advanced Olm sessions have to be persisted
        // even if sharing with one of the devices failed.
        let shared = self.share_room_key(&outbound, &recipients).await;

        if shared.is_ok() {
            outbound.mark_as_shared();
        }

        changes.outbound_group_sessions = vec![outbound.clone()];
        self.machine.store.save_changes(changes).await?;
        shared?;

        let encrypted = outbound.encrypt(event_type, content).await;

        trace!(message_index = encrypted.message_index(), "Encrypted a room event using Megolm");

        let changes =
            Changes { outbound_group_sessions: vec![outbound], ..Default::default() };
        self.machine.store.save_changes(changes).await?;

        Ok(encrypted.into())
    }

    /// Decrypt a Megolm encrypted room event.
    ///
    /// The session is loaded, used, checked against the replay guard and
    /// persisted again while holding the permit for the session.
    #[instrument(
        skip_all,
        fields(%room_id, event_id = %event.event_id, sender_key, session_id, message_index)
    )]
    pub async fn decrypt(
        &self,
        event: &EncryptedEvent,
        room_id: &RoomId,
        timeline_id: Option<&str>,
    ) -> MegolmResult<DecryptionResult> {
        let content = event.megolm_content().ok_or(EventError::UnsupportedAlgorithm)?;
        let sender_key = content.sender_key.ok_or(EventError::MissingSenderKey)?;
        let session_id = content.session_id.as_str();

        Span::current()
            .record("sender_key", debug(sender_key))
            .record("session_id", session_id);

        if let Some(event_room_id) = &event.room_id {
            if event_room_id != room_id {
                return Err(
                    EventError::MismatchedRoom(room_id.to_owned(), Some(event_room_id.clone()))
                        .into(),
                );
            }
        }

        let _guard = self
            .machine
            .inbound_sequencer
            .acquire((sender_key.to_base64(), session_id.to_owned()))
            .await;

        let Some(session) =
            self.machine.store.get_inbound_group_session(&sender_key, session_id).await?
        else {
            let withheld = self.machine.store.get_withheld_info(room_id, session_id).await?;
            let code = withheld.map(|w| w.code);

            debug!(withheld_code = ?code, "Missing the room key to decrypt the event");

            return Err(MegolmError::MissingRoomKey(code));
        };

        if session.room_id() != room_id {
            return Err(EventError::MismatchedRoom(
                room_id.to_owned(),
                Some(session.room_id().to_owned()),
            )
            .into());
        }

        let (clear_event, message_index) = session.decrypt(event).await?;
        Span::current().record("message_index", message_index);

        self.machine.replay_guard.check_and_record(
            room_id,
            session_id,
            message_index,
            &event.event_id,
            timeline_id,
        )?;

        let changes =
            Changes { inbound_group_sessions: vec![session.clone()], ..Default::default() };
        self.machine.store.save_changes(changes).await?;

        trace!("Successfully decrypted a room event");

        Ok(DecryptionResult {
            clear_event,
            sender_curve25519_key: session.sender_key(),
            claimed_ed25519_key: session.signing_key(),
            forwarding_curve25519_key_chain: session.forwarding_key_chain().to_vec(),
        })
    }

    /// Re-send the key of an already used session to a device.
    ///
    /// The device has to have received the session before, or has to be one
    /// of our own devices the key forwarding policy allows. A refused device
    /// is sent an `m.room_key.withheld` with the `m.unauthorised` code.
    #[instrument(skip_all, fields(%room_id, session_id, %user_id, %device_id))]
    pub async fn reshare_key(
        &self,
        room_id: &RoomId,
        session_id: &str,
        user_id: &UserId,
        device_id: &DeviceId,
        sender_key: Curve25519PublicKey,
    ) -> Result<bool, CryptoError> {
        let Some(device) = self.machine.store.get_device(user_id, device_id).await? else {
            warn!("Not resharing a room key with an unknown device");
            return Ok(false);
        };

        let Some(inbound) =
            self.machine.store.get_inbound_group_session(&sender_key, session_id).await?
        else {
            warn!("Not resharing a room key we don't have");
            return Ok(false);
        };

        if inbound.room_id() != room_id {
            warn!("Not resharing a room key that belongs to a different room");
            return Ok(false);
        }

        let outbound = self
            .machine
            .store
            .get_outbound_group_session(room_id)
            .await?
            .filter(|o| o.session_id() == session_id);

        match should_share_key(
            &self.machine.config.key_forwarding_policy,
            &self.machine.user_id,
            &device,
            outbound.as_ref(),
        ) {
            Ok(message_index) => {
                let message_index = message_index.unwrap_or(inbound.first_known_index());
                let exported = inbound.export_at_index(message_index).await;

                let Some(content) = exported.into_forwarded_room_key() else {
                    warn!("Not resharing a room key without a claimed Ed25519 key");
                    return Ok(false);
                };

                let event_type = content.event_type();
                let content = serde_json::to_value(content).map_err(OlmError::from)?;

                match self.olm().send_encrypted(&device, event_type, content).await {
                    Ok(()) => {
                        info!(message_index, "Reshared a room key");
                        Ok(true)
                    }
                    Err(OlmError::MissingSession) => {
                        warn!("Can't reshare a room key, no Olm session with the device");

                        let content = Self::withheld_content(
                            &inbound,
                            self.machine.device_id.clone(),
                            WithheldCode::NoOlm,
                        );
                        self.send_withheld(&device, content).await?;

                        Ok(false)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(reason) => {
                warn!(%reason, "Refusing to reshare a room key");

                let content = Self::withheld_content(
                    &inbound,
                    self.machine.device_id.clone(),
                    WithheldCode::Unauthorised,
                );
                self.send_withheld(&device, content).await?;

                Ok(false)
            }
        }
    }

    fn withheld_content(
        session: &InboundGroupSession,
        from_device: OwnedDeviceId,
        code: WithheldCode,
    ) -> RoomKeyWithheldContent {
        RoomKeyWithheldContent::new(
            code,
            session.room_id().to_owned(),
            session.session_id().to_owned(),
            session.sender_key(),
            from_device,
        )
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use futures_util::future::join_all;
    use matrix_e2ee_test::{
        alice_device_id, async_test, bob_device_id, carol_device_id, ALICE, BOB, CAROL,
        DEFAULT_TEST_ROOM_ID,
    };
    use ruma::{room_id, RoomId};
    use serde_json::{json, Value};

    use crate::{
        encryption::RoomMember,
        error::{CryptoError, EventError, MegolmError},
        identities::LocalTrust,
        machine::test_helpers::{
            deliver, encrypted_event, establish_session, exchange_devices, get_machine,
            get_machine_pair_with_session, TestMachine,
        },
        store::RoomSettings,
        types::events::{
            room_encrypted::RoomEncryptedEventContent, room_key_withheld::WithheldCode,
        },
    };

    fn message(body: &str) -> Value {
        json!({ "msgtype": "m.text", "body": body })
    }

    async fn encrypt(
        machine: &TestMachine,
        room_id: &RoomId,
        body: &str,
        members: &[RoomMember],
    ) -> RoomEncryptedEventContent {
        machine
            .encrypt_room_event(room_id, "m.room.message", &message(body), members)
            .await
            .unwrap()
    }

    fn session_id(content: &RoomEncryptedEventContent) -> String {
        assert_matches!(content, RoomEncryptedEventContent::MegolmV1AesSha2(c));
        c.session_id.clone()
    }

    fn withheld_codes(machine: &TestMachine, recipient: &TestMachine) -> Vec<WithheldCode> {
        machine
            .transport
            .take_for(recipient.user_id(), recipient.device_id())
            .into_iter()
            .filter(|e| e.event_type == "m.room_key.withheld")
            .map(|e| serde_json::from_value(e.content["code"].clone()).unwrap())
            .collect()
    }

    #[async_test]
    async fn test_megolm_room_event_roundtrip() {
        let (alice, bob) = get_machine_pair_with_session().await;
        let room_id = *DEFAULT_TEST_ROOM_ID;

        let content = encrypt(&alice, room_id, "It's a secret to everybody", &[
            RoomMember::joined(&ALICE),
            RoomMember::joined(&BOB),
        ])
        .await;

        assert_eq!(content.algorithm().as_str(), "m.megolm.v1.aes-sha2");

        let processed = deliver(&alice, &bob).await;
        assert_eq!(processed.len(), 1);

        let event = encrypted_event(alice.user_id(), "$megolm_event", content);
        let result = bob.decrypt_room_event(&event, room_id, None).await.unwrap();

        assert_eq!(result.event_type(), Some("m.room.message"));
        assert_eq!(result.clear_event["content"], message("It's a secret to everybody"));
        assert_eq!(result.clear_event["event_id"], "$megolm_event");
        assert_eq!(result.sender_curve25519_key, alice.identity_keys().curve25519);
        assert_eq!(result.claimed_ed25519_key, Some(alice.identity_keys().ed25519));
        assert!(!result.is_forwarded());

        // We can decrypt our own messages as well.
        let own = alice.decrypt_room_event(&event, room_id, None).await.unwrap();
        assert_eq!(own.clear_event["content"], result.clear_event["content"]);
    }

    #[async_test]
    async fn test_same_event_can_be_decrypted_again() {
        let (alice, bob) = get_machine_pair_with_session().await;
        let room_id = *DEFAULT_TEST_ROOM_ID;

        let content = encrypt(&alice, room_id, "Hello", &[RoomMember::joined(&BOB)]).await;
        deliver(&alice, &bob).await;

        let event = encrypted_event(alice.user_id(), "$event", content);

        let first = bob.decrypt_room_event(&event, room_id, Some("main")).await.unwrap();
        let second = bob.decrypt_room_event(&event, room_id, Some("main")).await.unwrap();
        let third = bob.decrypt_room_event(&event, room_id, Some("thread")).await.unwrap();

        similar_asserts::assert_eq!(first, second);
        similar_asserts::assert_eq!(first, third);
    }

    #[async_test]
    async fn test_reused_message_index_is_rejected() {
        let (alice, bob) = get_machine_pair_with_session().await;
        let room_id = *DEFAULT_TEST_ROOM_ID;

        let content = encrypt(&alice, room_id, "Hello", &[RoomMember::joined(&BOB)]).await;
        deliver(&alice, &bob).await;

        let event = encrypted_event(alice.user_id(), "$first", content.clone());
        let replayed = encrypted_event(alice.user_id(), "$second", content);

        bob.decrypt_room_event(&event, room_id, Some("main")).await.unwrap();

        for timeline_id in [Some("main"), Some("thread"), None] {
            let error = bob.decrypt_room_event(&replayed, room_id, timeline_id).await.unwrap_err();

            assert_eq!(error.error_type().as_str(), "DUPLICATED_MESSAGE_INDEX");
            assert_matches!(error, CryptoError::Megolm(MegolmError::DuplicatedMessageIndex(e)));
            assert_eq!(e.message_index, 0);
            assert_eq!(e.first_event_id.as_str(), "$first");
        }
    }

    #[async_test]
    async fn test_concurrent_replays_decrypt_only_once() {
        let (alice, bob) = get_machine_pair_with_session().await;
        let room_id = *DEFAULT_TEST_ROOM_ID;

        let content = encrypt(&alice, room_id, "Hello", &[RoomMember::joined(&BOB)]).await;
        deliver(&alice, &bob).await;

        let events: Vec<_> = (0..8)
            .map(|i| encrypted_event(alice.user_id(), &format!("$event{i}"), content.clone()))
            .collect();

        let results =
            join_all(events.iter().map(|event| bob.decrypt_room_event(event, room_id, None)))
                .await;

        let (decrypted, failed): (Vec<_>, Vec<_>) = results.into_iter().partition(Result::is_ok);
        assert_eq!(decrypted.len(), 1);
        assert_eq!(failed.len(), 7);

        for error in failed.into_iter().filter_map(Result::err) {
            assert_matches!(error, CryptoError::Megolm(MegolmError::DuplicatedMessageIndex(e)));
            assert_eq!(e.message_index, 0);
        }
    }

    #[async_test]
    async fn test_missing_room_key() {
        let (alice, bob) = get_machine_pair_with_session().await;
        let room_id = *DEFAULT_TEST_ROOM_ID;

        let content = encrypt(&alice, room_id, "Hello", &[RoomMember::joined(&BOB)]).await;

        // The room key is never delivered.
        let event = encrypted_event(alice.user_id(), "$event", content);
        let error = bob.decrypt_room_event(&event, room_id, None).await.unwrap_err();

        assert_eq!(error.error_type().as_str(), "UNKNOWN_INBOUND_SESSION_ID");
        assert_matches!(error, CryptoError::Megolm(MegolmError::MissingRoomKey(None)));
    }

    #[async_test]
    async fn test_missing_sender_key() {
        let (alice, bob) = get_machine_pair_with_session().await;
        let room_id = *DEFAULT_TEST_ROOM_ID;

        let mut content = encrypt(&alice, room_id, "Hello", &[RoomMember::joined(&BOB)]).await;
        deliver(&alice, &bob).await;

        if let RoomEncryptedEventContent::MegolmV1AesSha2(c) = &mut content {
            c.sender_key = None;
        }

        let event = encrypted_event(alice.user_id(), "$event", content);
        let error = bob.decrypt_room_event(&event, room_id, None).await.unwrap_err();

        assert_eq!(error.error_type().as_str(), "MISSING_SENDER_KEY");
        assert_matches!(
            error,
            CryptoError::Megolm(MegolmError::EventError(EventError::MissingSenderKey))
        );
    }

    #[async_test]
    async fn test_event_from_another_room_is_rejected() {
        let (alice, bob) = get_machine_pair_with_session().await;
        let room_id = *DEFAULT_TEST_ROOM_ID;

        let content = encrypt(&alice, room_id, "Hello", &[RoomMember::joined(&BOB)]).await;
        deliver(&alice, &bob).await;

        let event = encrypted_event(alice.user_id(), "$event", content);
        let error =
            bob.decrypt_room_event(&event, room_id!("!other:localhost"), None).await.unwrap_err();

        assert_eq!(error.error_type().as_str(), "INBOUND_SESSION_MISMATCH_ROOM_ID");
        assert_matches!(
            error,
            CryptoError::Megolm(MegolmError::EventError(EventError::MismatchedRoom(..)))
        );
    }

    #[async_test]
    async fn test_blacklisted_device_is_told_the_key_is_withheld() {
        let (alice, bob) = get_machine_pair_with_session().await;
        let room_id = *DEFAULT_TEST_ROOM_ID;

        alice.set_local_trust(&BOB, bob_device_id(), LocalTrust::BlackListed).await.unwrap();

        let content = encrypt(&alice, room_id, "Hello", &[RoomMember::joined(&BOB)]).await;

        let processed = deliver(&alice, &bob).await;
        assert_eq!(processed.len(), 1);

        let event = encrypted_event(alice.user_id(), "$event", content);
        let error = bob.decrypt_room_event(&event, room_id, None).await.unwrap_err();

        assert_eq!(error.error_type().as_str(), "KEYS_WITHHELD");
        assert_matches!(
            error,
            CryptoError::Megolm(MegolmError::MissingRoomKey(Some(WithheldCode::Blacklisted)))
        );
    }

    #[async_test]
    async fn test_unverified_devices_are_excluded_when_requested() {
        let (alice, bob) = get_machine_pair_with_session().await;
        let room_id = *DEFAULT_TEST_ROOM_ID;

        alice
            .set_room_settings(
                room_id,
                &RoomSettings { only_allow_trusted_devices: true, ..Default::default() },
            )
            .await
            .unwrap();
        alice.set_local_trust(&BOB, bob_device_id(), LocalTrust::Unset).await.unwrap();

        encrypt(&alice, room_id, "Hello", &[RoomMember::joined(&BOB)]).await;

        assert_eq!(withheld_codes(&alice, &bob), [WithheldCode::Unverified]);
    }

    #[async_test]
    async fn test_devices_without_olm_session_get_no_olm() {
        let (alice, bob) = get_machine_pair_with_session().await;
        let carol = get_machine(&CAROL, carol_device_id()).await;
        let room_id = *DEFAULT_TEST_ROOM_ID;

        exchange_devices(&alice, &carol).await;

        let members = [RoomMember::joined(&BOB), RoomMember::joined(&CAROL)];
        encrypt(&alice, room_id, "Hello", &members).await;

        assert_eq!(withheld_codes(&alice, &carol), [WithheldCode::NoOlm]);
        assert_eq!(deliver(&alice, &bob).await.len(), 1);

        // The notice is only sent once per session.
        encrypt(&alice, room_id, "Hello again", &members).await;
        assert!(withheld_codes(&alice, &carol).is_empty());
    }

    #[async_test]
    async fn test_invited_members_only_receive_the_key_when_enabled() {
        let (alice, bob) = get_machine_pair_with_session().await;
        let room_id = *DEFAULT_TEST_ROOM_ID;

        encrypt(&alice, room_id, "Hello", &[RoomMember::invited(&BOB)]).await;
        assert!(deliver(&alice, &bob).await.is_empty());

        let other_room = room_id!("!other:localhost");
        alice
            .set_room_settings(
                other_room,
                &RoomSettings { encrypt_for_invited_members: true, ..Default::default() },
            )
            .await
            .unwrap();

        encrypt(&alice, other_room, "Hello", &[RoomMember::invited(&BOB)]).await;
        assert_eq!(deliver(&alice, &bob).await.len(), 1);
    }

    #[async_test]
    async fn test_session_is_reused_and_shared_once() {
        let (alice, bob) = get_machine_pair_with_session().await;
        let room_id = *DEFAULT_TEST_ROOM_ID;
        let members = [RoomMember::joined(&BOB)];

        let first = encrypt(&alice, room_id, "Hello", &members).await;
        let second = encrypt(&alice, room_id, "Hello again", &members).await;

        assert_eq!(session_id(&first), session_id(&second));
        assert_eq!(deliver(&alice, &bob).await.len(), 1);

        let outbound = alice.store().get_outbound_group_session(room_id).await.unwrap().unwrap();
        let share_info = outbound.share_info(&BOB, bob_device_id()).unwrap();
        assert_eq!(share_info.message_index, 0);
        assert_eq!(share_info.sender_key, bob.identity_keys().curve25519);
    }

    #[async_test]
    async fn test_session_rotates_when_a_member_leaves() {
        let (alice, bob) = get_machine_pair_with_session().await;
        let carol = get_machine(&CAROL, carol_device_id()).await;
        let room_id = *DEFAULT_TEST_ROOM_ID;

        exchange_devices(&alice, &carol).await;
        establish_session(&alice, &carol).await;

        let members = [RoomMember::joined(&BOB), RoomMember::joined(&CAROL)];
        let first = encrypt(&alice, room_id, "Hello", &members).await;
        let second = encrypt(&alice, room_id, "Bye Carol", &[RoomMember::joined(&BOB)]).await;

        assert_ne!(session_id(&first), session_id(&second));

        // Carol only received the first room key.
        assert_eq!(deliver(&alice, &carol).await.len(), 1);
        assert_eq!(deliver(&alice, &bob).await.len(), 2);

        let event = encrypted_event(alice.user_id(), "$bye", second);
        let error = carol.decrypt_room_event(&event, room_id, None).await.unwrap_err();
        assert_matches!(error, CryptoError::Megolm(MegolmError::MissingRoomKey(None)));

        bob.decrypt_room_event(&event, room_id, None).await.unwrap();
    }

    #[async_test]
    async fn test_session_rotates_after_the_message_limit() {
        let (alice, _bob) = get_machine_pair_with_session().await;
        let room_id = *DEFAULT_TEST_ROOM_ID;

        alice
            .set_room_settings(
                room_id,
                &RoomSettings { session_rotation_period_messages: Some(1), ..Default::default() },
            )
            .await
            .unwrap();

        let members = [RoomMember::joined(&BOB)];
        let first = encrypt(&alice, room_id, "Hello", &members).await;
        let second = encrypt(&alice, room_id, "Hello again", &members).await;

        assert_ne!(session_id(&first), session_id(&second));
    }

    #[async_test]
    async fn test_reshare_key_with_a_device_the_session_was_shared_with() {
        let (alice, bob) = get_machine_pair_with_session().await;
        let room_id = *DEFAULT_TEST_ROOM_ID;

        let content = encrypt(&alice, room_id, "Hello", &[RoomMember::joined(&BOB)]).await;
        deliver(&alice, &bob).await;

        let reshared = alice
            .reshare_room_key(
                room_id,
                &session_id(&content),
                &BOB,
                bob_device_id(),
                alice.identity_keys().curve25519,
            )
            .await
            .unwrap();
        assert!(reshared);

        let sent = alice.transport.take_for(&BOB, bob_device_id());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event_type, "m.room.encrypted");
    }

    #[async_test]
    async fn test_reshare_key_is_refused_for_other_devices() {
        let (alice, bob) = get_machine_pair_with_session().await;
        let carol = get_machine(&CAROL, carol_device_id()).await;
        let room_id = *DEFAULT_TEST_ROOM_ID;

        exchange_devices(&alice, &carol).await;
        establish_session(&alice, &carol).await;

        let content = encrypt(&alice, room_id, "Hello", &[RoomMember::joined(&BOB)]).await;
        deliver(&alice, &bob).await;

        let reshared = alice
            .reshare_room_key(
                room_id,
                &session_id(&content),
                &CAROL,
                carol_device_id(),
                alice.identity_keys().curve25519,
            )
            .await
            .unwrap();

        assert!(!reshared);
        assert_eq!(withheld_codes(&alice, &carol), [WithheldCode::Unauthorised]);
    }

    #[async_test]
    async fn test_reshare_key_with_our_own_verified_device() {
        let alice = get_machine(&ALICE, alice_device_id()).await;
        let other_alice = get_machine(&ALICE, ruma::device_id!("OTHERDEVICE")).await;
        let bob = get_machine(&BOB, bob_device_id()).await;
        let room_id = *DEFAULT_TEST_ROOM_ID;

        exchange_devices(&alice, &other_alice).await;
        exchange_devices(&alice, &bob).await;
        establish_session(&alice, &bob).await;
        establish_session(&alice, &other_alice).await;

        // Our other device wasn't a recipient of the room key.
        let content = encrypt(&alice, room_id, "Hello", &[RoomMember::joined(&BOB)]).await;
        let sent = alice.transport.take_for(other_alice.user_id(), other_alice.device_id());
        assert!(sent.is_empty());

        let reshared = alice
            .reshare_room_key(
                room_id,
                &session_id(&content),
                other_alice.user_id(),
                other_alice.device_id(),
                alice.identity_keys().curve25519,
            )
            .await
            .unwrap();
        assert!(reshared);

        deliver(&alice, &other_alice).await;

        let event = encrypted_event(alice.user_id(), "$event", content);
        let result = other_alice.decrypt_room_event(&event, room_id, None).await.unwrap();

        assert!(result.is_forwarded());
        assert_eq!(
            result.forwarding_curve25519_key_chain,
            [alice.identity_keys().curve25519.to_base64()]
        );
    }
}
