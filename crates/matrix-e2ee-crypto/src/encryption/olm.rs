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

use std::collections::BTreeMap;

use ruma::{serde::JsonObject, DeviceId, RoomId, UserId};
use serde_json::Value;
use tracing::{debug, info, instrument, trace, warn, Span};
use vodozemac::{olm::OlmMessage, Curve25519PublicKey};

use super::{Recipients, RoomMember};
use crate::{
    error::{EventError, OlmError, OlmResult},
    identities::ReadOnlyDevice,
    machine::OlmMachineInner,
    olm::{EncryptionSettings, OlmMessageHash, Session},
    store::Changes,
    types::{
        events::{
            olm_v1::DecryptedOlmV1Event,
            room_encrypted::{EncryptedEvent, RoomEncryptedEventContent},
            EventType, OlmV1Curve25519AesSha2Content,
        },
        DecryptionResult,
    },
};

/// A successfully decrypted and checked Olm message.
#[derive(Debug)]
pub(crate) struct OlmDecryptionInfo {
    /// The Curve25519 key of the sending device, authenticated by the Olm
    /// session.
    pub sender_key: Curve25519PublicKey,
    /// The decrypted plaintext.
    pub event: DecryptedOlmV1Event,
}

/// The Olm engine.
///
/// Besides encrypting room events for every recipient device it is the
/// device-to-device channel the Megolm engine shares its room keys over.
#[derive(Debug, Clone, Copy)]
pub struct OlmEncryptor<'a> {
    machine: &'a OlmMachineInner,
}

impl<'a> OlmEncryptor<'a> {
    pub(crate) fn new(machine: &'a OlmMachineInner) -> Self {
        Self { machine }
    }

    /// The session with the given device we should encrypt with, the one that
    /// was used last.
    async fn last_used_session(&self, device: &ReadOnlyDevice) -> OlmResult<Option<Session>> {
        let sessions = self.machine.store.get_sessions(&device.curve25519_key()).await?;

        Ok(sessions.and_then(|s| s.into_iter().max_by_key(|s| s.last_use_time())))
    }

    /// Encrypt the given content for a single device.
    ///
    /// The advanced Olm session is persisted before the ciphertext is
    /// returned.
    pub(crate) async fn encrypt_for_device(
        &self,
        device: &ReadOnlyDevice,
        room_id: Option<&RoomId>,
        event_type: &str,
        content: Value,
    ) -> OlmResult<OlmV1Curve25519AesSha2Content> {
        let _guard = self.machine.account_sequencer.acquire().await;

        let Some(mut session) = self.last_used_session(device).await? else {
            return Err(OlmError::MissingSession);
        };

        let encrypted = match room_id {
            Some(room_id) => {
                session.encrypt_for_room(device, room_id, event_type, content).await?
            }
            None => session.encrypt(device, event_type, content).await?,
        };

        let changes = Changes { sessions: vec![session], ..Default::default() };
        self.machine.store.save_changes(changes).await?;

        Ok(encrypted)
    }

    /// Encrypt the given content for a device and send it as an
    /// `m.room.encrypted` to-device event.
    pub(crate) async fn send_encrypted(
        &self,
        device: &ReadOnlyDevice,
        event_type: &str,
        content: Value,
    ) -> OlmResult<()> {
        let encrypted = self.encrypt_for_device(device, None, event_type, content).await?;
        let encrypted = RoomEncryptedEventContent::from(encrypted);
        let event_type = encrypted.event_type();

        self.machine
            .transport
            .send_to_device(
                device.user_id(),
                device.device_id(),
                event_type,
                serde_json::to_value(encrypted)?,
            )
            .await?;

        Ok(())
    }

    /// Encrypt a room event for every recipient device.
    ///
    /// Devices we don't share an Olm session with are skipped, they won't be
    /// able to decrypt the event.
    #[instrument(skip_all, fields(%room_id, event_type))]
    pub async fn encrypt(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &Value,
        members: &[RoomMember],
        settings: &EncryptionSettings,
    ) -> OlmResult<RoomEncryptedEventContent> {
        let recipients = Recipients::collect(self.machine, members, settings).await?;
        let mut ciphertext = BTreeMap::new();

        for device in &recipients.devices {
            match self.encrypt_for_device(device, Some(room_id), event_type, content.clone()).await
            {
                Ok(encrypted) => ciphertext.extend(encrypted.ciphertext),
                Err(OlmError::MissingSession) => {
                    warn!(
                        user_id = %device.user_id(),
                        device_id = %device.device_id(),
                        "Not encrypting for a device we don't have an Olm session with"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        debug!(recipient_count = ciphertext.len(), "Encrypted a room event using Olm");

        Ok(OlmV1Curve25519AesSha2Content {
            sender_key: self.machine.account.identity_keys().curve25519,
            ciphertext,
        }
        .into())
    }

    /// Decrypt an Olm encrypted room event.
    ///
    /// Olm ratchets can't decrypt a message twice, decrypting the same event
    /// again fails with [`OlmError::ReplayedMessage`].
    #[instrument(skip_all, fields(%room_id, event_id = %event.event_id))]
    pub async fn decrypt(
        &self,
        event: &EncryptedEvent,
        room_id: &RoomId,
    ) -> OlmResult<DecryptionResult> {
        let RoomEncryptedEventContent::OlmV1Curve25519AesSha2(content) = &event.content else {
            return Err(EventError::UnsupportedAlgorithm.into());
        };

        let OlmDecryptionInfo { sender_key, event: decrypted } =
            self.decrypt_olm_event(&event.sender, content).await?;

        if decrypted.room_id.as_deref() != Some(room_id) {
            return Err(EventError::MismatchedRoom(room_id.to_owned(), decrypted.room_id).into());
        }

        let server_ts: u64 = event.origin_server_ts.0.into();
        let mut clear_event = JsonObject::new();

        clear_event.insert("type".to_owned(), decrypted.event_type.into());
        clear_event.insert("content".to_owned(), decrypted.content);
        clear_event.insert("room_id".to_owned(), room_id.as_str().into());
        clear_event.insert("sender".to_owned(), event.sender.as_str().into());
        clear_event.insert("event_id".to_owned(), event.event_id.as_str().into());
        clear_event.insert("origin_server_ts".to_owned(), server_ts.into());

        Ok(DecryptionResult {
            clear_event,
            sender_curve25519_key: sender_key,
            claimed_ed25519_key: Some(decrypted.keys.ed25519),
            forwarding_curve25519_key_chain: Vec::new(),
        })
    }

    /// Olm rooms don't have shared room keys, there is nothing to reshare.
    pub fn reshare_key(
        &self,
        room_id: &RoomId,
        session_id: &str,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> bool {
        debug!(
            %room_id,
            session_id,
            %user_id,
            %device_id,
            "Ignoring a key reshare for a room that is encrypted using Olm"
        );

        false
    }

    /// Decrypt an Olm message that was sent to us and check that the
    /// plaintext was meant for us.
    #[instrument(skip_all, fields(%sender, sender_key = ?content.sender_key, session_id))]
    pub(crate) async fn decrypt_olm_event(
        &self,
        sender: &UserId,
        content: &OlmV1Curve25519AesSha2Content,
    ) -> OlmResult<OlmDecryptionInfo> {
        let our_key = self.machine.account.identity_keys().curve25519;
        let sender_key = content.sender_key;

        let Some(message) = content.ciphertext_for(&our_key) else {
            warn!("Olm event doesn't contain a ciphertext for our key");
            return Err(EventError::MissingCiphertext.into());
        };

        let message_hash = OlmMessageHash::new(sender_key, message);
        let _guard = self.machine.account_sequencer.acquire().await;

        if self.machine.store.is_message_known(&message_hash).await? {
            info!("An Olm message got replayed, decryption failed");
            return Err(OlmError::ReplayedMessage(sender.to_owned(), sender_key));
        }

        let (session, plaintext, created) =
            self.decrypt_olm_message(sender, sender_key, message).await?;

        Span::current().record("session_id", session.session_id());
        trace!("Successfully decrypted an Olm message");

        // The ratchet moved forward whether the plaintext checks out or not.
        let mut changes = Changes {
            sessions: vec![session],
            message_hashes: vec![message_hash],
            ..Default::default()
        };

        if created {
            changes.account = Some(self.machine.account.clone());
        }

        self.machine.store.save_changes(changes).await?;

        match self.parse_decrypted_event(sender, &plaintext) {
            Ok(event) => Ok(OlmDecryptionInfo { sender_key, event }),
            Err(e) => {
                warn!(
                    error = ?e,
                    "A to-device message was successfully decrypted but \
                    parsing and checking the event fields failed"
                );

                Err(e)
            }
        }
    }

    /// Try to decrypt an Olm message, creating a new session if necessary.
    ///
    /// Returns the session that decrypted the message, the plaintext and
    /// whether the session was newly created.
    async fn decrypt_olm_message(
        &self,
        sender: &UserId,
        sender_key: Curve25519PublicKey,
        message: &OlmMessage,
    ) -> OlmResult<(Session, String, bool)> {
        let existing_sessions = self.machine.store.get_sessions(&sender_key).await?;

        match message {
            OlmMessage::Normal(_) => {
                let mut errors_by_olm_session = Vec::new();

                for mut session in existing_sessions.into_iter().flatten() {
                    match session.decrypt(message).await {
                        Ok(plaintext) => return Ok((session, plaintext, false)),
                        // We don't know which session encrypted the message,
                        // failing here is expected.
                        Err(e) => errors_by_olm_session.push((session.session_id().to_owned(), e)),
                    }
                }

                warn!(
                    ?errors_by_olm_session,
                    "Failed to decrypt a non-pre-key message with all available sessions"
                );

                Err(OlmError::SessionWedged(sender.to_owned(), sender_key))
            }

            OlmMessage::PreKey(prekey_message) => {
                let session_id = prekey_message.session_id();

                if let Some(mut session) = existing_sessions
                    .into_iter()
                    .flatten()
                    .find(|s| s.session_id() == session_id)
                {
                    // The one-time key of a session we already created is used
                    // up, a failure here can't be fixed with a new session.
                    return match session.decrypt(message).await {
                        Ok(plaintext) => Ok((session, plaintext, false)),
                        Err(e) => {
                            warn!(
                                session_id = session.session_id(),
                                error = ?e,
                                "Failed to decrypt a pre-key message with the corresponding session"
                            );

                            Err(OlmError::SessionWedged(sender.to_owned(), sender_key))
                        }
                    };
                }

                match self.machine.account.create_inbound_session(sender_key, prekey_message).await
                {
                    Ok(result) => Ok((result.session, result.plaintext, true)),
                    Err(e) => {
                        warn!(
                            error = ?e,
                            "Failed to create a new Olm session from a pre-key message"
                        );

                        Err(OlmError::SessionWedged(sender.to_owned(), sender_key))
                    }
                }
            }
        }
    }

    /// Parse the decrypted plaintext and verify that it wasn't forwarded by a
    /// third party.
    ///
    /// The `sender` must correspond to the user who sent the event, the
    /// `recipient` to us and the `recipient_keys` to our own Ed25519 key.
    fn parse_decrypted_event(
        &self,
        sender: &UserId,
        plaintext: &str,
    ) -> OlmResult<DecryptedOlmV1Event> {
        let event: DecryptedOlmV1Event = serde_json::from_str(plaintext)?;
        let identity_keys = self.machine.account.identity_keys();

        if event.recipient != self.machine.user_id {
            Err(EventError::MismatchedRecipient(event.recipient, self.machine.user_id.clone())
                .into())
        } else if &*event.sender != sender {
            Err(EventError::MismatchedSender(event.sender, sender.to_owned()).into())
        } else if identity_keys.ed25519 != event.recipient_keys.ed25519 {
            Err(EventError::MismatchedKeys(
                Box::new(identity_keys.ed25519),
                Box::new(event.recipient_keys.ed25519),
            )
            .into())
        } else {
            Ok(event)
        }
    }
}
