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

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use matrix_e2ee_common::sequencer::{KeyedSequencer, Sequencer};
use ruma::{DeviceId, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, field::display, info, instrument, trace, warn, Span};
use vodozemac::{megolm::SessionOrdering, olm::IdentityKeys, Curve25519PublicKey, KeyId};

use crate::{
    backups::BackupMachine,
    encryption::{OlmDecryptionInfo, OlmEncryptor, RoomEncryptor, RoomMember},
    error::{CryptoError, OlmResult, SetRoomSettingsError},
    gossiping::KeyForwardingPolicy,
    identities::{LocalTrust, ReadOnlyDevice},
    olm::{Account, EncryptionSettings, ExportedRoomKey, InboundGroupSession},
    replay_guard::ReplayGuard,
    store::{
        Changes, CryptoStoreError, DeviceChanges, DynCryptoStore, IntoCryptoStore,
        Result as StoreResult, RoomSettings,
    },
    transport::Transport,
    types::{
        events::{
            forwarded_room_key::ForwardedRoomKeyContent,
            olm_v1::DecryptedOlmV1Event,
            room_encrypted::{EncryptedEvent, RoomEncryptedEventContent},
            room_key::RoomKeyContent,
            room_key_withheld::RoomKeyWithheldContent,
            EventType, ToDeviceEvent,
        },
        DecryptionResult, EventEncryptionAlgorithm,
    },
    RoomKeyImportResult,
};
#[cfg(feature = "qrcode")]
use crate::verification::QrVerifier;

#[cfg(test)]
pub(crate) mod test_helpers;

/// The configuration of an [`OlmMachine`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// The encryption settings used for rooms that don't override them.
    #[serde(default)]
    pub encryption_settings: EncryptionSettings,
    /// Which devices may have a room key re-shared with them.
    #[serde(default)]
    pub key_forwarding_policy: KeyForwardingPolicy,
}

/// A to-device event after it went through the [`OlmMachine`].
#[derive(Clone, Debug)]
pub enum ProcessedToDeviceEvent {
    /// The event was encrypted using Olm and successfully decrypted.
    Decrypted {
        /// The Curve25519 key of the device that sent the event.
        sender_key: Curve25519PublicKey,
        /// The decrypted plaintext.
        event: DecryptedOlmV1Event,
        /// The room key the event carried, if it carried one we accepted.
        inbound_group_session: Option<InboundGroupSession>,
    },
    /// The event wasn't encrypted.
    PlainText(ToDeviceEvent),
}

/// The end-to-end encryption core of a single logged in device.
///
/// The machine owns the store handle, the transport, the replay guard and the
/// permits that serialize the use of the account, of each inbound session
/// and of each room. Cloning the machine is cheap, every clone shares the same
/// state.
#[derive(Clone)]
pub struct OlmMachine {
    pub(crate) inner: Arc<OlmMachineInner>,
}

pub(crate) struct OlmMachineInner {
    /// The unique user id that owns this account.
    pub(crate) user_id: OwnedUserId,
    /// The unique device ID of the device that holds this account.
    pub(crate) device_id: OwnedDeviceId,
    /// Our Olm account.
    pub(crate) account: Account,
    /// Store for the encryption keys.
    pub(crate) store: Arc<DynCryptoStore>,
    /// The transport used to send to-device events.
    pub(crate) transport: Arc<dyn Transport>,
    /// Records which event used which Megolm message index.
    pub(crate) replay_guard: ReplayGuard,
    /// Serializes the creation and use of Olm sessions.
    pub(crate) account_sequencer: Sequencer,
    /// Serializes the use of an inbound group session, keyed by the sender
    /// key and the session ID.
    pub(crate) inbound_sequencer: KeyedSequencer<(String, String)>,
    /// Serializes the outbound encryption of a room.
    pub(crate) room_sequencer: KeyedSequencer<OwnedRoomId>,
    pub(crate) config: CryptoConfig,
    backup_machine: BackupMachine,
}

impl OlmMachineInner {
    pub(crate) fn is_own_device(&self, device: &ReadOnlyDevice) -> bool {
        device.user_id() == &*self.user_id && device.device_id() == &*self.device_id
    }
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for OlmMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OlmMachine")
            .field("user_id", &self.user_id())
            .field("device_id", &self.device_id())
            .finish()
    }
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for OlmMachineInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OlmMachineInner")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl OlmMachine {
    /// Create a new OlmMachine with the given [`CryptoStore`].
    ///
    /// If the store already contains encryption keys for the given user/device
    /// pair those will be re-used. Otherwise new ones will be created and
    /// stored.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The unique id of the user that owns this machine.
    ///
    /// * `device_id` - The unique id of the device that owns this machine.
    ///
    /// * `store` - A `CryptoStore` implementation that will be used to store
    /// the encryption keys.
    ///
    /// * `transport` - The transport to-device events are sent with.
    ///
    /// * `config` - The default encryption settings and the key forwarding
    /// policy.
    ///
    /// [`CryptoStore`]: crate::store::CryptoStore
    #[instrument(skip(store, transport, config), fields(ed25519_key, curve25519_key))]
    pub async fn with_store(
        user_id: &UserId,
        device_id: &DeviceId,
        store: impl IntoCryptoStore,
        transport: Arc<dyn Transport>,
        config: CryptoConfig,
    ) -> StoreResult<Self> {
        let store = store.into_crypto_store();

        let account = match store.load_account().await? {
            Some(account) => {
                if user_id != account.user_id() || device_id != account.device_id() {
                    return Err(CryptoStoreError::MismatchedAccount {
                        expected: (account.user_id().to_owned(), account.device_id().to_owned()),
                        got: (user_id.to_owned(), device_id.to_owned()),
                    });
                }

                Span::current()
                    .record("ed25519_key", display(account.identity_keys().ed25519))
                    .record("curve25519_key", display(account.identity_keys().curve25519));
                debug!("Restored an Olm account");

                account
            }
            None => {
                let account = Account::with_device_id(user_id, device_id);

                Span::current()
                    .record("ed25519_key", display(account.identity_keys().ed25519))
                    .record("curve25519_key", display(account.identity_keys().curve25519));

                let mut device = ReadOnlyDevice::from_account(&account);

                // We just created this device from our own Olm `Account`. Since we are the
                // owners of the private keys of this device we can safely mark
                // the device as verified.
                device.set_local_trust(LocalTrust::Verified);

                let changes = Changes {
                    account: Some(account.clone()),
                    devices: DeviceChanges { new: vec![device], ..Default::default() },
                    ..Default::default()
                };
                store.save_changes(changes).await?;

                debug!("Created a new Olm account");

                account
            }
        };

        let backup_keys = store.load_backup_keys().await?;
        let backup_key = backup_keys.recovery_key.map(|recovery_key| {
            let key = recovery_key.megolm_v1_public_key();

            if let Some(version) = backup_keys.backup_version {
                key.set_version(version);
            }

            key
        });

        let backup_machine = BackupMachine::new(account.clone(), store.clone(), backup_key);

        let inner = Arc::new(OlmMachineInner {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            account,
            store,
            transport,
            replay_guard: ReplayGuard::new(),
            account_sequencer: Sequencer::new(),
            inbound_sequencer: KeyedSequencer::new(),
            room_sequencer: KeyedSequencer::new(),
            config,
            backup_machine,
        });

        Ok(Self { inner })
    }

    /// The unique user id that owns this `OlmMachine` instance.
    pub fn user_id(&self) -> &UserId {
        &self.inner.user_id
    }

    /// The unique device ID that identifies this `OlmMachine`.
    pub fn device_id(&self) -> &DeviceId {
        &self.inner.device_id
    }

    /// Get the public parts of our Olm identity keys.
    pub fn identity_keys(&self) -> IdentityKeys {
        *self.inner.account.identity_keys()
    }

    /// The configuration the machine was created with.
    pub fn config(&self) -> &CryptoConfig {
        &self.inner.config
    }

    /// The store the machine persists its state in.
    pub fn store(&self) -> &DynCryptoStore {
        &*self.inner.store
    }

    /// Get the backup related state machine.
    pub fn backup_machine(&self) -> &BackupMachine {
        &self.inner.backup_machine
    }

    /// Get the helper that creates and checks verification QR codes.
    #[cfg(feature = "qrcode")]
    pub fn qr_verifier(&self) -> QrVerifier {
        QrVerifier::new(self.inner.account.clone(), self.inner.store.clone())
    }

    /// The description of our own device, as other devices should store it.
    pub fn own_device(&self) -> ReadOnlyDevice {
        ReadOnlyDevice::from_account(&self.inner.account)
    }

    /// Generate new one-time keys and mark them as published.
    ///
    /// Publishing the keys is the concern of the caller, the returned keys
    /// are the ones other devices can create an Olm session with.
    pub async fn generate_one_time_keys(
        &self,
        count: usize,
    ) -> StoreResult<HashMap<KeyId, Curve25519PublicKey>> {
        let _guard = self.inner.account_sequencer.acquire().await;
        let account = &self.inner.account;

        account.generate_one_time_keys(count).await;
        let one_time_keys = account.one_time_keys().await;
        account.mark_keys_as_published().await;

        let changes = Changes { account: Some(account.clone()), ..Default::default() };
        self.inner.store.save_changes(changes).await?;

        debug!(count = one_time_keys.len(), "Generated new one-time keys");

        Ok(one_time_keys)
    }

    /// Create an outbound Olm session with the given device, using one of its
    /// published one-time keys.
    #[instrument(skip_all, fields(user_id = %device.user_id(), device_id = %device.device_id()))]
    pub async fn create_outbound_session(
        &self,
        device: &ReadOnlyDevice,
        one_time_key: Curve25519PublicKey,
    ) -> StoreResult<()> {
        let _guard = self.inner.account_sequencer.acquire().await;

        let session = self.inner.account.create_outbound_session(device, one_time_key).await;
        info!(session_id = session.session_id(), "Created a new outbound Olm session");

        let changes = Changes { sessions: vec![session], ..Default::default() };
        self.inner.store.save_changes(changes).await
    }

    /// Add a new device, or update an existing one, in the device registry.
    pub async fn save_device(&self, device: ReadOnlyDevice) -> StoreResult<()> {
        let changes = Changes {
            devices: DeviceChanges { changed: vec![device], ..Default::default() },
            ..Default::default()
        };

        self.inner.store.save_changes(changes).await
    }

    /// Get a device from the device registry.
    pub async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> StoreResult<Option<ReadOnlyDevice>> {
        self.inner.store.get_device(user_id, device_id).await
    }

    /// Get all the known devices of the given user.
    pub async fn get_user_devices(
        &self,
        user_id: &UserId,
    ) -> StoreResult<HashMap<OwnedDeviceId, ReadOnlyDevice>> {
        self.inner.store.get_user_devices(user_id).await
    }

    /// Set the local trust state of a device.
    ///
    /// Returns `false` if the device is unknown.
    pub async fn set_local_trust(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust_state: LocalTrust,
    ) -> StoreResult<bool> {
        let Some(mut device) = self.get_device(user_id, device_id).await? else {
            return Ok(false);
        };

        debug!(%user_id, %device_id, ?trust_state, "Setting the local trust of a device");

        device.set_local_trust(trust_state);
        self.save_device(device).await?;

        Ok(true)
    }

    /// Get the stored encryption settings for the given room.
    pub async fn room_settings(&self, room_id: &RoomId) -> StoreResult<Option<RoomSettings>> {
        self.inner.store.get_room_settings(room_id).await
    }

    /// Store encryption settings for the given room.
    ///
    /// This method checks if the new settings are "safe" -- ie, that they do
    /// not represent a downgrade in encryption security from any previous
    /// settings. Attempts to downgrade security will result in a
    /// [`SetRoomSettingsError::EncryptionDowngrade`].
    pub async fn set_room_settings(
        &self,
        room_id: &RoomId,
        new_settings: &RoomSettings,
    ) -> Result<(), SetRoomSettingsError> {
        // Racing a second call for the same room would let both pass the
        // downgrade check.
        let _guard = self.inner.room_sequencer.acquire(room_id.to_owned()).await;
        let store = &self.inner.store;

        // Any new settings are rejected if they differ from the existing settings.
        if let Some(old_settings) = store.get_room_settings(room_id).await? {
            if old_settings != *new_settings {
                return Err(SetRoomSettingsError::EncryptionDowngrade);
            } else {
                return Ok(());
            }
        }

        match new_settings.algorithm {
            EventEncryptionAlgorithm::OlmV1Curve25519AesSha2
            | EventEncryptionAlgorithm::MegolmV1AesSha2 => (),
            EventEncryptionAlgorithm::Unknown(_) => {
                warn!(
                    ?room_id,
                    "Rejecting invalid encryption algorithm {}", new_settings.algorithm
                );
                return Err(SetRoomSettingsError::InvalidSettings);
            }
        }

        store
            .save_changes(Changes {
                room_settings: HashMap::from([(room_id.to_owned(), new_settings.clone())]),
                ..Default::default()
            })
            .await?;

        Ok(())
    }

    /// The encryption settings that apply to the given room, the defaults of
    /// the machine overridden by the stored room settings.
    pub async fn encryption_settings(&self, room_id: &RoomId) -> StoreResult<EncryptionSettings> {
        let mut settings = self.inner.config.encryption_settings.clone();

        if let Some(room_settings) = self.room_settings(room_id).await? {
            settings.algorithm = room_settings.algorithm;
            settings.only_allow_trusted_devices = room_settings.only_allow_trusted_devices;
            settings.encrypt_for_invited_members = room_settings.encrypt_for_invited_members;

            if let Some(period) = room_settings.session_rotation_period {
                settings.rotation_period = period;
            }

            if let Some(messages) = room_settings.session_rotation_period_messages {
                settings.rotation_period_msgs = messages as u64;
            }
        }

        Ok(settings)
    }

    /// Encrypt a room event for the given members of the room.
    ///
    /// The engine is picked by the algorithm of the room, Megolm unless the
    /// room settings say otherwise.
    pub async fn encrypt_room_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &Value,
        members: &[RoomMember],
    ) -> Result<RoomEncryptedEventContent, CryptoError> {
        let settings = self.encryption_settings(room_id).await?;
        let encryptor = RoomEncryptor::new(&self.inner, &settings.algorithm)?;

        encryptor.encrypt(room_id, event_type, content, members, &settings).await
    }

    /// Decrypt an event from a room timeline.
    ///
    /// # Arguments
    ///
    /// * `event` - The event that should be decrypted.
    ///
    /// * `room_id` - The ID of the room where the event was sent to.
    ///
    /// * `timeline_id` - An identifier of the timeline the event was found in,
    /// recorded for diagnostics.
    pub async fn decrypt_room_event(
        &self,
        event: &EncryptedEvent,
        room_id: &RoomId,
        timeline_id: Option<&str>,
    ) -> Result<DecryptionResult, CryptoError> {
        let encryptor = RoomEncryptor::new(&self.inner, &event.content.algorithm())?;
        let result = encryptor.decrypt(event, room_id, timeline_id).await;

        if let Err(e) = &result {
            warn!(
                %room_id,
                event_id = %event.event_id,
                error_type = %e.error_type(),
                "Failed to decrypt a room event: {e}"
            );
        }

        result
    }

    /// Re-send the room key of an already used session to a device.
    ///
    /// See [`RoomEncryptor::reshare_key`].
    pub async fn reshare_room_key(
        &self,
        room_id: &RoomId,
        session_id: &str,
        user_id: &UserId,
        device_id: &DeviceId,
        sender_key: Curve25519PublicKey,
    ) -> Result<bool, CryptoError> {
        let settings = self.encryption_settings(room_id).await?;
        let encryptor = RoomEncryptor::new(&self.inner, &settings.algorithm)?;

        encryptor.reshare_key(room_id, session_id, user_id, device_id, sender_key).await
    }

    /// Handle a to-device event we received.
    ///
    /// Olm encrypted events are decrypted and any room key they carry is
    /// added to the store. Withheld notices are recorded, so decryption
    /// failures can report why the key is missing.
    #[instrument(skip_all, fields(sender = %event.sender, event_type = %event.event_type))]
    pub async fn receive_to_device_event(
        &self,
        event: &ToDeviceEvent,
    ) -> OlmResult<ProcessedToDeviceEvent> {
        match event.event_type.as_str() {
            RoomEncryptedEventContent::EVENT_TYPE => {
                let content: RoomEncryptedEventContent =
                    serde_json::from_value(event.content.clone())?;

                let RoomEncryptedEventContent::OlmV1Curve25519AesSha2(content) = content else {
                    warn!("Received a to-device event that wasn't encrypted using Olm");
                    return Ok(ProcessedToDeviceEvent::PlainText(event.clone()));
                };

                let olm = OlmEncryptor::new(&self.inner);
                let decrypted = olm.decrypt_olm_event(&event.sender, &content).await?;

                self.handle_decrypted_to_device_event(decrypted).await
            }
            RoomKeyWithheldContent::EVENT_TYPE => {
                self.add_withheld_info(&event.content).await?;
                Ok(ProcessedToDeviceEvent::PlainText(event.clone()))
            }
            _ => {
                trace!("Received an unencrypted to-device event");
                Ok(ProcessedToDeviceEvent::PlainText(event.clone()))
            }
        }
    }

    async fn handle_decrypted_to_device_event(
        &self,
        decrypted: OlmDecryptionInfo,
    ) -> OlmResult<ProcessedToDeviceEvent> {
        let OlmDecryptionInfo { sender_key, event } = decrypted;

        debug!(event_type = %event.event_type, "Received a decrypted to-device event");

        let inbound_group_session = match event.event_type.as_str() {
            RoomKeyContent::EVENT_TYPE => self.add_room_key(sender_key, &event).await?,
            ForwardedRoomKeyContent::EVENT_TYPE => {
                self.receive_forwarded_room_key(sender_key, &event).await?
            }
            RoomKeyWithheldContent::EVENT_TYPE => {
                self.add_withheld_info(&event.content).await?;
                None
            }
            "m.dummy" => {
                debug!("Received an `m.dummy` event");
                None
            }
            _ => {
                warn!("Received an unexpected encrypted to-device event");
                None
            }
        };

        Ok(ProcessedToDeviceEvent::Decrypted { sender_key, event, inbound_group_session })
    }

    /// Create a group session from a room key and add it to our crypto store.
    #[instrument(skip_all, fields(room_id, session_id))]
    async fn add_room_key(
        &self,
        sender_key: Curve25519PublicKey,
        event: &DecryptedOlmV1Event,
    ) -> OlmResult<Option<InboundGroupSession>> {
        let content: RoomKeyContent = match serde_json::from_value(event.content.clone()) {
            Ok(content) => content,
            Err(e) => {
                warn!("Received a malformed room key event: {e}");
                return Ok(None);
            }
        };

        Span::current()
            .record("room_id", display(&content.room_id))
            .record("session_id", content.session_id.as_str());

        if content.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            warn!(
                algorithm = %content.algorithm,
                "Received a room key with an unsupported algorithm"
            );
            return Ok(None);
        }

        let session = InboundGroupSession::new(
            sender_key,
            event.keys.ed25519,
            &content.room_id,
            &content.session_key,
        );

        if session.session_id() != content.session_id {
            warn!(
                expected = %content.session_id,
                got = session.session_id(),
                "The session ID of the room key doesn't match the session key"
            );
            return Ok(None);
        }

        Ok(self.save_if_better(session).await?)
    }

    /// Import a forwarded room key, only our own verified devices are trusted
    /// to forward keys to us.
    #[instrument(skip_all, fields(room_id, session_id))]
    async fn receive_forwarded_room_key(
        &self,
        sender_key: Curve25519PublicKey,
        event: &DecryptedOlmV1Event,
    ) -> OlmResult<Option<InboundGroupSession>> {
        let content: ForwardedRoomKeyContent = match serde_json::from_value(event.content.clone())
        {
            Ok(content) => content,
            Err(e) => {
                warn!("Received a malformed forwarded room key event: {e}");
                return Ok(None);
            }
        };

        Span::current()
            .record("room_id", display(&content.room_id))
            .record("session_id", content.session_id.as_str());

        let sender_device = self
            .inner
            .store
            .get_user_devices(&event.sender)
            .await?
            .into_values()
            .find(|d| d.curve25519_key() == sender_key);

        let trusted = event.sender == self.inner.user_id
            && sender_device.is_some_and(|d| d.is_locally_trusted());

        if !trusted {
            warn!(
                sender = %event.sender,
                "Ignoring a forwarded room key, it wasn't sent by one of our verified devices"
            );
            return Ok(None);
        }

        match InboundGroupSession::from_forwarded_key(&sender_key, &content) {
            Ok(session) => Ok(self.save_if_better(session).await?),
            Err(e) => {
                warn!("Received a forwarded room key that can't be imported: {e}");
                Ok(None)
            }
        }
    }

    async fn add_withheld_info(&self, content: &Value) -> OlmResult<()> {
        let content: RoomKeyWithheldContent = match serde_json::from_value(content.clone()) {
            Ok(content) => content,
            Err(e) => {
                warn!("Received a malformed `m.room_key.withheld` event: {e}");
                return Ok(());
            }
        };

        debug!(
            room_id = %content.room_id,
            session_id = %content.session_id,
            code = %content.code,
            "Processing `m.room_key.withheld` event"
        );

        let mut withheld_session_info = BTreeMap::new();
        withheld_session_info
            .entry(content.room_id.clone())
            .or_insert_with(BTreeMap::new)
            .insert(content.session_id.clone(), content);

        let changes = Changes { withheld_session_info, ..Default::default() };
        self.inner.store.save_changes(changes).await?;

        Ok(())
    }

    /// Store the given session, unless we already have a copy of it that can
    /// decrypt at least as many messages.
    ///
    /// Returns the session if it was stored.
    async fn save_if_better(
        &self,
        session: InboundGroupSession,
    ) -> StoreResult<Option<InboundGroupSession>> {
        let sender_key = session.sender_key();
        let session_id = session.session_id().to_owned();

        let _guard = self
            .inner
            .inbound_sequencer
            .acquire((sender_key.to_base64(), session_id.clone()))
            .await;

        let old_session =
            self.inner.store.get_inbound_group_session(&sender_key, &session_id).await?;

        let keep = match old_session {
            None => true,
            Some(old_session) => match session.compare(&old_session).await {
                SessionOrdering::Better => true,
                SessionOrdering::Unconnected => {
                    warn!(
                        %session_id,
                        "Received a room key that doesn't match the stored one, ignoring it"
                    );
                    false
                }
                SessionOrdering::Equal | SessionOrdering::Worse => {
                    debug!(%session_id, "Received a room key we already have");
                    false
                }
            },
        };

        if !keep {
            return Ok(None);
        }

        info!(
            room_id = %session.room_id(),
            %session_id,
            first_known_index = session.first_known_index(),
            "Received a new room key"
        );

        let changes =
            Changes { inbound_group_sessions: vec![session.clone()], ..Default::default() };
        self.inner.store.save_changes(changes).await?;

        Ok(Some(session))
    }

    /// Remove an inbound group session, together with the record of the
    /// events it decrypted.
    ///
    /// Returns `true` if the session was stored.
    pub async fn forget_inbound_group_session(
        &self,
        room_id: &RoomId,
        sender_key: Curve25519PublicKey,
        session_id: &str,
    ) -> StoreResult<bool> {
        let _guard = self
            .inner
            .inbound_sequencer
            .acquire((sender_key.to_base64(), session_id.to_owned()))
            .await;

        let removed =
            self.inner.store.remove_inbound_group_session(&sender_key, session_id).await?;
        self.inner.replay_guard.forget_session(room_id, session_id);

        debug!(%room_id, session_id, removed, "Forgot an inbound group session");

        Ok(removed)
    }

    /// Export the keys that match the given predicate.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use matrix_e2ee_crypto::{OlmMachine, encrypt_room_key_export};
    /// # use ruma::room_id;
    /// # async {
    /// # let machine: OlmMachine = unimplemented!();
    /// let room_id = room_id!("!test:localhost");
    /// let exported_keys = machine.export_room_keys(|s| s.room_id() == room_id).await.unwrap();
    /// let encrypted_export = encrypt_room_key_export(&exported_keys, "1234", 1);
    /// # };
    /// ```
    pub async fn export_room_keys(
        &self,
        mut predicate: impl FnMut(&InboundGroupSession) -> bool,
    ) -> StoreResult<Vec<ExportedRoomKey>> {
        let mut exported = Vec::new();

        for session in self.inner.store.get_inbound_group_sessions().await? {
            if predicate(&session) {
                exported.push(session.export().await);
            }
        }

        Ok(exported)
    }

    /// Import the given room keys into our store.
    ///
    /// # Arguments
    ///
    /// * `exported_keys` - A list of previously exported keys that should be
    /// imported into our store. If we already have a better version of a key
    /// the key will *not* be imported.
    ///
    /// * `from_backup` - Were the room keys imported from the backup, if true
    /// will mark the room keys as already backed up.
    pub async fn import_room_keys(
        &self,
        exported_keys: Vec<ExportedRoomKey>,
        from_backup: bool,
    ) -> StoreResult<RoomKeyImportResult> {
        let total_count = exported_keys.len();
        let mut keys = BTreeMap::new();

        for key in &exported_keys {
            let session = match InboundGroupSession::from_export(key) {
                Ok(session) => session,
                Err(e) => {
                    warn!(
                        room_id = %key.room_id,
                        session_id = %key.session_id,
                        "Couldn't import a room key from a file export: {e}"
                    );
                    continue;
                }
            };

            if from_backup {
                session.mark_as_backed_up();
            }

            if let Some(session) = self.save_if_better(session).await? {
                keys.entry(session.room_id().to_owned())
                    .or_insert_with(BTreeMap::new)
                    .entry(session.sender_key().to_base64())
                    .or_insert_with(std::collections::BTreeSet::new)
                    .insert(session.session_id().to_owned());
            }
        }

        let imported_count = keys.values().flat_map(|s| s.values()).map(|s| s.len()).sum();

        info!(total_count, imported_count, "Successfully imported room keys");

        Ok(RoomKeyImportResult::new(imported_count, total_count, keys))
    }
}

#[cfg(test)]
mod tests;
