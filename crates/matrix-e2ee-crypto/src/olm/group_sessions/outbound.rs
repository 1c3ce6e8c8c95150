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
    cmp::max,
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use matrix_e2ee_common::locks::RwLock as StdRwLock;
use ruma::{
    DeviceId, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, SecondsSinceUnixEpoch, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::debug;
use vodozemac::{
    megolm::{GroupSession, GroupSessionPickle, MegolmMessage, SessionConfig, SessionKey},
    olm::IdentityKeys,
    Curve25519PublicKey,
};

use crate::{
    identities::ReadOnlyDevice,
    types::{
        deserialize_curve_key,
        events::{
            room_key::RoomKeyContent,
            room_key_withheld::{RoomKeyWithheldContent, WithheldCode},
            MegolmV1AesSha2Content,
        },
        serialize_curve_key, EventEncryptionAlgorithm,
    },
};

const ROTATION_PERIOD: Duration = Duration::from_millis(604800000);
const ROTATION_MESSAGES: u64 = 100;
const MIN_ROTATION_PERIOD: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShareState {
    NotShared,
    SharedButChangedSenderKey,
    Shared(u32),
}

/// Settings for an encrypted room.
///
/// This determines the algorithm and rotation periods of a group session.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct EncryptionSettings {
    /// The encryption algorithm that should be used in the room.
    pub algorithm: EventEncryptionAlgorithm,
    /// How long the session should be used before changing it.
    pub rotation_period: Duration,
    /// How many messages should be sent before changing the session.
    pub rotation_period_msgs: u64,
    /// Should untrusted devices receive the room key, or should they be
    /// excluded from the conversation.
    #[serde(default)]
    pub only_allow_trusted_devices: bool,
    /// Should members that were invited but haven't joined yet receive the
    /// room key.
    #[serde(default)]
    pub encrypt_for_invited_members: bool,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            rotation_period: ROTATION_PERIOD,
            rotation_period_msgs: ROTATION_MESSAGES,
            only_allow_trusted_devices: false,
            encrypt_for_invited_members: false,
        }
    }
}

/// Information about a device a room key was shared with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareInfo {
    /// The Curve25519 key of the device when the key was shared with it.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,
    /// The first message index the device received.
    pub message_index: u32,
}

type SharedWithSet = BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, ShareInfo>>;
type WithheldFromSet = BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, WithheldCode>>;

/// Outbound group session.
///
/// Outbound group sessions are used to exchange room messages between a group
/// of participants. Outbound group sessions are used to encrypt the room
/// messages.
#[derive(Clone)]
pub struct OutboundGroupSession {
    inner: Arc<RwLock<GroupSession>>,
    device_id: OwnedDeviceId,
    account_identity_keys: Arc<IdentityKeys>,
    session_id: Arc<str>,
    room_id: OwnedRoomId,
    pub(crate) creation_time: SecondsSinceUnixEpoch,
    message_count: Arc<AtomicU64>,
    shared: Arc<AtomicBool>,
    invalidated: Arc<AtomicBool>,
    settings: Arc<EncryptionSettings>,
    shared_with_set: Arc<StdRwLock<SharedWithSet>>,
    withheld_from_set: Arc<StdRwLock<WithheldFromSet>>,
}

impl OutboundGroupSession {
    /// Create a new outbound group session for the given room.
    ///
    /// Outbound group sessions are used to encrypt room messages.
    ///
    /// # Arguments
    ///
    /// * `device_id` - The id of the device that created this session.
    ///
    /// * `identity_keys` - The identity keys of the account that created this
    ///   session.
    ///
    /// * `room_id` - The id of the room that the session is used in.
    ///
    /// * `settings` - Settings determining the algorithm and rotation period of
    ///   the outbound group session.
    pub fn new(
        device_id: OwnedDeviceId,
        identity_keys: Arc<IdentityKeys>,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> Self {
        let session = GroupSession::new(SessionConfig::version_1());
        let session_id = session.session_id();

        Self {
            inner: Arc::new(RwLock::new(session)),
            device_id,
            account_identity_keys: identity_keys,
            session_id: session_id.into(),
            room_id: room_id.to_owned(),
            creation_time: SecondsSinceUnixEpoch::now(),
            message_count: Arc::new(AtomicU64::new(0)),
            shared: Arc::new(AtomicBool::new(false)),
            invalidated: Arc::new(AtomicBool::new(false)),
            settings: Arc::new(settings),
            shared_with_set: Default::default(),
            withheld_from_set: Default::default(),
        }
    }

    /// Create the content of an `m.room_key.withheld` event for this session.
    pub fn withheld_code(&self, code: WithheldCode) -> RoomKeyWithheldContent {
        RoomKeyWithheldContent::new(
            code,
            self.room_id().to_owned(),
            self.session_id().to_owned(),
            self.sender_key(),
            self.device_id.clone(),
        )
    }

    /// Mark the session as invalid.
    ///
    /// This should be called if an user/device deletes a device that received
    /// this session.
    pub fn invalidate_session(&self) {
        self.invalidated.store(true, Ordering::Relaxed)
    }

    /// Get the encryption settings of this outbound session.
    pub fn settings(&self) -> &EncryptionSettings {
        &self.settings
    }

    /// Encrypt the given plaintext using this session.
    ///
    /// Returns the encrypted ciphertext.
    async fn encrypt_helper(&self, plaintext: String) -> MegolmMessage {
        let mut session = self.inner.write().await;
        self.message_count.fetch_add(1, Ordering::SeqCst);
        session.encrypt(&plaintext)
    }

    /// Encrypt a room message for the given room.
    ///
    /// Beware that a room key needs to be shared before this method
    /// can be called, otherwise the recipients won't be able to decrypt it.
    ///
    /// # Arguments
    ///
    /// * `event_type` - The plaintext type of the event, the outer type of the
    ///   event will become `m.room.encrypted`.
    ///
    /// * `content` - The plaintext content of the message that should be
    ///   encrypted.
    pub async fn encrypt(&self, event_type: &str, content: &Value) -> MegolmV1AesSha2Content {
        let plaintext = json!({
            "content": content,
            "room_id": &*self.room_id,
            "type": event_type,
        })
        .to_string();

        let ciphertext = self.encrypt_helper(plaintext).await;

        MegolmV1AesSha2Content {
            ciphertext,
            sender_key: Some(self.account_identity_keys.curve25519),
            device_id: Some(self.device_id.clone()),
            session_id: self.session_id().to_owned(),
        }
    }

    fn elapsed(&self) -> bool {
        let creation_time = Duration::from_secs(self.creation_time.get().into());
        let now = Duration::from_secs(SecondsSinceUnixEpoch::now().get().into());

        // The rotation period comes from room state that anyone in the room can
        // set, so it is clamped to an hour.
        now.checked_sub(creation_time)
            .map(|elapsed| elapsed >= max(self.settings.rotation_period, MIN_ROTATION_PERIOD))
            .unwrap_or(true)
    }

    /// Check if the session has expired and if it should be rotated.
    ///
    /// A session will expire after some time, if enough messages have been
    /// encrypted using it or if it was invalidated.
    pub fn expired(&self) -> bool {
        let count = self.message_count.load(Ordering::SeqCst);
        // A Megolm session should be usable for at least one message and at
        // most 10000 of them.
        let rotation_period_msgs = self.settings.rotation_period_msgs.clamp(1, 10_000);

        count >= rotation_period_msgs || self.elapsed() || self.invalidated()
    }

    /// Has the session been invalidated.
    pub fn invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Relaxed)
    }

    /// Mark the session as shared.
    ///
    /// Messages shouldn't be encrypted with the session before it has been
    /// shared.
    pub fn mark_as_shared(&self) {
        self.shared.store(true, Ordering::Relaxed);
    }

    /// Check if the session has been marked as shared.
    pub fn shared(&self) -> bool {
        self.shared.load(Ordering::Relaxed)
    }

    /// Get the session key of this session.
    ///
    /// A session key can be used to to create an `InboundGroupSession`.
    pub async fn session_key(&self) -> SessionKey {
        let session = self.inner.read().await;
        session.session_key()
    }

    /// Get the curve key of the sender of this session.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.account_identity_keys.curve25519
    }

    /// Get the room id of the room this session belongs to.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Get the current message index for this session.
    ///
    /// Each message is sent with an increasing index. This returns the
    /// message index that will be used for the next encrypted message.
    pub async fn message_index(&self) -> u32 {
        let session = self.inner.read().await;
        session.message_index()
    }

    /// The content of the `m.room_key` event that shares this session.
    pub(crate) async fn as_room_key_content(&self) -> RoomKeyContent {
        RoomKeyContent::new(
            self.room_id().to_owned(),
            self.session_id().to_owned(),
            self.session_key().await,
        )
    }

    /// Has or will the session be shared with the given device.
    pub(crate) fn is_shared_with(&self, device: &ReadOnlyDevice) -> ShareState {
        let shared_with = self.shared_with_set.read();

        match shared_with.get(device.user_id()).and_then(|d| d.get(device.device_id())) {
            Some(info) if info.sender_key == device.curve25519_key() => {
                ShareState::Shared(info.message_index)
            }
            Some(_) => ShareState::SharedButChangedSenderKey,
            None => ShareState::NotShared,
        }
    }

    /// Remember that the session was shared with the given device, starting
    /// at the given message index.
    pub(crate) fn mark_shared_with(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        sender_key: Curve25519PublicKey,
        message_index: u32,
    ) {
        debug!(
            session_id = self.session_id(),
            ?user_id,
            ?device_id,
            message_index,
            "Marking the room key as shared"
        );

        self.shared_with_set
            .write()
            .entry(user_id.to_owned())
            .or_default()
            .insert(device_id.to_owned(), ShareInfo { sender_key, message_index });
    }

    /// The code we used to withhold the session from the given device, if we
    /// did.
    pub fn withheld_code_for(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Option<WithheldCode> {
        self.withheld_from_set.read().get(user_id).and_then(|d| d.get(device_id)).cloned()
    }

    /// Remember that an `m.room_key.withheld` notice was sent to the given
    /// device.
    pub(crate) fn mark_withheld_from(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        code: WithheldCode,
    ) {
        self.withheld_from_set
            .write()
            .entry(user_id.to_owned())
            .or_default()
            .insert(device_id.to_owned(), code);
    }

    /// The share record of the given device, if the session was shared with
    /// it.
    pub fn share_info(&self, user_id: &UserId, device_id: &DeviceId) -> Option<ShareInfo> {
        self.shared_with_set.read().get(user_id).and_then(|d| d.get(device_id)).cloned()
    }

    /// Every device the session was shared with.
    pub fn shared_with(&self) -> Vec<(OwnedUserId, OwnedDeviceId)> {
        self.shared_with_set
            .read()
            .iter()
            .flat_map(|(user_id, devices)| {
                devices.keys().map(move |device_id| (user_id.clone(), device_id.clone()))
            })
            .collect()
    }

    /// Restore an outbound group session from a previously pickled one.
    ///
    /// # Arguments
    ///
    /// * `device_id` - The device ID of the device that created this session.
    ///   Put differently, our own device ID.
    ///
    /// * `identity_keys` - The identity keys of the device that created this
    ///   session, our own identity keys.
    ///
    /// * `pickle` - The pickled version of the `OutboundGroupSession`.
    pub fn from_pickle(
        device_id: OwnedDeviceId,
        identity_keys: Arc<IdentityKeys>,
        pickle: PickledOutboundGroupSession,
    ) -> Self {
        let inner: GroupSession = pickle.pickle.into();
        let session_id = inner.session_id();

        Self {
            inner: Arc::new(RwLock::new(inner)),
            device_id,
            account_identity_keys: identity_keys,
            session_id: session_id.into(),
            room_id: pickle.room_id,
            creation_time: pickle.creation_time,
            message_count: Arc::new(AtomicU64::new(pickle.message_count)),
            shared: Arc::new(AtomicBool::new(pickle.shared)),
            invalidated: Arc::new(AtomicBool::new(pickle.invalidated)),
            settings: Arc::new(pickle.settings),
            shared_with_set: Arc::new(StdRwLock::new(pickle.shared_with_set)),
            withheld_from_set: Arc::new(StdRwLock::new(pickle.withheld_from_set)),
        }
    }

    /// Store the group session as a base64 encoded string and associated data
    /// belonging to the session.
    pub async fn pickle(&self) -> PickledOutboundGroupSession {
        let pickle = self.inner.read().await.pickle();

        PickledOutboundGroupSession {
            pickle,
            room_id: self.room_id.clone(),
            settings: (*self.settings).clone(),
            creation_time: self.creation_time,
            message_count: self.message_count.load(Ordering::SeqCst),
            shared: self.shared(),
            invalidated: self.invalidated(),
            shared_with_set: self.shared_with_set.read().clone(),
            withheld_from_set: self.withheld_from_set.read().clone(),
        }
    }
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for OutboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("creation_time", &self.creation_time)
            .field("message_count", &self.message_count)
            .finish()
    }
}

/// A pickled version of an `OutboundGroupSession`.
///
/// Holds all the information that needs to be stored in a database to restore
/// an OutboundGroupSession.
#[derive(Deserialize, Serialize)]
#[allow(missing_debug_implementations)]
pub struct PickledOutboundGroupSession {
    /// The pickle string holding the OutboundGroupSession.
    pub pickle: GroupSessionPickle,
    /// The settings this session adheres to.
    pub settings: EncryptionSettings,
    /// The room id this session is used for.
    pub room_id: OwnedRoomId,
    /// The timestamp when this session was created.
    pub creation_time: SecondsSinceUnixEpoch,
    /// The number of messages this session has already encrypted.
    pub message_count: u64,
    /// Is the session shared.
    pub shared: bool,
    /// Has the session been invalidated.
    pub invalidated: bool,
    /// The set of users the session has been already shared with.
    pub shared_with_set: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, ShareInfo>>,
    /// The devices the session was withheld from, and why.
    #[serde(default)]
    pub withheld_from_set: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, WithheldCode>>,
}
