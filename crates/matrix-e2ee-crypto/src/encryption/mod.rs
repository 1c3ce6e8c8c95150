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

//! The room encryption engines.
//!
//! A room is encrypted either with Olm, every event is encrypted for every
//! recipient device separately, or with Megolm, a ratcheting room key is
//! shared with the recipient devices over Olm and the events are encrypted
//! once. The [`RoomEncryptor`] picks the engine for a given algorithm and
//! dispatches the common operations to it.

use std::collections::BTreeSet;

use ruma::{DeviceId, OwnedUserId, RoomId, UserId};
use serde_json::Value;
use tracing::trace;
use vodozemac::Curve25519PublicKey;

mod megolm;
mod olm;

pub use megolm::MegolmEncryptor;
pub use olm::OlmEncryptor;
pub(crate) use olm::OlmDecryptionInfo;

use crate::{
    error::{CryptoError, EventError},
    identities::ReadOnlyDevice,
    machine::OlmMachineInner,
    olm::EncryptionSettings,
    store::CryptoStoreError,
    types::{
        events::{
            room_encrypted::{EncryptedEvent, RoomEncryptedEventContent},
            room_key_withheld::WithheldCode,
        },
        DecryptionResult, EventEncryptionAlgorithm,
    },
};

/// The membership of a user in a room, as far as encryption is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Membership {
    /// The user joined the room.
    Joined,
    /// The user was invited to the room but hasn't joined yet.
    Invited,
}

/// A member of a room, one of the potential recipients of a room event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoomMember {
    /// The ID of the member.
    pub user_id: OwnedUserId,
    /// The membership of the member.
    pub membership: Membership,
}

impl RoomMember {
    /// A member that joined the room.
    pub fn joined(user_id: &UserId) -> Self {
        Self { user_id: user_id.to_owned(), membership: Membership::Joined }
    }

    /// A member that was invited to the room.
    pub fn invited(user_id: &UserId) -> Self {
        Self { user_id: user_id.to_owned(), membership: Membership::Invited }
    }
}

/// The devices an event, or a room key, should be encrypted for.
#[derive(Debug, Default)]
pub(crate) struct Recipients {
    /// Devices that should be able to decrypt the event.
    pub devices: Vec<ReadOnlyDevice>,
    /// Devices that are excluded by the settings of the room.
    pub withheld: Vec<(ReadOnlyDevice, WithheldCode)>,
}

impl Recipients {
    /// Collect the devices of the given members, our own device is never a
    /// recipient.
    pub(crate) async fn collect(
        machine: &OlmMachineInner,
        members: &[RoomMember],
        settings: &EncryptionSettings,
    ) -> Result<Self, CryptoStoreError> {
        let users: BTreeSet<&UserId> = members
            .iter()
            .filter(|m| {
                m.membership == Membership::Joined || settings.encrypt_for_invited_members
            })
            .map(|m| &*m.user_id)
            .collect();

        let mut recipients = Recipients::default();

        for user_id in users {
            for device in machine.store.get_user_devices(user_id).await?.into_values() {
                if machine.is_own_device(&device) {
                    continue;
                }

                if device.is_blacklisted() {
                    recipients.withheld.push((device, WithheldCode::Blacklisted));
                } else if settings.only_allow_trusted_devices && !device.is_locally_trusted() {
                    recipients.withheld.push((device, WithheldCode::Unverified));
                } else {
                    recipients.devices.push(device);
                }
            }
        }

        trace!(
            recipient_count = recipients.devices.len(),
            withheld_count = recipients.withheld.len(),
            "Collected the recipient devices"
        );

        Ok(recipients)
    }
}

/// The encryption engine of a room, selected by the algorithm of the room.
#[derive(Debug)]
pub enum RoomEncryptor<'a> {
    /// Every event is encrypted with Olm for every recipient device.
    Olm(OlmEncryptor<'a>),
    /// Events are encrypted with a Megolm room key that is shared over Olm.
    Megolm(MegolmEncryptor<'a>),
}

impl<'a> RoomEncryptor<'a> {
    /// Select the engine for the given algorithm.
    ///
    /// Returns an [`EventError::UnsupportedAlgorithm`] for algorithms we
    /// don't support.
    pub(crate) fn new(
        machine: &'a OlmMachineInner,
        algorithm: &EventEncryptionAlgorithm,
    ) -> Result<Self, EventError> {
        match algorithm {
            EventEncryptionAlgorithm::OlmV1Curve25519AesSha2 => {
                Ok(Self::Olm(OlmEncryptor::new(machine)))
            }
            EventEncryptionAlgorithm::MegolmV1AesSha2 => {
                Ok(Self::Megolm(MegolmEncryptor::new(machine)))
            }
            EventEncryptionAlgorithm::Unknown(_) => Err(EventError::UnsupportedAlgorithm),
        }
    }

    /// The algorithm of the selected engine.
    pub fn algorithm(&self) -> EventEncryptionAlgorithm {
        match self {
            RoomEncryptor::Olm(_) => EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
            RoomEncryptor::Megolm(_) => EventEncryptionAlgorithm::MegolmV1AesSha2,
        }
    }

    /// Encrypt the given event content for the given members of the room.
    pub async fn encrypt(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &Value,
        members: &[RoomMember],
        settings: &EncryptionSettings,
    ) -> Result<RoomEncryptedEventContent, CryptoError> {
        match self {
            RoomEncryptor::Olm(e) => {
                Ok(e.encrypt(room_id, event_type, content, members, settings).await?)
            }
            RoomEncryptor::Megolm(e) => {
                e.encrypt(room_id, event_type, content, members, settings).await
            }
        }
    }

    /// Decrypt an event of the given room.
    pub async fn decrypt(
        &self,
        event: &EncryptedEvent,
        room_id: &RoomId,
        timeline_id: Option<&str>,
    ) -> Result<DecryptionResult, CryptoError> {
        match self {
            RoomEncryptor::Olm(e) => Ok(e.decrypt(event, room_id).await?),
            RoomEncryptor::Megolm(e) => Ok(e.decrypt(event, room_id, timeline_id).await?),
        }
    }

    /// Re-send the key of a session we already used to the given device.
    ///
    /// Returns `true` if the key was sent, `false` if the device isn't
    /// allowed to have it.
    pub async fn reshare_key(
        &self,
        room_id: &RoomId,
        session_id: &str,
        user_id: &UserId,
        device_id: &DeviceId,
        sender_key: Curve25519PublicKey,
    ) -> Result<bool, CryptoError> {
        match self {
            RoomEncryptor::Olm(e) => Ok(e.reshare_key(room_id, session_id, user_id, device_id)),
            RoomEncryptor::Megolm(e) => {
                e.reshare_key(room_id, session_id, user_id, device_id, sender_key).await
            }
        }
    }
}
