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

use std::{collections::BTreeMap, fmt};

use ruma::{OwnedRoomId, RoomId};
use serde::{Deserialize, Serialize};
use vodozemac::{megolm::ExportedSessionKey, Curve25519PublicKey, Ed25519PublicKey};

mod inbound;
mod outbound;

pub use inbound::{InboundGroupSession, PickledInboundGroupSession};
pub(crate) use outbound::ShareState;
pub use outbound::{
    EncryptionSettings, OutboundGroupSession, PickledOutboundGroupSession, ShareInfo,
};

use crate::types::{
    deserialize_curve_key, events::forwarded_room_key::ForwardedRoomKeyContent,
    serialize_curve_key, EventEncryptionAlgorithm,
};

/// The key name of the claimed Ed25519 key in the `sender_claimed_keys` map.
const ED25519: &str = "ed25519";

/// An exported version of an `InboundGroupSession`
///
/// This can be used to share the `InboundGroupSession` in an exported file.
#[derive(Deserialize, Serialize)]
pub struct ExportedRoomKey {
    /// The encryption algorithm that the session uses.
    pub algorithm: EventEncryptionAlgorithm,

    /// The room where the session is used.
    pub room_id: OwnedRoomId,

    /// The Curve25519 key of the device which initiated the session originally.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,

    /// The ID of the session that the key is for.
    pub session_id: String,

    /// The key for the session.
    pub session_key: ExportedSessionKey,

    /// The Ed25519 key of the device which initiated the session originally.
    #[serde(default)]
    pub sender_claimed_keys: BTreeMap<String, String>,

    /// Chain of Curve25519 keys through which this session was forwarded, via
    /// m.forwarded_room_key events.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for ExportedRoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedRoomKey")
            .field("algorithm", &self.algorithm)
            .field("room_id", &self.room_id)
            .field("sender_key", &self.sender_key)
            .field("session_id", &self.session_id)
            .field("sender_claimed_keys", &self.sender_claimed_keys)
            .field("forwarding_curve25519_key_chain", &self.forwarding_curve25519_key_chain)
            .finish_non_exhaustive()
    }
}

impl ExportedRoomKey {
    /// The Ed25519 key the creator of the session claimed to own, if it is
    /// present and valid.
    pub fn claimed_ed25519_key(&self) -> Option<Ed25519PublicKey> {
        self.sender_claimed_keys.get(ED25519).and_then(|k| Ed25519PublicKey::from_base64(k).ok())
    }

    /// Create an `ExportedRoomKey` from a `BackedUpRoomKey`.
    ///
    /// The backed up key doesn't carry the room and session it belongs to,
    /// the backup stores them next to the encrypted key.
    pub fn from_backed_up_room_key(
        room_id: &RoomId,
        session_id: &str,
        room_key: BackedUpRoomKey,
    ) -> Self {
        Self {
            algorithm: room_key.algorithm,
            room_id: room_id.to_owned(),
            sender_key: room_key.sender_key,
            session_id: session_id.to_owned(),
            session_key: room_key.session_key,
            sender_claimed_keys: room_key.sender_claimed_keys,
            forwarding_curve25519_key_chain: room_key.forwarding_curve25519_key_chain,
        }
    }

    /// Convert the exported key into the content of an
    /// `m.forwarded_room_key` event.
    ///
    /// Returns `None` if the key doesn't carry a valid claimed Ed25519 key.
    pub fn into_forwarded_room_key(self) -> Option<ForwardedRoomKeyContent> {
        let sender_claimed_ed25519_key = self.claimed_ed25519_key()?;

        Some(ForwardedRoomKeyContent {
            algorithm: self.algorithm,
            room_id: self.room_id,
            sender_key: self.sender_key,
            session_id: self.session_id,
            session_key: self.session_key,
            sender_claimed_ed25519_key,
            forwarding_curve25519_key_chain: self.forwarding_curve25519_key_chain,
        })
    }
}

impl From<ForwardedRoomKeyContent> for ExportedRoomKey {
    /// Convert the content of a forwarded room key into a exported room key.
    fn from(forwarded_key: ForwardedRoomKeyContent) -> Self {
        let sender_claimed_keys = BTreeMap::from([(
            ED25519.to_owned(),
            forwarded_key.sender_claimed_ed25519_key.to_base64(),
        )]);

        Self {
            algorithm: forwarded_key.algorithm,
            room_id: forwarded_key.room_id,
            sender_key: forwarded_key.sender_key,
            session_id: forwarded_key.session_id,
            session_key: forwarded_key.session_key,
            sender_claimed_keys,
            forwarding_curve25519_key_chain: forwarded_key.forwarding_curve25519_key_chain,
        }
    }
}

/// A backed up version of an `InboundGroupSession`
///
/// This can be used to backup the `InboundGroupSession` to the server.
#[derive(Deserialize, Serialize)]
#[allow(missing_debug_implementations)]
pub struct BackedUpRoomKey {
    /// The encryption algorithm that the session uses.
    pub algorithm: EventEncryptionAlgorithm,

    /// The Curve25519 key of the device which initiated the session originally.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,

    /// The key for the session.
    pub session_key: ExportedSessionKey,

    /// The Ed25519 key of the device which initiated the session originally.
    #[serde(default)]
    pub sender_claimed_keys: BTreeMap<String, String>,

    /// Chain of Curve25519 keys through which this session was forwarded, via
    /// m.forwarded_room_key events.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

impl From<ExportedRoomKey> for BackedUpRoomKey {
    fn from(k: ExportedRoomKey) -> Self {
        Self {
            algorithm: k.algorithm,
            sender_key: k.sender_key,
            session_key: k.session_key,
            sender_claimed_keys: k.sender_claimed_keys,
            forwarding_curve25519_key_chain: k.forwarding_curve25519_key_chain,
        }
    }
}
