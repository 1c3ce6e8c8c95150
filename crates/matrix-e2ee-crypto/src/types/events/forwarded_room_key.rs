// Copyright 2022 The Matrix.org Foundation C.I.C.
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

//! Types for the `m.forwarded_room_key` events.

use std::fmt;

use ruma::OwnedRoomId;
use serde::{Deserialize, Serialize};
use vodozemac::{megolm::ExportedSessionKey, Curve25519PublicKey, Ed25519PublicKey};

use super::EventType;
use crate::types::{
    deserialize_curve_key, deserialize_ed25519_key, serialize_curve_key, serialize_ed25519_key,
    EventEncryptionAlgorithm,
};

/// The `m.forwarded_room_key` to-device event content.
///
/// Sent over Olm by a device that re-shares a room key it has, either because
/// it created the session or because it received it earlier.
#[derive(Deserialize, Serialize)]
pub struct ForwardedRoomKeyContent {
    /// The algorithm of the forwarded session.
    pub algorithm: EventEncryptionAlgorithm,
    /// The room where the key is used.
    pub room_id: OwnedRoomId,
    /// The Curve25519 key of the device which created the session.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,
    /// The ID of the session that the key is for.
    pub session_id: String,
    /// The key to be exchanged, exported at some message index.
    pub session_key: ExportedSessionKey,
    /// The Ed25519 key the creator of the session claimed to own.
    #[serde(
        deserialize_with = "deserialize_ed25519_key",
        serialize_with = "serialize_ed25519_key"
    )]
    pub sender_claimed_ed25519_key: Ed25519PublicKey,
    /// Chain of Curve25519 keys through which this session was forwarded.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

impl EventType for ForwardedRoomKeyContent {
    const EVENT_TYPE: &'static str = "m.forwarded_room_key";
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for ForwardedRoomKeyContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardedRoomKeyContent")
            .field("algorithm", &self.algorithm)
            .field("room_id", &self.room_id)
            .field("sender_key", &self.sender_key)
            .field("session_id", &self.session_id)
            .field("forwarding_curve25519_key_chain", &self.forwarding_curve25519_key_chain)
            .finish_non_exhaustive()
    }
}
