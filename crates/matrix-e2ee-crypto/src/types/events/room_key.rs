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

//! Types for the `m.room_key` events.

use std::fmt;

use ruma::OwnedRoomId;
use serde::{Deserialize, Serialize};
use vodozemac::megolm::SessionKey;

use super::EventType;
use crate::types::EventEncryptionAlgorithm;

/// The `m.room_key` to-device event content, it is always sent over an Olm
/// channel.
#[derive(Deserialize, Serialize)]
pub struct RoomKeyContent {
    /// The algorithm of the session, `m.megolm.v1.aes-sha2`.
    pub algorithm: EventEncryptionAlgorithm,
    /// The room where the key is used.
    pub room_id: OwnedRoomId,
    /// The ID of the session that the key is for.
    pub session_id: String,
    /// The key to be exchanged.
    pub session_key: SessionKey,
}

impl RoomKeyContent {
    /// Create a new `m.megolm.v1.aes-sha2` `m.room_key` content.
    pub fn new(room_id: OwnedRoomId, session_id: String, session_key: SessionKey) -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id,
            session_id,
            session_key,
        }
    }
}

impl EventType for RoomKeyContent {
    const EVENT_TYPE: &'static str = "m.room_key";
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for RoomKeyContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomKeyContent")
            .field("algorithm", &self.algorithm)
            .field("room_id", &self.room_id)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}
