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

//! Types for `m.room.encrypted` room events and to-device events.

use as_variant::as_variant;
use ruma::{MilliSecondsSinceUnixEpoch, OwnedEventId, OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    encryption_schemes::{scheme_serialization, Helper},
    EventType, MegolmV1AesSha2Content, OlmV1Curve25519AesSha2Content, UnknownEncryptedContent,
};
use crate::{error::EventError, types::EventEncryptionAlgorithm};

/// The content of an `m.room.encrypted` event.
///
/// This is an enum over the different encryption algorithms we support, the
/// `algorithm` field of the JSON selects the variant.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Helper")]
pub enum RoomEncryptedEventContent {
    /// The `m.olm.v1.curve25519-aes-sha2` variant, used for to-device events.
    OlmV1Curve25519AesSha2(OlmV1Curve25519AesSha2Content),
    /// The `m.megolm.v1.aes-sha2` variant, used for room events.
    MegolmV1AesSha2(MegolmV1AesSha2Content),
    /// An unknown and unsupported variant.
    Unknown(UnknownEncryptedContent),
}

impl RoomEncryptedEventContent {
    /// The algorithm that was used to encrypt the content.
    pub fn algorithm(&self) -> EventEncryptionAlgorithm {
        match self {
            Self::OlmV1Curve25519AesSha2(_) => EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
            Self::MegolmV1AesSha2(_) => EventEncryptionAlgorithm::MegolmV1AesSha2,
            Self::Unknown(c) => c.algorithm.to_owned(),
        }
    }
}

impl EventType for RoomEncryptedEventContent {
    const EVENT_TYPE: &'static str = "m.room.encrypted";
}

scheme_serialization!(
    RoomEncryptedEventContent,
    OlmV1Curve25519AesSha2 => OlmV1Curve25519AesSha2Content,
    MegolmV1AesSha2 => MegolmV1AesSha2Content,
);

/// An encrypted room event, as it is received from the sync.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedEvent {
    /// The user that sent the event.
    pub sender: OwnedUserId,
    /// The globally unique ID of the event.
    pub event_id: OwnedEventId,
    /// The encrypted content.
    pub content: RoomEncryptedEventContent,
    /// The time the event was received by the origin server.
    pub origin_server_ts: MilliSecondsSinceUnixEpoch,
    /// The room the event belongs to, absent in sync timelines where the room
    /// is implied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<OwnedRoomId>,
}

impl EncryptedEvent {
    /// Parse an encrypted event from its raw JSON form.
    ///
    /// Missing mandatory content fields are reported as
    /// [`EventError::MissingField`], any other malformed input as a JSON
    /// error.
    pub fn from_json(event: Value) -> Result<Self, EventError> {
        let content = event
            .get("content")
            .and_then(Value::as_object)
            .ok_or(EventError::MissingField("content"))?;

        let algorithm = content
            .get("algorithm")
            .and_then(Value::as_str)
            .ok_or(EventError::MissingField("algorithm"))?;

        if algorithm == EventEncryptionAlgorithm::MegolmV1AesSha2.as_str() {
            for field in ["ciphertext", "session_id"] {
                if !content.contains_key(field) {
                    return Err(EventError::MissingField(field));
                }
            }
        }

        Ok(serde_json::from_value(event)?)
    }

    /// The Megolm content of the event, if it was encrypted using Megolm.
    pub fn megolm_content(&self) -> Option<&MegolmV1AesSha2Content> {
        as_variant!(&self.content, RoomEncryptedEventContent::MegolmV1AesSha2)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use serde_json::json;

    use super::{EncryptedEvent, RoomEncryptedEventContent};
    use crate::{error::EventError, types::EventEncryptionAlgorithm};

    fn megolm_json() -> serde_json::Value {
        json!({
            "sender": "@alice:example.org",
            "event_id": "$143273582443PhrSn:example.org",
            "origin_server_ts": 1432735824653u64,
            "content": {
                "algorithm": "m.megolm.v1.aes-sha2",
                "ciphertext": "AwgAEpABhetEzzZzyYrxtEVUtlJnZtJcURBlQUQJ9irVeklCTs06LwgTMQj61PMUS4Vy\
                               YOX+PD67+hhU40/8olOww+Ud0m2afjMjC3wFX+4fFfSkoWPVHEmRVucfcdSF1RSB4EmK\
                               PIP4eo1X6x8kCIMewBvxl2sI9j4VNvDvAN7M3zkLJfFLOFHbBviI4FN7hSFHFeM739Zg\
                               iwxEs3hIkUXEiAfrobzaMEM/zY7SDrTdyffZndgJo7CZOVhoV6vuaOhmAy4X2t4UnbuV\
                               JGJjKfV57NAhp8W+9oT7ugwO",
                "device_id": "KIUVQQSDTM",
                "sender_key": "LvryVyoCjdONdBCi2vvoSbI34yTOx7YrCFACUEKoXnc",
                "session_id": "64H7XKokIx0ASkYDHZKlT5zd/Zccz/cQspPNdvnNULA"
            }
        })
    }

    #[test]
    fn test_megolm_event_deserialization() {
        let event = EncryptedEvent::from_json(megolm_json()).unwrap();

        assert_eq!(event.content.algorithm(), EventEncryptionAlgorithm::MegolmV1AesSha2);
        let content = event.megolm_content().unwrap();
        assert_eq!(content.session_id, "64H7XKokIx0ASkYDHZKlT5zd/Zccz/cQspPNdvnNULA");
        assert!(content.sender_key.is_some());

        let serialized = serde_json::to_value(&event).unwrap();
        let reparsed = EncryptedEvent::from_json(serialized).unwrap();
        assert_eq!(reparsed.content, event.content);
        assert_eq!(reparsed.event_id, event.event_id);
    }

    #[test]
    fn test_missing_fields_are_reported() {
        let mut json = megolm_json();
        json["content"].as_object_mut().unwrap().remove("ciphertext");

        assert_matches!(
            EncryptedEvent::from_json(json),
            Err(EventError::MissingField("ciphertext"))
        );
    }

    #[test]
    fn test_missing_sender_key_is_accepted() {
        let mut json = megolm_json();
        json["content"].as_object_mut().unwrap().remove("sender_key");

        let event = EncryptedEvent::from_json(json).unwrap();
        assert!(event.megolm_content().unwrap().sender_key.is_none());
    }

    #[test]
    fn test_unknown_algorithm() {
        let json = json!({
            "algorithm": "m.megolm.v3.aes-sha2",
            "ciphertext": "foo",
        });

        let content: RoomEncryptedEventContent = serde_json::from_value(json.clone()).unwrap();
        assert_matches!(&content, RoomEncryptedEventContent::Unknown(_));
        assert_eq!(serde_json::to_value(content).unwrap(), json);
    }
}
