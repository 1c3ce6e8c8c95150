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

//! Module containing the plaintext payload of events that were encrypted
//! using the Olm protocol.

use ruma::{OwnedDeviceId, OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::Ed25519PublicKey;

use crate::types::{deserialize_ed25519_key, serialize_ed25519_key};

/// Public keys of a device, as they appear in the Olm plaintext.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlmV1Keys {
    /// The Ed25519 key of the device.
    #[serde(
        deserialize_with = "deserialize_ed25519_key",
        serialize_with = "serialize_ed25519_key"
    )]
    pub ed25519: Ed25519PublicKey,
}

/// The plaintext of an `m.olm.v1.curve25519-aes-sha2` to-device event.
///
/// The sender and recipient fields bind the ciphertext to the two devices,
/// they must be checked against the outer event and our own identity before
/// the content is trusted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecryptedOlmV1Event {
    /// The sender of the event, as set by the sender of the event.
    pub sender: OwnedUserId,
    /// The device that sent the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_device: Option<OwnedDeviceId>,
    /// The intended recipient of the event, as set by the sender of the event.
    pub recipient: OwnedUserId,
    /// The sender's signing keys of the encrypted event.
    pub keys: OlmV1Keys,
    /// The recipient's signing keys of the encrypted event.
    pub recipient_keys: OlmV1Keys,
    /// The type of the inner event.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The content of the inner event.
    pub content: Value,
    /// The room of the inner event, only present for room events that were
    /// encrypted using Olm.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<OwnedRoomId>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::DecryptedOlmV1Event;

    #[test]
    fn test_olm_plaintext_deserialization() {
        let json = json!({
            "sender": "@alice:example.org",
            "sender_device": "ALICEDEVICE",
            "recipient": "@bob:example.org",
            "keys": { "ed25519": "aOfOnlaeMb5GW1TxkZ8pXnblkGMgAvps+lAukrdYaZk" },
            "recipient_keys": { "ed25519": "aOfOnlaeMb5GW1TxkZ8pXnblkGMgAvps+lAukrdYaZk" },
            "type": "m.dummy",
            "content": {}
        });

        let event: DecryptedOlmV1Event = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(event.event_type, "m.dummy");
        assert_eq!(event.sender.as_str(), "@alice:example.org");

        assert_eq!(serde_json::to_value(event).unwrap(), json);
    }
}
