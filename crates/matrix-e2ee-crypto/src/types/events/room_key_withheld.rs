// Copyright 2023 The Matrix.org Foundation C.I.C.
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

//! Types for the `m.room_key.withheld` events.

use std::fmt;

use ruma::{OwnedDeviceId, OwnedRoomId};
use serde::{Deserialize, Serialize};
use vodozemac::Curve25519PublicKey;

use super::EventType;
use crate::types::{deserialize_curve_key, serialize_curve_key, EventEncryptionAlgorithm};

/// A machine-readable code for why the Megolm key was not sent.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WithheldCode {
    /// The user or device was blacklisted.
    Blacklisted,
    /// The user or device was not verified, and the sender is only sharing
    /// keys with verified users or devices.
    Unverified,
    /// The user or device is not allowed to have the key, for example because
    /// a reshare request came from a device the session was never shared
    /// with.
    Unauthorised,
    /// Sent in reply to a key request if the device that the key is requested
    /// from does not have the requested key.
    Unavailable,
    /// An Olm session could not be established with the device.
    NoOlm,
    /// A code this crate doesn't know about.
    Custom(String),
}

impl WithheldCode {
    /// The string form of the code, as it appears in events.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Blacklisted => "m.blacklisted",
            Self::Unverified => "m.unverified",
            Self::Unauthorised => "m.unauthorised",
            Self::Unavailable => "m.unavailable",
            Self::NoOlm => "m.no_olm",
            Self::Custom(code) => code,
        }
    }
}

impl From<String> for WithheldCode {
    fn from(code: String) -> Self {
        match code.as_str() {
            "m.blacklisted" => Self::Blacklisted,
            "m.unverified" => Self::Unverified,
            "m.unauthorised" => Self::Unauthorised,
            "m.unavailable" => Self::Unavailable,
            "m.no_olm" => Self::NoOlm,
            _ => Self::Custom(code),
        }
    }
}

impl From<WithheldCode> for String {
    fn from(code: WithheldCode) -> Self {
        match code {
            WithheldCode::Custom(code) => code,
            other => other.as_str().to_owned(),
        }
    }
}

impl fmt::Display for WithheldCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            WithheldCode::Blacklisted => "The sender has blocked you.",
            WithheldCode::Unverified => "The sender has disabled encrypting to unverified devices.",
            WithheldCode::Unauthorised => "You are not authorised to read the message.",
            WithheldCode::Unavailable => "The requested key was not found.",
            WithheldCode::NoOlm => "Unable to establish a secure channel.",
            WithheldCode::Custom(code) => code,
        };

        f.write_str(text)
    }
}

/// The `m.room_key.withheld` event content.
///
/// Devices that purposely do not send Megolm keys to a device may instead
/// send this to-device event to indicate that the recipient should not expect
/// to receive keys for the session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoomKeyWithheldContent {
    /// The algorithm of the withheld session.
    pub algorithm: EventEncryptionAlgorithm,
    /// Why the key was withheld.
    pub code: WithheldCode,
    /// A human readable form of the code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// The room of the withheld session.
    pub room_id: OwnedRoomId,
    /// The ID of the withheld session.
    pub session_id: String,
    /// The Curve25519 key of the device that withholds the key.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,
    /// The device that withholds the key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_device: Option<OwnedDeviceId>,
}

impl RoomKeyWithheldContent {
    /// Creates a withheld content from the given info.
    pub fn new(
        code: WithheldCode,
        room_id: OwnedRoomId,
        session_id: String,
        sender_key: Curve25519PublicKey,
        from_device: OwnedDeviceId,
    ) -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            reason: Some(code.to_string()),
            code,
            room_id,
            session_id,
            sender_key,
            from_device: Some(from_device),
        }
    }
}

impl EventType for RoomKeyWithheldContent {
    const EVENT_TYPE: &'static str = "m.room_key.withheld";
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{RoomKeyWithheldContent, WithheldCode};

    #[test]
    fn test_withheld_code_serialization() {
        for (code, string) in [
            (WithheldCode::Blacklisted, "m.blacklisted"),
            (WithheldCode::Unverified, "m.unverified"),
            (WithheldCode::Unauthorised, "m.unauthorised"),
            (WithheldCode::Unavailable, "m.unavailable"),
            (WithheldCode::NoOlm, "m.no_olm"),
            (WithheldCode::Custom("org.example.code".to_owned()), "org.example.code"),
        ] {
            assert_eq!(serde_json::to_value(&code).unwrap(), json!(string));
            let parsed: WithheldCode = serde_json::from_value(json!(string)).unwrap();
            assert_eq!(parsed, code);
        }
    }

    #[test]
    fn test_withheld_content_deserialization() {
        let json = json!({
            "algorithm": "m.megolm.v1.aes-sha2",
            "code": "m.unverified",
            "reason": "Device not verified",
            "room_id": "!Cuyf34gef24t:localhost",
            "sender_key": "RF3s+E7RkTQTGF2d8Deol0FkQvgII2aJDf3/Jp5mxVU",
            "session_id": "X3lUlvLELLYxeTx4yOVu6UDpasGEVO0Jbu+QFnm0cKQ",
            "from_device": "ABCDEFG"
        });

        let content: RoomKeyWithheldContent = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(content.code, WithheldCode::Unverified);
        assert_eq!(content.from_device.as_deref().map(|d| d.as_str()), Some("ABCDEFG"));

        assert_eq!(serde_json::to_value(content).unwrap(), json);
    }
}
