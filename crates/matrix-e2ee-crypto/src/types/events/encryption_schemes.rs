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

//! Encryption schemes for `m.room.encrypted` contents.

use std::collections::BTreeMap;

use ruma::OwnedDeviceId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vodozemac::{megolm::MegolmMessage, olm::OlmMessage, Curve25519PublicKey};

use crate::types::{
    deserialize_curve_key, deserialize_optional_curve_key, serialize_curve_key,
    serialize_optional_curve_key, EventEncryptionAlgorithm,
};

/// The event content for events encrypted with the
/// `m.olm.v1.curve25519-aes-sha2` algorithm.
///
/// The ciphertext map is keyed by the Curve25519 key of each recipient device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlmV1Curve25519AesSha2Content {
    /// The Curve25519 key of the sender.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub sender_key: Curve25519PublicKey,

    /// The encrypted content, one entry per recipient device.
    pub ciphertext: BTreeMap<String, OlmMessage>,
}

impl OlmV1Curve25519AesSha2Content {
    /// Create a content carrying a single ciphertext for one recipient.
    pub fn new(
        sender_key: Curve25519PublicKey,
        recipient_key: Curve25519PublicKey,
        ciphertext: OlmMessage,
    ) -> Self {
        Self { sender_key, ciphertext: BTreeMap::from([(recipient_key.to_base64(), ciphertext)]) }
    }

    /// Get the ciphertext that was encrypted for the device owning the given
    /// Curve25519 key.
    pub fn ciphertext_for(&self, recipient_key: &Curve25519PublicKey) -> Option<&OlmMessage> {
        self.ciphertext.get(&recipient_key.to_base64())
    }
}

/// The event content for events encrypted with the `m.megolm.v1.aes-sha2`
/// algorithm.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MegolmV1AesSha2Content {
    /// The encrypted content of the event.
    pub ciphertext: MegolmMessage,

    /// The Curve25519 key of the sender.
    #[serde(
        default,
        deserialize_with = "deserialize_optional_curve_key",
        serialize_with = "serialize_optional_curve_key",
        skip_serializing_if = "Option::is_none"
    )]
    pub sender_key: Option<Curve25519PublicKey>,

    /// The ID of the sending device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<OwnedDeviceId>,

    /// The ID of the session used to encrypt the message.
    pub session_id: String,
}

impl MegolmV1AesSha2Content {
    /// The index of the Megolm ratchet that was used to encrypt the message.
    pub fn message_index(&self) -> u32 {
        self.ciphertext.message_index()
    }
}

/// An unknown and unsupported `m.room.encrypted` event content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnknownEncryptedContent {
    /// The algorithm that was used to encrypt the given event content.
    pub algorithm: EventEncryptionAlgorithm,
    /// The other data of the unknown encrypted content.
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

/// A deserialisation helper.
#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct Helper {
    pub algorithm: EventEncryptionAlgorithm,
    #[serde(flatten)]
    pub other: Value,
}

macro_rules! scheme_serialization {
    ($something:ident, $($algorithm:ident => $content:ident),+ $(,)?) => {
        $(
            impl From<$content> for $something {
                fn from(c: $content) -> Self {
                    Self::$algorithm(c.into())
                }
            }
        )+

        impl TryFrom<Helper> for $something {
            type Error = serde_json::Error;

            fn try_from(value: Helper) -> Result<Self, Self::Error> {
                Ok(match value.algorithm {
                    $(
                        EventEncryptionAlgorithm::$algorithm => {
                            let content: $content = serde_json::from_value(value.other)?;
                            content.into()
                        }
                    )+
                    _ => Self::Unknown(UnknownEncryptedContent {
                        algorithm: value.algorithm,
                        other: serde_json::from_value(value.other)?,
                    }),
                })
            }
        }

        impl Serialize for $something {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                let helper = match self {
                    $(
                        Self::$algorithm(r) => Helper {
                            algorithm: self.algorithm(),
                            other: serde_json::to_value(r).map_err(serde::ser::Error::custom)?,
                        },
                    )+
                    Self::Unknown(r) => Helper {
                        algorithm: r.algorithm.clone(),
                        other: serde_json::to_value(r.other.clone())
                            .map_err(serde::ser::Error::custom)?,
                    },
                };

                helper.serialize(serializer)
            }
        }
    };
}

pub(super) use scheme_serialization;
