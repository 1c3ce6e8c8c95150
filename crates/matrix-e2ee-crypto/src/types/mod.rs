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

//! Module containing customized types modeling Matrix keys and events.
//!
//! The types mirror the Ruma types of the same name, but deserialize directly
//! into vodozemac keys and messages.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

mod backup;
mod decryption;
pub mod events;

pub use backup::*;
pub use decryption::*;

/// An encryption algorithm to be used to encrypt messages sent to a room or to
/// a device.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventEncryptionAlgorithm {
    /// Olm version 1 using Curve25519, AES-256, and SHA-256.
    OlmV1Curve25519AesSha2,
    /// Megolm version 1 using AES-256 and SHA-256.
    MegolmV1AesSha2,
    /// An algorithm this crate doesn't know about.
    Unknown(String),
}

impl EventEncryptionAlgorithm {
    /// The string form of the algorithm, as it appears in events.
    pub fn as_str(&self) -> &str {
        match self {
            Self::OlmV1Curve25519AesSha2 => "m.olm.v1.curve25519-aes-sha2",
            Self::MegolmV1AesSha2 => "m.megolm.v1.aes-sha2",
            Self::Unknown(algorithm) => algorithm,
        }
    }
}

impl From<&str> for EventEncryptionAlgorithm {
    fn from(algorithm: &str) -> Self {
        match algorithm {
            "m.olm.v1.curve25519-aes-sha2" => Self::OlmV1Curve25519AesSha2,
            "m.megolm.v1.aes-sha2" => Self::MegolmV1AesSha2,
            _ => Self::Unknown(algorithm.to_owned()),
        }
    }
}

impl fmt::Display for EventEncryptionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventEncryptionAlgorithm {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventEncryptionAlgorithm {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let algorithm = String::deserialize(deserializer)?;
        Ok(algorithm.as_str().into())
    }
}

// Vodozemac serializes keys directly as a byte slice, while Matrix likes to
// base64 encode all byte slices.
//
// These helpers ensure that we serialize/deserialize in a Matrix compatible
// way.
pub(crate) fn deserialize_curve_key<'de, D>(de: D) -> Result<Curve25519PublicKey, D::Error>
where
    D: Deserializer<'de>,
{
    let key: String = Deserialize::deserialize(de)?;
    Curve25519PublicKey::from_base64(&key).map_err(serde::de::Error::custom)
}

pub(crate) fn serialize_curve_key<S>(key: &Curve25519PublicKey, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_str(&key.to_base64())
}

pub(crate) fn deserialize_optional_curve_key<'de, D>(
    de: D,
) -> Result<Option<Curve25519PublicKey>, D::Error>
where
    D: Deserializer<'de>,
{
    let key: Option<String> = Deserialize::deserialize(de)?;
    key.map(|k| Curve25519PublicKey::from_base64(&k).map_err(serde::de::Error::custom)).transpose()
}

pub(crate) fn serialize_optional_curve_key<S>(
    key: &Option<Curve25519PublicKey>,
    s: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match key {
        Some(key) => s.serialize_some(&key.to_base64()),
        None => s.serialize_none(),
    }
}

pub(crate) fn deserialize_ed25519_key<'de, D>(de: D) -> Result<Ed25519PublicKey, D::Error>
where
    D: Deserializer<'de>,
{
    let key: String = Deserialize::deserialize(de)?;
    Ed25519PublicKey::from_base64(&key).map_err(serde::de::Error::custom)
}

pub(crate) fn serialize_ed25519_key<S>(key: &Ed25519PublicKey, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_str(&key.to_base64())
}
