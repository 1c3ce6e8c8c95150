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

//! Data types for decrypting an event.

use ruma::serde::JsonObject;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

/// The outcome of a successful room event decryption.
#[derive(Clone, Debug, PartialEq)]
pub struct DecryptionResult {
    /// The decrypted event, with the `sender`, `event_id` and
    /// `origin_server_ts` of the encrypted event copied over.
    pub clear_event: JsonObject,

    /// The Curve25519 key of the device that created the session.
    pub sender_curve25519_key: Curve25519PublicKey,

    /// The Ed25519 key the creator of the session claimed to own.
    ///
    /// For sessions received directly over Olm this key was authenticated by
    /// the Olm channel, for forwarded or imported sessions it is merely a
    /// claim.
    pub claimed_ed25519_key: Option<Ed25519PublicKey>,

    /// The chain of Curve25519 keys through which the session was forwarded to
    /// us, empty if we received it from its creator.
    pub forwarding_curve25519_key_chain: Vec<String>,
}

impl DecryptionResult {
    /// The type of the decrypted event, if the plaintext contained one.
    pub fn event_type(&self) -> Option<&str> {
        self.clear_event.get("type").and_then(|t| t.as_str())
    }

    /// Was the session used to decrypt this event forwarded to us by a device
    /// other than its creator.
    pub fn is_forwarded(&self) -> bool {
        !self.forwarding_curve25519_key_chain.is_empty()
    }
}
