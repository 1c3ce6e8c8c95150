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

use std::{fmt, sync::Arc};

use ruma::{OwnedDeviceId, OwnedUserId, RoomId, SecondsSinceUnixEpoch};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{field::debug, instrument, trace, Span};
use vodozemac::{
    olm::{DecryptionError, IdentityKeys, OlmMessage, Session as InnerSession, SessionPickle},
    Curve25519PublicKey,
};

use crate::{
    error::OlmResult, identities::ReadOnlyDevice,
    types::events::OlmV1Curve25519AesSha2Content,
};

/// Cryptographic session that enables secure communication between two
/// `Account`s
#[derive(Clone)]
pub struct Session {
    /// The `UserId` of our own account.
    pub(crate) user_id: OwnedUserId,
    /// The `DeviceId` of our own account.
    pub(crate) device_id: OwnedDeviceId,
    /// Our own identity keys, they are embedded in every plaintext.
    pub(crate) our_identity_keys: Arc<IdentityKeys>,
    /// The Olm session.
    pub(crate) inner: Arc<Mutex<InnerSession>>,
    /// Our session ID.
    pub(crate) session_id: Arc<str>,
    /// The Curve25519 key of the other side.
    pub(crate) sender_key: Curve25519PublicKey,
    /// When the session was created.
    pub(crate) creation_time: SecondsSinceUnixEpoch,
    /// When the session was last used.
    pub(crate) last_use_time: SecondsSinceUnixEpoch,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id())
            .field("sender_key", &self.sender_key)
            .finish()
    }
}

impl Session {
    /// Decrypt the given Olm message.
    ///
    /// Returns the decrypted plaintext or a `DecryptionError` if decryption
    /// failed.
    #[instrument(skip_all, fields(session))]
    pub async fn decrypt(&mut self, message: &OlmMessage) -> Result<String, DecryptionError> {
        let mut inner = self.inner.lock().await;
        let plaintext = inner.decrypt(message)?;

        Span::current().record("session", debug(&*inner));
        trace!("Decrypted an Olm message");

        self.last_use_time = SecondsSinceUnixEpoch::now();

        Ok(String::from_utf8_lossy(&plaintext).into_owned())
    }

    /// Get the Curve25519 key of the device on the other side of the session.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    /// When the session was last used to encrypt or decrypt a message.
    pub fn last_use_time(&self) -> SecondsSinceUnixEpoch {
        self.last_use_time
    }

    /// Encrypt the given event content as an `m.room.encrypted` to-device
    /// event content.
    ///
    /// # Arguments
    ///
    /// * `recipient_device` - The device for which this message is going to be
    ///   encrypted, this needs to be the device that was used to create this
    ///   session with.
    ///
    /// * `event_type` - The type of the event content.
    ///
    /// * `content` - The content of the event.
    pub async fn encrypt(
        &mut self,
        recipient_device: &ReadOnlyDevice,
        event_type: &str,
        content: Value,
    ) -> OlmResult<OlmV1Curve25519AesSha2Content> {
        self.encrypt_helper(recipient_device, None, event_type, content).await
    }

    /// Encrypt the given event content as the ciphertext of a room event.
    ///
    /// The room ID is embedded in the plaintext so the receiver can check
    /// that the event wasn't moved to a different room.
    pub async fn encrypt_for_room(
        &mut self,
        recipient_device: &ReadOnlyDevice,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
    ) -> OlmResult<OlmV1Curve25519AesSha2Content> {
        self.encrypt_helper(recipient_device, Some(room_id), event_type, content).await
    }

    async fn encrypt_helper(
        &mut self,
        recipient_device: &ReadOnlyDevice,
        room_id: Option<&RoomId>,
        event_type: &str,
        content: Value,
    ) -> OlmResult<OlmV1Curve25519AesSha2Content> {
        let mut plaintext = json!({
            "sender": &self.user_id,
            "sender_device": &self.device_id,
            "keys": {
                "ed25519": self.our_identity_keys.ed25519.to_base64(),
            },
            "recipient": recipient_device.user_id(),
            "recipient_keys": {
                "ed25519": recipient_device.ed25519_key().to_base64(),
            },
            "type": event_type,
            "content": content,
        });

        if let Some(room_id) = room_id {
            plaintext["room_id"] = json!(room_id);
        }

        let plaintext = serde_json::to_string(&plaintext)?;

        let ciphertext = self.inner.lock().await.encrypt(&plaintext);

        self.last_use_time = SecondsSinceUnixEpoch::now();

        Ok(OlmV1Curve25519AesSha2Content::new(
            self.our_identity_keys.curve25519,
            recipient_device.curve25519_key(),
            ciphertext,
        ))
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Store the session as a base64 encoded string.
    pub async fn pickle(&self) -> PickledSession {
        let pickle = self.inner.lock().await.pickle();

        PickledSession {
            pickle,
            sender_key: self.sender_key,
            creation_time: self.creation_time,
            last_use_time: self.last_use_time,
        }
    }

    /// Restore a Session from a previously pickled string.
    ///
    /// # Arguments
    ///
    /// * `user_id` - Our own user id that the session belongs to.
    ///
    /// * `device_id` - Our own device ID that the session belongs to.
    ///
    /// * `our_identity_keys` - An clone of the Arc to our own identity keys.
    ///
    /// * `pickle` - The pickled version of the `Session`.
    pub fn from_pickle(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        our_identity_keys: Arc<IdentityKeys>,
        pickle: PickledSession,
    ) -> Self {
        let session: InnerSession = pickle.pickle.into();
        let session_id = session.session_id();

        Session {
            user_id,
            device_id,
            our_identity_keys,
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            sender_key: pickle.sender_key,
            creation_time: pickle.creation_time,
            last_use_time: pickle.last_use_time,
        }
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

/// A pickled version of a `Session`.
///
/// Holds all the information that needs to be stored in a database to restore
/// a Session.
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledSession {
    /// The pickle string holding the Olm Session.
    pub pickle: SessionPickle,
    /// The curve25519 key of the other user that we share this session with.
    pub sender_key: Curve25519PublicKey,
    /// The Unix timestamp when the session was created.
    pub creation_time: SecondsSinceUnixEpoch,
    /// The Unix timestamp when the session was last used.
    pub last_use_time: SecondsSinceUnixEpoch,
}
