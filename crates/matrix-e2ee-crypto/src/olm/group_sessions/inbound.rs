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

use std::{
    cmp::max,
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use matrix_e2ee_common::locks::Mutex as StdMutex;
use ruma::{serde::JsonObject, OwnedRoomId, RoomId, SecondsSinceUnixEpoch};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::trace;
use vodozemac::{
    megolm::{
        DecryptedMessage, InboundGroupSession as InnerSession, InboundGroupSessionPickle,
        MegolmMessage, SessionConfig, SessionKey, SessionOrdering,
    },
    Curve25519PublicKey, Ed25519PublicKey,
};

use super::{BackedUpRoomKey, ExportedRoomKey, ED25519};
use crate::{
    error::{EventError, MegolmResult, SessionCreationError},
    types::{
        events::{forwarded_room_key::ForwardedRoomKeyContent, room_encrypted::EncryptedEvent},
        EventEncryptionAlgorithm,
    },
};

/// Inbound group session.
///
/// Inbound group sessions are used to exchange room messages between a group of
/// participants. Inbound group sessions are used to decrypt the room messages.
#[derive(Clone)]
pub struct InboundGroupSession {
    inner: Arc<Mutex<InnerSession>>,
    session_id: Arc<str>,
    first_known_index: u32,
    sender_key: Curve25519PublicKey,
    signing_key: Option<Ed25519PublicKey>,
    room_id: OwnedRoomId,
    forwarding_key_chain: Arc<[String]>,
    imported: bool,
    backed_up: Arc<AtomicBool>,
    creation_time: SecondsSinceUnixEpoch,
    message_index_watermark: Arc<StdMutex<Option<u32>>>,
}

impl InboundGroupSession {
    /// Create a new inbound group session for the given room.
    ///
    /// These sessions are used to decrypt room messages.
    ///
    /// # Arguments
    ///
    /// * `sender_key` - The public Curve25519 key of the account that
    ///   sent us the session.
    ///
    /// * `signing_key` - The public Ed25519 key of the account that
    ///   sent us the session.
    ///
    /// * `room_id` - The id of the room that the session is used in.
    ///
    /// * `session_key` - The private session key that is used to decrypt
    ///   messages.
    pub fn new(
        sender_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
        room_id: &RoomId,
        session_key: &SessionKey,
    ) -> Self {
        let session = InnerSession::new(session_key, SessionConfig::version_1());

        Self::from_parts(
            session,
            sender_key,
            Some(signing_key),
            room_id.to_owned(),
            Vec::new(),
            false,
        )
    }

    /// Create an inbound group session from an exported version of the group
    /// session.
    ///
    /// Most notably this can be called with an `ExportedRoomKey` from a
    /// previous `export()` call.
    pub fn from_export(exported_session: &ExportedRoomKey) -> Result<Self, SessionCreationError> {
        if exported_session.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            return Err(SessionCreationError::UnsupportedAlgorithm(
                exported_session.algorithm.to_string(),
            ));
        }

        let session =
            InnerSession::import(&exported_session.session_key, SessionConfig::version_1());

        Ok(Self::from_parts(
            session,
            exported_session.sender_key,
            exported_session.claimed_ed25519_key(),
            exported_session.room_id.clone(),
            exported_session.forwarding_curve25519_key_chain.clone(),
            true,
        ))
    }

    /// Create an inbound group session from the content of an
    /// `m.forwarded_room_key` event.
    ///
    /// The Curve25519 key of the forwarding device is appended to the
    /// forwarding chain.
    pub fn from_forwarded_key(
        forwarder_key: &Curve25519PublicKey,
        content: &ForwardedRoomKeyContent,
    ) -> Result<Self, SessionCreationError> {
        if content.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            return Err(SessionCreationError::UnsupportedAlgorithm(content.algorithm.to_string()));
        }

        let session = InnerSession::import(&content.session_key, SessionConfig::version_1());

        let mut forwarding_key_chain = content.forwarding_curve25519_key_chain.clone();
        forwarding_key_chain.push(forwarder_key.to_base64());

        Ok(Self::from_parts(
            session,
            content.sender_key,
            Some(content.sender_claimed_ed25519_key),
            content.room_id.clone(),
            forwarding_key_chain,
            true,
        ))
    }

    fn from_parts(
        session: InnerSession,
        sender_key: Curve25519PublicKey,
        signing_key: Option<Ed25519PublicKey>,
        room_id: OwnedRoomId,
        forwarding_key_chain: Vec<String>,
        imported: bool,
    ) -> Self {
        let session_id = session.session_id();
        let first_known_index = session.first_known_index();

        Self {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            first_known_index,
            sender_key,
            signing_key,
            room_id,
            forwarding_key_chain: forwarding_key_chain.into(),
            imported,
            backed_up: Arc::new(AtomicBool::new(false)),
            creation_time: SecondsSinceUnixEpoch::now(),
            message_index_watermark: Arc::new(StdMutex::new(None)),
        }
    }

    /// Store the group session as a base64 encoded string.
    pub async fn pickle(&self) -> PickledInboundGroupSession {
        let pickle = self.inner.lock().await.pickle();

        PickledInboundGroupSession {
            pickle,
            sender_key: self.sender_key,
            signing_key: self.signing_key,
            room_id: self.room_id.clone(),
            forwarding_chains: self.forwarding_key_chain.to_vec(),
            imported: self.imported,
            backed_up: self.backed_up(),
            creation_time: self.creation_time,
            message_index_watermark: self.message_index_watermark(),
        }
    }

    /// Restore a Session from a previously pickled string.
    pub fn from_pickle(pickle: PickledInboundGroupSession) -> Self {
        let session = InnerSession::from_pickle(pickle.pickle);
        let mut restored = Self::from_parts(
            session,
            pickle.sender_key,
            pickle.signing_key,
            pickle.room_id,
            pickle.forwarding_chains,
            pickle.imported,
        );

        restored.backed_up = Arc::new(AtomicBool::new(pickle.backed_up));
        restored.creation_time = pickle.creation_time;
        restored.message_index_watermark =
            Arc::new(StdMutex::new(pickle.message_index_watermark));

        restored
    }

    /// Export this session at the first known message index.
    ///
    /// If only a limited part of this session should be exported use
    /// [`InboundGroupSession::export_at_index()`].
    pub async fn export(&self) -> ExportedRoomKey {
        self.export_at_index(self.first_known_index()).await
    }

    /// Export this session at the given message index.
    pub async fn export_at_index(&self, message_index: u32) -> ExportedRoomKey {
        let message_index = max(self.first_known_index(), message_index);

        let session_key = self
            .inner
            .lock()
            .await
            .export_at(message_index)
            .expect("Can't export session at a message index lower than the first known index");

        let sender_claimed_keys = self
            .signing_key
            .map(|k| BTreeMap::from([(ED25519.to_owned(), k.to_base64())]))
            .unwrap_or_default();

        ExportedRoomKey {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id: self.room_id.clone(),
            sender_key: self.sender_key,
            session_id: self.session_id().to_owned(),
            session_key,
            sender_claimed_keys,
            forwarding_curve25519_key_chain: self.forwarding_key_chain.to_vec(),
        }
    }

    /// Convert the group session into a room key that can be uploaded to a
    /// server-side backup.
    pub async fn to_backup(&self) -> BackedUpRoomKey {
        self.export().await.into()
    }

    /// Get the room id of the room this session belongs to.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The Curve25519 key of the device that created the session.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    /// The Ed25519 key the creator of the session claimed to own.
    pub fn signing_key(&self) -> Option<Ed25519PublicKey> {
        self.signing_key
    }

    /// The chain of Curve25519 keys through which this session was forwarded.
    pub fn forwarding_key_chain(&self) -> &[String] {
        &self.forwarding_key_chain
    }

    /// Get the first message index we know how to decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.first_known_index
    }

    /// The highest message index this session decrypted so far.
    pub fn message_index_watermark(&self) -> Option<u32> {
        *self.message_index_watermark.lock()
    }

    /// When the session was created or received.
    pub fn creation_time(&self) -> SecondsSinceUnixEpoch {
        self.creation_time
    }

    /// Has the session been imported from a file, a backup or a forwarded
    /// room key.
    pub fn has_been_imported(&self) -> bool {
        self.imported
    }

    /// Has the session been backed up to the server.
    pub fn backed_up(&self) -> bool {
        self.backed_up.load(Ordering::SeqCst)
    }

    /// Reset the backup state of the inbound group session.
    pub fn reset_backup_state(&self) {
        self.backed_up.store(false, Ordering::SeqCst)
    }

    /// Mark the session as backed up.
    pub fn mark_as_backed_up(&self) {
        self.backed_up.store(true, Ordering::SeqCst)
    }

    /// Check if the `InboundGroupSession` is better than the given other
    /// `InboundGroupSession`.
    ///
    /// Sessions that don't belong to the same sender or room, or whose
    /// ratchets don't match, are [`SessionOrdering::Unconnected`].
    pub async fn compare(&self, other: &InboundGroupSession) -> SessionOrdering {
        // Comparing a session with itself would deadlock on the inner lock.
        if Arc::ptr_eq(&self.inner, &other.inner) {
            SessionOrdering::Equal
        } else if self.sender_key() != other.sender_key()
            || self.signing_key() != other.signing_key()
            || self.room_id() != other.room_id()
        {
            SessionOrdering::Unconnected
        } else {
            let mut other_inner = other.inner.lock().await;
            self.inner.lock().await.compare(&mut other_inner)
        }
    }

    async fn decrypt_helper(
        &self,
        message: &MegolmMessage,
    ) -> Result<DecryptedMessage, vodozemac::megolm::DecryptionError> {
        self.inner.lock().await.decrypt(message)
    }

    /// Decrypt an event from a room timeline.
    ///
    /// Returns the decrypted event with the `sender`, `event_id` and
    /// `origin_server_ts` of the encrypted event copied over, and the message
    /// index of the ciphertext.
    pub async fn decrypt(&self, event: &EncryptedEvent) -> MegolmResult<(JsonObject, u32)> {
        let content = event.megolm_content().ok_or(EventError::UnsupportedAlgorithm)?;
        let decrypted = self.decrypt_helper(&content.ciphertext).await?;

        trace!(
            session_id = self.session_id(),
            message_index = decrypted.message_index,
            "Decrypted a Megolm message"
        );

        let plaintext = String::from_utf8_lossy(&decrypted.plaintext);

        let Value::Object(mut decrypted_object) = serde_json::from_str::<Value>(&plaintext)?
        else {
            return Err(EventError::NotAnObject.into());
        };

        let room_id = decrypted_object
            .get("room_id")
            .and_then(|r| r.as_str().and_then(|r| RoomId::parse(r).ok()));

        // The plaintext has to claim the room of the session, otherwise the
        // event was taken from another room.
        if room_id.as_deref() != Some(self.room_id()) {
            return Err(EventError::MismatchedRoom(self.room_id().to_owned(), room_id).into());
        }

        let server_ts: u64 = event.origin_server_ts.0.into();

        decrypted_object.insert("sender".to_owned(), event.sender.as_str().into());
        decrypted_object.insert("event_id".to_owned(), event.event_id.as_str().into());
        decrypted_object.insert("origin_server_ts".to_owned(), server_ts.into());

        {
            let mut watermark = self.message_index_watermark.lock();
            *watermark = Some(watermark.map_or(decrypted.message_index, |w| {
                max(w, decrypted.message_index)
            }));
        }

        Ok((decrypted_object, decrypted.message_index))
    }
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundGroupSession")
            .field("session_id", &self.session_id())
            .field("room_id", &self.room_id)
            .field("sender_key", &self.sender_key)
            .field("first_known_index", &self.first_known_index)
            .finish_non_exhaustive()
    }
}

impl PartialEq for InboundGroupSession {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

/// A pickled version of an `InboundGroupSession`.
///
/// Holds all the information that needs to be stored in a database to restore
/// an InboundGroupSession.
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledInboundGroupSession {
    /// The pickle string holding the InboundGroupSession.
    pub pickle: InboundGroupSessionPickle,
    /// The public Curve25519 key of the account that sent us the session.
    pub sender_key: Curve25519PublicKey,
    /// The public Ed25519 key of the account that sent us the session.
    pub signing_key: Option<Ed25519PublicKey>,
    /// The id of the room that the session is used in.
    pub room_id: OwnedRoomId,
    /// The list of claimed ed25519 that forwarded us this key. Will be empty if
    /// we directly received this session.
    #[serde(default)]
    pub forwarding_chains: Vec<String>,
    /// Flag remembering if the session was directly sent to us by the sender
    /// or if it was imported.
    pub imported: bool,
    /// Flag remembering if the session has been backed up.
    #[serde(default)]
    pub backed_up: bool,
    /// When the session was created or received.
    pub creation_time: SecondsSinceUnixEpoch,
    /// The highest message index the session decrypted so far.
    #[serde(default)]
    pub message_index_watermark: Option<u32>,
}
