// Copyright 2021, 2022 The Matrix.org Foundation C.I.C.
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

//! Server-side backup support for room keys
//!
//! This module implements support for server-side backups using the
//! `m.megolm_backup.v1.curve25519-aes-sha2` backup algorithm.
//!
//! The private half of a backup key is the [`RecoveryKey`], its public half
//! the [`MegolmV1BackupKey`]. Room keys are encrypted with the public half, so
//! a client can keep uploading them without holding the recovery key.
//!
//! [spec]: https://spec.matrix.org/unstable/client-server-api/#server-side-key-backups

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use ruma::{OwnedRoomId, OwnedTransactionId, TransactionId};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, trace, warn};
use vodozemac::Ed25519Signature;

use crate::{
    olm::{Account, InboundGroupSession},
    store::{BackupKeys, Changes, CryptoStoreError, DynCryptoStore, RoomKeyCounts},
    types::{KeyBackupData, MegolmV1AuthData, RoomKeyBackupInfo},
};

mod keys;

pub use keys::{
    base58_decode, base58_encode, DecodeError, DecryptionError, MegolmV1BackupKey, RecoveryKey,
};

/// The room keys of a single room, as they are uploaded to the backup.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RoomKeyBackup {
    /// The encrypted room keys, keyed by their session id.
    pub sessions: BTreeMap<String, KeyBackupData>,
}

/// A request that uploads a batch of encrypted room keys to the backup.
#[derive(Clone, Debug)]
pub struct KeysBackupRequest {
    /// The unique id of the request, used to mark the request as sent.
    pub request_id: OwnedTransactionId,
    /// The backup version the room keys are uploaded to.
    pub version: String,
    /// The encrypted room keys, keyed by room.
    pub rooms: BTreeMap<OwnedRoomId, RoomKeyBackup>,
}

/// A state machine that handles backing up room keys.
///
/// The state machine can be activated using the
/// [`BackupMachine::enable_backup_v1`] method. After the state machine has been
/// enabled a request that will upload encrypted room keys can be generated
/// using the [`BackupMachine::backup`] method.
#[derive(Debug, Clone)]
pub struct BackupMachine {
    account: Account,
    store: Arc<DynCryptoStore>,
    backup_key: Arc<RwLock<Option<MegolmV1BackupKey>>>,
    pending_backup: Arc<RwLock<Option<PendingBackup>>>,
}

#[derive(Debug, Clone)]
struct PendingBackup {
    request: KeysBackupRequest,
    sessions: BTreeMap<OwnedRoomId, BTreeMap<String, BTreeSet<String>>>,
}

impl PendingBackup {
    fn session_was_part_of_the_backup(&self, session: &InboundGroupSession) -> bool {
        self.sessions
            .get(session.room_id())
            .and_then(|r| {
                r.get(&session.sender_key().to_base64()).map(|s| s.contains(session.session_id()))
            })
            .unwrap_or(false)
    }
}

impl BackupMachine {
    const BACKUP_BATCH_SIZE: usize = 100;

    pub(crate) fn new(
        account: Account,
        store: Arc<DynCryptoStore>,
        backup_key: Option<MegolmV1BackupKey>,
    ) -> Self {
        Self {
            account,
            store,
            backup_key: RwLock::new(backup_key).into(),
            pending_backup: RwLock::new(None).into(),
        }
    }

    /// Are we able to back up room keys to the server?
    pub async fn enabled(&self) -> bool {
        self.backup_key.read().await.as_ref().is_some_and(|b| b.backup_version().is_some())
    }

    fn canonical_auth_data(auth_data: &MegolmV1AuthData) -> Result<String, serde_json::Error> {
        let mut auth_data = auth_data.clone();
        auth_data.signatures.clear();

        let value = serde_json::to_value(auth_data)?;
        let canonical: ruma::CanonicalJsonValue =
            value.try_into().map_err(serde::ser::Error::custom)?;

        Ok(canonical.to_string())
    }

    /// Get the backup info for the given key, signed by our own device.
    ///
    /// This is what gets uploaded when a new backup version is created.
    pub async fn sign_backup_info(
        &self,
        backup_key: &MegolmV1BackupKey,
    ) -> Result<RoomKeyBackupInfo, CryptoStoreError> {
        let mut auth_data = MegolmV1AuthData::new(backup_key.public_key());

        let signature = self.account.sign(&Self::canonical_auth_data(&auth_data)?).await;

        auth_data.signatures.entry(self.account.user_id().to_owned()).or_default().insert(
            format!("ed25519:{}", self.account.device_id()),
            signature.to_base64(),
        );

        Ok(RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(auth_data))
    }

    /// Check if the given backup info was signed by our own device.
    ///
    /// Backups that aren't signed by us might have been created by someone
    /// that took over the homeserver, room keys shouldn't be uploaded to them.
    #[instrument(skip_all)]
    pub fn verify_backup(&self, backup_info: &RoomKeyBackupInfo) -> bool {
        let RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(auth_data) = backup_info else {
            debug!(?backup_info, "Can't verify a backup with an unsupported algorithm");
            return false;
        };

        let key_id = format!("ed25519:{}", self.account.device_id());

        let Some(signature) =
            auth_data.signatures.get(self.account.user_id()).and_then(|s| s.get(&key_id))
        else {
            debug!("The backup isn't signed by our own device");
            return false;
        };

        let Ok(signature) = Ed25519Signature::from_base64(signature) else {
            warn!("The backup contains a malformed signature of our own device");
            return false;
        };

        let serialized = match Self::canonical_auth_data(auth_data) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = ?e, "Error while verifying backup, can't canonicalize auth data");
                return false;
            }
        };

        self.account.identity_keys().ed25519.verify(serialized.as_bytes(), &signature).is_ok()
    }

    /// Activate the given backup key to be used to encrypt and backup room
    /// keys.
    ///
    /// This will use the [`m.megolm_backup.v1.curve25519-aes-sha2`] algorithm
    /// to encrypt the room keys.
    ///
    /// [`m.megolm_backup.v1.curve25519-aes-sha2`]:
    /// https://spec.matrix.org/unstable/client-server-api/#backup-algorithm-mmegolm_backupv1curve25519-aes-sha2
    pub async fn enable_backup_v1(&self, key: MegolmV1BackupKey) -> Result<(), CryptoStoreError> {
        if key.backup_version().is_some() {
            *self.backup_key.write().await = Some(key.clone());
            info!(backup_key = ?key, "Activated a backup");
        } else {
            warn!(
                backup_key = ?key,
                "Tried to activate a backup without having the backup key uploaded"
            );
        }

        Ok(())
    }

    /// Get the number of backed up room keys and the total number of room keys.
    pub async fn room_key_counts(&self) -> Result<RoomKeyCounts, CryptoStoreError> {
        self.store.inbound_group_session_counts().await
    }

    /// Disable and reset our backup state.
    ///
    /// This will remove any pending backup request, remove the backup key and
    /// reset the backup state of each room key we have.
    #[instrument(skip(self))]
    pub async fn disable_backup(&self) -> Result<(), CryptoStoreError> {
        debug!("Disabling key backup and resetting backup state for room keys");

        self.backup_key.write().await.take();
        self.pending_backup.write().await.take();

        self.store.reset_backup_state().await?;

        debug!("Done disabling backup");

        Ok(())
    }

    /// Store the recovery key in the crypto store.
    pub async fn save_recovery_key(
        &self,
        recovery_key: Option<RecoveryKey>,
        version: Option<String>,
    ) -> Result<(), CryptoStoreError> {
        let changes = Changes { recovery_key, backup_version: version, ..Default::default() };
        self.store.save_changes(changes).await
    }

    /// Get the backup keys we have saved in our crypto store.
    pub async fn get_backup_keys(&self) -> Result<BackupKeys, CryptoStoreError> {
        self.store.load_backup_keys().await
    }

    /// Encrypt a batch of room keys and return a request that needs to be sent
    /// out to backup the room keys.
    ///
    /// The same request is returned until it's marked as sent.
    pub async fn backup(&self) -> Result<Option<KeysBackupRequest>, CryptoStoreError> {
        let mut request = self.pending_backup.write().await;

        if let Some(request) = &*request {
            trace!("Backing up, returning an existing request");

            Ok(Some(request.request.clone()))
        } else {
            trace!("Backing up, creating a new request");

            let new_request = self.backup_helper().await?;
            *request = new_request.clone();

            Ok(new_request.map(|r| r.request))
        }
    }

    /// Mark the backup request with the given id as sent, the room keys it
    /// contained won't be backed up again.
    pub async fn mark_request_as_sent(
        &self,
        request_id: &TransactionId,
    ) -> Result<(), CryptoStoreError> {
        let mut request = self.pending_backup.write().await;

        if let Some(r) = &*request {
            if r.request.request_id == request_id {
                let sessions: Vec<_> = self
                    .store
                    .get_inbound_group_sessions()
                    .await?
                    .into_iter()
                    .filter(|s| r.session_was_part_of_the_backup(s))
                    .collect();

                for session in &sessions {
                    session.mark_as_backed_up();
                }

                trace!(%request_id, keys = ?r.sessions, "Marking room keys as backed up");

                let changes = Changes { inbound_group_sessions: sessions, ..Default::default() };
                self.store.save_changes(changes).await?;

                let counts = self.store.inbound_group_session_counts().await?;

                trace!(room_key_counts = ?counts, %request_id, "Marked room keys as backed up");

                *request = None;
            } else {
                warn!(
                    expected = %r.request.request_id,
                    got = %request_id,
                    "Tried to mark a pending backup as sent but the request id didn't match"
                );
            }
        } else {
            warn!(
                %request_id,
                "Tried to mark a pending backup as sent but there isn't a backup pending"
            );
        };

        Ok(())
    }

    async fn backup_helper(&self) -> Result<Option<PendingBackup>, CryptoStoreError> {
        let Some(backup_key) = &*self.backup_key.read().await else {
            warn!("Trying to backup room keys but no backup key was found");
            return Ok(None);
        };

        let Some(version) = backup_key.backup_version() else {
            warn!("Trying to backup room keys but the backup key wasn't uploaded");
            return Ok(None);
        };

        let sessions =
            self.store.inbound_group_sessions_for_backup(Self::BACKUP_BATCH_SIZE).await?;

        if sessions.is_empty() {
            trace!(?backup_key, "No room keys need to be backed up");
            return Ok(None);
        }

        let key_count = sessions.len();
        let (rooms, sessions) = Self::backup_keys(sessions, backup_key).await?;

        info!(key_count, keys = ?sessions, ?backup_key, "Created a room keys backup request");

        let request = KeysBackupRequest { request_id: TransactionId::new(), version, rooms };

        Ok(Some(PendingBackup { request, sessions }))
    }

    /// Encrypt the given room keys for the backup.
    async fn backup_keys(
        sessions: Vec<InboundGroupSession>,
        backup_key: &MegolmV1BackupKey,
    ) -> Result<
        (
            BTreeMap<OwnedRoomId, RoomKeyBackup>,
            BTreeMap<OwnedRoomId, BTreeMap<String, BTreeSet<String>>>,
        ),
        CryptoStoreError,
    > {
        let mut backup: BTreeMap<OwnedRoomId, RoomKeyBackup> = BTreeMap::new();
        let mut session_record: BTreeMap<OwnedRoomId, BTreeMap<String, BTreeSet<String>>> =
            BTreeMap::new();

        for session in sessions {
            let room_id = session.room_id().to_owned();
            let session_id = session.session_id().to_owned();
            let key_backup_data = backup_key.encrypt(&session).await?;

            session_record
                .entry(room_id.clone())
                .or_default()
                .entry(session.sender_key().to_base64())
                .or_default()
                .insert(session_id.clone());

            backup.entry(room_id).or_default().sessions.insert(session_id, key_backup_data);
        }

        Ok((backup, session_record))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use matrix_e2ee_test::{alice_device_id, async_test, ALICE, DEFAULT_TEST_ROOM_ID};
    use ruma::room_id;
    use serde_json::json;

    use super::RecoveryKey;
    use crate::{
        encryption::RoomMember,
        machine::test_helpers::{get_machine, get_machine_pair},
        types::RoomKeyBackupInfo,
    };

    #[async_test]
    async fn test_backup_flow() {
        let machine = get_machine(&ALICE, alice_device_id()).await;
        let backup_machine = machine.backup_machine();

        let counts = backup_machine.room_key_counts().await.unwrap();
        assert_eq!(counts.total, 0, "Initially no keys exist");
        assert_eq!(counts.backed_up, 0, "Initially no backed up keys exist");

        for room_id in [*DEFAULT_TEST_ROOM_ID, room_id!("!test2:localhost")] {
            machine
                .encrypt_room_event(
                    room_id,
                    "m.room.message",
                    &json!({ "body": "Hello" }),
                    &[RoomMember::joined(&ALICE)],
                )
                .await
                .unwrap();
        }

        let counts = backup_machine.room_key_counts().await.unwrap();
        assert_eq!(counts.total, 2, "Two room keys need to exist in the store");
        assert_eq!(counts.backed_up, 0, "No room keys have been backed up yet");

        // Without a backup key nothing gets backed up.
        assert!(!backup_machine.enabled().await);
        assert!(backup_machine.backup().await.unwrap().is_none());

        let recovery_key = RecoveryKey::new();
        let backup_key = recovery_key.megolm_v1_public_key();
        backup_key.set_version("1".to_owned());

        backup_machine.enable_backup_v1(backup_key).await.unwrap();
        assert!(backup_machine.enabled().await);

        let request = backup_machine.backup().await.unwrap().expect("A backup request is created");
        assert_eq!(request.version, "1");
        assert_eq!(request.rooms.len(), 2);
        assert_eq!(
            Some(&request.request_id),
            backup_machine.backup().await.unwrap().as_ref().map(|r| &r.request_id),
            "Calling backup again without uploading creates the same backup request"
        );

        let room = &request.rooms[*DEFAULT_TEST_ROOM_ID];
        let (session_id, key_backup_data) = room.sessions.iter().next().unwrap();
        let room_key = recovery_key
            .decrypt_room_key(*DEFAULT_TEST_ROOM_ID, session_id, &key_backup_data.session_data)
            .unwrap();
        assert_eq!(&room_key.session_id, session_id);
        assert_eq!(room_key.sender_key, machine.identity_keys().curve25519);

        backup_machine.mark_request_as_sent(&request.request_id).await.unwrap();

        let counts = backup_machine.room_key_counts().await.unwrap();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.backed_up, 2, "All room keys have been backed up");

        assert!(
            backup_machine.backup().await.unwrap().is_none(),
            "No room keys need to be backed up, no request needs to be created"
        );

        backup_machine.disable_backup().await.unwrap();

        let counts = backup_machine.room_key_counts().await.unwrap();
        assert_eq!(counts.total, 2);
        assert_eq!(
            counts.backed_up, 0,
            "Disabling the backup resets the backup flag on the room keys"
        );
        assert!(!backup_machine.enabled().await);
    }

    #[async_test]
    async fn test_backup_key_without_a_version_is_not_enabled() {
        let machine = get_machine(&ALICE, alice_device_id()).await;
        let backup_machine = machine.backup_machine();

        let backup_key = RecoveryKey::new().megolm_v1_public_key();
        backup_machine.enable_backup_v1(backup_key).await.unwrap();

        assert!(!backup_machine.enabled().await);
    }

    #[async_test]
    async fn test_mismatched_request_id_is_ignored() {
        let machine = get_machine(&ALICE, alice_device_id()).await;
        let backup_machine = machine.backup_machine();

        machine
            .encrypt_room_event(
                *DEFAULT_TEST_ROOM_ID,
                "m.room.message",
                &json!({ "body": "Hello" }),
                &[RoomMember::joined(&ALICE)],
            )
            .await
            .unwrap();

        let backup_key = RecoveryKey::new().megolm_v1_public_key();
        backup_key.set_version("1".to_owned());
        backup_machine.enable_backup_v1(backup_key).await.unwrap();

        let request = backup_machine.backup().await.unwrap().unwrap();
        backup_machine.mark_request_as_sent(&ruma::TransactionId::new()).await.unwrap();

        assert_eq!(backup_machine.room_key_counts().await.unwrap().backed_up, 0);
        let same = backup_machine.backup().await.unwrap().unwrap();
        assert_eq!(same.request_id, request.request_id);
    }

    #[async_test]
    async fn test_recovery_key_is_restored_from_the_store() {
        let machine = get_machine(&ALICE, alice_device_id()).await;
        let backup_machine = machine.backup_machine();

        let recovery_key = RecoveryKey::new();
        backup_machine
            .save_recovery_key(Some(recovery_key.clone()), Some("2".to_owned()))
            .await
            .unwrap();

        let backup_keys = backup_machine.get_backup_keys().await.unwrap();
        assert_eq!(backup_keys.backup_version.as_deref(), Some("2"));
        assert_eq!(
            backup_keys.recovery_key.unwrap().as_bytes(),
            recovery_key.as_bytes(),
            "The stored recovery key is the one we saved"
        );
    }

    #[async_test]
    async fn test_backup_info_signatures() {
        let (alice, bob) = get_machine_pair().await;
        let backup_key = RecoveryKey::new().megolm_v1_public_key();

        let unsigned = backup_key.backup_info();
        assert!(!alice.backup_machine().verify_backup(&unsigned));

        let signed = alice.backup_machine().sign_backup_info(&backup_key).await.unwrap();
        assert!(alice.backup_machine().verify_backup(&signed));
        assert!(!bob.backup_machine().verify_backup(&signed), "Only our own signature counts");

        assert_matches!(
            RecoveryKey::new().megolm_v1_public_key().backup_info(),
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(other_auth_data)
        );
        let mut tampered = signed.clone();
        if let RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(auth_data) = &mut tampered {
            auth_data.public_key = other_auth_data.public_key;
        }
        assert!(!alice.backup_machine().verify_backup(&tampered));

        let other = RoomKeyBackupInfo::Other {
            algorithm: "m.megolm_backup.v2".to_owned(),
            auth_data: Default::default(),
        };
        assert!(!alice.backup_machine().verify_backup(&other));
    }
}
