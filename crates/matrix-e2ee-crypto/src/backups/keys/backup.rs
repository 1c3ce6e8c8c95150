// Copyright 2021 The Matrix.org Foundation C.I.C.
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

use std::sync::Arc;

use matrix_e2ee_common::locks::Mutex;
use vodozemac::{pk_encryption::PkEncryption, Curve25519PublicKey, KeyError};
use zeroize::Zeroizing;

use crate::{
    olm::InboundGroupSession,
    types::{EncryptedSessionData, KeyBackupData, MegolmV1AuthData, RoomKeyBackupInfo},
};

#[derive(Debug)]
struct InnerBackupKey {
    key: Curve25519PublicKey,
    version: Mutex<Option<String>>,
}

/// The public part of a backup key.
#[derive(Clone)]
pub struct MegolmV1BackupKey {
    inner: Arc<InnerBackupKey>,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for MegolmV1BackupKey {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("MegolmV1BackupKey")
            .field("key", &self.to_base64())
            .field("version", &self.backup_version())
            .finish()
    }
}

impl MegolmV1BackupKey {
    pub(crate) fn new(key: Curve25519PublicKey, version: Option<String>) -> Self {
        Self { inner: InnerBackupKey { key, version: Mutex::new(version) }.into() }
    }

    /// Get the full name of the backup algorithm this backup key supports.
    pub fn backup_algorithm(&self) -> &str {
        "m.megolm_backup.v1.curve25519-aes-sha2"
    }

    /// Get the auth data that needs to be uploaded when a new backup version
    /// is created with this key.
    pub fn backup_info(&self) -> RoomKeyBackupInfo {
        RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(MegolmV1AuthData::new(self.inner.key))
    }

    pub(crate) fn public_key(&self) -> Curve25519PublicKey {
        self.inner.key
    }

    /// Try to create a new `MegolmV1BackupKey` from a base 64 encoded string.
    pub fn from_base64(public_key: &str) -> Result<Self, KeyError> {
        let key = Curve25519PublicKey::from_base64(public_key)?;

        Ok(Self::new(key, None))
    }

    /// Convert the [`MegolmV1BackupKey`] to a base 64 encoded string.
    pub fn to_base64(&self) -> String {
        self.inner.key.to_base64()
    }

    /// Get the backup version that this key is used with, if any.
    pub fn backup_version(&self) -> Option<String> {
        self.inner.version.lock().clone()
    }

    /// Set the backup version that this `MegolmV1BackupKey` will be used with.
    ///
    /// The key won't be able to encrypt room keys unless a version has been
    /// set.
    pub fn set_version(&self, version: String) {
        *self.inner.version.lock() = Some(version);
    }

    pub(crate) async fn encrypt(
        &self,
        session: &InboundGroupSession,
    ) -> Result<KeyBackupData, serde_json::Error> {
        let pk = PkEncryption::from_key(self.inner.key);

        // We only care whether we received the session directly from its
        // creator or not.
        let forwarded_count = session.has_been_imported().into();
        let first_message_index = session.first_known_index();

        let key = session.to_backup().await;
        let key = Zeroizing::new(serde_json::to_vec(&key)?);

        let message = pk.encrypt(&key);

        Ok(KeyBackupData {
            first_message_index,
            forwarded_count,
            is_verified: false,
            session_data: EncryptedSessionData {
                ephemeral: message.ephemeral_key.to_base64(),
                ciphertext: vodozemac::base64_encode(message.ciphertext),
                mac: vodozemac::base64_encode(message.mac),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use matrix_e2ee_test::{async_test, DEFAULT_TEST_ROOM_ID};
    use vodozemac::megolm::{GroupSession, SessionConfig};

    use crate::{
        backups::RecoveryKey,
        olm::InboundGroupSession,
        types::{EventEncryptionAlgorithm, RoomKeyBackupInfo},
    };

    #[async_test]
    async fn test_backed_up_room_key_can_be_decrypted() {
        let recovery_key = RecoveryKey::new();
        let backup_key = recovery_key.megolm_v1_public_key();
        assert!(backup_key.backup_version().is_none());

        backup_key.set_version("1".to_owned());
        assert_eq!(backup_key.backup_version().as_deref(), Some("1"));

        let identity = vodozemac::olm::Account::new();
        let outbound = GroupSession::new(SessionConfig::version_1());
        let session = InboundGroupSession::new(
            identity.curve25519_key(),
            identity.ed25519_key(),
            *DEFAULT_TEST_ROOM_ID,
            &outbound.session_key(),
        );

        let backed_up = backup_key.encrypt(&session).await.unwrap();
        assert_eq!(backed_up.first_message_index, 0);
        assert_eq!(backed_up.forwarded_count, 0);

        let decrypted = recovery_key.decrypt_session_data(&backed_up.session_data).unwrap();
        assert_eq!(decrypted.algorithm, EventEncryptionAlgorithm::MegolmV1AesSha2);
        assert_eq!(decrypted.sender_key, identity.curve25519_key());

        let other_key = RecoveryKey::new();
        assert!(other_key.decrypt_session_data(&backed_up.session_data).is_err());
    }

    #[test]
    fn test_backup_info_carries_the_public_key() {
        let backup_key = RecoveryKey::new().megolm_v1_public_key();

        assert_matches!(
            backup_key.backup_info(),
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(auth_data)
        );
        assert_eq!(auth_data.public_key.to_base64(), backup_key.to_base64());
    }
}
