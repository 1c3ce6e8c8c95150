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

use std::{collections::HashMap, fmt, sync::Arc};

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, SecondsSinceUnixEpoch, UserId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, field::debug, instrument, trace, Span};
use vodozemac::{
    olm::{
        Account as InnerAccount, AccountPickle, IdentityKeys, OlmMessage, PreKeyMessage,
        SessionConfig,
    },
    Curve25519PublicKey, Ed25519Signature, KeyId,
};

use super::Session;
use crate::{error::SessionCreationError, identities::ReadOnlyDevice, utilities::encode};

/// The result of an inbound Olm session creation.
#[derive(Debug)]
pub struct InboundCreationResult {
    /// The newly created session.
    pub session: Session,
    /// The plaintext of the pre-key message that created the session.
    pub plaintext: String,
}

/// A hash of a successfully decrypted Olm message.
///
/// Olm ratchets can't decrypt a message twice, remembering the hashes lets us
/// tell a replayed message apart from a wedged session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OlmMessageHash {
    /// The curve25519 key of the sender that sent us the Olm message.
    pub sender_key: String,
    /// The hash of the message.
    pub hash: String,
}

impl OlmMessageHash {
    pub(crate) fn new(sender_key: Curve25519PublicKey, ciphertext: &OlmMessage) -> Self {
        let (message_type, ciphertext) = ciphertext.clone().to_parts();
        let sender_key = sender_key.to_base64();

        let sha = Sha256::new()
            .chain_update(sender_key.as_bytes())
            .chain_update([message_type as u8])
            .chain_update(ciphertext)
            .finalize();

        Self { sender_key, hash: encode(sha.as_slice()) }
    }
}

/// Our own Olm account, holding the long-term identity keys of this device.
///
/// Cloning the account yields a handle to the same underlying account.
#[derive(Clone)]
pub struct Account {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    identity_keys: Arc<IdentityKeys>,
    inner: Arc<Mutex<InnerAccount>>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("identity_keys", &self.identity_keys)
            .finish()
    }
}

/// A typed representation of a base64 encoded string containing the account
/// pickle.
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledAccount {
    /// The user id of the account owner.
    pub user_id: OwnedUserId,
    /// The device ID of the account owner.
    pub device_id: OwnedDeviceId,
    /// The pickled version of the Olm account.
    pub pickle: AccountPickle,
}

impl Account {
    /// Create a fresh new account, this will generate the identity key-pair.
    pub fn with_device_id(user_id: &UserId, device_id: &DeviceId) -> Self {
        let account = InnerAccount::new();
        let identity_keys = account.identity_keys();

        debug!(%user_id, %device_id, "Created a new Olm account");

        Self {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            identity_keys: Arc::new(identity_keys),
            inner: Arc::new(Mutex::new(account)),
        }
    }

    /// The user id of the account owner.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The device ID of the account owner.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Get the public identity keys of the account.
    pub fn identity_keys(&self) -> &IdentityKeys {
        &self.identity_keys
    }

    pub(crate) fn identity_keys_arc(&self) -> Arc<IdentityKeys> {
        self.identity_keys.clone()
    }

    /// Generate `count` new one-time keys.
    pub async fn generate_one_time_keys(&self, count: usize) {
        let result = self.inner.lock().await.generate_one_time_keys(count);

        debug!(
            count,
            discarded_keys = ?result.removed,
            created_keys = ?result.created,
            "Generated new one-time keys"
        );
    }

    /// Get the unpublished one-time keys of the account.
    pub async fn one_time_keys(&self) -> HashMap<KeyId, Curve25519PublicKey> {
        self.inner.lock().await.one_time_keys()
    }

    /// Mark the current set of one-time keys as being published.
    pub async fn mark_keys_as_published(&self) {
        self.inner.lock().await.mark_keys_as_published();
    }

    /// Sign the given string using the accounts signing key.
    pub async fn sign(&self, string: &str) -> Ed25519Signature {
        self.inner.lock().await.sign(string)
    }

    /// Create a new session with another account given a one-time key the
    /// other account published.
    pub async fn create_outbound_session(
        &self,
        device: &ReadOnlyDevice,
        one_time_key: Curve25519PublicKey,
    ) -> Session {
        let session = self.inner.lock().await.create_outbound_session(
            SessionConfig::version_1(),
            device.curve25519_key(),
            one_time_key,
        );

        let now = SecondsSinceUnixEpoch::now();
        let session_id = session.session_id();

        debug!(
            user_id = %device.user_id(),
            device_id = %device.device_id(),
            session_id,
            "Created a new outbound Olm session"
        );

        Session {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            our_identity_keys: self.identity_keys.clone(),
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            sender_key: device.curve25519_key(),
            creation_time: now,
            last_use_time: now,
        }
    }

    /// Create a new session with another account given a pre-key Olm message.
    ///
    /// Returns the newly created session or a `SessionCreationError` if
    /// creating a session failed.
    ///
    /// # Arguments
    ///
    /// * `their_identity_key` - The other account's identity/curve25519 key.
    ///
    /// * `message` - A pre-key Olm message that was sent to us by the other
    ///   account.
    #[instrument(skip_all, fields(session_id))]
    pub async fn create_inbound_session(
        &self,
        their_identity_key: Curve25519PublicKey,
        message: &PreKeyMessage,
    ) -> Result<InboundCreationResult, SessionCreationError> {
        Span::current().record("session_id", debug(message.session_id()));
        trace!("Creating a new Olm session from a pre-key message");

        let result = self.inner.lock().await.create_inbound_session(their_identity_key, message)?;
        let now = SecondsSinceUnixEpoch::now();
        let session_id = result.session.session_id();

        debug!(session = ?result.session, "Decrypted an Olm message from a new Olm session");

        let session = Session {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            our_identity_keys: self.identity_keys.clone(),
            inner: Arc::new(Mutex::new(result.session)),
            session_id: session_id.into(),
            sender_key: their_identity_key,
            creation_time: now,
            last_use_time: now,
        };

        let plaintext = String::from_utf8_lossy(&result.plaintext).into_owned();

        Ok(InboundCreationResult { session, plaintext })
    }

    /// Get a serializable version of the `Account` so it can be persisted.
    pub async fn pickle(&self) -> PickledAccount {
        PickledAccount {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            pickle: self.inner.lock().await.pickle(),
        }
    }

    /// Restore an account from a previously pickled one.
    pub fn from_pickle(pickle: PickledAccount) -> Self {
        let account = InnerAccount::from_pickle(pickle.pickle);
        let identity_keys = account.identity_keys();

        Self {
            user_id: pickle.user_id,
            device_id: pickle.device_id,
            identity_keys: Arc::new(identity_keys),
            inner: Arc::new(Mutex::new(account)),
        }
    }
}

impl PartialEq for Account {
    fn eq(&self, other: &Self) -> bool {
        self.identity_keys == other.identity_keys && self.device_id == other.device_id
    }
}

#[cfg(test)]
mod tests {
    use matrix_e2ee_test::{alice_device_id, async_test, ALICE};

    use super::Account;

    #[async_test]
    async fn test_one_time_key_publishing() {
        let account = Account::with_device_id(&ALICE, alice_device_id());
        assert!(account.one_time_keys().await.is_empty());

        account.generate_one_time_keys(10).await;
        assert_eq!(account.one_time_keys().await.len(), 10);

        account.mark_keys_as_published().await;
        assert!(account.one_time_keys().await.is_empty());
    }

    #[async_test]
    async fn test_account_pickle_roundtrip() {
        let account = Account::with_device_id(&ALICE, alice_device_id());
        let pickle = account.pickle().await;

        let json = serde_json::to_string(&pickle).unwrap();
        let restored = Account::from_pickle(serde_json::from_str(&json).unwrap());

        assert_eq!(account, restored);
        assert_eq!(restored.user_id(), *ALICE);
    }

    #[async_test]
    async fn test_signatures_verify_with_the_identity_key() {
        let account = Account::with_device_id(&ALICE, alice_device_id());
        let signature = account.sign("It's a secret to everybody").await;

        account
            .identity_keys()
            .ed25519
            .verify(b"It's a secret to everybody", &signature)
            .expect("The signature should verify with our own signing key");
    }
}
