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

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;
use url::Url;
use vodozemac::{Curve25519PublicKey, Curve25519SecretKey};

use super::{RendezvousAlgorithm, RendezvousChannel, RendezvousIntent, HTTP_TRANSPORT_V1};
use crate::{
    ciphers::{AesHmacSha2Key, IV_SIZE, MAC_SIZE},
    utilities::{decode, encode, DecodeError},
};

/// Error type for messages received over an [`EstablishedSecureChannel`].
#[derive(Debug, Error)]
pub enum SecureChannelError {
    /// The other side used a public key that doesn't contribute to the shared
    /// secret.
    #[error("the key agreement produced a non-contributory shared secret")]
    NonContributory,
    /// The message wasn't encrypted by the other side of this channel, or it
    /// was modified on the way.
    #[error("the message failed authentication")]
    InvalidMac,
    /// The initialization vector of the message has the wrong length.
    #[error("the initialization vector has an invalid length: expected {IV_SIZE}, got {0}")]
    InvalidIv(usize),
    /// A field of the message isn't valid base64.
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// A message encrypted for the other side of an [`EstablishedSecureChannel`],
/// all fields are unpadded base64.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureChannelMessage {
    /// The initialization vector of the AES-CTR cipher.
    pub iv: String,
    /// The encrypted message.
    pub ciphertext: String,
    /// The HMAC-SHA-256 of the initialization vector and the ciphertext.
    pub mac: String,
}

/// The side of a rendezvous that shows its code and waits for another device
/// to connect.
pub struct SecureChannel {
    secret_key: Curve25519SecretKey,
    public_key: Curve25519PublicKey,
    algorithm: RendezvousAlgorithm,
    intent: RendezvousIntent,
    transport_uri: Url,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("public_key", &self.public_key)
            .field("algorithm", &self.algorithm)
            .field("intent", &self.intent)
            .field("transport_uri", &self.transport_uri)
            .finish_non_exhaustive()
    }
}

impl SecureChannel {
    /// Create a new secure channel with a fresh ephemeral key.
    pub fn new(intent: RendezvousIntent, transport_uri: Url) -> Self {
        let secret_key = Curve25519SecretKey::new();
        let public_key = Curve25519PublicKey::from(&secret_key);

        Self {
            secret_key,
            public_key,
            algorithm: RendezvousAlgorithm::V2Curve25519AesSha256,
            intent,
            transport_uri,
        }
    }

    /// Our ephemeral public key.
    pub fn public_key(&self) -> Curve25519PublicKey {
        self.public_key
    }

    /// The rendezvous code the other device needs to connect to us, usually
    /// shown as a QR code.
    pub fn code(&self) -> String {
        json!({
            "rendezvous": {
                "algorithm": self.algorithm.as_str(),
                "key": self.public_key.to_base64(),
                "transport": {
                    "type": HTTP_TRANSPORT_V1,
                    "uri": self.transport_uri.as_str(),
                },
            },
            "intent": self.intent.as_str(),
        })
        .to_string()
    }

    /// Establish the channel once the other device told us its public key.
    pub fn establish(
        self,
        their_public_key: Curve25519PublicKey,
    ) -> Result<EstablishedSecureChannel, SecureChannelError> {
        EstablishedSecureChannel::new(
            &self.secret_key,
            self.algorithm,
            Role::CodeOwner,
            self.public_key,
            their_public_key,
        )
    }

    /// Connect to the device that showed us the rendezvous code the channel
    /// was negotiated from.
    ///
    /// Our public key, [`EstablishedSecureChannel::our_public_key`], needs to
    /// be sent to the other device over the transport.
    pub fn connect(
        channel: &RendezvousChannel,
    ) -> Result<EstablishedSecureChannel, SecureChannelError> {
        let secret_key = Curve25519SecretKey::new();
        let public_key = Curve25519PublicKey::from(&secret_key);

        EstablishedSecureChannel::new(
            &secret_key,
            channel.algorithm,
            Role::Scanner,
            public_key,
            channel.their_public_key,
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    CodeOwner,
    Scanner,
}

/// A secure channel both sides agreed on.
///
/// Each direction has its own keys, a message can only be decrypted by the
/// other side.
pub struct EstablishedSecureChannel {
    send_key: AesHmacSha2Key,
    receive_key: AesHmacSha2Key,
    check_code: u8,
    our_public_key: Curve25519PublicKey,
    their_public_key: Curve25519PublicKey,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for EstablishedSecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EstablishedSecureChannel")
            .field("our_public_key", &self.our_public_key)
            .field("their_public_key", &self.their_public_key)
            .finish_non_exhaustive()
    }
}

impl EstablishedSecureChannel {
    fn new(
        secret_key: &Curve25519SecretKey,
        algorithm: RendezvousAlgorithm,
        role: Role,
        our_public_key: Curve25519PublicKey,
        their_public_key: Curve25519PublicKey,
    ) -> Result<Self, SecureChannelError> {
        let shared_secret = secret_key.diffie_hellman(&their_public_key);

        if !shared_secret.was_contributory() {
            return Err(SecureChannelError::NonContributory);
        }

        let (owner_key, scanner_key) = match role {
            Role::CodeOwner => (our_public_key, their_public_key),
            Role::Scanner => (their_public_key, our_public_key),
        };

        let info = format!(
            "{}|{}|{}",
            algorithm.as_str(),
            owner_key.to_base64(),
            scanner_key.to_base64()
        );

        let direction_key = |direction: &str| {
            AesHmacSha2Key::from_shared_secret(
                shared_secret.as_bytes(),
                format!("{info}|{direction}").as_bytes(),
            )
        };

        let owner_to_scanner = direction_key("owner_to_scanner");
        let scanner_to_owner = direction_key("scanner_to_owner");

        let mut check_bytes = [0u8; 2];
        Hkdf::<Sha256>::new(None, shared_secret.as_bytes())
            .expand(format!("{info}|check_code").as_bytes(), &mut check_bytes)
            .expect("We should be able to expand the shared secret into two bytes");
        let check_code = (check_bytes[0] % 10) * 10 + (check_bytes[1] % 10);

        let (send_key, receive_key) = match role {
            Role::CodeOwner => (owner_to_scanner, scanner_to_owner),
            Role::Scanner => (scanner_to_owner, owner_to_scanner),
        };

        debug!(%algorithm, ?role, "Established a secure rendezvous channel");

        Ok(Self { send_key, receive_key, check_code, our_public_key, their_public_key })
    }

    /// The two digit code both sides need to show, the user confirms that they
    /// match.
    pub fn check_code(&self) -> u8 {
        self.check_code
    }

    /// Our ephemeral public key.
    pub fn our_public_key(&self) -> Curve25519PublicKey {
        self.our_public_key
    }

    /// The ephemeral public key of the other side.
    pub fn their_public_key(&self) -> Curve25519PublicKey {
        self.their_public_key
    }

    /// Encrypt a message for the other side of the channel.
    pub fn encrypt(&self, plaintext: &[u8]) -> SecureChannelMessage {
        let (ciphertext, iv) = self.send_key.encrypt(plaintext.to_vec());
        let mac = self.send_key.create_mac_tag(&[iv.as_slice(), &ciphertext].concat());

        SecureChannelMessage {
            iv: encode(iv),
            ciphertext: encode(ciphertext),
            mac: encode(mac.as_bytes()),
        }
    }

    /// Decrypt a message the other side of the channel sent us.
    pub fn decrypt(&self, message: &SecureChannelMessage) -> Result<Vec<u8>, SecureChannelError> {
        let iv = decode(&message.iv)?;
        let iv: [u8; IV_SIZE] =
            iv.as_slice().try_into().map_err(|_| SecureChannelError::InvalidIv(iv.len()))?;

        let ciphertext = decode(&message.ciphertext)?;
        let mac: [u8; MAC_SIZE] = decode(&message.mac)?
            .as_slice()
            .try_into()
            .map_err(|_| SecureChannelError::InvalidMac)?;

        self.receive_key
            .verify_mac(&[iv.as_slice(), &ciphertext].concat(), &mac)
            .map_err(|_| SecureChannelError::InvalidMac)?;

        Ok(self.receive_key.decrypt(ciphertext, &iv))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use url::Url;

    use super::{EstablishedSecureChannel, SecureChannel, SecureChannelError};
    use crate::rendezvous::{build_channel, RendezvousIntent};

    fn channel_pair() -> (EstablishedSecureChannel, EstablishedSecureChannel) {
        let uri = Url::parse("https://rendezvous.example.org/abcdef").unwrap();
        let owner = SecureChannel::new(RendezvousIntent::LoginReciprocate, uri.clone());

        let channel = build_channel(&owner.code()).unwrap();
        assert_eq!(channel.intent, RendezvousIntent::LoginReciprocate);
        assert_eq!(channel.transport_uri, uri);
        assert_eq!(channel.their_public_key, owner.public_key());

        let scanner = SecureChannel::connect(&channel).unwrap();
        let owner = owner.establish(scanner.our_public_key()).unwrap();

        (owner, scanner)
    }

    #[test]
    fn test_both_sides_agree() {
        let (owner, scanner) = channel_pair();

        assert_eq!(owner.check_code(), scanner.check_code());
        assert!(owner.check_code() < 100);
        assert_eq!(owner.our_public_key(), scanner.their_public_key());
        assert_eq!(owner.their_public_key(), scanner.our_public_key());

        let message = scanner.encrypt(b"MATRIX_QR_CODE_LOGIN_INITIATE");
        assert_eq!(owner.decrypt(&message).unwrap(), b"MATRIX_QR_CODE_LOGIN_INITIATE");

        let reply = owner.encrypt(b"MATRIX_QR_CODE_LOGIN_OK");
        assert_eq!(scanner.decrypt(&reply).unwrap(), b"MATRIX_QR_CODE_LOGIN_OK");
    }

    #[test]
    fn test_messages_are_bound_to_a_direction() {
        let (owner, scanner) = channel_pair();

        let message = owner.encrypt(b"hello");
        assert_matches!(owner.decrypt(&message), Err(SecureChannelError::InvalidMac));
        assert_eq!(scanner.decrypt(&message).unwrap(), b"hello");
    }

    #[test]
    fn test_tampered_messages_are_rejected() {
        let (owner, scanner) = channel_pair();

        let mut message = owner.encrypt(b"hello");
        message.ciphertext = crate::utilities::encode(b"hellp");
        assert_matches!(scanner.decrypt(&message), Err(SecureChannelError::InvalidMac));

        let mut message = owner.encrypt(b"hello");
        message.iv = crate::utilities::encode([0u8; 8]);
        assert_matches!(scanner.decrypt(&message), Err(SecureChannelError::InvalidIv(8)));

        let mut message = owner.encrypt(b"hello");
        message.mac = "not base64!".to_owned();
        assert_matches!(scanner.decrypt(&message), Err(SecureChannelError::Decode(_)));
    }

    #[test]
    fn test_other_channels_cant_decrypt() {
        let (owner, _) = channel_pair();
        let (_, other_scanner) = channel_pair();

        let message = owner.encrypt(b"hello");
        assert_matches!(other_scanner.decrypt(&message), Err(SecureChannelError::InvalidMac));
    }

    #[test]
    fn test_message_serialization() {
        let (owner, _) = channel_pair();

        let message = owner.encrypt(b"hello");
        let json = serde_json::to_value(&message).unwrap();

        assert!(json.get("iv").is_some());
        assert!(json.get("ciphertext").is_some());
        assert!(json.get("mac").is_some());
        assert_eq!(serde_json::from_value::<super::SecureChannelMessage>(json).unwrap(), message);
    }
}
