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

use rand::{thread_rng, RngCore};
use ruma::RoomId;
use thiserror::Error;
use vodozemac::{
    pk_encryption::{Message, MessageDecodeError, PkDecryption},
    Curve25519SecretKey,
};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::MegolmV1BackupKey;
use crate::{
    olm::{BackedUpRoomKey, ExportedRoomKey},
    types::EncryptedSessionData,
};

/// Error type for the decoding of a [`RecoveryKey`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The decoded recovery key has an invalid prefix.
    #[error("The decoded recovery key has an invalid prefix: expected {0:?}, got {1:?}")]
    Prefix([u8; 2], [u8; 2]),
    /// The parity byte of the recovery key didn't match.
    #[error("The parity byte of the recovery key doesn't match: expected {0:?}, got {1:?}")]
    Parity(u8, u8),
    /// The recovery key has an invalid length.
    #[error("The decoded recovery key has a invalid length: expected {0}, got {1}")]
    Length(usize, usize),
    /// The recovery key isn't valid Base58.
    #[error(transparent)]
    Base58(#[from] bs58::decode::Error),
}

/// Error type for the decryption of backed up room keys.
#[derive(Debug, Error)]
pub enum DecryptionError {
    /// The encrypted session data couldn't be decoded.
    #[error(transparent)]
    Message(#[from] MessageDecodeError),
    /// The session data couldn't be decrypted, the MAC didn't match or the
    /// key is wrong.
    #[error(transparent)]
    Pk(#[from] vodozemac::pk_encryption::Error),
    /// The decrypted session data isn't a valid room key.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// The private part of a server-side backup key.
///
/// The key is shown to users in its Base58 encoded form, prefixed with
/// `0x8B 0x01` and followed by a parity byte.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct RecoveryKey {
    key: Box<[u8; RecoveryKey::KEY_SIZE]>,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for RecoveryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryKey").finish_non_exhaustive()
    }
}

impl std::fmt::Display for RecoveryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let string = Zeroizing::new(self.to_base58());

        let string = Zeroizing::new(
            string
                .chars()
                .collect::<Vec<char>>()
                .chunks(Self::DISPLAY_CHUNK_SIZE)
                .map(|c| c.iter().collect::<String>())
                .collect::<Vec<_>>()
                .join(" "),
        );

        write!(f, "{}", string.as_str())
    }
}

impl TryFrom<String> for RecoveryKey {
    type Error = DecodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_base58(&value)
    }
}

impl RecoveryKey {
    /// The number of bytes the recovery key has.
    pub const KEY_SIZE: usize = 32;
    const PREFIX: [u8; 2] = [0x8b, 0x01];
    const PREFIX_PARITY: u8 = Self::PREFIX[0] ^ Self::PREFIX[1];
    const DECODED_SIZE: usize = Self::PREFIX.len() + Self::KEY_SIZE + 1;
    const DISPLAY_CHUNK_SIZE: usize = 4;

    fn parity_byte(bytes: &[u8]) -> u8 {
        bytes.iter().fold(Self::PREFIX_PARITY, |acc, x| acc ^ x)
    }

    /// Create a new random recovery key.
    pub fn new() -> Self {
        let mut key = Box::new([0u8; Self::KEY_SIZE]);
        thread_rng().fill_bytes(key.as_mut_slice());

        Self { key }
    }

    /// Create a recovery key from the raw bytes of the key.
    pub fn from_bytes(key: &[u8; Self::KEY_SIZE]) -> Self {
        Self { key: Box::new(*key) }
    }

    /// The raw bytes of the key.
    pub fn as_bytes(&self) -> &[u8; Self::KEY_SIZE] {
        &self.key
    }

    /// Try to decode a recovery key from its Base58 form.
    ///
    /// Whitespace is ignored, the key is commonly displayed in groups of four
    /// characters.
    pub fn from_base58(value: &str) -> Result<Self, DecodeError> {
        let value: Zeroizing<String> =
            Zeroizing::new(value.chars().filter(|c| !c.is_whitespace()).collect());
        let decoded = Zeroizing::new(base58_decode(&value)?);

        if decoded.len() != Self::DECODED_SIZE {
            return Err(DecodeError::Length(Self::DECODED_SIZE, decoded.len()));
        }

        let prefix = [decoded[0], decoded[1]];
        let key = &decoded[Self::PREFIX.len()..Self::PREFIX.len() + Self::KEY_SIZE];
        let expected_parity = decoded[Self::DECODED_SIZE - 1];
        let parity = Self::parity_byte(key);

        if prefix != Self::PREFIX {
            Err(DecodeError::Prefix(Self::PREFIX, prefix))
        } else if expected_parity != parity {
            Err(DecodeError::Parity(expected_parity, parity))
        } else {
            let mut key_bytes = Box::new([0u8; Self::KEY_SIZE]);
            key_bytes.copy_from_slice(key);

            Ok(Self { key: key_bytes })
        }
    }

    /// Encode the recovery key in its Base58 form.
    pub fn to_base58(&self) -> String {
        let bytes = Zeroizing::new(
            [
                Self::PREFIX.as_slice(),
                self.key.as_slice(),
                [Self::parity_byte(self.key.as_slice())].as_slice(),
            ]
            .concat(),
        );

        base58_encode(&bytes)
    }

    fn pk_decryption(&self) -> PkDecryption {
        PkDecryption::from_key(Curve25519SecretKey::from_slice(&self.key))
    }

    /// Get the public part of the key, it's used to encrypt room keys for the
    /// backup.
    pub fn megolm_v1_public_key(&self) -> MegolmV1BackupKey {
        MegolmV1BackupKey::new(self.pk_decryption().public_key(), None)
    }

    /// Decrypt a room key that was fetched from the backup.
    pub fn decrypt_session_data(
        &self,
        session_data: &EncryptedSessionData,
    ) -> Result<BackedUpRoomKey, DecryptionError> {
        let message = Message::from_base64(
            &session_data.ciphertext,
            &session_data.mac,
            &session_data.ephemeral,
        )?;

        let decrypted = Zeroizing::new(self.pk_decryption().decrypt(&message)?);

        Ok(serde_json::from_slice(&decrypted)?)
    }

    /// Decrypt a room key from the backup and turn it into an
    /// [`ExportedRoomKey`] that can be imported.
    pub fn decrypt_room_key(
        &self,
        room_id: &RoomId,
        session_id: &str,
        session_data: &EncryptedSessionData,
    ) -> Result<ExportedRoomKey, DecryptionError> {
        let room_key = self.decrypt_session_data(session_data)?;

        Ok(ExportedRoomKey::from_backed_up_room_key(room_id, session_id, room_key))
    }
}

impl Default for RecoveryKey {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode bytes using the Bitcoin Base58 alphabet.
///
/// Leading zero bytes are encoded as leading `1` characters.
pub fn base58_encode(input: &[u8]) -> String {
    bs58::encode(input).with_alphabet(bs58::Alphabet::BITCOIN).into_string()
}

/// Decode a string that uses the Bitcoin Base58 alphabet.
pub fn base58_decode(input: &str) -> Result<Vec<u8>, bs58::decode::Error> {
    bs58::decode(input).with_alphabet(bs58::Alphabet::BITCOIN).into_vec()
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;
    use proptest::prelude::*;

    use super::{base58_decode, base58_encode, DecodeError, RecoveryKey};

    const TEST_KEY: [u8; 32] = [
        0x77, 0x07, 0x6D, 0x0A, 0x73, 0x18, 0xA5, 0x7D, 0x3C, 0x16, 0xC1, 0x72, 0x51, 0xB2, 0x66,
        0x45, 0xDF, 0x4C, 0x2F, 0x87, 0xEB, 0xC0, 0x99, 0x2A, 0xB1, 0x77, 0xFB, 0xA5, 0x1D, 0xB9,
        0x2C, 0x2A,
    ];
    const TEST_KEY_BASE58: &str = "EsTcLW2KPGiFwKEA3As5g5c4BXwkqeeJZJV8Q9fugUMNUE4d";

    #[test]
    fn test_base58_encoding() {
        assert_eq!(base58_encode(b"hello world"), "StV1DL6CwTryKyV");
        assert_eq!(base58_decode("StV1DL6CwTryKyV").unwrap(), b"hello world");

        assert_eq!(base58_encode(&[0, 0, 1]), "112");
        assert_eq!(base58_decode("112").unwrap(), [0, 0, 1]);
    }

    #[test]
    fn test_recovery_key_encoding() {
        let key = RecoveryKey::from_bytes(&TEST_KEY);
        assert_eq!(key.to_base58(), TEST_KEY_BASE58);

        let decoded = RecoveryKey::from_base58(TEST_KEY_BASE58).unwrap();
        assert_eq!(decoded.as_bytes(), &TEST_KEY);
    }

    #[test]
    fn test_whitespace_is_ignored() {
        let key = RecoveryKey::from_bytes(&TEST_KEY);
        let displayed = key.to_string();
        assert!(displayed.contains(' '));

        let decoded = RecoveryKey::from_base58(&displayed).unwrap();
        assert_eq!(decoded.as_bytes(), &TEST_KEY);

        let with_newlines = format!("{}\r\n{}\n", &TEST_KEY_BASE58[..10], &TEST_KEY_BASE58[10..]);
        let decoded = RecoveryKey::from_base58(&with_newlines).unwrap();
        assert_eq!(decoded.as_bytes(), &TEST_KEY);
    }

    #[test]
    fn test_corrupted_keys_are_rejected() {
        let first = TEST_KEY_BASE58.replacen('E', "F", 1);
        assert!(RecoveryKey::from_base58(&first).is_err());

        let second = TEST_KEY_BASE58.replacen('s', "q", 1);
        assert!(RecoveryKey::from_base58(&second).is_err());

        let mut last = TEST_KEY_BASE58[..TEST_KEY_BASE58.len() - 1].to_owned();
        last.push('e');
        assert_matches!(RecoveryKey::from_base58(&last), Err(DecodeError::Parity(..)));

        assert_matches!(RecoveryKey::from_base58("abc"), Err(DecodeError::Length(35, _)));
        assert_matches!(RecoveryKey::from_base58(""), Err(DecodeError::Length(35, 0)));
        assert_matches!(RecoveryKey::from_base58("0OIl"), Err(DecodeError::Base58(_)));
    }

    #[test]
    fn test_wrong_prefix_is_rejected() {
        let encoded = base58_encode(&[[0x8b, 0x02].as_slice(), &TEST_KEY, &[0]].concat());
        assert_matches!(RecoveryKey::from_base58(&encoded), Err(DecodeError::Prefix(..)));
    }

    #[test]
    fn test_debug_output_is_redacted() {
        let key = RecoveryKey::from_bytes(&TEST_KEY);
        assert!(!format!("{key:?}").contains(TEST_KEY_BASE58));
    }

    proptest! {
        #[test]
        fn test_recovery_key_roundtrip(bytes in any::<[u8; 32]>()) {
            let key = RecoveryKey::from_bytes(&bytes);
            let decoded = RecoveryKey::from_base58(&key.to_base58()).unwrap();

            prop_assert_eq!(decoded.as_bytes(), &bytes);
        }

        #[test]
        fn test_base58_roundtrip(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            prop_assert_eq!(base58_decode(&base58_encode(&bytes)).unwrap(), bytes);
        }
    }
}
