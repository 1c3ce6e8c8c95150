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

use std::io::{Cursor, Read, Seek, SeekFrom};

use byteorder::{BigEndian, ReadBytesExt};
use rand::{thread_rng, RngCore};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::{
    ciphers::{AesHmacSha2Key, IV_SIZE, MAC_SIZE, SALT_SIZE},
    olm::ExportedRoomKey,
    utilities::{decode, encode_padded, DecodeError},
};

const VERSION: u8 = 1;
const LINE_WIDTH: usize = 128;

const HEADER: &str = "-----BEGIN MEGOLM SESSION DATA-----";
const FOOTER: &str = "-----END MEGOLM SESSION DATA-----";

/// Error representing a failure during key export or import.
#[derive(Error, Debug)]
pub enum KeyExportError {
    /// The key export doesn't contain valid headers.
    #[error("Invalid or missing key export headers.")]
    InvalidHeaders,
    /// The key export has been encrypted with an unsupported version.
    #[error("The key export has been encrypted with an unsupported version {0}.")]
    UnsupportedVersion(u8),
    /// The MAC of the encrypted payload is invalid, the passphrase is most
    /// likely wrong.
    #[error("The MAC of the encrypted payload is invalid.")]
    InvalidMac,
    /// The passphrase is empty.
    #[error("An empty passphrase can't be used for key exports.")]
    EmptyPassphrase,
    /// The decrypted key export isn't valid UTF-8.
    #[error(transparent)]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    /// The key export isn't valid base64.
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// The decrypted key export isn't a valid list of room keys.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// The key export is too short or couldn't be read.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Try to decrypt a reader into a list of exported room keys.
///
/// # Arguments
///
/// * `passphrase` - The passphrase that was used to encrypt the exported keys.
///
/// # Examples
///
/// ```no_run
/// # use std::io::Cursor;
/// # use matrix_e2ee_crypto::{OlmMachine, decrypt_room_key_export};
/// # async {
/// # let export = Cursor::new("".to_owned());
/// # let machine: OlmMachine = unimplemented!();
/// let exported_keys = decrypt_room_key_export(export, "1234").unwrap();
/// machine.import_room_keys(exported_keys, false).await.unwrap();
/// # };
/// ```
pub fn decrypt_room_key_export(
    mut input: impl Read,
    passphrase: &str,
) -> Result<Vec<ExportedRoomKey>, KeyExportError> {
    let mut x = String::new();
    input.read_to_string(&mut x)?;

    if !(x.trim_start().starts_with(HEADER) && x.trim_end().ends_with(FOOTER)) {
        return Err(KeyExportError::InvalidHeaders);
    }

    let payload: String = x
        .lines()
        .map(str::trim)
        .filter(|l| !(l.starts_with(HEADER) || l.starts_with(FOOTER)))
        .collect();

    let decrypted = decrypt_helper(&payload, passphrase)?;

    Ok(serde_json::from_str(&decrypted)?)
}

/// Encrypt the list of exported room keys using the given passphrase.
///
/// # Arguments
///
/// * `keys` - A list of sessions that should be encrypted.
///
/// * `passphrase` - The passphrase that will be used to encrypt the exported
/// room keys.
///
/// * `rounds` - The number of rounds that should be used for the key
/// derivation when the passphrase gets turned into an AES key. More rounds are
/// increasingly computationally intensive and as such help against brute-force
/// attacks. Should be at least `10000`, while values in the `100000` ranges
/// should be preferred.
pub fn encrypt_room_key_export(
    keys: &[ExportedRoomKey],
    passphrase: &str,
    rounds: u32,
) -> Result<String, KeyExportError> {
    let plaintext = Zeroizing::new(serde_json::to_vec(keys)?);
    let ciphertext = encrypt_helper(&plaintext, passphrase, rounds)?;

    let lines: Vec<&str> = ciphertext
        .as_bytes()
        .chunks(LINE_WIDTH)
        .map(|c| std::str::from_utf8(c).unwrap_or_default())
        .collect();

    Ok([HEADER, &lines.join("\n"), FOOTER, ""].join("\n"))
}

fn encrypt_helper(
    plaintext: &[u8],
    passphrase: &str,
    rounds: u32,
) -> Result<String, KeyExportError> {
    if passphrase.is_empty() {
        return Err(KeyExportError::EmptyPassphrase);
    }

    let mut salt = [0u8; SALT_SIZE];
    thread_rng().fill_bytes(&mut salt);

    let key = AesHmacSha2Key::from_passphrase(passphrase, rounds, &salt);
    let (ciphertext, iv) = key.encrypt(plaintext.to_vec());

    let mut payload: Vec<u8> = vec![];

    payload.push(VERSION);
    payload.extend(&salt);
    payload.extend(&iv);
    payload.extend(&rounds.to_be_bytes());
    payload.extend_from_slice(&ciphertext);

    let mac = key.create_mac_tag(&payload);
    payload.extend(mac.as_bytes());

    Ok(encode_padded(payload))
}

fn decrypt_helper(ciphertext: &str, passphrase: &str) -> Result<String, KeyExportError> {
    if passphrase.is_empty() {
        return Err(KeyExportError::EmptyPassphrase);
    }

    let decoded = decode(ciphertext)?;

    let mut decoded = Cursor::new(decoded);

    let mut salt = [0u8; SALT_SIZE];
    let mut iv = [0u8; IV_SIZE];
    let mut mac = [0u8; MAC_SIZE];

    let version = decoded.read_u8()?;
    decoded.read_exact(&mut salt)?;
    decoded.read_exact(&mut iv)?;

    let rounds = decoded.read_u32::<BigEndian>()?;
    let ciphertext_start = decoded.position() as usize;

    decoded.seek(SeekFrom::End(-(MAC_SIZE as i64)))?;
    let ciphertext_end = decoded.position() as usize;

    decoded.read_exact(&mut mac)?;

    let decoded = decoded.into_inner();

    if version != VERSION {
        return Err(KeyExportError::UnsupportedVersion(version));
    }

    if ciphertext_end < ciphertext_start {
        return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
    }

    let key = AesHmacSha2Key::from_passphrase(passphrase, rounds, &salt);
    key.verify_mac(&decoded[0..ciphertext_end], &mac).map_err(|_| KeyExportError::InvalidMac)?;

    let plaintext = key.decrypt(decoded[ciphertext_start..ciphertext_end].to_vec(), &iv);

    Ok(String::from_utf8(plaintext)?)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches2::assert_matches;
    use matrix_e2ee_test::{alice_device_id, async_test, ALICE, DEFAULT_TEST_ROOM_ID};
    use serde_json::json;

    use super::{
        decrypt_helper, decrypt_room_key_export, encrypt_helper, encrypt_room_key_export,
        KeyExportError, FOOTER, HEADER,
    };
    use crate::{encryption::RoomMember, machine::test_helpers::get_machine};

    const PASSPHRASE: &str = "1234";

    #[test]
    fn test_encrypt_decrypt() {
        let data = "It's a secret to everybody";
        let bytes = data.to_owned().into_bytes();

        let encrypted = encrypt_helper(&bytes, PASSPHRASE, 10).unwrap();
        let decrypted = decrypt_helper(&encrypted, PASSPHRASE).unwrap();

        assert_eq!(data, decrypted);
    }

    #[test]
    fn test_wrong_passphrase_is_detected() {
        let bytes = b"It's a secret to everybody".to_vec();
        let encrypted = encrypt_helper(&bytes, PASSPHRASE, 10).unwrap();

        assert_matches!(decrypt_helper(&encrypted, "4321"), Err(KeyExportError::InvalidMac));
    }

    #[test]
    fn test_empty_passphrase_is_rejected() {
        let bytes = b"secret".to_vec();

        assert_matches!(encrypt_helper(&bytes, "", 10), Err(KeyExportError::EmptyPassphrase));
        assert_matches!(decrypt_helper("AQ", ""), Err(KeyExportError::EmptyPassphrase));
    }

    #[test]
    fn test_malformed_exports_are_rejected() {
        assert_matches!(
            decrypt_room_key_export(Cursor::new("not an export"), PASSPHRASE),
            Err(KeyExportError::InvalidHeaders)
        );

        let truncated = format!("{HEADER}\nAQID\n{FOOTER}\n");
        assert_matches!(
            decrypt_room_key_export(Cursor::new(truncated), PASSPHRASE),
            Err(KeyExportError::Io(_))
        );

        // A single version byte of 2 followed by enough padding to be parsed.
        let mut payload = vec![2u8];
        payload.extend([0u8; 16 + 16 + 4 + 32]);
        let wrong_version =
            format!("{HEADER}\n{}\n{FOOTER}\n", crate::utilities::encode_padded(payload));
        assert_matches!(
            decrypt_room_key_export(Cursor::new(wrong_version), PASSPHRASE),
            Err(KeyExportError::UnsupportedVersion(2))
        );
    }

    #[async_test]
    async fn test_session_export_roundtrip() {
        let machine = get_machine(&ALICE, alice_device_id()).await;
        let room_id = *DEFAULT_TEST_ROOM_ID;

        machine
            .encrypt_room_event(
                room_id,
                "m.room.message",
                &json!({ "body": "Hello" }),
                &[RoomMember::joined(&ALICE)],
            )
            .await
            .unwrap();

        let exported = machine.export_room_keys(|s| s.room_id() == room_id).await.unwrap();
        assert_eq!(exported.len(), 1);

        let encrypted = encrypt_room_key_export(&exported, PASSPHRASE, 1).unwrap();
        assert!(encrypted.starts_with(HEADER));
        assert!(encrypted.trim_end().ends_with(FOOTER));
        assert!(encrypted.lines().all(|l| l.len() <= 128));

        let decrypted = decrypt_room_key_export(Cursor::new(encrypted), PASSPHRASE).unwrap();

        assert_eq!(decrypted.len(), 1);
        assert_eq!(decrypted[0].session_id, exported[0].session_id);
        assert_eq!(decrypted[0].room_id, exported[0].room_id);
        assert_eq!(decrypted[0].sender_key, exported[0].sender_key);
    }
}
