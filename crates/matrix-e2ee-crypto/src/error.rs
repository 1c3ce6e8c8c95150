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

use std::fmt;

use ruma::{OwnedDeviceId, OwnedRoomId, OwnedUserId};
use serde_json::Error as SerdeError;
use thiserror::Error;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use crate::{
    replay_guard::DuplicatedMessageIndex, store::CryptoStoreError, transport::TransportError,
    types::events::room_key_withheld::WithheldCode,
};

/// Result type for the Olm operations of the machine.
pub type OlmResult<T> = Result<T, OlmError>;
/// Result type for the Megolm operations of the machine.
pub type MegolmResult<T> = Result<T, MegolmError>;

/// Error representing a failure during a device to device cryptographic
/// operation.
#[derive(Error, Debug)]
pub enum OlmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// The received room key couldn't be converted into a valid Megolm session,
    /// or a new Olm session couldn't be created.
    #[error(transparent)]
    SessionCreation(#[from] SessionCreationError),

    /// The storage layer returned an error.
    #[error("failed to read or write to the crypto store {0}")]
    Store(#[from] CryptoStoreError),

    /// The transport failed to deliver a to-device event.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The session with a device has become corrupted.
    #[error(
        "decryption failed likely because an Olm session from {0} with sender key {1} was wedged"
    )]
    SessionWedged(OwnedUserId, Curve25519PublicKey),

    /// An Olm message got replayed while the Olm ratchet has already moved
    /// forward.
    #[error("decryption failed because an Olm message from {0} with sender key {1} was replayed")]
    ReplayedMessage(OwnedUserId, Curve25519PublicKey),

    /// Encryption failed because the device does not have a valid Olm session
    /// with us.
    #[error(
        "encryption failed because the device does not \
            have a valid Olm session with us"
    )]
    MissingSession,
}

/// Error representing a failure during a group encryption operation.
#[derive(Error, Debug)]
pub enum MegolmError {
    /// The event that should have been decrypted is malformed.
    #[error(transparent)]
    EventError(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// Decryption failed because we're missing the room key that was used to
    /// encrypt the event.
    #[error("Can't find the room key to decrypt the event, withheld code: {0:?}")]
    MissingRoomKey(Option<WithheldCode>),

    /// The encrypted megolm message couldn't be decoded.
    #[error(transparent)]
    Decode(#[from] vodozemac::DecodeError),

    /// The event could not have been decrypted.
    #[error(transparent)]
    Decryption(#[from] vodozemac::megolm::DecryptionError),

    /// A different event was already decrypted using the same message index.
    #[error(transparent)]
    DuplicatedMessageIndex(#[from] DuplicatedMessageIndex),

    /// The storage layer returned an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

/// Error that occurs when decrypting an event that is malformed.
#[derive(Error, Debug)]
pub enum EventError {
    /// The Encrypted message has been encrypted with a unsupported algorithm.
    #[error("the Encrypted message has been encrypted with a unsupported algorithm.")]
    UnsupportedAlgorithm,

    /// The provided JSON value isn't an object.
    #[error("the provided JSON value isn't an object")]
    NotAnObject,

    /// The Encrypted message doesn't contain a ciphertext for our device.
    #[error("the Encrypted message doesn't contain a ciphertext for our device")]
    MissingCiphertext,

    /// The Encrypted message is missing the sender key.
    #[error("the Encrypted message is missing the sender key")]
    MissingSenderKey,

    /// A mandatory field of the event is missing.
    #[error("the event is missing the mandatory `{0}` field")]
    MissingField(&'static str),

    /// The event couldn't be deserialized.
    #[error(transparent)]
    Json(#[from] SerdeError),

    /// The sender of the plaintext doesn't match the sender of the encrypted
    /// message.
    #[error(
        "the sender of the plaintext doesn't match the sender of the encrypted \
        message, got {0}, expected {1}"
    )]
    MismatchedSender(OwnedUserId, OwnedUserId),

    /// The recipient of the plaintext isn't us.
    #[error("the plaintext was encrypted for {0}, but we are {1}")]
    MismatchedRecipient(OwnedUserId, OwnedUserId),

    /// The public key that was part of the message doesn't match the key we
    /// have stored.
    #[error(
        "the public key that was part of the message doesn't match the key we \
        have stored, expected {0}, got {1}"
    )]
    MismatchedKeys(Box<Ed25519PublicKey>, Box<Ed25519PublicKey>),

    /// The room ID of the room key doesn't match the room ID of the decrypted
    /// event.
    #[error(
        "the room id of the room key doesn't match the room id of the \
        decrypted event: expected {0}, got {1:?}"
    )]
    MismatchedRoom(OwnedRoomId, Option<OwnedRoomId>),
}

/// Error that occurs when a room key can't be converted into a valid Megolm
/// session, or an Olm session can't be established.
#[derive(Error, Debug)]
pub enum SessionCreationError {
    /// The device has no unused one-time key we could use.
    #[error(
        "Tried to create a new Olm session for {0} {1}, but the \
        one-time key is missing"
    )]
    OneTimeKeyMissing(OwnedUserId, OwnedDeviceId),

    /// Error when creating an Olm Session from an incoming Olm message.
    #[error(transparent)]
    InboundCreation(#[from] vodozemac::olm::SessionCreationError),

    /// The exported room key couldn't be imported.
    #[error("the room key uses the unsupported algorithm {0}")]
    UnsupportedAlgorithm(String),

    /// A key that is part of the room key isn't a valid key.
    #[error(transparent)]
    InvalidKey(#[from] vodozemac::KeyError),
}

/// Errors that can be returned by
/// [`crate::machine::OlmMachine::set_room_settings`].
#[derive(Debug, Error)]
pub enum SetRoomSettingsError {
    /// The changes are rejected because they conflict with the previous
    /// settings for this room.
    #[error("the new settings would cause a downgrade of encryption security")]
    EncryptionDowngrade,

    /// The changes are rejected because they use an algorithm we don't
    /// support.
    #[error("the new settings are invalid")]
    InvalidSettings,

    /// The store ran into an error.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

/// The error returned by the [`crate::encryption::RoomEncryptor`], wrapping
/// the error of the engine that was selected for the room.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The Olm engine failed.
    #[error(transparent)]
    Olm(#[from] OlmError),

    /// The Megolm engine failed.
    #[error(transparent)]
    Megolm(#[from] MegolmError),
}

impl From<EventError> for CryptoError {
    fn from(e: EventError) -> Self {
        Self::Megolm(e.into())
    }
}

impl From<CryptoStoreError> for CryptoError {
    fn from(e: CryptoStoreError) -> Self {
        Self::Megolm(e.into())
    }
}

/// A stable, machine-readable classification of encryption and decryption
/// failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorType {
    /// We don't have the room key that encrypted the event.
    UnknownInboundSessionId,
    /// The sender told us it withheld the room key from us.
    KeysWithheld,
    /// Our copy of the room key starts after the index of the message.
    UnknownMessageIndex,
    /// A different event used the same message index.
    DuplicatedMessageIndex,
    /// The room of the room key and of the event differ.
    InboundSessionMismatchRoomId,
    /// The ciphertext couldn't be decoded.
    BadEncryptedMessage,
    /// The plaintext isn't a well formed event.
    BadDecryptedFormat,
    /// The event is missing the sender key.
    MissingSenderKey,
    /// The event is missing a mandatory field.
    MissingFields,
    /// The ciphertext failed authentication.
    UnableToDecrypt,
    /// No Olm session exists to encrypt with.
    UnableToEncrypt,
    /// An Olm channel failure.
    Olm,
    /// Anything else, for example a storage or transport failure.
    Unknown,
}

impl ErrorType {
    /// The upper-case string form of the error type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::UnknownInboundSessionId => "UNKNOWN_INBOUND_SESSION_ID",
            ErrorType::KeysWithheld => "KEYS_WITHHELD",
            ErrorType::UnknownMessageIndex => "UNKNOWN_MESSAGE_INDEX",
            ErrorType::DuplicatedMessageIndex => "DUPLICATED_MESSAGE_INDEX",
            ErrorType::InboundSessionMismatchRoomId => "INBOUND_SESSION_MISMATCH_ROOM_ID",
            ErrorType::BadEncryptedMessage => "BAD_ENCRYPTED_MESSAGE",
            ErrorType::BadDecryptedFormat => "BAD_DECRYPTED_FORMAT",
            ErrorType::MissingSenderKey => "MISSING_SENDER_KEY",
            ErrorType::MissingFields => "MISSING_FIELDS",
            ErrorType::UnableToDecrypt => "UNABLE_TO_DECRYPT",
            ErrorType::UnableToEncrypt => "UNABLE_TO_ENCRYPT",
            ErrorType::Olm => "OLM",
            ErrorType::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EventError {
    /// The [`ErrorType`] of this error.
    pub fn error_type(&self) -> ErrorType {
        match self {
            EventError::UnsupportedAlgorithm => ErrorType::BadEncryptedMessage,
            EventError::MissingSenderKey => ErrorType::MissingSenderKey,
            EventError::MissingCiphertext | EventError::MissingField(_) => ErrorType::MissingFields,
            EventError::MismatchedRoom(..) => ErrorType::InboundSessionMismatchRoomId,
            EventError::NotAnObject
            | EventError::Json(_)
            | EventError::MismatchedSender(..)
            | EventError::MismatchedRecipient(..)
            | EventError::MismatchedKeys(..) => ErrorType::BadDecryptedFormat,
        }
    }
}

impl MegolmError {
    /// The [`ErrorType`] of this error.
    pub fn error_type(&self) -> ErrorType {
        use vodozemac::megolm::DecryptionError;

        match self {
            MegolmError::EventError(e) => e.error_type(),
            MegolmError::JsonError(_) => ErrorType::BadDecryptedFormat,
            MegolmError::MissingRoomKey(None) => ErrorType::UnknownInboundSessionId,
            MegolmError::MissingRoomKey(Some(_)) => ErrorType::KeysWithheld,
            MegolmError::Decode(_) => ErrorType::BadEncryptedMessage,
            MegolmError::Decryption(DecryptionError::UnknownMessageIndex(..)) => {
                ErrorType::UnknownMessageIndex
            }
            MegolmError::Decryption(_) => ErrorType::UnableToDecrypt,
            MegolmError::DuplicatedMessageIndex(_) => ErrorType::DuplicatedMessageIndex,
            MegolmError::Store(_) => ErrorType::Unknown,
        }
    }
}

impl OlmError {
    /// The [`ErrorType`] of this error.
    pub fn error_type(&self) -> ErrorType {
        match self {
            OlmError::EventError(e) => e.error_type(),
            OlmError::JsonError(_) => ErrorType::BadDecryptedFormat,
            OlmError::MissingSession => ErrorType::UnableToEncrypt,
            OlmError::SessionCreation(_)
            | OlmError::SessionWedged(..)
            | OlmError::ReplayedMessage(..) => ErrorType::Olm,
            OlmError::Store(_) | OlmError::Transport(_) => ErrorType::Unknown,
        }
    }
}

impl CryptoError {
    /// The [`ErrorType`] of this error.
    pub fn error_type(&self) -> ErrorType {
        match self {
            CryptoError::Olm(e) => e.error_type(),
            CryptoError::Megolm(e) => e.error_type(),
        }
    }
}

#[cfg(test)]
mod tests {
    use ruma::{owned_event_id, owned_room_id, room_id};

    use super::*;

    #[test]
    fn test_error_types() {
        assert_eq!(
            MegolmError::MissingRoomKey(None).error_type().as_str(),
            "UNKNOWN_INBOUND_SESSION_ID"
        );
        assert_eq!(
            MegolmError::MissingRoomKey(Some(WithheldCode::Unverified)).error_type().as_str(),
            "KEYS_WITHHELD"
        );
        assert_eq!(
            MegolmError::from(vodozemac::megolm::DecryptionError::UnknownMessageIndex(3, 1))
                .error_type(),
            ErrorType::UnknownMessageIndex
        );
        assert_eq!(
            MegolmError::from(EventError::MismatchedRoom(
                owned_room_id!("!a:localhost"),
                Some(owned_room_id!("!b:localhost"))
            ))
            .error_type()
            .to_string(),
            "INBOUND_SESSION_MISMATCH_ROOM_ID"
        );

        let duplicate = DuplicatedMessageIndex {
            room_id: room_id!("!a:localhost").to_owned(),
            session_id: "session".to_owned(),
            message_index: 0,
            first_event_id: owned_event_id!("$first"),
        };
        assert_eq!(
            CryptoError::from(MegolmError::from(duplicate)).error_type(),
            ErrorType::DuplicatedMessageIndex
        );
        assert_eq!(
            CryptoError::from(OlmError::MissingSession).error_type().as_str(),
            "UNABLE_TO_ENCRYPT"
        );
    }
}
