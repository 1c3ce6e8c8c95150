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

//! Types and traits to implement the storage layer for the [`OlmMachine`]
//!
//! The storage layer for the [`OlmMachine`] can be customized using a trait.
//! Implementing your own [`CryptoStore`] lets the session material live in a
//! real database, an in-memory only store is provided for tests and for
//! clients that don't need persistence.
//!
//! ```
//! # use std::sync::Arc;
//! # use matrix_e2ee_crypto::{
//! #     store::MemoryStore, transport::NoopTransport, CryptoConfig, OlmMachine,
//! # };
//! # use ruma::{device_id, user_id};
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let user_id = user_id!("@example:localhost");
//! # let device_id = device_id!("TEST");
//! let store = Arc::new(MemoryStore::new());
//!
//! let machine = OlmMachine::with_store(
//!     user_id,
//!     device_id,
//!     store,
//!     Arc::new(NoopTransport),
//!     CryptoConfig::default(),
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`OlmMachine`]: crate::OlmMachine

use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use ruma::OwnedRoomId;
use serde::{Deserialize, Serialize};

use crate::{
    backups::RecoveryKey,
    identities::ReadOnlyDevice,
    olm::{Account, InboundGroupSession, OlmMessageHash, OutboundGroupSession, Session},
    types::{events::room_key_withheld::RoomKeyWithheldContent, EventEncryptionAlgorithm},
};

mod error;
mod memorystore;
mod traits;

pub use error::{CryptoStoreError, Result};
pub use memorystore::MemoryStore;
pub use traits::{CryptoStore, DynCryptoStore, IntoCryptoStore};

/// Aggregated changes to be saved in the database.
///
/// The engines collect everything a single operation touched into one
/// `Changes` value, a store must apply it as a whole.
#[derive(Default, Debug)]
#[allow(missing_docs)]
pub struct Changes {
    pub account: Option<Account>,
    pub backup_version: Option<String>,
    pub recovery_key: Option<RecoveryKey>,
    pub sessions: Vec<Session>,
    pub message_hashes: Vec<OlmMessageHash>,
    pub inbound_group_sessions: Vec<InboundGroupSession>,
    pub outbound_group_sessions: Vec<OutboundGroupSession>,
    pub devices: DeviceChanges,
    /// Stores when a `m.room_key.withheld` is received
    pub withheld_session_info: BTreeMap<OwnedRoomId, BTreeMap<String, RoomKeyWithheldContent>>,
    pub room_settings: HashMap<OwnedRoomId, RoomSettings>,
}

impl Changes {
    /// Are there any changes stored or is this an empty `Changes` struct?
    pub fn is_empty(&self) -> bool {
        self.account.is_none()
            && self.backup_version.is_none()
            && self.recovery_key.is_none()
            && self.sessions.is_empty()
            && self.message_hashes.is_empty()
            && self.inbound_group_sessions.is_empty()
            && self.outbound_group_sessions.is_empty()
            && self.devices.is_empty()
            && self.withheld_session_info.is_empty()
            && self.room_settings.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
#[allow(missing_docs)]
pub struct DeviceChanges {
    pub new: Vec<ReadOnlyDevice>,
    pub changed: Vec<ReadOnlyDevice>,
    pub deleted: Vec<ReadOnlyDevice>,
}

impl DeviceChanges {
    /// Are there any changes stored or is this an empty `DeviceChanges`
    /// struct?
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.changed.is_empty() && self.deleted.is_empty()
    }
}

/// Struct holding info about how many room keys the store has.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoomKeyCounts {
    /// The total number of room keys the store has.
    pub total: usize,
    /// The number of backed up room keys the store has.
    pub backed_up: usize,
}

/// Stored versions of the backup keys.
#[derive(Default, Clone, Debug)]
pub struct BackupKeys {
    /// The key used to decrypt backed up room keys.
    pub recovery_key: Option<RecoveryKey>,
    /// The version that we are using for backups.
    pub backup_version: Option<String>,
}

/// Room encryption settings which are modified by state events or user options
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct RoomSettings {
    /// The encryption algorithm that should be used in the room.
    pub algorithm: EventEncryptionAlgorithm,

    /// Should untrusted devices receive the room key, or should they be
    /// excluded from the conversation.
    #[serde(default)]
    pub only_allow_trusted_devices: bool,

    /// Should members that were invited but haven't joined yet receive the
    /// room key.
    #[serde(default)]
    pub encrypt_for_invited_members: bool,

    /// The maximum time an encryption session should be used for, before it is
    /// rotated.
    pub session_rotation_period: Option<Duration>,

    /// The maximum number of messages an encryption session should be used for,
    /// before it is rotated.
    pub session_rotation_period_messages: Option<usize>,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            only_allow_trusted_devices: false,
            encrypt_for_invited_members: false,
            session_rotation_period: None,
            session_rotation_period_messages: None,
        }
    }
}
