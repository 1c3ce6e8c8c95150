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

//! Detection of replayed Megolm ciphertext.
//!
//! Megolm ratchets can be rewound to any index we hold a key for, so a
//! malicious homeserver could present an old ciphertext under a new event ID.
//! For every `(room, session, message index)` triple we remember the first
//! event that used it and reject any other event claiming the same index.

use std::collections::{BTreeMap, HashMap};

use matrix_e2ee_common::locks::RwLock;
use ruma::{EventId, OwnedEventId, OwnedRoomId, RoomId};
use thiserror::Error;
use tracing::{trace, warn};

/// A different event was already decrypted using the same Megolm message
/// index.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error(
    "the message index {message_index} of session {session_id} in {room_id} was already used by \
     {first_event_id}"
)]
pub struct DuplicatedMessageIndex {
    /// The room the session belongs to.
    pub room_id: OwnedRoomId,
    /// The ID of the Megolm session.
    pub session_id: String,
    /// The reused message index.
    pub message_index: u32,
    /// The event that used the index first.
    pub first_event_id: OwnedEventId,
}

/// The event that first used a message index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplayEntry {
    /// The ID of the event.
    pub event_id: OwnedEventId,
    /// The timeline the event was first decrypted for.
    pub timeline_id: Option<String>,
}

type SessionKey = (OwnedRoomId, String);

/// An append-only record of the message indices every Megolm session has used.
#[derive(Debug, Default)]
pub struct ReplayGuard {
    entries: RwLock<HashMap<SessionKey, BTreeMap<u32, ReplayEntry>>>,
}

impl ReplayGuard {
    /// Create an empty guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the given event was decrypted using the given message
    /// index.
    ///
    /// Decrypting the same event again is accepted, whatever the timeline.
    /// Any other event using an index that is already taken is rejected.
    pub fn check_and_record(
        &self,
        room_id: &RoomId,
        session_id: &str,
        message_index: u32,
        event_id: &EventId,
        timeline_id: Option<&str>,
    ) -> Result<(), DuplicatedMessageIndex> {
        let mut entries = self.entries.write();
        let indices = entries.entry((room_id.to_owned(), session_id.to_owned())).or_default();

        match indices.get(&message_index) {
            Some(entry) if entry.event_id.as_str() == event_id.as_str() => {
                trace!(%event_id, message_index, "The event was already decrypted");
                Ok(())
            }
            Some(entry) => {
                warn!(
                    %room_id,
                    session_id,
                    message_index,
                    %event_id,
                    first_event_id = %entry.event_id,
                    "Rejecting an event that reuses a Megolm message index"
                );

                Err(DuplicatedMessageIndex {
                    room_id: room_id.to_owned(),
                    session_id: session_id.to_owned(),
                    message_index,
                    first_event_id: entry.event_id.clone(),
                })
            }
            None => {
                indices.insert(
                    message_index,
                    ReplayEntry {
                        event_id: event_id.to_owned(),
                        timeline_id: timeline_id.map(ToOwned::to_owned),
                    },
                );

                Ok(())
            }
        }
    }

    /// Get the event that first used the given message index.
    pub fn entry(
        &self,
        room_id: &RoomId,
        session_id: &str,
        message_index: u32,
    ) -> Option<ReplayEntry> {
        self.entries
            .read()
            .get(&(room_id.to_owned(), session_id.to_owned()))
            .and_then(|indices| indices.get(&message_index).cloned())
    }

    /// Drop every entry of a session, called when the session itself is
    /// discarded.
    pub fn forget_session(&self, room_id: &RoomId, session_id: &str) {
        self.entries.write().remove(&(room_id.to_owned(), session_id.to_owned()));
    }
}
