// Copyright 2022 The Matrix.org Foundation C.I.C.
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

//! Types for the events the encryption core sends and receives.

use ruma::OwnedUserId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod encryption_schemes;
pub mod forwarded_room_key;
pub mod olm_v1;
pub mod room_encrypted;
pub mod room_key;
pub mod room_key_withheld;

pub use encryption_schemes::*;

/// An event type that is known at compile time.
pub trait EventType {
    /// The event type of the event.
    const EVENT_TYPE: &'static str;

    /// Get the event type of the event content.
    fn event_type(&self) -> &'static str {
        Self::EVENT_TYPE
    }
}

/// A to-device event as it is received from the transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToDeviceEvent<C = Value> {
    /// The user that sent the event.
    pub sender: OwnedUserId,
    /// The type of the event.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The content of the event.
    pub content: C,
}

impl<C> ToDeviceEvent<C> {
    /// Create a new to-device event.
    pub fn new(sender: OwnedUserId, event_type: impl Into<String>, content: C) -> Self {
        Self { sender, event_type: event_type.into(), content }
    }
}
