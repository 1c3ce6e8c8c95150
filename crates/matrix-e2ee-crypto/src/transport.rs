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


//! The transport used to deliver to-device events.
//!
//! The encryption core never talks to the homeserver itself. Room keys,
//! forwarded keys and withheld notices are handed to a [`Transport`], which is
//! responsible for delivering them and for retrying failed requests.

use std::fmt;

use async_trait::async_trait;
use matrix_e2ee_common::{locks::Mutex, AsyncTraitDeps};
use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use serde_json::Value;
use thiserror::Error;

/// Error type for failures of a [`Transport`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// The event couldn't be delivered.
    #[error("the to-device event for {user_id} {device_id} couldn't be delivered: {reason}")]
    Undelivered {
        /// The recipient user.
        user_id: OwnedUserId,
        /// The recipient device.
        device_id: OwnedDeviceId,
        /// Why the delivery failed.
        reason: String,
    },

    /// A problem with the underlying network layer.
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

impl TransportError {
    /// Create a new [`Backend`][Self::Backend] error.
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(error))
    }
}

/// Something that can send to-device events to a single device.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait Transport: AsyncTraitDeps {
    /// Send a to-device event to the given device.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The user that owns the recipient device.
    ///
    /// * `device_id` - The recipient device.
    ///
    /// * `event_type` - The type of the event, `m.room.encrypted` for anything
    ///   that went through Olm.
    ///
    /// * `content` - The content of the event.
    async fn send_to_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        event_type: &str,
        content: Value,
    ) -> Result<(), TransportError>;
}

/// A transport that drops every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTransport;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl Transport for NoopTransport {
    async fn send_to_device(
        &self,
        _: &UserId,
        _: &DeviceId,
        _: &str,
        _: Value,
    ) -> Result<(), TransportError> {
        Ok(())
    }
}

/// A to-device event captured by a [`RecordingTransport`].
#[derive(Clone, Debug, PartialEq)]
pub struct SentToDevice {
    /// The recipient user.
    pub user_id: OwnedUserId,
    /// The recipient device.
    pub device_id: OwnedDeviceId,
    /// The type of the event.
    pub event_type: String,
    /// The content of the event.
    pub content: Value,
}

/// A transport that remembers every event it was asked to send.
///
/// Useful to wire two `OlmMachine`s together in tests.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SentToDevice>>,
}

impl fmt::Debug for RecordingTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingTransport").field("sent", &self.sent.lock().len()).finish()
    }
}

impl RecordingTransport {
    /// Create a new, empty, `RecordingTransport`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take all the events that were sent so far.
    pub fn take(&self) -> Vec<SentToDevice> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Take the events of the given type that were sent so far, leaving the
    /// other ones in place.
    pub fn take_of_type(&self, event_type: &str) -> Vec<SentToDevice> {
        let mut sent = self.sent.lock();
        let (matching, rest): (Vec<_>, Vec<_>) =
            sent.drain(..).partition(|e| e.event_type == event_type);
        *sent = rest;

        matching
    }

    /// Take the events that were sent to the given device so far, leaving
    /// the other ones in place.
    pub fn take_for(&self, user_id: &UserId, device_id: &DeviceId) -> Vec<SentToDevice> {
        let mut sent = self.sent.lock();
        let (matching, rest): (Vec<_>, Vec<_>) = sent.drain(..).partition(|e| {
            e.user_id.as_str() == user_id.as_str() && e.device_id.as_str() == device_id.as_str()
        });
        *sent = rest;

        matching
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl Transport for RecordingTransport {
    async fn send_to_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        event_type: &str,
        content: Value,
    ) -> Result<(), TransportError> {
        self.sent.lock().push(SentToDevice {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            event_type: event_type.to_owned(),
            content,
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use matrix_e2ee_test::{alice_device_id, async_test, ALICE};
    use serde_json::json;

    use super::{RecordingTransport, Transport};

    #[async_test]
    async fn test_recording_transport() {
        let transport = RecordingTransport::new();

        transport.send_to_device(&ALICE, alice_device_id(), "m.first", json!({})).await.unwrap();
        transport.send_to_device(&ALICE, alice_device_id(), "m.second", json!({})).await.unwrap();

        let first = transport.take_of_type("m.first");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].device_id.as_str(), alice_device_id().as_str());

        let rest = transport.take();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].event_type, "m.second");
        assert!(transport.take().is_empty());
    }
}
