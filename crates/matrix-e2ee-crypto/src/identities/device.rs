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

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use crate::{
    olm::Account,
    types::{
        deserialize_curve_key, deserialize_ed25519_key, serialize_curve_key,
        serialize_ed25519_key,
    },
};

/// The local trust state of a device.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalTrust {
    /// The device has been verified and is trusted.
    Verified = 0,
    /// The device been blacklisted from communicating.
    BlackListed = 1,
    /// The trust state of the device is being ignored.
    Ignored = 2,
    /// The trust state is unset.
    #[default]
    Unset = 3,
}

/// A read-only version of a device of some user.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadOnlyDevice {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    curve25519_key: Curve25519PublicKey,
    #[serde(
        deserialize_with = "deserialize_ed25519_key",
        serialize_with = "serialize_ed25519_key"
    )]
    ed25519_key: Ed25519PublicKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    display_name: Option<String>,
    #[serde(default)]
    trust_state: LocalTrust,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for ReadOnlyDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadOnlyDevice")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("display_name", &self.display_name)
            .field("curve25519_key", &self.curve25519_key)
            .field("ed25519_key", &self.ed25519_key)
            .field("trust_state", &self.trust_state)
            .finish()
    }
}

impl ReadOnlyDevice {
    /// Create a new device from its public identity keys.
    pub fn new(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        curve25519_key: Curve25519PublicKey,
        ed25519_key: Ed25519PublicKey,
    ) -> Self {
        Self {
            user_id,
            device_id,
            curve25519_key,
            ed25519_key,
            display_name: None,
            trust_state: LocalTrust::Unset,
        }
    }

    /// Create the device description of our own account.
    pub fn from_account(account: &Account) -> Self {
        let keys = account.identity_keys();

        Self::new(
            account.user_id().to_owned(),
            account.device_id().to_owned(),
            keys.curve25519,
            keys.ed25519,
        )
    }

    /// Set the human readable name of the device.
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    /// The user id of the device owner.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The unique ID of the device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Get the human readable name of the device.
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// Get the Curve25519 identity key of the device.
    pub fn curve25519_key(&self) -> Curve25519PublicKey {
        self.curve25519_key
    }

    /// Get the Ed25519 signing key of the device.
    pub fn ed25519_key(&self) -> Ed25519PublicKey {
        self.ed25519_key
    }

    /// Get the trust state of the device.
    pub fn local_trust_state(&self) -> LocalTrust {
        self.trust_state
    }

    /// Set the trust state of the device to the given state.
    ///
    /// The change only becomes durable once the device is saved.
    pub fn set_local_trust(&mut self, state: LocalTrust) {
        self.trust_state = state;
    }

    /// Is the device locally marked as trusted.
    pub fn is_locally_trusted(&self) -> bool {
        self.trust_state == LocalTrust::Verified
    }

    /// Is the device locally marked as blacklisted.
    ///
    /// Blacklisted devices won't receive any group sessions.
    pub fn is_blacklisted(&self) -> bool {
        self.trust_state == LocalTrust::BlackListed
    }

    /// Is the device trusted enough to receive room keys in rooms that only
    /// allow trusted devices.
    ///
    /// Ignored devices are treated as trusted, the user explicitly chose not
    /// to care about their verification state.
    pub fn is_trusted_for_sharing(&self) -> bool {
        matches!(self.trust_state, LocalTrust::Verified | LocalTrust::Ignored)
    }
}

#[cfg(test)]
mod tests {
    use matrix_e2ee_test::{alice_device_id, ALICE};

    use super::{LocalTrust, ReadOnlyDevice};
    use crate::olm::Account;

    #[test]
    fn test_device_trust_state() {
        let account = Account::with_device_id(&ALICE, alice_device_id());
        let mut device = ReadOnlyDevice::from_account(&account).with_display_name("Alice's phone");

        assert_eq!(device.user_id(), *ALICE);
        assert_eq!(device.display_name(), Some("Alice's phone"));
        assert_eq!(device.local_trust_state(), LocalTrust::Unset);
        assert!(!device.is_trusted_for_sharing());

        device.set_local_trust(LocalTrust::Ignored);
        assert!(device.is_trusted_for_sharing());
        assert!(!device.is_locally_trusted());

        device.set_local_trust(LocalTrust::BlackListed);
        assert!(device.is_blacklisted());
    }

    #[test]
    fn test_device_serialization() {
        let account = Account::with_device_id(&ALICE, alice_device_id());
        let mut device = ReadOnlyDevice::from_account(&account);
        device.set_local_trust(LocalTrust::Verified);

        let json = serde_json::to_value(&device).unwrap();
        assert_eq!(json["curve25519_key"], account.identity_keys().curve25519.to_base64());

        let restored: ReadOnlyDevice = serde_json::from_value(json).unwrap();
        assert_eq!(restored, device);
    }
}
