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


//! Decisions about re-sharing room keys with other devices.
//!
//! A device that lost a room key, or never received it, can have the key
//! re-shared with it. Whether we do so depends on the records of the outbound
//! session and on the [`KeyForwardingPolicy`].

use ruma::UserId;
use serde::{Deserialize, Serialize};

use crate::{
    identities::ReadOnlyDevice,
    olm::{OutboundGroupSession, ShareState},
};

/// Configures which devices may have a room key re-shared with them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyForwardingPolicy {
    /// Re-share keys with our own devices even if we didn't verify them.
    #[serde(default)]
    pub share_with_untrusted_devices: bool,
    /// Never re-share keys with devices of other users, not even if the
    /// outbound session was shared with them.
    #[serde(default)]
    pub only_own_devices: bool,
}

/// An error describing why a key share request won't be honored.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum KeyForwardDecision {
    /// The key request is from a device that we don't own, we're only sharing
    /// sessions that we know the requesting device already was supposed to get.
    #[error("can't find an active outbound group session")]
    MissingOutboundSession,
    /// The key request is from a device that we don't own and the device wasn't
    /// meant to receive the session in the original key share.
    #[error("outbound session wasn't shared with the requesting device")]
    OutboundSessionNotShared,
    /// The key request is from a device we own, yet we don't trust it.
    #[error("requesting device isn't trusted")]
    UntrustedDevice,
    /// The key request is from a device of another user while we only
    /// re-share keys with our own devices.
    #[error("keys are only re-shared with our own devices")]
    NotOwnDevice,
    /// The outbound session was shared with the device, but the device either
    /// accidentally or maliciously changed their curve25519 sender key.
    #[error("the device has changed their curve25519 sender key")]
    ChangedSenderKey,
}

/// Decide if the room key of the given outbound session may be re-shared with
/// the given device.
///
/// Returns the message index the key should be exported at, `None` meaning
/// the first known index.
pub(crate) fn should_share_key(
    policy: &KeyForwardingPolicy,
    own_user_id: &UserId,
    device: &ReadOnlyDevice,
    outbound_session: Option<&OutboundGroupSession>,
) -> Result<Option<u32>, KeyForwardDecision> {
    let own_device = device.user_id() == own_user_id;

    if device.is_blacklisted() {
        Err(KeyForwardDecision::UntrustedDevice)
    // If this is our own, verified device, we share the entire session from the
    // earliest known index.
    } else if own_device && (device.is_locally_trusted() || policy.share_with_untrusted_devices) {
        Ok(None)
    } else if !own_device && policy.only_own_devices {
        Err(KeyForwardDecision::NotOwnDevice)
    // Otherwise, if the records show we previously shared with this device,
    // we'll reshare the session from the index we previously shared at.
    } else if let Some(outbound) = outbound_session {
        match outbound.is_shared_with(device) {
            ShareState::Shared(message_index) => Ok(Some(message_index)),
            ShareState::SharedButChangedSenderKey => Err(KeyForwardDecision::ChangedSenderKey),
            ShareState::NotShared if own_device => Err(KeyForwardDecision::UntrustedDevice),
            ShareState::NotShared => Err(KeyForwardDecision::OutboundSessionNotShared),
        }
    } else if own_device {
        Err(KeyForwardDecision::UntrustedDevice)
    } else {
        Err(KeyForwardDecision::MissingOutboundSession)
    }
}
