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

use std::{collections::BTreeMap, sync::Arc};

use matrix_e2ee_qrcode::{QrCodeData, VERIFY_ACTION};
use rand::{thread_rng, RngCore};
use ruma::{EventId, OwnedDeviceId, OwnedEventId, OwnedUserId, UserId};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::{
    identities::{LocalTrust, ReadOnlyDevice},
    olm::Account,
    store::{Changes, CryptoStoreError, DeviceChanges, DynCryptoStore},
    utilities::encode,
};

const SECRET_SIZE: usize = 16;

/// An error for the different failure modes that can happen during the
/// validation of a scanned QR code.
#[derive(Debug, Error)]
pub enum ScanError {
    /// An IO error inside the crypto store happened during the validation of
    /// the QR code scan.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
    /// The QR code asks for something else than a verification.
    #[error("The QR code has an unsupported action {0}")]
    UnsupportedAction(String),
    /// The QR code belongs to another verification request.
    #[error("The verification request did not match (expected {expected}, found {found})")]
    RequestMismatch {
        /// The event ID of the request we are verifying.
        expected: OwnedEventId,
        /// The event ID found in the QR code.
        found: OwnedEventId,
    },
    /// The QR code was shown by another user than the one we are verifying.
    #[error("The user did not match (expected {expected}, found {found})")]
    UserMismatch {
        /// The user we are verifying.
        expected: OwnedUserId,
        /// The user found in the QR code.
        found: OwnedUserId,
    },
    /// A key mismatch happened during the validation of the QR code scan.
    #[error("The keys that are being verified didn't match (expected {expected}, found {found})")]
    KeyMismatch {
        /// The expected ed25519 key.
        expected: String,
        /// The ed25519 key that we got.
        found: String,
    },
    /// The QR code advertises a device we don't know about.
    #[error("The user's {0} device {1} is unknown")]
    MissingDevice(OwnedUserId, OwnedDeviceId),
    /// The QR code doesn't advertise any device key, there is nothing to
    /// verify.
    #[error("The QR code doesn't contain any device key")]
    NoKeys,
}

/// Creates the QR codes of our device and checks the ones our device scans.
#[derive(Clone)]
pub struct QrVerifier {
    account: Account,
    store: Arc<DynCryptoStore>,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for QrVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QrVerifier")
            .field("user_id", &self.account.user_id())
            .field("device_id", &self.account.device_id())
            .finish()
    }
}

impl QrVerifier {
    pub(crate) fn new(account: Account, store: Arc<DynCryptoStore>) -> Self {
        Self { account, store }
    }

    fn generate_secret() -> String {
        let mut shared_secret = [0u8; SECRET_SIZE];
        thread_rng().fill_bytes(&mut shared_secret);

        encode(shared_secret)
    }

    fn own_ed25519_key(&self) -> String {
        self.account.identity_keys().ed25519.to_base64()
    }

    /// Create the QR code our device shows for the given verification
    /// request.
    ///
    /// The code advertises the ed25519 key of our device and carries the key
    /// we believe the other device has, so the other side can check both.
    pub fn qr_code_for_request(
        &self,
        request_event_id: &EventId,
        other_device: &ReadOnlyDevice,
    ) -> QrCodeData {
        QrCodeData {
            user_id: self.account.user_id().to_owned(),
            request_event_id: request_event_id.to_owned(),
            action: VERIFY_ACTION.to_owned(),
            keys: BTreeMap::from([(
                self.account.device_id().as_str().to_owned(),
                self.own_ed25519_key(),
            )]),
            shared_secret: Self::generate_secret(),
            other_user_key: other_device.ed25519_key().to_base64(),
        }
    }

    /// Check a QR code we scanned from a device of `other_user`.
    ///
    /// All the checks happen before any trust is changed: either every
    /// advertised device matches and becomes locally verified, or nothing
    /// changes. Returns the newly verified devices.
    #[instrument(skip_all, fields(%request_event_id, %other_user))]
    pub async fn scan(
        &self,
        request_event_id: &EventId,
        other_user: &UserId,
        qr_code: &QrCodeData,
    ) -> Result<Vec<ReadOnlyDevice>, ScanError> {
        if qr_code.action != VERIFY_ACTION {
            return Err(ScanError::UnsupportedAction(qr_code.action.clone()));
        }

        if *qr_code.request_event_id != *request_event_id {
            return Err(ScanError::RequestMismatch {
                expected: request_event_id.to_owned(),
                found: qr_code.request_event_id.clone(),
            });
        }

        if *qr_code.user_id != *other_user {
            return Err(ScanError::UserMismatch {
                expected: other_user.to_owned(),
                found: qr_code.user_id.clone(),
            });
        }

        // The other side needs to see our real key, otherwise it would
        // verify somebody else.
        let own_key = self.own_ed25519_key();

        if qr_code.other_user_key != own_key {
            return Err(ScanError::KeyMismatch {
                expected: own_key,
                found: qr_code.other_user_key.clone(),
            });
        }

        if qr_code.keys.is_empty() {
            return Err(ScanError::NoKeys);
        }

        let mut devices = Vec::with_capacity(qr_code.keys.len());

        for (device_id, key) in &qr_code.keys {
            let device_id = OwnedDeviceId::from(device_id.as_str());

            let device = self
                .store
                .get_device(other_user, &device_id)
                .await?
                .ok_or_else(|| ScanError::MissingDevice(other_user.to_owned(), device_id))?;

            let expected = device.ed25519_key().to_base64();

            if *key != expected {
                debug!(device_id = %device.device_id(), "A scanned device key didn't match");
                return Err(ScanError::KeyMismatch { expected, found: key.clone() });
            }

            devices.push(device);
        }

        for device in &mut devices {
            device.set_local_trust(LocalTrust::Verified);
        }

        let changes = Changes {
            devices: DeviceChanges { changed: devices.clone(), ..Default::default() },
            ..Default::default()
        };
        self.store.save_changes(changes).await?;

        info!(count = devices.len(), "Verified devices by scanning a QR code");

        Ok(devices)
    }
}
