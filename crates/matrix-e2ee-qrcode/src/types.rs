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

use std::collections::BTreeMap;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use ruma::{EventId, OwnedEventId, OwnedUserId, UserId};
use url::{form_urlencoded, Url};

use crate::error::DecodingError;

/// The permalink host used when no other one is requested.
pub const DEFAULT_BASE_URL: &str = "https://matrix.to";

/// The action a verification QR code asks for.
pub const VERIFY_ACTION: &str = "verify";

const KEY_PARAMETER_PREFIX: &str = "key_";

/// Characters that need to be escaped in the user ID path segment.
///
/// This is the URL path set with the segment separator and the escape
/// character added, a user ID containing either must survive a round trip.
const USER_ID_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'%');

/// The data a verification QR code carries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QrCodeData {
    /// The user being verified, the permalink points to them.
    pub user_id: OwnedUserId,
    /// The event ID of the verification request this code belongs to.
    pub request_event_id: OwnedEventId,
    /// What the scanning side should do, usually [`VERIFY_ACTION`].
    pub action: String,
    /// Map from a device ID to the unpadded base64 Ed25519 key of the device.
    pub keys: BTreeMap<String, String>,
    /// The shared secret both sides confirm after the scan.
    pub shared_secret: String,
    /// The key the code's author believes belongs to the scanning side.
    pub other_user_key: String,
}

impl QrCodeData {
    /// Encode the data as a permalink on the default `matrix.to` host.
    ///
    /// # Examples
    ///
    /// ```
    /// # use std::collections::BTreeMap;
    /// # use matrix_e2ee_qrcode::QrCodeData;
    /// # use ruma::{event_id, user_id};
    /// let data = QrCodeData {
    ///     user_id: user_id!("@alice:example.org").to_owned(),
    ///     request_event_id: event_id!("$request").to_owned(),
    ///     action: "verify".to_owned(),
    ///     keys: BTreeMap::from([("DEVICE".to_owned(), "key".to_owned())]),
    ///     shared_secret: "secret".to_owned(),
    ///     other_user_key: "other".to_owned(),
    /// };
    ///
    /// let url = data.to_url();
    /// assert_eq!(QrCodeData::from_url(&url), Some(data));
    /// ```
    pub fn to_url(&self) -> String {
        self.to_url_with_base(DEFAULT_BASE_URL)
    }

    /// Encode the data as a permalink on the given host, e.g.
    /// `https://matrix.to`.
    pub fn to_url_with_base(&self, base_url: &str) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());

        query
            .append_pair("request", self.request_event_id.as_str())
            .append_pair("action", &self.action);

        for (device_id, key) in &self.keys {
            query.append_pair(&format!("{KEY_PARAMETER_PREFIX}{device_id}"), key);
        }

        query
            .append_pair("secret", &self.shared_secret)
            .append_pair("other_user_key", &self.other_user_key);

        let user_id = utf8_percent_encode(self.user_id.as_str(), USER_ID_ENCODE_SET);

        format!("{}/#/{user_id}?{}", base_url.trim_end_matches('/'), query.finish())
    }

    /// Decode a permalink, returning `None` if it isn't a valid verification
    /// QR code.
    ///
    /// See [`QrCodeData::try_from_url`] to learn why decoding failed.
    pub fn from_url(url: &str) -> Option<Self> {
        Self::try_from_url(url).ok()
    }

    /// Decode a permalink into the data it carries.
    pub fn try_from_url(url: &str) -> Result<Self, DecodingError> {
        let url = Url::parse(url)?;

        if url.scheme() != "https" {
            return Err(DecodingError::Scheme(url.scheme().to_owned()));
        }

        let fragment = url
            .fragment()
            .and_then(|f| f.strip_prefix('/'))
            .ok_or(DecodingError::MissingFragment)?;

        let (path, query) = fragment.split_once('?').unwrap_or((fragment, ""));

        if path.is_empty() {
            return Err(DecodingError::MissingUserId);
        } else if path.contains('/') {
            return Err(DecodingError::InvalidPath(path.to_owned()));
        }

        let user_id = percent_decode_str(path).decode_utf8()?;
        let user_id = UserId::parse(user_id.as_ref())?;

        let mut request = None;
        let mut action = None;
        let mut shared_secret = None;
        let mut other_user_key = None;
        let mut keys = BTreeMap::new();

        for (name, value) in form_urlencoded::parse(query.as_bytes()) {
            match name.as_ref() {
                "request" => request = Some(value.into_owned()),
                "action" => action = Some(value.into_owned()),
                "secret" => shared_secret = Some(value.into_owned()),
                "other_user_key" => other_user_key = Some(value.into_owned()),
                name => {
                    if let Some(device_id) = name.strip_prefix(KEY_PARAMETER_PREFIX) {
                        keys.insert(device_id.to_owned(), value.into_owned());
                    }
                }
            }
        }

        let request = required(request, "request")?;

        Ok(Self {
            user_id,
            request_event_id: EventId::parse(request)?,
            action: required(action, "action")?,
            keys,
            shared_secret: required(shared_secret, "secret")?,
            other_user_key: required(other_user_key, "other_user_key")?,
        })
    }
}

fn required(value: Option<String>, name: &'static str) -> Result<String, DecodingError> {
    value.filter(|v| !v.trim().is_empty()).ok_or(DecodingError::MissingParameter(name))
}
