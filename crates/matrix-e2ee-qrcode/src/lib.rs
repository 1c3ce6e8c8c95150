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

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![deny(
    missing_debug_implementations,
    dead_code,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications
)]

mod error;
mod types;

pub use error::DecodingError;
pub use types::{QrCodeData, DEFAULT_BASE_URL, VERIFY_ACTION};

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use assert_matches2::assert_matches;
    use proptest::prelude::*;
    use ruma::{event_id, user_id, EventId, UserId};

    use crate::{DecodingError, QrCodeData};

    const URL: &str = "https://matrix.to/#/@benoit:matrix.org?request=%24azertyazerty\
                       &action=verify&key_1=abcdef&key_2=ghijql\
                       &secret=sharedSecret&other_user_key=otherUserKey";

    fn data() -> QrCodeData {
        QrCodeData {
            user_id: user_id!("@benoit:matrix.org").to_owned(),
            request_event_id: event_id!("$azertyazerty").to_owned(),
            action: "verify".to_owned(),
            keys: BTreeMap::from([
                ("1".to_owned(), "abcdef".to_owned()),
                ("2".to_owned(), "ghijql".to_owned()),
            ]),
            shared_secret: "sharedSecret".to_owned(),
            other_user_key: "otherUserKey".to_owned(),
        }
    }

    #[test]
    fn test_encoding() {
        assert_eq!(data().to_url(), URL);
    }

    #[test]
    fn test_decoding() {
        assert_eq!(QrCodeData::from_url(URL), Some(data()));
    }

    #[test]
    fn test_custom_base_url() {
        let url = data().to_url_with_base("https://example.org/");
        assert!(url.starts_with("https://example.org/#/@benoit:matrix.org?"));
        assert_eq!(QrCodeData::from_url(&url), Some(data()));
    }

    #[test]
    fn test_identifiers_with_a_slash_round_trip() {
        let mut data = data();
        data.user_id = UserId::parse("@ben/oit:matrix.org").unwrap();
        data.request_event_id = EventId::parse("$azerty/azerty").unwrap();

        let url = data.to_url();
        assert!(url.contains("/#/@ben%2Foit:matrix.org?"), "The slash should be escaped: {url}");
        assert!(url.contains("request=%24azerty%2Fazerty&"), "The slash should be escaped: {url}");
        assert_eq!(QrCodeData::from_url(&url), Some(data));
    }

    #[test]
    fn test_missing_parameters() {
        for parameter in ["request", "action", "secret", "other_user_key"] {
            let url = URL
                .split(['?', '&'])
                .skip(1)
                .filter(|pair| !pair.starts_with(&format!("{parameter}=")))
                .collect::<Vec<_>>()
                .join("&");
            let url = format!("https://matrix.to/#/@benoit:matrix.org?{url}");

            assert_matches!(
                QrCodeData::try_from_url(&url),
                Err(DecodingError::MissingParameter(missing))
            );
            assert_eq!(missing, parameter);
        }
    }

    #[test]
    fn test_blank_parameters() {
        let url = URL.replace("secret=sharedSecret", "secret=%20%20");
        assert_matches!(
            QrCodeData::try_from_url(&url),
            Err(DecodingError::MissingParameter("secret"))
        );
    }

    #[test]
    fn test_missing_user_id() {
        let url = URL.replace("@benoit:matrix.org", "");
        assert_matches!(QrCodeData::try_from_url(&url), Err(DecodingError::MissingUserId));
        assert_eq!(QrCodeData::from_url(&url), None);
    }

    #[test]
    fn test_invalid_inputs() {
        assert_eq!(QrCodeData::from_url("not a url"), None);
        assert_eq!(QrCodeData::from_url("https://matrix.to/"), None);
        assert_eq!(QrCodeData::from_url(&URL.replace("https", "http")), None);
        assert_eq!(QrCodeData::from_url(&URL.replace("@benoit", "benoit")), None);
        assert_eq!(QrCodeData::from_url(&URL.replace("@benoit:matrix.org", "@benoit")), None);
        assert_eq!(QrCodeData::from_url(&URL.replace("%24azerty", "azerty")), None);

        assert_matches!(
            QrCodeData::try_from_url(&URL.replace("@benoit:matrix.org", "@benoit:matrix.org/extra")),
            Err(DecodingError::InvalidPath(_))
        );
    }

    #[test]
    fn test_unknown_parameters_are_ignored() {
        let url = format!("{URL}&via=matrix.org");
        assert_eq!(QrCodeData::from_url(&url), Some(data()));
    }

    proptest! {
        #[test]
        fn secrets_survive_the_round_trip(secret in "[^\\s].{0,40}", key in ".{1,20}") {
            let mut data = data();
            data.shared_secret = secret;
            data.other_user_key = format!("x{key}");

            prop_assert_eq!(QrCodeData::from_url(&data.to_url()), Some(data));
        }
    }
}
