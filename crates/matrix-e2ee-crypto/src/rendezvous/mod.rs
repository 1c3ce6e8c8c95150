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

//! Rendezvous negotiation for logging in with a second device.
//!
//! One device shows a rendezvous code, a small JSON object naming the
//! algorithm, its ephemeral public key, the transport and what it wants to
//! do. The other device parses the code with [`build_channel`] and, if it
//! supports everything the code asks for, connects a [`SecureChannel`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;
use vodozemac::Curve25519PublicKey;

mod channel;

pub use channel::{
    EstablishedSecureChannel, SecureChannel, SecureChannelError, SecureChannelMessage,
};

/// The only transport we know how to use, a simple HTTP mailbox.
pub const HTTP_TRANSPORT_V1: &str = "org.matrix.msc3886.http.v1";

/// The algorithms a rendezvous can be secured with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RendezvousAlgorithm {
    /// `org.matrix.msc3903.rendezvous.v1.curve25519-aes-sha256`
    V1Curve25519AesSha256,
    /// `org.matrix.msc3903.rendezvous.v2.curve25519-aes-sha256`
    V2Curve25519AesSha256,
}

impl RendezvousAlgorithm {
    /// The identifier of the algorithm, as it appears in a rendezvous code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V1Curve25519AesSha256 => "org.matrix.msc3903.rendezvous.v1.curve25519-aes-sha256",
            Self::V2Curve25519AesSha256 => "org.matrix.msc3903.rendezvous.v2.curve25519-aes-sha256",
        }
    }

    fn from_identifier(identifier: &str) -> Option<Self> {
        [Self::V1Curve25519AesSha256, Self::V2Curve25519AesSha256]
            .into_iter()
            .find(|a| a.as_str() == identifier)
    }
}

impl fmt::Display for RendezvousAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the device that shows the rendezvous code wants to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RendezvousIntent {
    /// The device wants to log in, it needs an existing device to help it.
    LoginStart,
    /// The device is already logged in and offers to log in another one.
    LoginReciprocate,
}

impl RendezvousIntent {
    /// The identifier of the intent, as it appears in a rendezvous code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoginStart => "login.start",
            Self::LoginReciprocate => "login.reciprocate",
        }
    }

    fn from_identifier(identifier: &str) -> Option<Self> {
        match identifier {
            "login.start" => Some(Self::LoginStart),
            "login.reciprocate" => Some(Self::LoginReciprocate),
            _ => None,
        }
    }
}

/// Why a rendezvous code can't be used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RendezvousFailureReason {
    /// The code asks for an algorithm we don't support.
    UnsupportedAlgorithm,
    /// The code asks for a transport we don't support.
    UnsupportedTransport,
    /// The code is malformed.
    InvalidCode,
}

/// Error type for the negotiation of a rendezvous channel.
///
/// A failed negotiation is final, retrying with the same code gives the same
/// result.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("the rendezvous code can't be used: {reason:?}")]
pub struct RendezvousError {
    /// Why the code was rejected.
    pub reason: RendezvousFailureReason,
}

impl From<RendezvousFailureReason> for RendezvousError {
    fn from(reason: RendezvousFailureReason) -> Self {
        Self { reason }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RendezvousCode {
    pub rendezvous: RendezvousDetails,
    pub intent: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RendezvousDetails {
    pub algorithm: String,
    pub key: String,
    pub transport: TransportDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TransportDetails {
    #[serde(rename = "type")]
    pub transport_type: String,
    pub uri: String,
}

/// A rendezvous channel we are able to use, negotiated from the rendezvous
/// code of another device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RendezvousChannel {
    /// The algorithm the channel is secured with.
    pub algorithm: RendezvousAlgorithm,
    /// The type of the transport, always [`HTTP_TRANSPORT_V1`].
    pub transport_type: String,
    /// Where the transport can be reached.
    pub transport_uri: Url,
    /// What the other device wants to do.
    pub intent: RendezvousIntent,
    /// The ephemeral public key of the other device.
    pub their_public_key: Curve25519PublicKey,
}

/// Negotiate a rendezvous channel from the JSON rendezvous code of another
/// device.
///
/// The algorithm is checked first, then the transport, and only then the
/// rest of the code.
pub fn build_channel(code: &str) -> Result<RendezvousChannel, RendezvousError> {
    use RendezvousFailureReason::*;

    let code: RendezvousCode = serde_json::from_str(code).map_err(|e| {
        debug!("Received a malformed rendezvous code: {e}");
        RendezvousError::from(InvalidCode)
    })?;

    let algorithm =
        RendezvousAlgorithm::from_identifier(&code.rendezvous.algorithm).ok_or_else(|| {
            debug!(algorithm = %code.rendezvous.algorithm, "Unsupported rendezvous algorithm");
            RendezvousError::from(UnsupportedAlgorithm)
        })?;

    let transport = code.rendezvous.transport;

    if transport.transport_type != HTTP_TRANSPORT_V1 {
        debug!(transport_type = %transport.transport_type, "Unsupported rendezvous transport");
        return Err(UnsupportedTransport.into());
    }

    let intent = RendezvousIntent::from_identifier(&code.intent).ok_or(InvalidCode)?;
    let their_public_key =
        Curve25519PublicKey::from_base64(&code.rendezvous.key).map_err(|_| InvalidCode)?;
    let transport_uri = Url::parse(&transport.uri).map_err(|_| InvalidCode)?;

    Ok(RendezvousChannel {
        algorithm,
        transport_type: transport.transport_type,
        transport_uri,
        intent,
        their_public_key,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        build_channel, RendezvousAlgorithm, RendezvousFailureReason, RendezvousIntent,
        HTTP_TRANSPORT_V1,
    };

    const KEY: &str = "XjhWTCjW7l59pbfx9tlCBQolfnIQWARoKOzjTOPSlWM";
    const URI: &str = "https://rendezvous.lab.element.dev/e8da6355-550b-4a32-a193-1619d9830668";

    fn code(algorithm: &str, transport_type: &str, intent: &str) -> String {
        json!({
            "rendezvous": {
                "algorithm": algorithm,
                "key": KEY,
                "transport": {
                    "type": transport_type,
                    "uri": URI,
                },
            },
            "intent": intent,
        })
        .to_string()
    }

    fn reason(code: &str) -> RendezvousFailureReason {
        build_channel(code).unwrap_err().reason
    }

    #[test]
    fn test_supported_codes() {
        for algorithm in
            [RendezvousAlgorithm::V1Curve25519AesSha256, RendezvousAlgorithm::V2Curve25519AesSha256]
        {
            for intent in [RendezvousIntent::LoginStart, RendezvousIntent::LoginReciprocate] {
                let channel =
                    build_channel(&code(algorithm.as_str(), HTTP_TRANSPORT_V1, intent.as_str()))
                        .unwrap();

                assert_eq!(channel.algorithm, algorithm);
                assert_eq!(channel.intent, intent);
                assert_eq!(channel.transport_type, HTTP_TRANSPORT_V1);
                assert_eq!(channel.transport_uri.as_str(), URI);
                assert_eq!(channel.their_public_key.to_base64(), KEY);
            }
        }
    }

    #[test]
    fn test_unsupported_algorithm() {
        let code = code("bad algo", HTTP_TRANSPORT_V1, "login.start");
        assert_eq!(reason(&code), RendezvousFailureReason::UnsupportedAlgorithm);
    }

    #[test]
    fn test_unsupported_transport() {
        let algorithm = RendezvousAlgorithm::V2Curve25519AesSha256.as_str();
        let code = code(algorithm, "bad transport", "login.start");
        assert_eq!(reason(&code), RendezvousFailureReason::UnsupportedTransport);
    }

    #[test]
    fn test_algorithm_is_checked_before_the_transport() {
        let code = code("bad algo", "bad transport", "foo");
        assert_eq!(reason(&code), RendezvousFailureReason::UnsupportedAlgorithm);
    }

    #[test]
    fn test_invalid_codes() {
        let algorithm = RendezvousAlgorithm::V1Curve25519AesSha256.as_str();

        assert_eq!(
            reason(&code(algorithm, HTTP_TRANSPORT_V1, "foo")),
            RendezvousFailureReason::InvalidCode
        );

        for code in ["{}", "rubbish", ""] {
            assert_eq!(reason(code), RendezvousFailureReason::InvalidCode, "{code:?}");
        }

        let bad_key = code(algorithm, HTTP_TRANSPORT_V1, "login.start").replace(KEY, "abc");
        assert_eq!(reason(&bad_key), RendezvousFailureReason::InvalidCode);

        let bad_uri = code(algorithm, HTTP_TRANSPORT_V1, "login.start").replace(URI, "not a uri");
        assert_eq!(reason(&bad_uri), RendezvousFailureReason::InvalidCode);
    }
}
