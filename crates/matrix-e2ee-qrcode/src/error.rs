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

use thiserror::Error;

/// Error type describing why a QR code URL couldn't be turned into
/// [`QrCodeData`](crate::QrCodeData).
#[derive(Error, Debug)]
pub enum DecodingError {
    /// The string isn't a valid URL.
    #[error(transparent)]
    Url(#[from] url::ParseError),
    /// The URL doesn't use the `https` scheme.
    #[error("the QR code URL uses an unsupported scheme: {0}")]
    Scheme(String),
    /// The URL has no `#/` fragment containing the payload.
    #[error("the QR code URL is missing the permalink fragment")]
    MissingFragment,
    /// The permalink fragment doesn't point to a user.
    #[error("the QR code URL is missing the user ID")]
    MissingUserId,
    /// The permalink path has more than one segment.
    #[error("the QR code URL contains an unexpected path: {0}")]
    InvalidPath(String),
    /// The percent-encoded user ID isn't valid UTF-8.
    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),
    /// The user ID or the request event ID is malformed.
    #[error(transparent)]
    Identifier(#[from] ruma::IdParseError),
    /// A mandatory query parameter is missing or blank.
    #[error("the QR code URL is missing the `{0}` parameter")]
    MissingParameter(&'static str),
}
