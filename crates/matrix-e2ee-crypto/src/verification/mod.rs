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

//! Interactive verification of devices by scanning QR codes.
//!
//! One device shows a QR code advertising its ed25519 key and the key it
//! believes the other device has. The other device scans the code, checks
//! both keys against what it knows and, if everything matches, marks the
//! advertised device as locally verified.

mod qrcode;

pub use qrcode::{QrVerifier, ScanError};
