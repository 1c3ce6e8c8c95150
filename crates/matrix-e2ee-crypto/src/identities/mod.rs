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

//! The device registry.
//!
//! Devices are handed to us by the caller, who fetched them from the
//! homeserver, and are persisted through the store. The local trust of a device
//! decides whether it receives room keys and whether it may ask for them to be
//! re-shared.

mod device;

pub use device::{LocalTrust, ReadOnlyDevice};
