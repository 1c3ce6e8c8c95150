// Copyright 2022 The Matrix.org Foundation C.I.C.
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

use once_cell::sync::Lazy;
use ruma::{device_id, room_id, user_id, DeviceId, RoomId, UserId};

/// Attribute for async tests, runs the test body on a tokio runtime.
pub use tokio::test as async_test;

/// Create a `Raw<T>` from arbitrary JSON, the target type is inferred.
///
/// Forwards all arguments to [`serde_json::json`].
#[macro_export]
macro_rules! raw_json {
    ($( $tt:tt )*) => {
        ::ruma::serde::Raw::from_json(
            ::serde_json::value::to_raw_value(&::serde_json::json!( $($tt)* )).unwrap(),
        )
    }
}

pub static ALICE: Lazy<&UserId> = Lazy::new(|| user_id!("@alice:server.name"));
pub static BOB: Lazy<&UserId> = Lazy::new(|| user_id!("@bob:other.server"));
pub static CAROL: Lazy<&UserId> = Lazy::new(|| user_id!("@carol:other.server"));

pub fn alice_device_id() -> &'static DeviceId {
    device_id!("ALICEDEVICE")
}

pub fn bob_device_id() -> &'static DeviceId {
    device_id!("BOBDEVICE")
}

pub fn carol_device_id() -> &'static DeviceId {
    device_id!("CAROLDEVICE")
}

pub static DEFAULT_TEST_ROOM_ID: Lazy<&RoomId> =
    Lazy::new(|| room_id!("!SVkFJHzfwvuaIEawgC:localhost"));

/// Install a global `tracing` subscriber writing to the test output.
///
/// The filter is taken from `RUST_LOG`, calling this more than once is fine.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
