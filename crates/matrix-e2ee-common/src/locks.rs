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

//! Simplified blocking locks.
//!
//! A poisoned lock means a thread panicked while holding it, at which point
//! the state it guards can't be trusted anymore, so we propagate the panic
//! instead of handing out a `Result` on every access.

use std::sync::{
    Mutex as StdMutex, MutexGuard, RwLock as StdRwLock, RwLockReadGuard, RwLockWriteGuard,
};

/// A wrapper around `std::sync::RwLock` that panics on poisoning.
#[derive(Debug, Default)]
pub struct RwLock<T: ?Sized>(StdRwLock<T>);

impl<T> RwLock<T> {
    /// Create a new `RwLock` wrapping the given value.
    pub const fn new(value: T) -> Self {
        Self(StdRwLock::new(value))
    }
}

impl<T: ?Sized> RwLock<T> {
    /// Lock this `RwLock` with shared read access.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.0.read().expect("the RwLock was poisoned")
    }

    /// Lock this `RwLock` with exclusive write access.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.0.write().expect("the RwLock was poisoned")
    }
}

/// A wrapper around `std::sync::Mutex` that panics on poisoning.
#[derive(Debug, Default)]
pub struct Mutex<T: ?Sized>(StdMutex<T>);

impl<T> Mutex<T> {
    /// Create a new `Mutex` wrapping the given value.
    pub const fn new(value: T) -> Self {
        Self(StdMutex::new(value))
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquire the lock.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock().expect("the Mutex was poisoned")
    }
}
