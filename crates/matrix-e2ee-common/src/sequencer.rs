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

//! First-in-first-out sequencing of async operations.
//!
//! Cryptographic ratchets are single-writer resources: two interleaved
//! read-modify-write cycles on the same session would skip or reuse message
//! indices. A [`Sequencer`] hands out a single permit at a time, in the order
//! the permits were requested. The [`KeyedSequencer`] keeps one such queue per
//! key, so operations on independent sessions still run in parallel.

use std::{collections::HashMap, fmt, hash::Hash, sync::Arc};

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::locks::Mutex as StdMutex;

/// Proof that the holder is the only operation currently running on a
/// sequenced resource. The next queued operation starts once this is dropped.
pub struct SequencerGuard {
    _guard: OwnedMutexGuard<()>,
}

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for SequencerGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequencerGuard").finish_non_exhaustive()
    }
}

/// A single-permit FIFO queue.
///
/// Cloning the sequencer yields a handle to the same queue.
#[derive(Clone, Debug, Default)]
pub struct Sequencer {
    // Tokio's mutex is fair, waiters are woken up in the order they called
    // `lock()`.
    queue: Arc<Mutex<()>>,
}

impl Sequencer {
    /// Create a new, idle, sequencer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for our turn.
    pub async fn acquire(&self) -> SequencerGuard {
        SequencerGuard { _guard: self.queue.clone().lock_owned().await }
    }
}

/// A collection of FIFO queues, one per key.
pub struct KeyedSequencer<K> {
    queues: StdMutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K> Default for KeyedSequencer<K> {
    fn default() -> Self {
        Self { queues: StdMutex::new(HashMap::new()) }
    }
}

#[cfg(not(tarpaulin_include))]
impl<K> fmt::Debug for KeyedSequencer<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedSequencer").field("active_queues", &self.queues.lock().len()).finish()
    }
}

impl<K: Eq + Hash> KeyedSequencer<K> {
    /// Create a new sequencer without any queues.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for our turn on the queue belonging to the given key.
    pub async fn acquire(&self, key: K) -> SequencerGuard {
        let queue = {
            let mut queues = self.queues.lock();

            // A queue only referenced by the map has no holder and no waiter,
            // it can go.
            queues.retain(|_, queue| Arc::strong_count(queue) > 1);
            queues.entry(key).or_default().clone()
        };

        SequencerGuard { _guard: queue.lock_owned().await }
    }

    /// The number of queues that are held or waited upon.
    pub fn active_queues(&self) -> usize {
        self.queues.lock().values().filter(|queue| Arc::strong_count(queue) > 1).count()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use matrix_e2ee_test::async_test;
    use tokio::time::{sleep, timeout};

    use super::{KeyedSequencer, Sequencer};
    use crate::locks::Mutex;

    #[async_test]
    async fn test_operations_run_in_submission_order() {
        let sequencer = Sequencer::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let guard = sequencer.acquire().await;
        let mut handles = Vec::new();

        for i in 0..5 {
            let sequencer = sequencer.clone();
            let order = order.clone();

            handles.push(tokio::spawn(async move {
                let _guard = sequencer.acquire().await;
                order.lock().push(i);
            }));

            // Let the task enqueue itself before spawning the next one.
            sleep(Duration::from_millis(10)).await;
        }

        assert!(order.lock().is_empty(), "Nothing may run while the permit is held");
        drop(guard);

        for handle in futures_util::future::join_all(handles).await {
            handle.unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[async_test]
    async fn test_independent_keys_do_not_block_each_other() {
        let sequencer = KeyedSequencer::new();

        let _first = sequencer.acquire("first").await;
        let second = timeout(Duration::from_millis(100), sequencer.acquire("second")).await;
        assert!(second.is_ok(), "A different key should be acquired immediately");

        let same = timeout(Duration::from_millis(50), sequencer.acquire("first")).await;
        assert!(same.is_err(), "The same key must wait for the current holder");
    }

    #[async_test]
    async fn test_idle_queues_are_pruned() {
        let sequencer = KeyedSequencer::new();

        {
            let _guard = sequencer.acquire(1).await;
            assert_eq!(sequencer.active_queues(), 1);
        }

        assert_eq!(sequencer.active_queues(), 0);

        let _guard = sequencer.acquire(2).await;
        assert_eq!(sequencer.queues.lock().len(), 1, "The idle queue for key 1 should be gone");
    }
}
