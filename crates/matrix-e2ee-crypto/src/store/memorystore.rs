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


use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use matrix_e2ee_common::locks::RwLock as StdRwLock;
use ruma::{DeviceId, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use tokio::sync::{Mutex, RwLock};
use vodozemac::{olm::IdentityKeys, Curve25519PublicKey};

use super::{
    BackupKeys, Changes, CryptoStore, CryptoStoreError, Result, RoomKeyCounts, RoomSettings,
};
use crate::{
    identities::ReadOnlyDevice,
    olm::{
        Account, InboundGroupSession, OlmMessageHash, OutboundGroupSession, PickledAccount,
        PickledInboundGroupSession, PickledSession, Session,
    },
    types::events::room_key_withheld::RoomKeyWithheldContent,
};

/// The parts of the account that are needed to restore Olm sessions.
#[derive(Clone, Debug)]
struct StaticAccountData {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    identity_keys: Arc<IdentityKeys>,
}

/// An in-memory only store that will forget all the E2EE key once it's dropped.
///
/// Sessions are kept in their pickled form, loading one hands out a fresh copy
/// the same way a database backed store would.
#[derive(Default, Debug)]
pub struct MemoryStore {
    static_account: StdRwLock<Option<StaticAccountData>>,
    account: StdRwLock<Option<String>>,
    // Map of sender_key to map of session_id to serialized pickle
    sessions: StdRwLock<BTreeMap<String, BTreeMap<String, String>>>,
    // Map of sender_key to map of session_id to serialized pickle
    inbound_group_sessions: StdRwLock<BTreeMap<String, HashMap<String, String>>>,
    outbound_group_sessions: StdRwLock<BTreeMap<OwnedRoomId, OutboundGroupSession>>,
    olm_hashes: StdRwLock<HashMap<String, HashSet<String>>>,
    devices: StdRwLock<HashMap<OwnedUserId, HashMap<OwnedDeviceId, ReadOnlyDevice>>>,
    withheld_info: StdRwLock<HashMap<OwnedRoomId, HashMap<String, RoomKeyWithheldContent>>>,
    room_settings: StdRwLock<HashMap<OwnedRoomId, RoomSettings>>,
    backup_keys: RwLock<BackupKeys>,

    save_changes_lock: Arc<Mutex<()>>,
}

impl MemoryStore {
    /// Create a new empty `MemoryStore`.
    pub fn new() -> Self {
        Self::default()
    }

    fn get_static_account(&self) -> Result<StaticAccountData> {
        self.static_account.read().clone().ok_or(CryptoStoreError::AccountUnset)
    }

    fn save_devices(&self, devices: Vec<ReadOnlyDevice>) {
        let mut stored = self.devices.write();

        for device in devices {
            stored
                .entry(device.user_id().to_owned())
                .or_default()
                .insert(device.device_id().to_owned(), device);
        }
    }

    fn delete_devices(&self, devices: Vec<ReadOnlyDevice>) {
        let mut stored = self.devices.write();

        for device in devices {
            if let Some(user_devices) = stored.get_mut(device.user_id()) {
                user_devices.remove(device.device_id());
            }
        }
    }

    fn save_sessions(&self, sessions: Vec<(String, PickledSession)>) -> Result<()> {
        let mut session_store = self.sessions.write();

        for (session_id, pickle) in sessions {
            let entry = session_store.entry(pickle.sender_key.to_base64()).or_default();

            // insert or replace if exists
            entry.insert(session_id, serde_json::to_string(&pickle)?);
        }

        Ok(())
    }

    fn save_outbound_group_sessions(&self, sessions: Vec<OutboundGroupSession>) {
        self.outbound_group_sessions
            .write()
            .extend(sessions.into_iter().map(|s| (s.room_id().to_owned(), s)));
    }

    async fn save_inbound_group_sessions(&self, sessions: Vec<InboundGroupSession>) -> Result<()> {
        for session in sessions {
            let pickle = serde_json::to_string(&session.pickle().await)?;

            self.inbound_group_sessions
                .write()
                .entry(session.sender_key().to_base64())
                .or_default()
                .insert(session.session_id().to_owned(), pickle);
        }

        Ok(())
    }

    fn load_inbound_group_sessions(&self) -> Result<Vec<InboundGroupSession>> {
        self.inbound_group_sessions
            .read()
            .values()
            .flat_map(HashMap::values)
            .map(|ser| {
                let pickle: PickledInboundGroupSession = serde_json::from_str(ser)?;
                Ok(InboundGroupSession::from_pickle(pickle))
            })
            .collect()
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl CryptoStore for MemoryStore {
    async fn load_account(&self) -> Result<Option<Account>> {
        let pickled_account: Option<PickledAccount> =
            self.account.read().as_deref().map(serde_json::from_str).transpose()?;

        Ok(pickled_account.map(Account::from_pickle))
    }

    async fn save_changes(&self, changes: Changes) -> Result<()> {
        let _guard = self.save_changes_lock.lock().await;

        if let Some(account) = changes.account {
            let pickle = serde_json::to_string(&account.pickle().await)?;

            *self.static_account.write() = Some(StaticAccountData {
                user_id: account.user_id().to_owned(),
                device_id: account.device_id().to_owned(),
                identity_keys: account.identity_keys_arc(),
            });
            *self.account.write() = Some(pickle);
        }

        let mut pickled_sessions = Vec::new();
        for session in changes.sessions {
            let session_id = session.session_id().to_owned();
            let pickle = session.pickle().await;
            pickled_sessions.push((session_id, pickle));
        }
        self.save_sessions(pickled_sessions)?;

        self.save_inbound_group_sessions(changes.inbound_group_sessions).await?;
        self.save_outbound_group_sessions(changes.outbound_group_sessions);

        self.save_devices(changes.devices.new);
        self.save_devices(changes.devices.changed);
        self.delete_devices(changes.devices.deleted);

        {
            let mut olm_hashes = self.olm_hashes.write();
            for hash in changes.message_hashes {
                olm_hashes.entry(hash.sender_key.to_owned()).or_default().insert(hash.hash);
            }
        }

        if let Some(key) = changes.recovery_key {
            self.backup_keys.write().await.recovery_key = Some(key);
        }

        if let Some(version) = changes.backup_version {
            self.backup_keys.write().await.backup_version = Some(version);
        }

        {
            let mut withheld_info = self.withheld_info.write();
            for (room_id, data) in changes.withheld_session_info {
                for (session_id, content) in data {
                    withheld_info
                        .entry(room_id.to_owned())
                        .or_default()
                        .insert(session_id, content);
                }
            }
        }

        if !changes.room_settings.is_empty() {
            self.room_settings.write().extend(changes.room_settings);
        }

        Ok(())
    }

    async fn get_sessions(&self, sender_key: &Curve25519PublicKey) -> Result<Option<Vec<Session>>> {
        let Some(pickles) = self.sessions.read().get(&sender_key.to_base64()).cloned() else {
            return Ok(None);
        };

        let account = self.get_static_account()?;

        let sessions = pickles
            .values()
            .map(|serialized_pickle| {
                let pickle: PickledSession = serde_json::from_str(serialized_pickle)?;

                Ok(Session::from_pickle(
                    account.user_id.clone(),
                    account.device_id.clone(),
                    account.identity_keys.clone(),
                    pickle,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(sessions))
    }

    async fn get_inbound_group_session(
        &self,
        sender_key: &Curve25519PublicKey,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>> {
        let pickle: Option<PickledInboundGroupSession> = self
            .inbound_group_sessions
            .read()
            .get(&sender_key.to_base64())
            .and_then(|m| m.get(session_id))
            .map(|ser| serde_json::from_str(ser))
            .transpose()?;

        Ok(pickle.map(InboundGroupSession::from_pickle))
    }

    async fn get_inbound_group_sessions(&self) -> Result<Vec<InboundGroupSession>> {
        self.load_inbound_group_sessions()
    }

    async fn remove_inbound_group_session(
        &self,
        sender_key: &Curve25519PublicKey,
        session_id: &str,
    ) -> Result<bool> {
        Ok(self
            .inbound_group_sessions
            .write()
            .get_mut(&sender_key.to_base64())
            .and_then(|m| m.remove(session_id))
            .is_some())
    }

    async fn inbound_group_session_counts(&self) -> Result<RoomKeyCounts> {
        let sessions = self.load_inbound_group_sessions()?;
        let backed_up = sessions.iter().filter(|s| s.backed_up()).count();

        Ok(RoomKeyCounts { total: sessions.len(), backed_up })
    }

    async fn inbound_group_sessions_for_backup(
        &self,
        limit: usize,
    ) -> Result<Vec<InboundGroupSession>> {
        Ok(self
            .load_inbound_group_sessions()?
            .into_iter()
            .filter(|s| !s.backed_up())
            .take(limit)
            .collect())
    }

    async fn reset_backup_state(&self) -> Result<()> {
        let sessions = self.load_inbound_group_sessions()?;

        for session in &sessions {
            session.reset_backup_state();
        }

        self.save_inbound_group_sessions(sessions).await
    }

    async fn load_backup_keys(&self) -> Result<BackupKeys> {
        Ok(self.backup_keys.read().await.to_owned())
    }

    async fn get_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<OutboundGroupSession>> {
        Ok(self.outbound_group_sessions.read().get(room_id).cloned())
    }

    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<ReadOnlyDevice>> {
        Ok(self.devices.read().get(user_id).and_then(|d| d.get(device_id)).cloned())
    }

    async fn get_user_devices(
        &self,
        user_id: &UserId,
    ) -> Result<HashMap<OwnedDeviceId, ReadOnlyDevice>> {
        Ok(self.devices.read().get(user_id).cloned().unwrap_or_default())
    }

    async fn is_message_known(&self, message_hash: &OlmMessageHash) -> Result<bool> {
        Ok(self
            .olm_hashes
            .read()
            .get(&message_hash.sender_key)
            .is_some_and(|hashes| hashes.contains(&message_hash.hash)))
    }

    async fn get_withheld_info(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<RoomKeyWithheldContent>> {
        Ok(self.withheld_info.read().get(room_id).and_then(|e| e.get(session_id)).cloned())
    }

    async fn get_room_settings(&self, room_id: &RoomId) -> Result<Option<RoomSettings>> {
        Ok(self.room_settings.read().get(room_id).cloned())
    }
}
