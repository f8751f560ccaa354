//! Registry of live rooms.
//!
//! ```text
//! RwLock<HashMap<RoomId, Arc<Mutex<Room>>>>
//!        │                      │
//!        │ short-lived          └── held for the whole mutation,
//!        │ (lookup / insert)        one mutation per room at a time
//! ```
//!
//! Lock order is room → map. The map lock is never held while waiting on a
//! room, so rooms never block each other. Archive reads and writes block, so
//! they run on the blocking pool and never under the map lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::error::RoomError;
use crate::protocol::RoomId;
use crate::room::{Room, RoomDefaults};
use crate::storage::{ArchiveError, ArchivedRoom, RoomArchive};

pub type RoomHandle = Arc<Mutex<Room>>;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Per-room broadcast buffer, in messages.
    pub broadcast_capacity: usize,
    /// Accepted operations kept for transforming late deltas.
    pub history_limit: usize,
    /// How long a room must stay empty before it is evicted.
    pub eviction_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            history_limit: 1024,
            eviction_grace: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub active_rooms: usize,
    pub rooms_created: u64,
    pub rooms_restored: u64,
    pub rooms_evicted: u64,
}

struct StoreInner {
    rooms: RwLock<HashMap<RoomId, RoomHandle>>,
    config: SessionConfig,
    archive: Option<Arc<RoomArchive>>,
    rooms_created: AtomicU64,
    rooms_restored: AtomicU64,
    rooms_evicted: AtomicU64,
}

/// Shared handle to the room registry. Cloning is cheap.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Self {
        Self::build(config, None)
    }

    /// Rooms are saved to `archive` on eviction and restored on re-creation.
    pub fn with_archive(config: SessionConfig, archive: Arc<RoomArchive>) -> Self {
        Self::build(config, Some(archive))
    }

    fn build(config: SessionConfig, archive: Option<Arc<RoomArchive>>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                rooms: RwLock::new(HashMap::new()),
                config,
                archive,
                rooms_created: AtomicU64::new(0),
                rooms_restored: AtomicU64::new(0),
                rooms_evicted: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Return the live room, creating it if needed. `defaults` only apply to
    /// a room that is neither live nor archived.
    pub async fn get_or_create(&self, room_id: &RoomId, defaults: &RoomDefaults) -> RoomHandle {
        if let Some(room) = self.inner.rooms.read().await.get(room_id) {
            return room.clone();
        }

        loop {
            let evictions = self.inner.rooms_evicted.load(Ordering::Acquire);
            let restored = self.restore(room_id).await;

            let mut rooms = self.inner.rooms.write().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
            // An eviction since the load may have archived newer state.
            if self.inner.archive.is_some()
                && self.inner.rooms_evicted.load(Ordering::Acquire) != evictions
            {
                continue;
            }

            let handle = Arc::new(Mutex::new(self.build_room(room_id, defaults, restored)));
            rooms.insert(room_id.clone(), handle.clone());
            self.inner.rooms_created.fetch_add(1, Ordering::Relaxed);
            return handle;
        }
    }

    fn build_room(&self, room_id: &RoomId, defaults: &RoomDefaults, restored: Option<ArchivedRoom>) -> Room {
        match restored {
            Some(archived) => {
                self.inner.rooms_restored.fetch_add(1, Ordering::Relaxed);
                log::info!(
                    "Restored room {room_id} from archive at revision {}",
                    archived.revision
                );
                Room::new(
                    archived.room_id,
                    archived.buffer,
                    archived.language,
                    archived.revision,
                    archived.settings,
                    self.inner.config.history_limit,
                    self.inner.config.broadcast_capacity,
                )
            }
            None => {
                log::info!("Created room {room_id}");
                Room::new(
                    room_id.clone(),
                    defaults.buffer.clone(),
                    defaults.language,
                    0,
                    defaults.settings,
                    self.inner.config.history_limit,
                    self.inner.config.broadcast_capacity,
                )
            }
        }
    }

    async fn restore(&self, room_id: &RoomId) -> Option<ArchivedRoom> {
        let archive = self.inner.archive.as_ref()?;
        let key = room_id.clone();
        match on_archive(archive, move |archive| archive.load(&key)).await {
            Ok(found) => found,
            Err(e) => {
                log::error!("Failed to restore room {room_id} from archive: {e}");
                None
            }
        }
    }

    pub async fn get(&self, room_id: &RoomId) -> Option<RoomHandle> {
        self.inner.rooms.read().await.get(room_id).cloned()
    }

    /// Run `f` on the room under its exclusive lock.
    ///
    /// Fails with `RoomNotFound` if the room does not exist or was evicted
    /// while this call waited for the lock.
    pub async fn mutate<T, F>(&self, room_id: &RoomId, f: F) -> Result<T, RoomError>
    where
        F: FnOnce(&mut Room) -> Result<T, RoomError>,
    {
        let handle = self
            .get(room_id)
            .await
            .ok_or_else(|| RoomError::RoomNotFound(room_id.clone()))?;
        let mut room = handle.clone().lock_owned().await;
        if room.evicted {
            return Err(RoomError::RoomNotFound(room_id.clone()));
        }
        let result = f(&mut *room);
        self.settle(&handle, &mut *room);
        result
    }

    /// Like [`mutate`](Self::mutate), but creates the room first if needed.
    pub async fn mutate_or_create<T, F>(
        &self,
        room_id: &RoomId,
        defaults: &RoomDefaults,
        f: F,
    ) -> Result<T, RoomError>
    where
        F: FnOnce(&mut Room) -> Result<T, RoomError>,
    {
        let (handle, mut room) = self.lock_live(room_id, defaults).await;
        let result = f(&mut *room);
        self.settle(&handle, &mut *room);
        result
    }

    async fn lock_live(
        &self,
        room_id: &RoomId,
        defaults: &RoomDefaults,
    ) -> (RoomHandle, OwnedMutexGuard<Room>) {
        loop {
            let handle = self.get_or_create(room_id, defaults).await;
            let room = handle.clone().lock_owned().await;
            if !room.evicted {
                return (handle, room);
            }
            // Lost a race with eviction; the map entry is gone by now.
            drop(room);
            tokio::task::yield_now().await;
        }
    }

    /// Read-only access under the room lock.
    pub async fn read<T, F>(&self, room_id: &RoomId, f: F) -> Result<T, RoomError>
    where
        F: FnOnce(&Room) -> T,
    {
        let handle = self
            .get(room_id)
            .await
            .ok_or_else(|| RoomError::RoomNotFound(room_id.clone()))?;
        let room = handle.lock().await;
        if room.evicted {
            return Err(RoomError::RoomNotFound(room_id.clone()));
        }
        Ok(f(&*room))
    }

    /// Arm or cancel the eviction timer after a mutation.
    fn settle(&self, handle: &RoomHandle, room: &mut Room) {
        let evictable = room.is_evictable();
        if evictable && !room.eviction.scheduled {
            room.eviction.epoch += 1;
            room.eviction.scheduled = true;

            let store = self.clone();
            let handle = handle.clone();
            let epoch = room.eviction.epoch;
            let grace = self.inner.config.eviction_grace;
            log::debug!("Room {} is empty, evicting in {grace:?}", room.id);
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                store.try_evict(&handle, epoch).await;
            });
        } else if !evictable && room.eviction.scheduled {
            room.eviction.epoch += 1;
            room.eviction.scheduled = false;
        }
    }

    /// Evict the room if it is still empty and the timer is still current.
    async fn try_evict(&self, handle: &RoomHandle, epoch: u64) -> bool {
        let mut room = handle.lock().await;
        if room.evicted || room.eviction.epoch != epoch || !room.is_evictable() {
            return false;
        }
        room.evicted = true;

        if let Some(archive) = &self.inner.archive {
            let record = archived(&room);
            if let Err(e) = on_archive(archive, move |archive| archive.save(&record)).await {
                log::error!("Failed to archive room {}: {e}", room.id);
            }
        }

        let mut rooms = self.inner.rooms.write().await;
        if rooms.get(&room.id).is_some_and(|live| Arc::ptr_eq(live, handle)) {
            rooms.remove(&room.id);
        }
        self.inner.rooms_evicted.fetch_add(1, Ordering::Release);
        drop(rooms);
        log::info!("Evicted room {} at revision {}", room.id, room.revision);
        true
    }

    /// Save every live room without evicting it. Returns how many were saved.
    pub async fn archive_all(&self) -> usize {
        let Some(archive) = &self.inner.archive else {
            return 0;
        };
        let handles: Vec<RoomHandle> = self.inner.rooms.read().await.values().cloned().collect();

        let mut saved = 0;
        for handle in handles {
            let room = handle.lock().await;
            if room.evicted {
                continue;
            }
            let record = archived(&room);
            match on_archive(archive, move |archive| archive.save(&record)).await {
                Ok(_) => saved += 1,
                Err(e) => log::error!("Failed to archive room {}: {e}", room.id),
            }
        }
        saved
    }

    pub async fn room_count(&self) -> usize {
        self.inner.rooms.read().await.len()
    }

    pub async fn room_ids(&self) -> Vec<RoomId> {
        let mut ids: Vec<RoomId> = self.inner.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn stats(&self) -> SessionStats {
        SessionStats {
            active_rooms: self.room_count().await,
            rooms_created: self.inner.rooms_created.load(Ordering::Relaxed),
            rooms_restored: self.inner.rooms_restored.load(Ordering::Relaxed),
            rooms_evicted: self.inner.rooms_evicted.load(Ordering::Acquire),
        }
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("config", &self.inner.config)
            .field("archive", &self.inner.archive.is_some())
            .finish()
    }
}

/// Run a RocksDB call on the blocking pool.
async fn on_archive<T, F>(archive: &Arc<RoomArchive>, f: F) -> Result<T, ArchiveError>
where
    F: FnOnce(&RoomArchive) -> Result<T, ArchiveError> + Send + 'static,
    T: Send + 'static,
{
    let archive = archive.clone();
    tokio::task::spawn_blocking(move || f(&archive))
        .await
        .map_err(|e| ArchiveError::Task(e.to_string()))?
}

fn archived(room: &Room) -> ArchivedRoom {
    ArchivedRoom {
        room_id: room.id.clone(),
        buffer: room.buffer.clone(),
        language: room.language,
        revision: room.revision,
        settings: room.settings,
    }
}
