//! Per-node streaming listener cache.
//!
//! Holds at most one live streaming connection per [`EndpointKey`]. Creation
//! is serialized per key so concurrent callers share one connection, while
//! different keys never wait on each other. Entries leave the cache only
//! through [`ListenerCache::remove_listener`] and
//! [`ListenerCache::clear_all`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use polar_core::{EndpointKey, Error, Result};
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info};
use uuid::Uuid;

use crate::stream::{StreamConnection, StreamConnector, StreamTarget};

/// A live streaming connection owned by the cache.
pub struct ListenerHandle {
    id: Uuid,
    key: EndpointKey,
    connection: Box<dyn StreamConnection>,
}

impl ListenerHandle {
    fn new(key: EndpointKey, connection: Box<dyn StreamConnection>) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            connection,
        }
    }

    /// Unique id of this connection; a recreated listener gets a new one.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Endpoint this listener is connected to.
    #[must_use]
    pub const fn key(&self) -> EndpointKey {
        self.key
    }

    /// Whether the connection is still open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Receive messages arriving after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.connection.subscribe()
    }

    /// Messages arriving after this call as a stream.
    #[must_use]
    pub fn messages(&self) -> BroadcastStream<String> {
        BroadcastStream::new(self.subscribe())
    }

    fn disconnect(&self) {
        debug!(key = %self.key, id = %self.id, "disconnecting listener");
        self.connection.disconnect();
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// One cache entry. Its lock is held for the whole creation of a connection.
type Slot = Arc<AsyncMutex<Option<Arc<ListenerHandle>>>>;

/// Cache of streaming listeners keyed by endpoint.
pub struct ListenerCache {
    connector: Arc<dyn StreamConnector>,
    slots: Mutex<HashMap<EndpointKey, Slot>>,
}

impl ListenerCache {
    /// Create an empty cache opening connections through `connector`.
    pub fn new(connector: Arc<dyn StreamConnector>) -> Self {
        Self {
            connector,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Get the listener for `key`, connecting to `target` if there is none.
    ///
    /// A cached listener whose connection dropped is replaced. If the entry is
    /// removed while the connection is being opened, the new connection is
    /// closed and a [`Error::Transport`] is returned.
    pub async fn get_listener(
        &self,
        key: EndpointKey,
        target: &StreamTarget,
    ) -> Result<Arc<ListenerHandle>> {
        let slot = self.slot(key);
        let mut entry = slot.lock().await;

        if let Some(handle) = entry.as_ref() {
            if handle.is_connected() && self.is_current(key, &slot) {
                return Ok(Arc::clone(handle));
            }
        }
        if let Some(stale) = entry.take() {
            stale.disconnect();
        }
        if !self.is_current(key, &slot) {
            return Err(evicted(key));
        }

        let connection = match self.connector.connect(target).await {
            Ok(connection) => connection,
            Err(e) => {
                self.discard_if_idle(key, &slot);
                return Err(e);
            }
        };
        let handle = Arc::new(ListenerHandle::new(key, connection));

        if !self.is_current(key, &slot) {
            handle.disconnect();
            return Err(evicted(key));
        }

        info!(%key, id = %handle.id(), url = %target.url, "listener created");
        *entry = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Disconnect and evict the listener for `key`. No-op if absent.
    ///
    /// Waits for an in-flight creation for `key` to finish.
    pub async fn remove_listener(&self, key: EndpointKey) {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        if let Some(slot) = slot {
            release(key, &slot).await;
        }
    }

    /// Disconnect and evict every listener.
    pub async fn clear_all(&self) {
        let drained: Vec<(EndpointKey, Slot)> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (key, slot) in drained {
            release(key, &slot).await;
        }
    }

    /// Whether a live listener is cached for `key`.
    pub async fn contains(&self, key: EndpointKey) -> bool {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned();
        match slot {
            Some(slot) => slot
                .lock()
                .await
                .as_ref()
                .is_some_and(|handle| handle.is_connected()),
            None => false,
        }
    }

    /// Number of keys with an entry, including creations in flight.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the cache has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, key: EndpointKey) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(key).or_default())
    }

    /// Drop the empty entry a failed creation leaves behind, unless another
    /// caller is already waiting on it.
    fn discard_if_idle(&self, key: EndpointKey, slot: &Slot) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map and one held by the failed creator.
        let idle = slots
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && Arc::strong_count(slot) == 2);
        if idle {
            slots.remove(&key);
        }
    }

    fn is_current(&self, key: EndpointKey, slot: &Slot) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }
}

async fn release(key: EndpointKey, slot: &Slot) {
    if let Some(handle) = slot.lock().await.take() {
        handle.disconnect();
        info!(%key, id = %handle.id(), "listener removed");
    }
}

fn evicted(key: EndpointKey) -> Error {
    Error::Transport(format!("listener {key} was removed while connecting"))
}
