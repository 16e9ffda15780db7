//! Schema snapshot cache
//!
//! Introspection is the slowest metadata step of a request, so snapshots are
//! kept per connection identity for a bounded time. A cached snapshot is only
//! ever replaced whole.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

use crate::connection::ConnectionDescriptor;
use crate::schema::SchemaSnapshot;

/// Time-bounded cache of schema snapshots keyed by connection identity
pub struct SchemaCache {
    ttl: Duration,
    /// Snapshot and the moment it was stored
    entries: RwLock<HashMap<String, (Arc<SchemaSnapshot>, Instant)>>,
}

impl SchemaCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Fresh snapshot for the connection, if one is cached
    ///
    /// An expired entry is removed on lookup.
    pub async fn get(&self, descriptor: &ConnectionDescriptor) -> Option<Arc<SchemaSnapshot>> {
        let identity = descriptor.identity();
        {
            let entries = self.entries.read().await;
            let (snapshot, stored) = entries.get(&identity)?;
            if stored.elapsed() <= self.ttl {
                return Some(Arc::clone(snapshot));
            }
        }

        let mut entries = self.entries.write().await;
        // Another task may have refreshed it between the two locks
        match entries.get(&identity) {
            Some((snapshot, stored)) if stored.elapsed() <= self.ttl => Some(Arc::clone(snapshot)),
            Some(_) => {
                entries.remove(&identity);
                debug!(target_database = %descriptor, "cached schema expired");
                None
            }
            None => None,
        }
    }

    /// Store a snapshot, sweeping every expired entry first
    pub async fn insert(&self, descriptor: &ConnectionDescriptor, snapshot: Arc<SchemaSnapshot>) {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, (_, stored)| stored.elapsed() <= self.ttl);
        if entries.len() < before {
            debug!(swept = before - entries.len(), "expired schemas dropped");
        }
        entries.insert(descriptor.identity(), (snapshot, Instant::now()));
    }

    /// Drop the snapshot for one connection
    pub async fn invalidate(&self, descriptor: &ConnectionDescriptor) {
        self.entries.write().await.remove(&descriptor.identity());
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
