#![forbid(unsafe_code)]

// Addressing for worker actors: one live actor per address, created on first
// use, mirroring "get actor by name" semantics of a durable-object runtime.

use super::storage::WorkerRecord;
use super::{WorkerActor, WorkerAddress, WorkerDeps};
use crate::error::StorageError;
use std::collections::HashMap;
use std::sync::RwLock as StdRwLock;
use tracing::{info, warn};

pub struct WorkerDirectory {
    deps: WorkerDeps,
    actors: StdRwLock<HashMap<WorkerAddress, WorkerActor>>,
}

impl WorkerDirectory {
    pub fn new(deps: WorkerDeps) -> Self {
        Self {
            deps,
            actors: StdRwLock::new(HashMap::new()),
        }
    }

    /// Returns the live actor for `address`, creating it if needed.
    pub fn get_or_create(&self, address: &WorkerAddress) -> WorkerActor {
        if let Some(actor) = self.get(address) {
            return actor;
        }
        let mut actors = self.actors.write().unwrap_or_else(|e| e.into_inner());
        actors
            .entry(address.clone())
            .or_insert_with(|| WorkerActor::new(address.clone(), self.deps.clone()))
            .clone()
    }

    pub fn get(&self, address: &WorkerAddress) -> Option<WorkerActor> {
        self.actors.read().unwrap_or_else(|e| e.into_inner()).get(address).cloned()
    }

    pub fn remove(&self, address: &WorkerAddress) -> Option<WorkerActor> {
        self.actors.write().unwrap_or_else(|e| e.into_inner()).remove(address)
    }

    pub fn len(&self) -> usize {
        self.actors.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn all(&self) -> Vec<WorkerActor> {
        self.actors.read().unwrap_or_else(|e| e.into_inner()).values().cloned().collect()
    }

    /// Workers persisted by a previous process, keyed by address.
    pub async fn persisted(&self) -> Result<Vec<(WorkerAddress, WorkerRecord)>, StorageError> {
        let records = self.deps.storage.list().await?;
        Ok(records
            .into_iter()
            .filter_map(|(key, record)| match WorkerAddress::from_storage_key(&key) {
                Some(address) => Some((address, record)),
                None => {
                    warn!("Skipping unparseable worker key {}", key);
                    None
                }
            })
            .collect())
    }

    /// Re-arms the persisted timers of `addresses`. Returns how many were resumed.
    pub async fn resume(&self, addresses: &[WorkerAddress]) -> usize {
        let mut resumed = 0;
        for address in addresses {
            let actor = self.get_or_create(address);
            match actor.resume().await {
                Ok(true) => resumed += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to resume worker {}: {}", address, e),
            }
        }
        if resumed > 0 {
            info!("Resumed {} persisted workers", resumed);
        }
        resumed
    }

    /// Suspends every live actor, keeping persisted state for `recover`.
    pub async fn suspend_all(&self) {
        let actors = self.all();
        for actor in &actors {
            actor.suspend().await;
        }
        info!("Suspended {} workers", actors.len());
    }
}
