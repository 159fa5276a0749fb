use std::{collections::HashMap, net::SocketAddrV4, sync::Arc};

use parking_lot::Mutex;

use super::{CollectServersFilter, ServerStore, UpdateResult};
use crate::processing::ServerRecord;

/// A store that keeps everything in a map. Used when no database is
/// configured, so results only live as long as the process.
#[derive(Clone, Default)]
pub struct MemoryStore {
    servers: Arc<Mutex<HashMap<SocketAddrV4, ServerRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, target: &SocketAddrV4) -> Option<ServerRecord> {
        self.servers.lock().get(target).cloned()
    }

    pub fn len(&self) -> usize {
        self.servers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.lock().is_empty()
    }

    /// All records, sorted by target.
    pub fn records(&self) -> Vec<ServerRecord> {
        let mut records = self.servers.lock().values().cloned().collect::<Vec<_>>();
        records.sort_by_key(|r| r.target);
        records
    }
}

impl ServerStore for MemoryStore {
    async fn upsert(&self, record: &ServerRecord) -> eyre::Result<UpdateResult> {
        let previous = self.servers.lock().insert(record.target, record.clone());
        Ok(match previous {
            Some(_) => UpdateResult::Updated,
            None => UpdateResult::Inserted,
        })
    }

    async fn collect_servers(
        &self,
        filter: &CollectServersFilter,
    ) -> eyre::Result<Vec<SocketAddrV4>> {
        let mut servers = self
            .servers
            .lock()
            .values()
            .filter(|r| r.last_seen > filter.seen_after && r.last_seen < filter.seen_before)
            .map(|r| (r.last_seen, r.target))
            .collect::<Vec<_>>();
        servers.sort();
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(servers
            .into_iter()
            .take(limit)
            .map(|(_, target)| target)
            .collect())
    }
}
