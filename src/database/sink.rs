//! Writes records to the store as they come in from the workers.

use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use tokio::{
    sync::{Semaphore, mpsc},
    task::JoinSet,
};
use tracing::{debug, error, warn};

use super::{ServerStore, UpdateResult};
use crate::{config::StorageConfig, processing::ServerRecord, progress::ScanCounters};

/// The longest we'll wait between two attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub struct ResultSink<S> {
    store: Arc<S>,
    counters: Arc<ScanCounters>,
    /// Limits the number of upserts in flight.
    permits: Arc<Semaphore>,
    max_attempts: u32,
    backoff: Duration,
}

impl<S: ServerStore> ResultSink<S> {
    pub fn new(store: Arc<S>, counters: Arc<ScanCounters>, config: &StorageConfig) -> Self {
        Self {
            store,
            counters,
            permits: Arc::new(Semaphore::new(config.max_concurrent_writes.max(1))),
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }

    /// Store records until the channel is closed and every write has
    /// finished.
    pub async fn run(self, mut records: mpsc::Receiver<ServerRecord>) {
        let mut tasks = JoinSet::new();

        while let Some(record) = records.recv().await {
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                break;
            };
            let store = self.store.clone();
            let counters = self.counters.clone();
            let max_attempts = self.max_attempts;
            let backoff = self.backoff;
            tasks.spawn(async move {
                let _permit = permit;
                match upsert_with_retry(store.as_ref(), &record, max_attempts, backoff).await {
                    Some(UpdateResult::Inserted) => {
                        counters.inserted.fetch_add(1, Ordering::Relaxed);
                    }
                    Some(UpdateResult::Updated) => {
                        counters.updated.fetch_add(1, Ordering::Relaxed);
                    }
                    None => {
                        counters.lost.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });

            // don't let finished tasks pile up
            while tasks.try_join_next().is_some() {}
        }

        while tasks.join_next().await.is_some() {}
        debug!("sink finished");
    }
}

/// Upsert the record, retrying with exponential backoff. Returns None if
/// every attempt failed, in which case the record is lost.
pub async fn upsert_with_retry<S: ServerStore>(
    store: &S,
    record: &ServerRecord,
    max_attempts: u32,
    backoff: Duration,
) -> Option<UpdateResult> {
    let mut delay = backoff;
    for attempt in 1..=max_attempts {
        match store.upsert(record).await {
            Ok(result) => return Some(result),
            Err(err) if attempt < max_attempts => {
                warn!(
                    "Failed to store {} (attempt {attempt}/{max_attempts}), retrying in {delay:?}: {err}",
                    record.target
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_BACKOFF);
            }
            Err(err) => {
                error!(
                    "Lost {} after {max_attempts} attempts: {err}",
                    record.target
                );
            }
        }
    }
    None
}

#[cfg(test)]
mod test {
    use std::{
        collections::BTreeSet,
        net::{Ipv4Addr, SocketAddrV4},
        sync::atomic::AtomicU32,
    };

    use chrono::Utc;

    use super::*;
    use crate::database::{CollectServersFilter, MemoryStore};

    fn record(last_octet: u8) -> ServerRecord {
        ServerRecord {
            target: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last_octet), 25565),
            motd_raw: "A Minecraft Server".to_string(),
            motd_formatted: "A Minecraft Server".to_string(),
            players_online: 0,
            players_max: 20,
            player_list: vec![],
            mods: BTreeSet::new(),
            version_name: "1.8.9".to_string(),
            version_protocol: Some(47),
            favicon_hash: None,
            is_online_mode: None,
            enforces_secure_chat: None,
            prevents_chat_reports: None,
            is_legacy: false,
            last_seen: Utc::now(),
        }
    }

    /// Fails the first `failures` upserts.
    struct FlakyStore {
        failures: u32,
        calls: AtomicU32,
        inner: MemoryStore,
    }

    impl ServerStore for FlakyStore {
        async fn upsert(&self, record: &ServerRecord) -> eyre::Result<UpdateResult> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                eyre::bail!("connection reset");
            }
            self.inner.upsert(record).await
        }

        async fn collect_servers(
            &self,
            filter: &CollectServersFilter,
        ) -> eyre::Result<Vec<SocketAddrV4>> {
            self.inner.collect_servers(filter).await
        }
    }

    fn storage_config() -> StorageConfig {
        StorageConfig {
            max_concurrent_writes: 4,
            max_pool_size: 4,
            max_attempts: 3,
            backoff_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let store = FlakyStore {
            failures: 2,
            calls: AtomicU32::new(0),
            inner: MemoryStore::new(),
        };
        let result = upsert_with_retry(&store, &record(1), 3, Duration::from_millis(1)).await;
        assert_eq!(result, Some(UpdateResult::Inserted));
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.inner.len(), 1);
    }

    #[tokio::test]
    async fn test_give_up_after_max_attempts() {
        let store = FlakyStore {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
            inner: MemoryStore::new(),
        };
        let result = upsert_with_retry(&store, &record(1), 3, Duration::from_millis(1)).await;
        assert_eq!(result, None);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert!(store.inner.is_empty());
    }

    #[tokio::test]
    async fn test_sink_upserts_are_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let counters = Arc::new(ScanCounters::default());
        let sink = ResultSink::new(store.clone(), counters.clone(), &storage_config());

        let (tx, rx) = mpsc::channel(16);
        let sink_task = tokio::spawn(sink.run(rx));

        let first = record(2);
        let mut second = record(2);
        second.last_seen = first.last_seen + chrono::Duration::seconds(60);
        second.players_online = 5;

        tx.send(first).await.unwrap();
        tx.send(record(3)).await.unwrap();
        // make sure the first write to 10.0.0.2 finished before the second
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(second.clone()).await.unwrap();
        drop(tx);
        sink_task.await.unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&second.target), Some(second));

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.inserted, 2);
        assert_eq!(snapshot.updated, 1);
        assert_eq!(snapshot.lost, 0);
    }

    #[tokio::test]
    async fn test_sink_counts_lost_records() {
        let store = Arc::new(FlakyStore {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
            inner: MemoryStore::new(),
        });
        let counters = Arc::new(ScanCounters::default());
        let sink = ResultSink::new(store.clone(), counters.clone(), &storage_config());

        let (tx, rx) = mpsc::channel(16);
        let sink_task = tokio::spawn(sink.run(rx));
        tx.send(record(1)).await.unwrap();
        tx.send(record(2)).await.unwrap();
        drop(tx);
        sink_task.await.unwrap();

        assert_eq!(counters.snapshot().lost, 2);
        assert_eq!(store.calls.load(Ordering::SeqCst), 6);
    }
}
