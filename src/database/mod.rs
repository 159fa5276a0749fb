pub mod memory;
pub mod sink;

use std::{
    future::Future,
    net::{Ipv4Addr, SocketAddrV4},
};

use bson::{Bson, Document, doc};
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use mongodb::{Client, Collection, IndexModel, options::ClientOptions};
use tracing::{debug, info};

use crate::{config::Config, processing::ServerRecord};

pub use memory::MemoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    Inserted,
    Updated,
}

/// Which servers to collect for rescanning.
#[derive(Debug, Clone)]
pub struct CollectServersFilter {
    /// Only servers last seen after this.
    pub seen_after: DateTime<Utc>,
    /// Only servers last seen before this.
    pub seen_before: DateTime<Utc>,
    pub limit: Option<usize>,
}

/// Durable storage for discovered servers, keyed on `(ip, port)`.
///
/// `upsert` must never create a second document for the same key, even when
/// called concurrently, and the last write wins.
pub trait ServerStore: Send + Sync + 'static {
    fn upsert(
        &self,
        record: &ServerRecord,
    ) -> impl Future<Output = eyre::Result<UpdateResult>> + Send;

    /// Servers matching the filter, oldest `last_seen` first.
    fn collect_servers(
        &self,
        filter: &CollectServersFilter,
    ) -> impl Future<Output = eyre::Result<Vec<SocketAddrV4>>> + Send;
}

#[derive(Clone)]
pub struct Database {
    pub client: Client,
    database_name: String,
    collection: String,
}

impl Database {
    pub async fn connect(mongodb_uri: &str, config: &Config) -> eyre::Result<Self> {
        let mut client_options = ClientOptions::parse(mongodb_uri).await?;
        // independent from the number of workers so we don't overwhelm the database
        client_options.max_pool_size = Some(config.storage.max_pool_size);
        client_options.app_name = Some("mcsweep".to_string());

        let client = Client::with_options(client_options)?;

        // ping the database to make sure it's up
        client
            .database(&config.database_name)
            .run_command(doc! {"ping": 1})
            .await?;
        info!("Connected to MongoDB");

        let db = Self {
            client,
            database_name: config.database_name.clone(),
            collection: config.collection.clone(),
        };

        db.servers_coll()
            .create_index(IndexModel::builder().keys(doc! {"last_seen": 1}).build())
            .await?;

        Ok(db)
    }

    pub fn mcscanner_database(&self) -> mongodb::Database {
        self.client.database(&self.database_name)
    }

    pub fn servers_coll(&self) -> Collection<Document> {
        self.mcscanner_database()
            .collection::<Document>(&self.collection)
    }
}

impl ServerStore for Database {
    async fn upsert(&self, record: &ServerRecord) -> eyre::Result<UpdateResult> {
        let result = self
            .servers_coll()
            .update_one(
                doc! { "_id": record.key() },
                doc! {
                    "$set": record_to_document(record),
                    "$setOnInsert": { "first_seen": to_bson_datetime(record.last_seen) },
                },
            )
            .upsert(true)
            .await?;

        Ok(if result.upserted_id.is_some() {
            UpdateResult::Inserted
        } else {
            UpdateResult::Updated
        })
    }

    async fn collect_servers(
        &self,
        filter: &CollectServersFilter,
    ) -> eyre::Result<Vec<SocketAddrV4>> {
        info!("Collecting servers with filter {filter:?}");

        let coll = self.servers_coll();
        let mut find = coll
            .find(doc! {
                "last_seen": {
                    "$gt": to_bson_datetime(filter.seen_after),
                    "$lt": to_bson_datetime(filter.seen_before),
                }
            })
            .projection(doc! {"addr": 1, "port": 1, "_id": 0})
            .sort(doc! {"last_seen": 1})
            .batch_size(2000);
        if let Some(limit) = filter.limit {
            find = find.limit(limit as i64);
        }
        let mut cursor = find.await?;

        let mut servers = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            let Some(addr) = get_u32(&doc, "addr") else {
                continue;
            };
            let Some(port) = get_u32(&doc, "port") else {
                continue;
            };
            servers.push(SocketAddrV4::new(Ipv4Addr::from(addr), port as u16));

            if servers.len() % 10000 == 0 {
                debug!("Collected {} servers", servers.len());
            }
        }

        Ok(servers)
    }
}

/// Every field of the record, so rediscovering a server overwrites the whole
/// document instead of merging into it.
pub fn record_to_document(r: &ServerRecord) -> Document {
    doc! {
        "ip": r.target.ip().to_string(),
        "addr": u32::from(*r.target.ip()) as i64,
        "port": r.target.port() as i32,
        "motd_raw": r.motd_raw.as_str(),
        "motd_formatted": r.motd_formatted.as_str(),
        "players_online": r.players_online,
        "players_max": r.players_max,
        "player_list": r.player_list.clone(),
        "mods": r.mods.iter().cloned().collect::<Vec<_>>(),
        "version": r.version_name.as_str(),
        "protocol": r.version_protocol,
        "favicon_hash": r.favicon_hash.clone(),
        "online_mode": r.is_online_mode,
        "enforces_secure_chat": r.enforces_secure_chat,
        "prevents_chat_reports": r.prevents_chat_reports,
        "legacy": r.is_legacy,
        "last_seen": to_bson_datetime(r.last_seen),
    }
}

fn to_bson_datetime(t: DateTime<Utc>) -> Bson {
    Bson::DateTime(bson::DateTime::from_millis(t.timestamp_millis()))
}

pub fn get_u32(doc: &Document, key: &str) -> Option<u32> {
    get_i64(doc, key).and_then(|a| u32::try_from(a).ok())
}

pub fn get_i64(doc: &Document, key: &str) -> Option<i64> {
    doc.get(key).and_then(|a| {
        if let Some(addr) = a.as_i32() {
            Some(addr as i64)
        } else {
            a.as_i64()
        }
    })
}
