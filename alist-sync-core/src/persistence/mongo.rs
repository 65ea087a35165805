//! Document-DB Persistence Handle backend, selected when `Config::
//! mongodb_uri` is set (spec.md §4.3, §6). Three collections: `workers`,
//! `items`, `logs`, matching `original_source/alist_sync/config.py`'s
//! `MongoHandle`. Feature-gated (`mongo`) so a default build has no
//! network-dependent driver (DESIGN.md DR-11).

use std::collections::HashSet;

use async_trait::async_trait;
use mongodb::bson::{doc, to_bson};
use mongodb::options::ReplaceOptions;
use mongodb::{Client, Collection, Database};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::model::{CompletedLog, RemoteItem, Worker};

use super::{FieldValue, PersistenceHandle};

#[derive(Debug, Serialize, Deserialize)]
struct ItemDoc {
    #[serde(rename = "_id")]
    uri: String,
    #[serde(flatten)]
    item: RemoteItem,
}

pub struct MongoStore {
    workers: Collection<Worker>,
    items: Collection<ItemDoc>,
    logs: Collection<CompletedLog>,
}

impl MongoStore {
    pub async fn connect(uri: &str) -> Result<Self> {
        let client =
            Client::with_uri_str(uri).await.map_err(|e| EngineError::Persistence(e.to_string()))?;
        let db: Database = client.default_database().ok_or_else(|| {
            EngineError::Persistence("mongodb_uri must name a default database".to_string())
        })?;
        Ok(MongoStore {
            workers: db.collection("workers"),
            items: db.collection("items"),
            logs: db.collection("logs"),
        })
    }
}

#[async_trait]
impl PersistenceHandle for MongoStore {
    async fn upsert_worker(&self, w: &Worker) -> Result<()> {
        self.workers
            .replace_one(doc! {"id": &w.id}, w)
            .with_options(ReplaceOptions::builder().upsert(true).build())
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn update_worker(&self, id: &str, fields: &[(&str, FieldValue)]) -> Result<()> {
        let mut set_doc = mongodb::bson::Document::new();
        for (name, value) in fields {
            let bson = match value {
                FieldValue::Text(s) => to_bson(s),
                FieldValue::OptText(s) => to_bson(s),
                FieldValue::Int(i) => to_bson(i),
                FieldValue::OptInt(i) => to_bson(i),
                FieldValue::Bool(b) => to_bson(b),
            }
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
            set_doc.insert(*name, bson);
        }
        self.workers
            .update_one(doc! {"id": id}, doc! {"$set": set_doc})
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn delete_worker(&self, id: &str) -> Result<()> {
        self.workers
            .delete_one(doc! {"id": id})
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn get_workers(&self) -> Result<Vec<Worker>> {
        use futures_util::TryStreamExt;
        let mut cursor = self
            .workers
            .find(doc! {})
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        let mut out = Vec::new();
        while let Some(w) = cursor
            .try_next()
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?
        {
            out.push(w);
        }
        Ok(out)
    }

    async fn get_worker(&self, id: &str) -> Result<Option<Worker>> {
        self.workers
            .find_one(doc! {"id": id})
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))
    }

    async fn append_log(&self, log: &CompletedLog) -> Result<()> {
        self.logs
            .insert_one(log)
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn prune_completed_log(&self, retention_days: u32) -> Result<()> {
        let cutoff = chrono::Utc::now().timestamp() - (retention_days as i64) * 86_400;
        self.logs
            .delete_many(doc! {"done_at": {"$lt": cutoff}})
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn upsert_item(&self, uri: &str, item: &RemoteItem) -> Result<()> {
        let doc = ItemDoc {
            uri: uri.to_string(),
            item: item.clone(),
        };
        self.items
            .replace_one(doc! {"_id": uri}, &doc)
            .with_options(ReplaceOptions::builder().upsert(true).build())
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?;
        Ok(())
    }

    async fn get_item(&self, uri: &str) -> Result<Option<RemoteItem>> {
        Ok(self
            .items
            .find_one(doc! {"_id": uri})
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))?
            .map(|d| d.item))
    }

    async fn load_locks(&self) -> Result<HashSet<String>> {
        let workers = self.get_workers().await?;
        let mut locks = HashSet::new();
        for w in workers {
            if let Some(s) = w.source_uri {
                locks.insert(s);
            }
            locks.insert(w.target_uri);
        }
        Ok(locks)
    }
}
