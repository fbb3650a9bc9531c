//! MongoDB document store.

use async_trait::async_trait;
use mongodb::bson::{self, doc, Bson, Document as BsonDocument};
use mongodb::options::{
    ClientOptions, FindOneAndUpdateOptions, IndexOptions, ReplaceOptions, ReturnDocument,
};
use mongodb::{Client, Collection, Database, IndexModel};
use smf_core::config::mask_credentials;
use smf_core::Document;

use super::{DocumentStore, Filter};
use crate::error::BackendError;

pub struct MongoDocumentStore {
    database: Database,
}

impl MongoDocumentStore {
    /// Connect and ping. Fails if the server does not answer.
    pub async fn connect(url: &str, name: &str) -> Result<Self, BackendError> {
        let options = ClientOptions::parse(url)
            .await
            .map_err(|e| BackendError::new("connect", e.to_string()))?;
        let client =
            Client::with_options(options).map_err(|e| BackendError::new("connect", e.to_string()))?;
        let database = client.database(name);
        database
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| BackendError::new("ping", e.to_string()))?;
        tracing::info!(url = %mask_credentials(url), database = name, "connected to document store");
        Ok(Self { database })
    }

    fn collection(&self, name: &str) -> Collection<BsonDocument> {
        self.database.collection(name)
    }
}

fn query(filter: &Filter) -> BsonDocument {
    let mut query = BsonDocument::new();
    query.insert(filter.field, filter.value.as_str());
    query
}

fn to_bson(operation: &'static str, document: Document) -> Result<BsonDocument, BackendError> {
    bson::to_document(&serde_json::Value::Object(document))
        .map_err(|e| BackendError::new(operation, e.to_string()))
}

fn from_bson(mut document: BsonDocument) -> Document {
    document.remove("_id");
    match Bson::Document(document).into_relaxed_extjson() {
        serde_json::Value::Object(map) => map,
        _ => Document::new(),
    }
}

#[async_trait]
impl DocumentStore for MongoDocumentStore {
    async fn find_one(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Option<Document>, BackendError> {
        let found = self
            .collection(collection)
            .find_one(query(filter), None)
            .await
            .map_err(|e| BackendError::new("find_one", e.to_string()))?;
        Ok(found.map(from_bson))
    }

    async fn upsert(
        &self,
        collection: &str,
        filter: &Filter,
        document: Document,
    ) -> Result<(), BackendError> {
        let replacement = to_bson("upsert", document)?;
        let options = ReplaceOptions::builder().upsert(true).build();
        self.collection(collection)
            .replace_one(query(filter), replacement, options)
            .await
            .map_err(|e| BackendError::new("upsert", e.to_string()))?;
        Ok(())
    }

    async fn delete_one(&self, collection: &str, filter: &Filter) -> Result<bool, BackendError> {
        let result = self
            .collection(collection)
            .delete_one(query(filter), None)
            .await
            .map_err(|e| BackendError::new("delete_one", e.to_string()))?;
        Ok(result.deleted_count > 0)
    }

    async fn create_index(
        &self,
        collection: &str,
        field: &'static str,
    ) -> Result<(), BackendError> {
        let mut keys = BsonDocument::new();
        keys.insert(field, 1);
        let model = IndexModel::builder()
            .keys(keys)
            .options(IndexOptions::builder().unique(true).build())
            .build();
        self.collection(collection)
            .create_index(model, None)
            .await
            .map_err(|e| BackendError::new("create_index", e.to_string()))?;
        Ok(())
    }

    async fn unique_identity(&self, counter: &str) -> Result<u64, BackendError> {
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();
        let updated = self
            .collection(super::collections::SMF_COUNT)
            .find_one_and_update(
                doc! { "_id": counter },
                doc! { "$inc": { "count": 1_i64 } },
                options,
            )
            .await
            .map_err(|e| BackendError::new("unique_identity", e.to_string()))?
            .ok_or_else(|| BackendError::new("unique_identity", "counter upsert returned nothing"))?;
        let count = updated
            .get_i64("count")
            .map_err(|e| BackendError::new("unique_identity", e.to_string()))?;
        u64::try_from(count).map_err(|e| BackendError::new("unique_identity", e.to_string()))
    }
}
