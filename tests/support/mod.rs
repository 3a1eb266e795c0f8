//! Shared fixtures for the database-backed scenario tests.
//!
//! The scenarios need a MongoDB deployment with change streams and
//! transactions (a replica set). They connect through `VC_TEST_URI` and
//! skip silently when the variable is unset, so the unit suites stay
//! runnable without any infrastructure.

#![allow(dead_code)]

use bson::oid::ObjectId;
use bson::{doc, Document};
use futures::TryStreamExt;
use mongodb::{Client, Collection};
use vc::{Result, VersionedCollection};

pub struct TestDb {
    client: Client,
    pub local_db: String,
    pub remote_db: String,
}

impl TestDb {
    /// Connect to the test deployment, or `None` when `VC_TEST_URI` is
    /// not set or the server is unreachable.
    pub async fn connect() -> Option<TestDb> {
        let uri = std::env::var("VC_TEST_URI").ok()?;
        let client = Client::with_uri_str(&uri).await.ok()?;
        client
            .database("admin")
            .run_command(doc! {"ping": 1})
            .await
            .ok()?;

        let suffix = ObjectId::new().to_hex();
        Some(TestDb {
            client,
            local_db: format!("vc_test_{suffix}"),
            remote_db: format!("vc_test_{suffix}_remote"),
        })
    }

    pub async fn local(&self, name: &str) -> Result<VersionedCollection> {
        VersionedCollection::open(self.client.clone(), &self.local_db, name, "local").await
    }

    pub async fn remote(&self, name: &str) -> Result<VersionedCollection> {
        VersionedCollection::open(self.client.clone(), &self.remote_db, name, "remote").await
    }

    /// Raw handle for writing to the local target collection, the way an
    /// application would.
    pub fn target(&self, name: &str) -> Collection<Document> {
        self.client.database(&self.local_db).collection(name)
    }

    pub fn remote_target(&self, name: &str) -> Collection<Document> {
        self.client.database(&self.remote_db).collection(name)
    }

    /// Raw handle on any collection of the local database.
    pub fn raw(&self, collection: &str) -> Collection<Document> {
        self.client.database(&self.local_db).collection(collection)
    }

    pub fn remote_raw(&self, collection: &str) -> Collection<Document> {
        self.client.database(&self.remote_db).collection(collection)
    }

    pub async fn cleanup(self) {
        let _ = self.client.database(&self.local_db).drop().await;
        let _ = self.client.database(&self.remote_db).drop().await;
    }
}

/// All documents of a collection, sorted by id for stable comparison.
pub async fn sorted_contents(collection: &Collection<Document>) -> Vec<Document> {
    collection
        .find(doc! {})
        .sort(doc! {"_id": 1})
        .await
        .expect("find")
        .try_collect()
        .await
        .expect("collect")
}

/// Assert that two collections hold identical documents.
pub async fn assert_collections_equal(a: &Collection<Document>, b: &Collection<Document>) {
    let left = sorted_contents(a).await;
    let right = sorted_contents(b).await;
    assert_eq!(left, right, "{} != {}", a.name(), b.name());
}

/// Like [`assert_collections_equal`], but ignoring the automatic `_id`
/// field and ordering by `sort_key`. Used for stores whose records have
/// no shared identity across databases (branch pointers).
pub async fn assert_records_equal(
    a: &Collection<Document>,
    b: &Collection<Document>,
    sort_key: &str,
) {
    let strip = |mut docs: Vec<Document>| {
        for doc in &mut docs {
            doc.remove("_id");
        }
        docs.sort_by_key(|doc| doc.get_str(sort_key).unwrap_or_default().to_string());
        docs
    };
    let left = strip(sorted_contents(a).await);
    let right = strip(sorted_contents(b).await);
    assert_eq!(left, right, "{} != {}", a.name(), b.name());
}
