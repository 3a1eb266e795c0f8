//! Push/pull scenarios between two engine instances.
//!
//! Skipped unless `VC_TEST_URI` points at a MongoDB replica set.

mod support;

use bson::{doc, Document};
use support::{assert_collections_equal, assert_records_equal, TestDb};
use vc::error::Error;
use vc::resolver::Resolver;
use vc::VersionId;

/// Headless resolver that always takes the source side.
struct TakeSource;

impl Resolver for TakeSource {
    fn resolve(
        &self,
        _destination: &Document,
        source: &Document,
        _merged: &Document,
    ) -> vc::Result<Option<Document>> {
        Ok(Some(source.clone()))
    }
}

#[tokio::test]
async fn push_then_pull_fast_forward() -> vc::Result<()> {
    let Some(db) = TestDb::connect().await else {
        eprintln!("skipping: VC_TEST_URI not set");
        return Ok(());
    };

    let mut local = db.local("users").await?;
    local.init(None).await?;
    db.target("users")
        .insert_one(doc! {"_id": 1_i64, "name": "A"})
        .await?;
    local.register("v1", None).await?;
    db.target("users")
        .insert_one(doc! {"_id": 2_i64, "name": "B"})
        .await?;
    local.register("v2", None).await?;

    // First push seeds the untracked remote and replicates the history
    // verbatim.
    let mut remote = db.remote("users").await?;
    let pushed = local.push(&mut remote, Some("main")).await?;
    assert_eq!(pushed, 2);
    for store in ["__log_users", "__deltas_users"] {
        assert_collections_equal(&db.raw(store), &db.remote_raw(store)).await;
    }
    assert_records_equal(
        &db.raw("__branches_users"),
        &db.remote_raw("__branches_users"),
        "name",
    )
    .await;
    assert_collections_equal(&db.target("users"), &db.remote_target("users")).await;
    assert_collections_equal(&db.target("users"), &db.remote_raw("__replica_users")).await;

    // Remote advances; the local pull fast-forwards onto its tip.
    db.remote_target("users")
        .insert_one(doc! {"_id": 3_i64, "name": "C"})
        .await?;
    remote.register("v3", None).await?;

    let pulled = local.pull(&mut remote, Some("main")).await?;
    assert_eq!(pulled, 1);
    assert_eq!(local.current().await?, VersionId::new(3, "main"));
    assert_collections_equal(&db.target("users"), &db.remote_target("users")).await;

    // Pulling again is a no-op.
    assert_eq!(local.pull(&mut remote, Some("main")).await?, 0);

    local.close().await;
    remote.close().await;
    db.cleanup().await;
    Ok(())
}

#[tokio::test]
async fn push_refuses_non_fast_forward() -> vc::Result<()> {
    let Some(db) = TestDb::connect().await else {
        eprintln!("skipping: VC_TEST_URI not set");
        return Ok(());
    };

    let mut local = db.local("users").await?;
    local.init(None).await?;
    db.target("users")
        .insert_one(doc! {"_id": 1_i64, "x": 1_i64})
        .await?;
    local.register("v1", None).await?;

    let mut remote = db.remote("users").await?;
    local.push(&mut remote, Some("main")).await?;

    // Both sides register divergent versions.
    db.target("users")
        .replace_one(doc! {"_id": 1_i64}, doc! {"_id": 1_i64, "x": 2_i64})
        .await?;
    local.register("local v2", None).await?;
    db.remote_target("users")
        .replace_one(doc! {"_id": 1_i64}, doc! {"_id": 1_i64, "x": 3_i64})
        .await?;
    remote.register("remote v2", None).await?;

    let denied = local.push(&mut remote, Some("main")).await;
    assert!(matches!(denied, Err(Error::NonFastForward(_))));

    local.close().await;
    remote.close().await;
    db.cleanup().await;
    Ok(())
}

#[tokio::test]
async fn conflicting_pull_records_and_resolves() -> vc::Result<()> {
    let Some(db) = TestDb::connect().await else {
        eprintln!("skipping: VC_TEST_URI not set");
        return Ok(());
    };

    let mut local = db.local("users").await?;
    local.init(None).await?;
    db.target("users")
        .insert_one(doc! {"_id": 1_i64, "x": 1_i64, "same": 1_i64})
        .await?;
    local.register("base", None).await?;

    let mut remote = db.remote("users").await?;
    local.push(&mut remote, Some("main")).await?;

    // The same field diverges on both sides of the shared base.
    db.target("users")
        .replace_one(
            doc! {"_id": 1_i64},
            doc! {"_id": 1_i64, "x": 2_i64, "same": 1_i64},
        )
        .await?;
    local.register("local change", None).await?;
    db.remote_target("users")
        .replace_one(
            doc! {"_id": 1_i64},
            doc! {"_id": 1_i64, "x": 3_i64, "same": 1_i64},
        )
        .await?;
    remote.register("remote change", None).await?;

    let failed = local.pull(&mut remote, Some("main")).await;
    assert!(matches!(failed, Err(Error::AutoMergeFailed(_))));
    assert!(local.status().await?.has_conflicts);

    // One conflict whose merged state keeps the destination value on the
    // conflicted field.
    let conflicts = support::sorted_contents(&db.raw("__conflicts_users")).await;
    assert_eq!(conflicts.len(), 1);
    let merged = conflicts[0].get_document("merged").unwrap();
    assert_eq!(merged.get_i64("x").unwrap(), 2);

    // Registering is blocked until the conflicts are gone.
    assert!(matches!(
        local.register("blocked", None).await,
        Err(Error::UnresolvedConflicts(_))
    ));

    let resolved = local.resolve_conflicts(&TakeSource, false).await?;
    assert!(resolved);
    assert!(!local.status().await?.has_conflicts);
    assert_eq!(
        db.target("users")
            .find_one(doc! {"_id": 1_i64})
            .await?
            .unwrap()
            .get_i64("x")
            .unwrap(),
        3,
        "the resolution took the source side"
    );

    let version = local.register("resolved", None).await?;
    assert!(version.is_some());
    assert!(!local.status().await?.has_conflicts);
    // The staging rebranch is gone.
    assert!(local
        .branches()
        .await?
        .iter()
        .all(|name| !name.starts_with("__rebranched_")));

    local.close().await;
    remote.close().await;
    db.cleanup().await;
    Ok(())
}

#[tokio::test]
async fn divergent_pull_auto_merges_disjoint_fields() -> vc::Result<()> {
    let Some(db) = TestDb::connect().await else {
        eprintln!("skipping: VC_TEST_URI not set");
        return Ok(());
    };

    let mut local = db.local("users").await?;
    local.init(None).await?;
    db.target("users")
        .insert_one(doc! {"_id": 1_i64, "a": 1_i64, "b": 1_i64})
        .await?;
    local.register("base", None).await?;

    let mut remote = db.remote("users").await?;
    local.push(&mut remote, Some("main")).await?;

    // Different fields change on each side; the merge is clean and a
    // combined version is registered automatically.
    db.target("users")
        .replace_one(
            doc! {"_id": 1_i64},
            doc! {"_id": 1_i64, "a": 2_i64, "b": 1_i64},
        )
        .await?;
    local.register("local a", None).await?;
    db.remote_target("users")
        .replace_one(
            doc! {"_id": 1_i64},
            doc! {"_id": 1_i64, "a": 1_i64, "b": 9_i64},
        )
        .await?;
    remote.register("remote b", None).await?;

    local.pull(&mut remote, Some("main")).await?;

    let merged = db
        .target("users")
        .find_one(doc! {"_id": 1_i64})
        .await?
        .unwrap();
    assert_eq!(merged.get_i64("a").unwrap(), 2);
    assert_eq!(merged.get_i64("b").unwrap(), 9);
    assert_eq!(local.current().await?, VersionId::new(3, "main"));
    assert!(!local.status().await?.has_conflicts);

    local.close().await;
    remote.close().await;
    db.cleanup().await;
    Ok(())
}
