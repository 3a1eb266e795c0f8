//! End-to-end versioning scenarios against a live deployment.
//!
//! Skipped unless `VC_TEST_URI` points at a MongoDB replica set.

mod support;

use bson::doc;
use support::{assert_collections_equal, sorted_contents, TestDb};
use vc::VersionId;

#[tokio::test]
async fn basic_register() -> vc::Result<()> {
    let Some(db) = TestDb::connect().await else {
        eprintln!("skipping: VC_TEST_URI not set");
        return Ok(());
    };

    let mut users = db.local("users").await?;
    assert!(users.init(Some("v0")).await?);
    assert!(!users.init(None).await?, "init must be idempotent");

    db.target("users")
        .insert_one(doc! {"_id": 1_i64, "name": "A"})
        .await?;
    let version = users.register("v1", None).await?;
    assert_eq!(version, Some(VersionId::new(1, "main")));

    let status = users.status().await?;
    assert_eq!(status.version, Some(1));
    assert_eq!(status.branch.as_deref(), Some("main"));
    assert!(!status.changed);
    assert!(!status.detached);

    // One log entry on top of the root, one delta for the new document,
    // trackers drained, replica in sync.
    assert_eq!(db.raw("__log_users").count_documents(doc! {}).await?, 2);
    assert_eq!(db.raw("__deltas_users").count_documents(doc! {}).await?, 1);
    assert_eq!(db.raw("__modified_users").count_documents(doc! {}).await?, 0);
    assert_collections_equal(&db.target("users"), &db.raw("__replica_users")).await;

    // Registering again with no changes is a no-op.
    assert_eq!(users.register("again", None).await?, None);

    users.close().await;
    db.cleanup().await;
    Ok(())
}

#[tokio::test]
async fn round_trip_checkout() -> vc::Result<()> {
    let Some(db) = TestDb::connect().await else {
        eprintln!("skipping: VC_TEST_URI not set");
        return Ok(());
    };

    let mut users = db.local("users").await?;
    users.init(None).await?;
    db.target("users")
        .insert_one(doc! {"_id": 1_i64, "name": "A"})
        .await?;
    users.register("v1", None).await?;

    db.target("users")
        .replace_one(
            doc! {"_id": 1_i64},
            doc! {"_id": 1_i64, "name": "A", "x": 1_i64},
        )
        .await?;
    users.register("v2", None).await?;

    users.checkout(Some(0), None).await?;
    assert_eq!(db.target("users").count_documents(doc! {}).await?, 0);
    assert!(users.status().await?.detached);

    users.checkout(Some(2), None).await?;
    let contents = sorted_contents(&db.target("users")).await;
    assert_eq!(
        contents,
        vec![doc! {"_id": 1_i64, "name": "A", "x": 1_i64}]
    );
    assert!(!users.status().await?.detached);

    users.close().await;
    db.cleanup().await;
    Ok(())
}

#[tokio::test]
async fn branch_with_disconnected_delta_trees() -> vc::Result<()> {
    let Some(db) = TestDb::connect().await else {
        eprintln!("skipping: VC_TEST_URI not set");
        return Ok(());
    };

    let mut users = db.local("users").await?;
    users.init(None).await?;

    db.target("users")
        .insert_one(doc! {"_id": 7_i64, "seed": true})
        .await?;
    users.register("v1", None).await?;

    // D3 first exists at (2, main).
    db.target("users")
        .insert_one(doc! {"_id": 3_i64, "name": "D3"})
        .await?;
    users.register("v2", None).await?;

    // An unrelated D3' with the same id, inserted independently on a
    // branch forked below v2.
    users.checkout(Some(1), None).await?;
    users.create_branch("b").await?;
    db.target("users")
        .replace_one(doc! {"_id": 3_i64}, doc! {"_id": 3_i64, "name": "D3'"})
        .upsert(true)
        .await?;
    let on_branch = users.register("1_b", None).await?;
    assert_eq!(on_branch, Some(VersionId::new(0, "b")));

    // Crossing from (2, main) to the branch tip composes through the
    // synthetic identity delta at the fork and lands exactly on D3'.
    users.checkout(Some(2), Some("main")).await?;
    assert_eq!(
        db.target("users")
            .find_one(doc! {"_id": 3_i64})
            .await?
            .unwrap(),
        doc! {"_id": 3_i64, "name": "D3"}
    );
    users.checkout(None, Some("b")).await?;
    assert_eq!(
        db.target("users")
            .find_one(doc! {"_id": 3_i64})
            .await?
            .unwrap(),
        doc! {"_id": 3_i64, "name": "D3'"}
    );

    users.close().await;
    db.cleanup().await;
    Ok(())
}

#[tokio::test]
async fn stash_shelves_and_restores_changes() -> vc::Result<()> {
    let Some(db) = TestDb::connect().await else {
        eprintln!("skipping: VC_TEST_URI not set");
        return Ok(());
    };

    let mut users = db.local("users").await?;
    users.init(None).await?;
    db.target("users")
        .insert_one(doc! {"_id": 1_i64, "x": 1_i64})
        .await?;
    users.register("v1", None).await?;

    db.target("users")
        .replace_one(doc! {"_id": 1_i64}, doc! {"_id": 1_i64, "x": 2_i64})
        .await?;
    assert!(users.stash(false).await?);
    assert!(users.status().await?.has_stash);
    assert_eq!(
        db.target("users")
            .find_one(doc! {"_id": 1_i64})
            .await?
            .unwrap(),
        doc! {"_id": 1_i64, "x": 1_i64},
        "stash must restore the registered state"
    );

    assert!(users.stash_apply().await?);
    assert!(!users.status().await?.has_stash);
    assert_eq!(
        db.target("users")
            .find_one(doc! {"_id": 1_i64})
            .await?
            .unwrap(),
        doc! {"_id": 1_i64, "x": 2_i64}
    );

    // The restored changes register as usual.
    let version = users.register("v2", None).await?;
    assert_eq!(version, Some(VersionId::new(2, "main")));

    users.close().await;
    db.cleanup().await;
    Ok(())
}

#[tokio::test]
async fn listener_fence_captures_a_burst() -> vc::Result<()> {
    let Some(db) = TestDb::connect().await else {
        eprintln!("skipping: VC_TEST_URI not set");
        return Ok(());
    };

    let mut events = db.local("events").await?;
    events.init(None).await?;

    let batch: Vec<_> = (0..1000_i64)
        .map(|i| doc! {"_id": i, "payload": format!("event-{i}")})
        .collect();
    db.target("events").insert_many(batch).await?;

    // All 1000 inserts land in exactly one new version.
    let version = events.register("burst", None).await?;
    assert_eq!(version, Some(VersionId::new(1, "main")));
    assert_eq!(db.raw("__deltas_events").count_documents(doc! {}).await?, 1000);
    assert_eq!(db.raw("__modified_events").count_documents(doc! {}).await?, 0);

    events.checkout(Some(0), None).await?;
    assert_eq!(db.target("events").count_documents(doc! {}).await?, 0);
    events.checkout(Some(1), None).await?;
    assert_eq!(db.target("events").count_documents(doc! {}).await?, 1000);

    events.close().await;
    db.cleanup().await;
    Ok(())
}

#[tokio::test]
async fn delete_version_subtree_prunes_branches() -> vc::Result<()> {
    let Some(db) = TestDb::connect().await else {
        eprintln!("skipping: VC_TEST_URI not set");
        return Ok(());
    };

    let mut users = db.local("users").await?;
    users.init(None).await?;
    for n in 1..=3_i64 {
        db.target("users")
            .insert_one(doc! {"_id": n, "v": n})
            .await?;
        users.register(&format!("v{n}"), None).await?;
    }

    // A branch forking inside the doomed subtree disappears with it.
    users.checkout(Some(2), None).await?;
    users.create_branch("doomed").await?;
    db.target("users")
        .insert_one(doc! {"_id": 9_i64, "v": 9_i64})
        .await?;
    users.register("0_doomed", None).await?;
    users.checkout(None, Some("main")).await?;

    users.delete_version_subtree(2, Some("main")).await?;

    let status = users.status().await?;
    assert_eq!(status.version, Some(1));
    assert!(!users.branches().await?.contains(&"doomed".to_string()));
    assert_eq!(db.raw("__log_users").count_documents(doc! {}).await?, 2);

    users.close().await;
    db.cleanup().await;
    Ok(())
}
