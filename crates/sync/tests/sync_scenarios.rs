//! Multi-client reconciliation scenarios against the in-process server:
//! per-column merges, last-write-wins, rejection with undo, out-of-order
//! arrival, idempotent push, and full convergence.

use std::sync::Arc;

use db::LocalDb;
use driver::{
    Driver,
    SqliteDriver,
};
use pretty_assertions::assert_eq;
use schema::{
    id,
    no_constraints,
    no_indexes,
    table,
    text,
    Schema,
    TableMeta,
};
use serde_json::{
    json,
    Map,
    Value as JsonValue,
};
use sql::{
    RawSql,
    SqlRow,
};
use sync::{
    internal,
    BatchStatus,
    OnlineDetector,
    RemoteDb,
    RemoteDbConfig,
    SyncConfig,
    SyncServer,
    SyncedDb,
};

fn users() -> TableMeta {
    table(
        "users",
        vec![
            ("id", id()),
            ("name", text().optional()),
            ("email", text().optional()),
        ],
        no_indexes,
        no_constraints,
    )
    .unwrap()
}

fn app_schema() -> Schema {
    Schema::new([users()])
}

async fn make_server() -> Arc<SyncServer> {
    let driver = Arc::new(SqliteDriver::open_in_memory().unwrap());
    SyncServer::new(driver, app_schema(), RemoteDbConfig::default())
        .await
        .unwrap()
}

async fn make_client(server: &Arc<SyncServer>, name: &str) -> Arc<SyncedDb> {
    let driver = Arc::new(SqliteDriver::open_in_memory().unwrap());
    let db = LocalDb::open(driver, app_schema()).await.unwrap();
    SyncedDb::new(
        db,
        server.clone() as Arc<dyn RemoteDb>,
        OnlineDetector::new(true),
        SyncConfig {
            node_name: name.to_owned(),
            ..SyncConfig::default()
        },
    )
    .await
    .unwrap()
}

async fn cycle(client: &SyncedDb) {
    client.push_once().await.unwrap();
    client.get_once().await.unwrap();
}

fn row(pairs: &[(&str, JsonValue)]) -> Map<String, JsonValue> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

async fn user_rows(db: &LocalDb) -> Vec<SqlRow> {
    db.driver()
        .run(&RawSql::new("SELECT id, name, email FROM users ORDER BY id"))
        .await
        .unwrap()
}

async fn assert_converged(a: &SyncedDb, b: &SyncedDb) {
    let left = user_rows(a.db()).await;
    let right = user_rows(b.db()).await;
    assert_eq!(left, right, "replicas diverged");
}

#[tokio::test]
async fn disjoint_column_updates_merge_on_all_clients() {
    let server = make_server().await;
    let c1 = make_client(&server, "one").await;
    let c2 = make_client(&server, "two").await;

    let inserted = c1
        .insert_with_undo(
            "users",
            row(&[("name", json!("Original")), ("email", json!("o@x"))]),
        )
        .await
        .unwrap();
    let uid = inserted["id"].as_str().unwrap().to_owned();
    cycle(&c1).await;
    cycle(&c2).await;

    c1.update_with_undo("users", &uid, row(&[("name", json!("Alice"))]))
        .await
        .unwrap();
    c2.update_with_undo("users", &uid, row(&[("email", json!("a@new"))]))
        .await
        .unwrap();

    cycle(&c1).await;
    cycle(&c2).await;
    cycle(&c1).await;

    let rows = user_rows(c1.db()).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(sql::row_get(&rows[0], "name"), Some(&"Alice".into()));
    assert_eq!(sql::row_get(&rows[0], "email"), Some(&"a@new".into()));
    assert_converged(&c1, &c2).await;
}

#[tokio::test]
async fn same_column_updates_resolve_last_writer_wins() {
    let server = make_server().await;
    let c1 = make_client(&server, "one").await;
    let c2 = make_client(&server, "two").await;

    let inserted = c1
        .insert_with_undo("users", row(&[("email", json!("o@x"))]))
        .await
        .unwrap();
    let uid = inserted["id"].as_str().unwrap().to_owned();
    cycle(&c1).await;
    cycle(&c2).await;

    c1.update_with_undo("users", &uid, row(&[("email", json!("first@x"))]))
        .await
        .unwrap();
    c2.update_with_undo("users", &uid, row(&[("email", json!("second@x"))]))
        .await
        .unwrap();

    // c1's write reaches the server first, c2's second: the later server
    // timestamp wins everywhere.
    cycle(&c1).await;
    cycle(&c2).await;
    cycle(&c1).await;

    let rows = user_rows(c1.db()).await;
    assert_eq!(sql::row_get(&rows[0], "email"), Some(&"second@x".into()));
    assert_converged(&c1, &c2).await;
}

#[tokio::test]
async fn out_of_order_insert_update_replays_correctly() {
    let server = make_server().await;
    let c1 = make_client(&server, "one").await;

    let inserted = c1
        .insert_with_undo("users", row(&[("name", json!("Bob"))]))
        .await
        .unwrap();
    let uid = inserted["id"].as_str().unwrap().to_owned();
    c1.update_with_undo("users", &uid, row(&[("name", json!("Bobby"))]))
        .await
        .unwrap();

    // Deliver the update before the insert, as a reordering network would.
    let queued = internal::unpushed_batches(c1.db().driver().as_ref(), 10)
        .await
        .unwrap();
    assert_eq!(queued.len(), 2);
    let insert_batch = queued[0].clone();
    let update_batch = queued[1].clone();
    assert!(insert_batch.id < update_batch.id);

    let first = server.send(vec![update_batch.clone()]).await.unwrap();
    assert_eq!(first.succeeded.len(), 1);
    let second = server.send(vec![insert_batch.clone()]).await.unwrap();
    assert_eq!(second.succeeded.len(), 1);

    // The server state has the update applied over the insert.
    let server_rows = server
        .driver()
        .run(&RawSql::new("SELECT name FROM users"))
        .await
        .unwrap();
    assert_eq!(sql::row_get(&server_rows[0], "name"), Some(&"Bobby".into()));

    // A fresh replica replaying the feed sees insert before update.
    let feed = server.get(0).await.unwrap();
    let ids: Vec<&str> = feed.iter().map(|b| b.id.as_str()).collect();
    let insert_pos = ids.iter().position(|id| *id == insert_batch.id).unwrap();
    let update_pos = ids.iter().position(|id| *id == update_batch.id).unwrap();
    assert!(insert_pos < update_pos);

    let c2 = make_client(&server, "two").await;
    cycle(&c2).await;
    let rows = user_rows(c2.db()).await;
    assert_eq!(sql::row_get(&rows[0], "name"), Some(&"Bobby".into()));
}

#[tokio::test]
async fn duplicate_insert_is_rejected_and_undone() {
    let server = make_server().await;
    let c1 = make_client(&server, "one").await;
    let c2 = make_client(&server, "two").await;

    let uid = "01J8ZZZZZZZZZZZZZZZZZZZZZZ".to_owned();
    c1.insert_with_undo(
        "users",
        row(&[("id", json!(uid.clone())), ("name", json!("First"))]),
    )
    .await
    .unwrap();
    c2.insert_with_undo(
        "users",
        row(&[("id", json!(uid.clone())), ("name", json!("Second"))]),
    )
    .await
    .unwrap();

    cycle(&c1).await;
    // c2's insert of the same primary key is rejected wholesale; its local
    // effect is undone and the batch lands in _failed_mutations.
    cycle(&c2).await;

    let failed = c2
        .db()
        .driver()
        .run(&RawSql::new("SELECT id, reason FROM _failed_mutations"))
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);

    // After the undo, the get loop replayed c1's accepted insert.
    let rows = user_rows(c2.db()).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(sql::row_get(&rows[0], "name"), Some(&"First".into()));
    assert_converged(&c1, &c2).await;
}

#[tokio::test]
async fn update_after_delete_is_rejected() {
    let server = make_server().await;
    let c1 = make_client(&server, "one").await;
    let c2 = make_client(&server, "two").await;

    let inserted = c1
        .insert_with_undo("users", row(&[("name", json!("Target"))]))
        .await
        .unwrap();
    let uid = inserted["id"].as_str().unwrap().to_owned();
    cycle(&c1).await;
    cycle(&c2).await;

    // c1 deletes and syncs; c2 updates the same row before hearing of it.
    c1.delete_with_undo("users", &[uid.clone()]).await.unwrap();
    cycle(&c1).await;
    c2.update_with_undo("users", &uid, row(&[("name", json!("Too late"))]))
        .await
        .unwrap();
    cycle(&c2).await;

    assert_eq!(user_rows(c1.db()).await.len(), 0);
    assert_eq!(user_rows(c2.db()).await.len(), 0);

    let failed = c2
        .db()
        .driver()
        .run(&RawSql::new("SELECT reason FROM _failed_mutations"))
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
}

#[tokio::test]
async fn concurrent_deletes_are_a_noop_not_a_conflict() {
    let server = make_server().await;
    let c1 = make_client(&server, "one").await;
    let c2 = make_client(&server, "two").await;

    let inserted = c1
        .insert_with_undo("users", row(&[("name", json!("Doomed"))]))
        .await
        .unwrap();
    let uid = inserted["id"].as_str().unwrap().to_owned();
    cycle(&c1).await;
    cycle(&c2).await;

    c1.delete_with_undo("users", &[uid.clone()]).await.unwrap();
    c2.delete_with_undo("users", &[uid.clone()]).await.unwrap();
    cycle(&c1).await;
    cycle(&c2).await;

    // The second delete acked; nothing failed anywhere.
    let failed = c2
        .db()
        .driver()
        .run(&RawSql::new("SELECT id FROM _failed_mutations"))
        .await
        .unwrap();
    assert!(failed.is_empty());
    assert_eq!(user_rows(c1.db()).await.len(), 0);
    assert_eq!(user_rows(c2.db()).await.len(), 0);
}

#[tokio::test]
async fn resending_an_acked_batch_is_idempotent() {
    let server = make_server().await;
    let c1 = make_client(&server, "one").await;

    c1.insert_with_undo("users", row(&[("name", json!("Once"))]))
        .await
        .unwrap();
    cycle(&c1).await;

    let (batch, status, ts) = internal::queue_lookup(
        c1.db().driver().as_ref(),
        &internal::acked_batches_after(c1.db().driver().as_ref(), 0)
            .await
            .unwrap()[0]
            .id
            .clone(),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(status, BatchStatus::Acked);
    let original_ts = ts.unwrap();

    let resent = server.send(vec![batch]).await.unwrap();
    assert_eq!(resent.succeeded.len(), 1);
    assert_eq!(resent.succeeded[0].server_timestamp_ms, original_ts);

    let rows = server
        .driver()
        .run(&RawSql::new("SELECT count(*) AS n FROM users"))
        .await
        .unwrap();
    assert_eq!(sql::row_get(&rows[0], "n"), Some(&sql::SqlValue::Integer(1)));
}

#[tokio::test]
async fn many_interleaved_writes_converge() {
    let server = make_server().await;
    let c1 = make_client(&server, "one").await;
    let c2 = make_client(&server, "two").await;

    for i in 0..5 {
        c1.insert_with_undo("users", row(&[("name", json!(format!("a{i}")))]))
            .await
            .unwrap();
        c2.insert_with_undo("users", row(&[("name", json!(format!("b{i}")))]))
            .await
            .unwrap();
        if i % 2 == 0 {
            cycle(&c1).await;
        } else {
            cycle(&c2).await;
        }
    }
    for _ in 0..3 {
        cycle(&c1).await;
        cycle(&c2).await;
    }

    let rows = user_rows(c1.db()).await;
    assert_eq!(rows.len(), 10);
    assert_converged(&c1, &c2).await;
}

#[tokio::test]
async fn worker_loop_reaches_synced_state() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let server = make_server().await;
    let c1 = make_client(&server, "one").await;
    let c2 = make_client(&server, "two").await;

    let h1 = c1.spawn();
    let h2 = c2.spawn();

    c1.insert_with_undo("users", row(&[("name", json!("via worker"))]))
        .await
        .unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(10), async {
        c1.wait_for_sync().await.unwrap();
        // Give c2's poll loop a few rounds to observe the feed.
        loop {
            if user_rows(c2.db()).await.len() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("workers did not converge in time");

    assert_eq!(c1.state(), sync::SyncState::Synced);
    assert_converged(&c1, &c2).await;
    h1.abort();
    h2.abort();
}

#[tokio::test]
async fn security_rules_gate_synced_writes() {
    let server = make_server().await;
    let c1 = make_client(&server, "one").await;

    let inserted = c1
        .insert_with_undo("users", row(&[("name", json!("Existing"))]))
        .await
        .unwrap();
    let uid = inserted["id"].as_str().unwrap().to_owned();

    // From here on, writes to users are denied.
    c1.db()
        .security()
        .add_rule("users", db::rule_fn(|analysis, _| !analysis.is_write()));

    let denied = |err: anyhow::Error| {
        matches!(
            err.downcast_ref::<db::DbError>(),
            Some(db::DbError::AuthorizationDenied(_))
        )
    };
    let err = c1
        .insert_with_undo("users", row(&[("name", json!("Blocked"))]))
        .await
        .unwrap_err();
    assert!(denied(err));
    let err = c1
        .update_with_undo("users", &uid, row(&[("name", json!("Blocked"))]))
        .await
        .unwrap_err();
    assert!(denied(err));
    let err = c1.delete_with_undo("users", &[uid.clone()]).await.unwrap_err();
    assert!(denied(err));

    // Nothing was queued or applied beyond the pre-rule insert.
    let queued = internal::unpushed_batches(c1.db().driver().as_ref(), 10)
        .await
        .unwrap();
    assert_eq!(queued.len(), 1);
    let rows = user_rows(c1.db()).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(sql::row_get(&rows[0], "name"), Some(&"Existing".into()));
}

#[tokio::test]
async fn offline_clients_queue_until_reconnect() {
    let server = make_server().await;
    let c1 = make_client(&server, "one").await;
    c1.online_detector().set_online(false);

    c1.insert_with_undo("users", row(&[("name", json!("queued"))]))
        .await
        .unwrap();
    assert!(!c1.push_once().await.unwrap());
    assert!(c1.has_unsynced().await.unwrap());

    c1.online_detector().set_online(true);
    assert!(c1.push_once().await.unwrap());
    assert!(!c1.has_unsynced().await.unwrap());

    let rows = server
        .driver()
        .run(&RawSql::new("SELECT name FROM users"))
        .await
        .unwrap();
    assert_eq!(sql::row_get(&rows[0], "name"), Some(&"queued".into()));
}
