use std::sync::{
    atomic::{
        AtomicUsize,
        Ordering,
    },
    Arc,
};

use db::{
    rule_fn,
    DbError,
    LocalDb,
};
use driver::{
    Driver,
    SqliteDriver,
};
use pretty_assertions::assert_eq;
use schema::{
    boolean,
    date,
    id,
    integer,
    json,
    no_constraints,
    no_indexes,
    table,
    text,
    Schema,
    SchemaError,
    TableMeta,
};
use serde_json::{
    json,
    Map,
    Value as JsonValue,
};
use sql::{
    filter,
    row_get,
    RawSql,
    SqlValue,
};

fn users_table() -> TableMeta {
    table(
        "users",
        vec![
            ("id", id()),
            ("name", text().not_null()),
            ("email", text().optional()),
            ("active", boolean().default_auto()),
            ("settings", json().optional()),
            ("createdAt", date().default_auto()),
        ],
        no_indexes,
        no_constraints,
    )
    .unwrap()
}

fn posts_table() -> TableMeta {
    table(
        "posts",
        vec![
            ("id", id()),
            ("authorId", text().not_null().references("users.id")),
            ("title", text().not_null()),
        ],
        no_indexes,
        no_constraints,
    )
    .unwrap()
}

async fn open_db() -> LocalDb {
    let driver = Arc::new(SqliteDriver::open_in_memory().unwrap());
    LocalDb::open(driver, Schema::new([users_table(), posts_table()]))
        .await
        .unwrap()
}

fn row(pairs: &[(&str, JsonValue)]) -> Map<String, JsonValue> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn insert_fills_defaults_and_round_trips() {
    let db = open_db().await;
    let users = db.table("users").unwrap();
    let inserted = users
        .insert(row(&[("name", json!("Ada")), ("settings", json!({"theme": "dark"}))]))
        .await
        .unwrap();
    assert_eq!(inserted["name"], json!("Ada"));
    assert_eq!(inserted["active"], json!(false));
    assert_eq!(inserted["id"].as_str().unwrap().len(), 26);
    assert!(inserted["createdAt"].as_str().is_some());

    let fetched = users
        .select()
        .filter(filter::eq("name", "Ada"))
        .execute_and_take_first()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched["settings"], json!({"theme": "dark"}));
    assert_eq!(fetched["active"], json!(false));
    assert_eq!(fetched["createdAt"], inserted["createdAt"]);
}

#[tokio::test]
async fn missing_required_columns_fail_listing_them() {
    let db = open_db().await;
    let users = db.table("users").unwrap();
    let err = users.insert(row(&[("email", json!("a@x"))])).await.unwrap_err();
    match err.downcast_ref::<DbError>() {
        Some(DbError::MissingRequiredColumns(columns)) => {
            assert_eq!(columns, &vec!["name".to_string()]);
        },
        other => panic!("expected missing-columns error, got {other:?}"),
    }
}

#[tokio::test]
async fn update_applies_encoders_and_filters() {
    let db = open_db().await;
    let users = db.table("users").unwrap();
    users.insert(row(&[("name", json!("Ada"))])).await.unwrap();
    users.insert(row(&[("name", json!("Grace"))])).await.unwrap();

    users
        .update(
            row(&[("active", json!(true))]),
            Some(filter::eq("name", "Ada")),
        )
        .await
        .unwrap();

    let active = users
        .select()
        .filter(filter::eq("active", true))
        .execute()
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["name"], json!("Ada"));

    users.delete(Some(filter::eq("name", "Grace"))).await.unwrap();
    let remaining = users.select().execute().await.unwrap();
    assert_eq!(remaining.len(), 1);
}

#[tokio::test]
async fn join_shapes_follow_the_rules() {
    let db = open_db().await;
    let users = db.table("users").unwrap();
    let posts = db.table("posts").unwrap();
    let ada = users.insert(row(&[("name", json!("Ada"))])).await.unwrap();
    posts
        .insert(row(&[
            ("authorId", ada["id"].clone()),
            ("title", json!("Hello")),
        ]))
        .await
        .unwrap();

    // No explicit columns + join: grouped by table name.
    let grouped = posts
        .select()
        .join(&users, filter::column_eq("posts.authorId", "users.id"))
        .execute()
        .await
        .unwrap();
    assert_eq!(grouped.len(), 1);
    assert_eq!(grouped[0]["posts"]["title"], json!("Hello"));
    assert_eq!(grouped[0]["users"]["name"], json!("Ada"));

    // Explicit columns: flat rows with the map's keys.
    let aliased = posts
        .select()
        .join(&users, filter::column_eq("posts.authorId", "users.id"))
        .columns(vec![("postTitle", "posts.title"), ("author", "users.name")])
        .execute()
        .await
        .unwrap();
    assert_eq!(aliased[0], json!({"postTitle": "Hello", "author": "Ada"}));

    // No columns, no join: flat application names.
    let flat = users.select().execute().await.unwrap();
    assert_eq!(flat[0]["name"], json!("Ada"));
}

#[tokio::test]
async fn security_rules_gate_operations() {
    let db = open_db().await;
    db.security().add_rule("posts", rule_fn(|_, user| !user.is_anonymous()));
    let posts = db.table("posts").unwrap();

    let err = posts.select().execute().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DbError>(),
        Some(DbError::AuthorizationDenied(_))
    ));

    db.security().set_user_provider(Arc::new(|| db::User {
        id: "u1".into(),
        attributes: JsonValue::Null,
    }));
    posts.select().execute().await.unwrap();
}

#[tokio::test]
async fn writes_invalidate_live_queries_after_commit() {
    let db = open_db().await;
    let users = db.table("users").unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let analysis = users.select().analyze().unwrap();
    let hits2 = hits.clone();
    let _sub = db.live().subscribe(&analysis, move |_| {
        hits2.fetch_add(1, Ordering::SeqCst);
    });

    users.insert(row(&[("name", json!("Ada"))])).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    users
        .update(row(&[("email", json!("ada@x"))]), None)
        .await
        .unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    // A failed write does not invalidate.
    let _ = users.insert(row(&[("email", json!("nope"))])).await;
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn migration_scenario_rename_and_add() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("db.sqlite3");

    {
        let driver = Arc::new(SqliteDriver::open(&path).unwrap());
        let v1 = table(
            "users",
            vec![("id", id()), ("name", text())],
            no_indexes,
            no_constraints,
        )
        .unwrap();
        let db = LocalDb::open(driver, Schema::new([v1])).await.unwrap();
        db.table("users")
            .unwrap()
            .insert(row(&[("name", json!("Ada"))]))
            .await
            .unwrap();
    }

    let driver = Arc::new(SqliteDriver::open(&path).unwrap());
    let v2 = table(
        "users",
        vec![
            ("id", id()),
            ("fullName", text().renamed_from("name")),
            ("age", integer().optional()),
        ],
        no_indexes,
        no_constraints,
    )
    .unwrap();
    let db = LocalDb::open(driver, Schema::new([v2])).await.unwrap();

    // Existing data survives under the renamed column.
    let rows = db.table("users").unwrap().select().execute().await.unwrap();
    assert_eq!(rows[0]["fullName"], json!("Ada"));
    assert_eq!(rows[0]["age"], JsonValue::Null);

    // The stored snapshot was bumped to the new hash.
    let (_, hash) = db.stored_snapshot().await.unwrap().unwrap();
    assert_eq!(hash, schema::SchemaSnapshot::of(db.schema()).hash());
}

#[tokio::test]
async fn migration_scenario_rejected_type_change() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("db.sqlite3");

    {
        let driver = Arc::new(SqliteDriver::open(&path).unwrap());
        let v1 = table(
            "users",
            vec![("id", id()), ("name", text())],
            no_indexes,
            no_constraints,
        )
        .unwrap();
        LocalDb::open(driver, Schema::new([v1])).await.unwrap();
    }

    let driver = Arc::new(SqliteDriver::open(&path).unwrap());
    let before = {
        let rows = driver
            .run(&RawSql::new(
                "SELECT snapshot_hash FROM _migrations WHERE id = 'snapshot'",
            ))
            .await
            .unwrap();
        rows[0].clone()
    };

    let v2 = table(
        "users",
        vec![("id", id()), ("name", integer())],
        no_indexes,
        no_constraints,
    )
    .unwrap();
    let err = LocalDb::open(driver.clone(), Schema::new([v2]))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SchemaError>(),
        Some(SchemaError::ColumnMutationNotSupported { .. })
    ));

    // No DDL was emitted and the stored snapshot is unchanged.
    let after = driver
        .run(&RawSql::new(
            "SELECT snapshot_hash FROM _migrations WHERE id = 'snapshot'",
        ))
        .await
        .unwrap();
    assert_eq!(
        row_get(&before, "snapshot_hash"),
        row_get(&after[0], "snapshot_hash")
    );
}

#[tokio::test]
async fn raw_run_goes_through_the_pipeline() {
    let db = open_db().await;
    let users = db.table("users").unwrap();
    users.insert(row(&[("name", json!("Ada"))])).await.unwrap();

    let rows = db
        .run(&RawSql::with_params(
            "SELECT name FROM users WHERE name = ?",
            vec![SqlValue::Text("Ada".into())],
        ))
        .await
        .unwrap();
    assert_eq!(row_get(&rows[0], "name"), Some(&SqlValue::Text("Ada".into())));

    // Unparseable SQL is an analyzer error, not a driver call.
    assert!(db.run(&RawSql::new("VACUUM INTO nowhere")).await.is_err());
}
