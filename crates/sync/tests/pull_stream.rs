//! Bulk-pull scenarios: full transfer, resume-after-interrupt without
//! duplicates or losses, multi-table streams, and adaptive batch sizing.

use std::sync::Arc;

use db::LocalDb;
use driver::{
    Driver,
    SqliteDriver,
};
use futures::StreamExt;
use pretty_assertions::assert_eq;
use schema::{
    id,
    integer,
    no_constraints,
    no_indexes,
    table,
    text,
    Schema,
    TableMeta,
};
use sql::{
    row_get,
    sql,
    RawSql,
    SqlValue,
};
use sync::{
    internal,
    pull::run_pull,
    Frame,
    FrameDecoder,
    OnlineDetector,
    PullState,
    RemoteDb,
    RemoteDbConfig,
    SyncServer,
};

fn items() -> TableMeta {
    table(
        "items",
        vec![("id", id()), ("label", text().optional()), ("qty", integer().optional())],
        no_indexes,
        no_constraints,
    )
    .unwrap()
}

fn tags() -> TableMeta {
    table(
        "tags",
        vec![("id", id()), ("word", text().optional())],
        no_indexes,
        no_constraints,
    )
    .unwrap()
}

fn app_schema() -> Schema {
    Schema::new([items(), tags()])
}

async fn seeded_server(rows: usize, config: RemoteDbConfig) -> Arc<SyncServer> {
    let driver = Arc::new(SqliteDriver::open_in_memory().unwrap());
    let server = SyncServer::new(driver, app_schema(), config).await.unwrap();
    for i in 0..rows {
        server
            .driver()
            .run(&sql!(
                "INSERT INTO items (id, label, qty) VALUES ("
                {format!("{i:026}")} ", " {format!("item-{i}")} ", " {i as i64} ")"
            ))
            .await
            .unwrap();
    }
    server
        .driver()
        .run(&sql!("INSERT INTO tags (id, word) VALUES (" {"t1"} ", " {"blue"} ")"))
        .await
        .unwrap();
    server
}

async fn fresh_client() -> LocalDb {
    let driver = Arc::new(SqliteDriver::open_in_memory().unwrap());
    let db = LocalDb::open(driver, app_schema()).await.unwrap();
    db.driver().exec(internal::SYNC_INIT).await.unwrap();
    db
}

async fn count(db: &LocalDb, table: &str) -> i64 {
    let rows = db
        .driver()
        .run(&RawSql::new(format!("SELECT count(*) AS n FROM {table}")))
        .await
        .unwrap();
    match row_get(&rows[0], "n") {
        Some(SqlValue::Integer(n)) => *n,
        _ => 0,
    }
}

#[tokio::test]
async fn full_pull_transfers_every_table() {
    let server = seeded_server(250, RemoteDbConfig::default()).await;
    let client = fresh_client().await;
    let online = OnlineDetector::new(true);

    run_pull(&client, server.as_ref(), &online).await.unwrap();

    assert_eq!(count(&client, "items").await, 250);
    assert_eq!(count(&client, "tags").await, 1);

    let progress = internal::pull_progress(client.driver().as_ref()).await.unwrap();
    assert_eq!(progress["items"].state, PullState::All);
    assert_eq!(progress["tags"].state, PullState::All);
}

#[tokio::test]
async fn resumed_pull_has_no_duplicates_and_no_losses() {
    let server = seeded_server(1000, RemoteDbConfig::default()).await;
    let client = fresh_client().await;
    let online = OnlineDetector::new(true);

    // Simulate a crash after 400 rows: the first 400 landed and the cursor
    // was committed with them.
    let first_400 = server
        .driver()
        .run(&RawSql::new(
            "SELECT id, label, qty FROM items ORDER BY id LIMIT 400",
        ))
        .await
        .unwrap();
    for row in &first_400 {
        let mut statement = RawSql::new("INSERT INTO items (id, label, qty) VALUES (");
        for (i, (_, value)) in row.iter().enumerate() {
            if i > 0 {
                statement.push_str(", ");
            }
            statement.bind(value.clone());
        }
        statement.push_str(")");
        client.driver().run(&statement).await.unwrap();
    }
    client
        .driver()
        .run(&internal::pull_progress_upsert("items", PullState::Partial, 400))
        .await
        .unwrap();

    run_pull(&client, server.as_ref(), &online).await.unwrap();

    assert_eq!(count(&client, "items").await, 1000);
    let distinct = client
        .driver()
        .run(&RawSql::new("SELECT count(DISTINCT id) AS n FROM items"))
        .await
        .unwrap();
    assert_eq!(row_get(&distinct[0], "n"), Some(&SqlValue::Integer(1000)));

    let progress = internal::pull_progress(client.driver().as_ref()).await.unwrap();
    assert_eq!(progress["items"].state, PullState::All);
    assert_eq!(progress["items"].next_offset, 1000);
}

#[tokio::test]
async fn completed_tables_are_skipped_on_resume() {
    let server = seeded_server(10, RemoteDbConfig::default()).await;
    let client = fresh_client().await;
    let online = OnlineDetector::new(true);

    run_pull(&client, server.as_ref(), &online).await.unwrap();

    // More rows land on the server afterwards; a re-pull must not disturb
    // completed tables (the mutation feed covers them from here on).
    server
        .driver()
        .run(&sql!(
            "INSERT INTO items (id, label, qty) VALUES (" {"zz-new"} ", " {"late"} ", " {1i64} ")"
        ))
        .await
        .unwrap();
    run_pull(&client, server.as_ref(), &online).await.unwrap();
    assert_eq!(count(&client, "items").await, 10);
}

#[tokio::test]
async fn stream_frames_follow_the_protocol() {
    let server = seeded_server(
        30,
        RemoteDbConfig {
            max_memory_mb: 50,
            initial_batch_rows: 10,
        },
    )
    .await;
    let mut stream = server.pull(Default::default()).await.unwrap();

    let mut decoder = FrameDecoder::default();
    let mut frames = Vec::new();
    while let Some(chunk) = stream.next().await {
        decoder.feed(&chunk.unwrap());
        while let Some(frame) = decoder.next_frame().unwrap() {
            frames.push(frame);
        }
    }

    // Table name, then its binary batches, next table, end marker; no
    // per-table end frame exists.
    assert!(matches!(&frames[0], Frame::Str(name) if name == "items"));
    let mut saw_tags_at = None;
    for (i, frame) in frames.iter().enumerate() {
        if matches!(frame, Frame::Str(name) if name == "tags") {
            saw_tags_at = Some(i);
        }
    }
    let tags_at = saw_tags_at.expect("tags table announced");
    assert!(frames[1..tags_at]
        .iter()
        .all(|f| matches!(f, Frame::Bin(_))));
    assert_eq!(frames.last(), Some(&Frame::End));

    // The 30 items arrive split across several batches (initial size 10,
    // then adapted, capped well above this table's size).
    let item_batches = frames[1..tags_at].len();
    assert!(item_batches >= 2, "expected batched transfer, got {item_batches}");
}

#[tokio::test]
async fn pull_rejects_unknown_tables() {
    // A stream announcing a table outside the declared schema must not be
    // trusted with raw SQL.
    let client = fresh_client().await;

    struct EvilRemote;
    #[async_trait::async_trait]
    impl RemoteDb for EvilRemote {
        async fn pull(&self, _resume: sync::ResumeState) -> anyhow::Result<sync::ByteStream> {
            let frames = vec![
                Ok(sync::frames::encode_frame(&Frame::Str("sqlite_master".into()))),
                Ok(sync::frames::encode_frame(&Frame::End)),
            ];
            Ok(futures::stream::iter(frames).boxed())
        }

        async fn send(
            &self,
            _batches: Vec<sync::MutationBatch>,
        ) -> anyhow::Result<sync::SendResult> {
            unimplemented!()
        }

        async fn get(&self, _after: sync::Timestamp) -> anyhow::Result<Vec<sync::MutationBatch>> {
            unimplemented!()
        }
    }

    let online = OnlineDetector::new(true);
    let err = run_pull(&client, &EvilRemote, &online).await.unwrap_err();
    assert!(err.to_string().contains("unknown table"));
}
