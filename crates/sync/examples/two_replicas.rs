//! Two in-process replicas reconciling through the in-process server.
//!
//! Run with `cargo run -p sync --example two_replicas`.

use std::sync::Arc;

use db::LocalDb;
use driver::SqliteDriver;
use schema::{
    boolean,
    id,
    no_constraints,
    no_indexes,
    table,
    text,
    Schema,
};
use serde_json::json;
use sync::{
    OnlineDetector,
    RemoteDb,
    RemoteDbConfig,
    SyncConfig,
    SyncServer,
    SyncedDb,
};

fn todos_schema() -> Schema {
    Schema::new([table(
        "todos",
        vec![
            ("id", id()),
            ("title", text().not_null()),
            ("done", boolean().default_auto()),
        ],
        no_indexes,
        no_constraints,
    )
    .expect("valid schema")])
}

async fn replica(server: &Arc<SyncServer>, name: &str) -> anyhow::Result<Arc<SyncedDb>> {
    let driver = Arc::new(SqliteDriver::open_in_memory()?);
    let db = LocalDb::open(driver, todos_schema()).await?;
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
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let server_driver = Arc::new(SqliteDriver::open_in_memory()?);
    let server = SyncServer::new(server_driver, todos_schema(), RemoteDbConfig::default()).await?;

    let laptop = replica(&server, "laptop").await?;
    let phone = replica(&server, "phone").await?;

    // A write lands locally first, then syncs.
    let todo = laptop
        .insert_with_undo(
            "todos",
            [("title".to_owned(), json!("water the plants"))]
                .into_iter()
                .collect(),
        )
        .await?;
    println!("laptop wrote: {}", serde_json::to_string(&todo)?);

    laptop.push_once().await?;
    phone.get_once().await?;

    // The phone marks it done; both replicas converge after a sync cycle.
    let todo_id = todo["id"].as_str().expect("ulid id").to_owned();
    phone
        .update_with_undo(
            "todos",
            &todo_id,
            [("done".to_owned(), json!(true))].into_iter().collect(),
        )
        .await?;
    phone.push_once().await?;
    laptop.get_once().await?;

    for (name, replica) in [("laptop", &laptop), ("phone", &phone)] {
        let rows = replica
            .db()
            .table("todos")?
            .select()
            .execute()
            .await?;
        println!("{name} sees: {}", serde_json::to_string(&rows)?);
    }
    Ok(())
}
