//! Client side of the initial bulk pull: drains the frame stream, commits
//! each batch together with its offset advance, and records completion per
//! table so an interrupted pull resumes without duplicating or losing rows.

use anyhow::{
    bail,
    Context,
};
use db::LocalDb;
use futures::StreamExt;
use sql::{
    RawSql,
    SqlRow,
};

use crate::{
    backoff::{
        retry_with_backoff,
        OnlineDetector,
    },
    batch::decode_rows,
    frames::{
        Frame,
        FrameDecoder,
    },
    internal,
    remote::RemoteDb,
    types::PullState,
};

fn insert_pulled_row(table: &str, names: &[String], row: &SqlRow) -> RawSql {
    let mut statement = RawSql::new(format!(
        "INSERT OR REPLACE INTO {table} ({}) VALUES (",
        names.join(", ")
    ));
    for (i, (_, value)) in row.iter().enumerate() {
        if i > 0 {
            statement.push_str(", ");
        }
        statement.bind(value.clone());
    }
    statement.push_str(")");
    statement
}

async fn finish_table(db: &LocalDb, current: &mut Option<(String, u64)>) -> anyhow::Result<()> {
    if let Some((table, offset)) = current.take() {
        db.driver()
            .run(&internal::pull_progress_upsert(&table, PullState::All, offset))
            .await?;
        tracing::debug!(table, rows = offset, "pull complete for table");
    }
    Ok(())
}

/// Runs one pull to completion. Safe to re-run: completed tables are skipped
/// by the server and partially-transferred ones resume at their offset.
pub async fn run_pull(
    db: &LocalDb,
    remote: &dyn RemoteDb,
    online: &OnlineDetector,
) -> anyhow::Result<()> {
    let driver = db.driver().clone();
    let resume = internal::pull_progress(driver.as_ref()).await?;
    let mut stream =
        retry_with_backoff(5, online, || remote.pull(resume.clone())).await?;

    let mut decoder = FrameDecoder::default();
    let mut current: Option<(String, u64)> = None;
    while let Some(chunk) = stream.next().await {
        let bytes = chunk?;
        decoder.feed(&bytes);
        while let Some(frame) = decoder.next_frame()? {
            match frame {
                Frame::Str(name) => {
                    finish_table(db, &mut current).await?;
                    let table = db
                        .schema()
                        .table(&name)
                        .with_context(|| format!("pull announced unknown table {name}"))?
                        .db_name
                        .clone();
                    let offset = resume.get(&table).map(|p| p.next_offset).unwrap_or(0);
                    driver
                        .run(&internal::pull_progress_upsert(
                            &table,
                            PullState::Partial,
                            offset,
                        ))
                        .await?;
                    current = Some((table, offset));
                },
                Frame::Bin(payload) => {
                    let Some((table, offset)) = &mut current else {
                        bail!("binary frame arrived before any table name");
                    };
                    let (names, rows) = decode_rows(&payload)?;
                    if rows.is_empty() {
                        continue;
                    }
                    let mut statements: Vec<RawSql> = rows
                        .iter()
                        .map(|row| insert_pulled_row(table, &names, row))
                        .collect();
                    *offset += rows.len() as u64;
                    statements.push(internal::pull_progress_upsert(
                        table,
                        PullState::Partial,
                        *offset,
                    ));
                    // One transaction per received batch: rows land together
                    // with the cursor advance.
                    driver.batch(&statements).await?;
                    let table = table.clone();
                    db.invalidate_table(&table, &[]);
                },
                Frame::End => {
                    finish_table(db, &mut current).await?;
                    return Ok(());
                },
            }
        }
    }
    bail!("pull stream ended without an end marker");
}
