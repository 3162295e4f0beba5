use anyhow::{
    bail,
    Context,
};
use async_trait::async_trait;
use sql::{
    RawSql,
    SqlRow,
};

use crate::{
    Driver,
    DriverLimits,
    DriverTransaction,
};

/// Wraps a driver whose engine caps bound parameters per statement and
/// statements per batch. Oversized multi-row INSERTs are split into several
/// INSERTs with identical prefix/suffix; oversized batches are chunked and
/// their row results concatenated per original statement index.
pub struct LimitedDriver<D> {
    inner: D,
    limits: DriverLimits,
}

impl<D: Driver> LimitedDriver<D> {
    pub fn new(inner: D, limits: DriverLimits) -> Self {
        Self { inner, limits }
    }

    fn expand(&self, statement: &RawSql) -> anyhow::Result<Vec<RawSql>> {
        match self.limits.max_parameters_per_statement {
            Some(max) if statement.params.len() > max => {
                split_oversized_insert(statement, max)
            },
            _ => Ok(vec![statement.clone()]),
        }
    }
}

#[async_trait]
impl<D: Driver> Driver for LimitedDriver<D> {
    async fn exec(&self, sql_text: &str) -> anyhow::Result<()> {
        self.inner.exec(sql_text).await
    }

    async fn run(&self, statement: &RawSql) -> anyhow::Result<Vec<SqlRow>> {
        let parts = self.expand(statement)?;
        if parts.len() == 1 {
            return self.inner.run(&parts[0]).await;
        }
        // The split parts stand in for one atomic statement.
        let results = self.inner.batch(&parts).await?;
        Ok(results.into_iter().flatten().collect())
    }

    async fn batch(&self, statements: &[RawSql]) -> anyhow::Result<Vec<Vec<SqlRow>>> {
        let mut expanded: Vec<(usize, RawSql)> = Vec::new();
        for (index, statement) in statements.iter().enumerate() {
            for part in self.expand(statement)? {
                expanded.push((index, part));
            }
        }
        let chunk_size = self
            .limits
            .max_statements_per_batch
            .unwrap_or(usize::MAX)
            .max(1);

        let mut results: Vec<Vec<SqlRow>> = vec![Vec::new(); statements.len()];
        for chunk in expanded.chunks(chunk_size) {
            let parts: Vec<RawSql> = chunk.iter().map(|(_, s)| s.clone()).collect();
            let chunk_results = self.inner.batch(&parts).await?;
            for ((index, _), rows) in chunk.iter().zip(chunk_results) {
                results[*index].extend(rows);
            }
        }
        Ok(results)
    }

    async fn begin_transaction(&self) -> anyhow::Result<Box<dyn DriverTransaction>> {
        self.inner.begin_transaction().await
    }

    fn limits(&self) -> DriverLimits {
        self.limits
    }
}

/// Splits a multi-row `INSERT … VALUES (…), (…) …` whose bound parameters
/// exceed `max_params` into several INSERTs with the same prefix and suffix.
/// Fails if the statement is not a splittable VALUES insert or a single value
/// group alone exceeds the cap.
pub fn split_oversized_insert(
    statement: &RawSql,
    max_params: usize,
) -> anyhow::Result<Vec<RawSql>> {
    let query = statement.query.as_str();
    let values_at = find_values_keyword(query)
        .context("statement exceeds the parameter cap and is not a VALUES insert")?;
    let prefix = &query[..values_at];
    let rest = &query[values_at..];

    let (groups, suffix) = parse_value_groups(rest)?;
    if groups.is_empty() {
        bail!("VALUES insert has no value groups");
    }
    let per_group: Vec<usize> = groups.iter().map(|g| placeholder_count(g)).collect();
    let total: usize = per_group.iter().sum();
    if total != statement.params.len() {
        bail!(
            "cannot split: {} placeholders outside VALUES groups",
            statement.params.len().abs_diff(total)
        );
    }

    let mut out = Vec::new();
    let mut start_group = 0;
    let mut param_offset = 0;
    while start_group < groups.len() {
        let mut end_group = start_group;
        let mut chunk_params = 0;
        while end_group < groups.len() && chunk_params + per_group[end_group] <= max_params {
            chunk_params += per_group[end_group];
            end_group += 1;
        }
        if end_group == start_group {
            bail!(
                "one VALUES group carries {} parameters, above the cap of {max_params}",
                per_group[start_group]
            );
        }
        let query = format!("{prefix} {}{suffix}", groups[start_group..end_group].join(", "));
        let mut part = RawSql::with_params(
            query,
            statement.params[param_offset..param_offset + chunk_params].to_vec(),
        );
        part.debug_params = statement.debug_params
            [param_offset.min(statement.debug_params.len())
                ..(param_offset + chunk_params).min(statement.debug_params.len())]
            .to_vec();
        out.push(part);
        param_offset += chunk_params;
        start_group = end_group;
    }
    Ok(out)
}

/// Byte offset just past the top-level VALUES keyword, if any.
fn find_values_keyword(query: &str) -> Option<usize> {
    let bytes = query.as_bytes();
    let mut depth = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' | b'`' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            },
            b'(' => {
                depth += 1;
                i += 1;
            },
            b')' => {
                depth = depth.saturating_sub(1);
                i += 1;
            },
            b'V' | b'v' if depth == 0 => {
                let end = i + 6;
                let boundary_before =
                    i == 0 || !(bytes[i - 1].is_ascii_alphanumeric() || bytes[i - 1] == b'_');
                let boundary_after = end >= bytes.len()
                    || !(bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_');
                if boundary_before
                    && boundary_after
                    && end <= bytes.len()
                    && query[i..end].eq_ignore_ascii_case("VALUES")
                {
                    return Some(end);
                }
                i += 1;
            },
            _ => i += 1,
        }
    }
    None
}

/// Splits `(…), (…) suffix` into the parenthesized group texts and the
/// trailing suffix.
fn parse_value_groups(rest: &str) -> anyhow::Result<(Vec<String>, String)> {
    let bytes = rest.as_bytes();
    let mut groups = Vec::new();
    let mut i = 0;
    loop {
        while i < bytes.len() && (bytes[i] as char).is_whitespace() {
            i += 1;
        }
        if i >= bytes.len() || bytes[i] != b'(' {
            bail!("expected a parenthesized VALUES group");
        }
        let start = i;
        let mut depth = 0usize;
        while i < bytes.len() {
            match bytes[i] {
                b'\'' | b'"' | b'`' => {
                    let quote = bytes[i];
                    i += 1;
                    while i < bytes.len() && bytes[i] != quote {
                        i += 1;
                    }
                },
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                },
                _ => {},
            }
            i += 1;
        }
        if i >= bytes.len() {
            bail!("unbalanced parentheses in VALUES groups");
        }
        i += 1;
        groups.push(rest[start..i].to_owned());
        let mut j = i;
        while j < bytes.len() && (bytes[j] as char).is_whitespace() {
            j += 1;
        }
        if j < bytes.len() && bytes[j] == b',' {
            i = j + 1;
            continue;
        }
        return Ok((groups, rest[i..].to_owned()));
    }
}

fn placeholder_count(text: &str) -> usize {
    RawSql::new(text).placeholder_count()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use sql::SqlValue;

    use super::*;

    fn insert(rows: usize, columns: usize) -> RawSql {
        let group = format!("({})", vec!["?"; columns].join(", "));
        let groups = vec![group; rows].join(", ");
        RawSql::with_params(
            format!("INSERT INTO t (a, b) VALUES {groups}"),
            (0..rows * columns).map(|i| SqlValue::Integer(i as i64)).collect(),
        )
    }

    #[test]
    fn small_inserts_pass_through() {
        let statement = insert(2, 2);
        let parts = split_oversized_insert(&statement, 100).unwrap();
        assert_eq!(parts, vec![statement]);
    }

    #[test]
    fn oversized_insert_splits_by_value_groups() {
        let statement = insert(7, 3);
        let parts = split_oversized_insert(&statement, 9).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].params.len(), 9);
        assert_eq!(parts[1].params.len(), 9);
        assert_eq!(parts[2].params.len(), 3);
        for part in &parts {
            assert!(part.verify());
            assert!(part.query.starts_with("INSERT INTO t (a, b) VALUES ("));
        }
        let all: Vec<SqlValue> = parts.iter().flat_map(|p| p.params.clone()).collect();
        assert_eq!(all, statement.params);
    }

    #[test]
    fn suffix_is_preserved_on_every_part() {
        let mut statement = insert(4, 2);
        statement.query.push_str(" RETURNING id");
        let parts = split_oversized_insert(&statement, 4).unwrap();
        assert_eq!(parts.len(), 2);
        for part in &parts {
            assert!(part.query.ends_with(" RETURNING id"));
        }
    }

    #[test]
    fn single_group_over_cap_fails() {
        let statement = insert(1, 12);
        assert!(split_oversized_insert(&statement, 8).is_err());
    }

    #[test]
    fn non_insert_over_cap_fails() {
        let statement = RawSql::with_params(
            "UPDATE t SET a = ? WHERE b IN (?, ?)",
            vec![SqlValue::Null, SqlValue::Null, SqlValue::Null],
        );
        assert!(split_oversized_insert(&statement, 2).is_err());
    }
}
