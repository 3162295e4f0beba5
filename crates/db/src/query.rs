//! Typed query builder and executor: translates application-named
//! operations into parameterized SQL, routes them through analysis and
//! security, and decodes result rows back to application values.

use std::sync::Arc;

use anyhow::Context;
use schema::{
    ColumnMeta,
    TableMeta,
};
use serde_json::{
    Map as JsonMap,
    Value as JsonValue,
};
use sql::{
    analyze,
    FilterNode,
    QueryAnalysis,
    RawSql,
    SqlRow,
};

use crate::{
    error::DbError,
    LocalDb,
};

/// A handle to one declared table; all operations go through the owning
/// [`LocalDb`].
#[derive(Clone)]
pub struct TableHandle {
    pub(crate) db: LocalDb,
    pub(crate) table: Arc<TableMeta>,
}

/// How result rows are shaped, per the join rules: flat application names
/// when reading one table, grouped by table name across joins, and flat
/// caller aliases when an explicit column map is given.
#[derive(Clone, Debug)]
enum RowShape {
    FlatApp,
    Grouped,
    Aliased(Vec<(String, String)>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum JoinKind {
    Inner,
    Left,
}

#[derive(Clone)]
struct JoinSpec {
    kind: JoinKind,
    table: Arc<TableMeta>,
    on: FilterNode,
}

#[derive(Clone)]
pub struct SelectBuilder {
    db: LocalDb,
    base: Arc<TableMeta>,
    columns: Option<Vec<(String, String)>>,
    joins: Vec<JoinSpec>,
    filter: Option<FilterNode>,
    order_by: Vec<(String, bool)>,
    group_by: Vec<String>,
    limit: Option<u64>,
    offset: Option<u64>,
}

/// A reactive-cache descriptor for this query: a stable key tuple, the SQL
/// to run, and the tables whose invalidation must refetch it.
#[derive(Clone, Debug)]
pub struct QueryDescriptor {
    pub key: Vec<JsonValue>,
    pub sql: RawSql,
    pub affected_tables: Vec<String>,
}

impl TableHandle {
    pub fn meta(&self) -> &Arc<TableMeta> {
        &self.table
    }

    pub fn select(&self) -> SelectBuilder {
        SelectBuilder {
            db: self.db.clone(),
            base: self.table.clone(),
            columns: None,
            joins: Vec::new(),
            filter: None,
            order_by: Vec::new(),
            group_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    /// Inserts one row: application defaults fill missing optional columns,
    /// required columns must be present, every value runs through its
    /// column's encoder. Returns the completed application row.
    pub async fn insert(&self, row: JsonMap<String, JsonValue>) -> anyhow::Result<JsonMap<String, JsonValue>> {
        let (statement, completed, id) = self.build_insert(row)?;
        self.db.execute_write(&statement, &self.table.db_name, id.as_slice()).await?;
        Ok(completed)
    }

    /// Inserts rows one by one, aggregating results.
    pub async fn insert_many(
        &self,
        rows: Vec<JsonMap<String, JsonValue>>,
    ) -> anyhow::Result<Vec<JsonMap<String, JsonValue>>> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(self.insert(row).await?);
        }
        Ok(out)
    }

    /// Builds the INSERT statement without executing it: returns the
    /// statement, the completed application row (defaults filled) and the
    /// primary-key ids it will create. Used by sync to append the write and
    /// its queue entry in one transaction.
    pub fn build_insert(
        &self,
        mut row: JsonMap<String, JsonValue>,
    ) -> anyhow::Result<(RawSql, JsonMap<String, JsonValue>, Vec<String>)> {
        let mut columns: Vec<&ColumnMeta> = Vec::new();
        let mut values: Vec<(sql::SqlValue, JsonValue)> = Vec::new();
        let mut completed = JsonMap::new();
        let mut missing: Vec<String> = Vec::new();

        for column in &self.table.columns {
            if column.is_virtual() {
                row.remove(&column.name);
                continue;
            }
            match row.remove(&column.name) {
                Some(value) => {
                    let stored = column.encode_value(&value)?;
                    completed.insert(column.name.clone(), value.clone());
                    columns.push(column);
                    values.push((stored, value));
                },
                None => match column.insert_type {
                    schema::InsertType::Required => missing.push(column.name.clone()),
                    schema::InsertType::WithDefault => {
                        if let Some(value) = column.produce_default() {
                            let stored = column.encode_value(&value)?;
                            completed.insert(column.name.clone(), value.clone());
                            columns.push(column);
                            values.push((stored, value));
                        }
                        // Without an app default the storage DEFAULT applies.
                    },
                    schema::InsertType::Optional => {},
                    schema::InsertType::Virtual => unreachable!("virtual filtered above"),
                },
            }
        }
        if let Some(unknown) = row.keys().next() {
            return Err(DbError::Validation(format!(
                "unknown column {unknown} for table {}",
                self.table.name
            ))
            .into());
        }
        if !missing.is_empty() {
            return Err(DbError::MissingRequiredColumns(missing).into());
        }

        if columns.is_empty() {
            let statement =
                RawSql::new(format!("INSERT INTO {} DEFAULT VALUES", self.table.db_name));
            return Ok((statement, completed, Vec::new()));
        }
        let mut statement = RawSql::new(format!(
            "INSERT INTO {} ({}) VALUES (",
            self.table.db_name,
            columns
                .iter()
                .map(|c| c.db_name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ));
        for (i, (stored, app)) in values.into_iter().enumerate() {
            if i > 0 {
                statement.push_str(", ");
            }
            statement.bind_encoded(stored, app);
        }
        statement.push_str(")");

        let id = self
            .table
            .primary_key_column()
            .and_then(|pk| completed.get(&pk.name))
            .and_then(|v| v.as_str())
            .map(|s| vec![s.to_owned()])
            .unwrap_or_default();
        Ok((statement, completed, id))
    }

    /// Updates rows matching `filter`. Columns with an on-update producer
    /// are overwritten on every call.
    pub async fn update(
        &self,
        data: JsonMap<String, JsonValue>,
        filter: Option<FilterNode>,
    ) -> anyhow::Result<()> {
        let statement = self.build_update(data, filter)?;
        self.db.execute_write(&statement, &self.table.db_name, &[]).await
    }

    pub(crate) fn build_update(
        &self,
        mut data: JsonMap<String, JsonValue>,
        filter: Option<FilterNode>,
    ) -> anyhow::Result<RawSql> {
        for column in &self.table.columns {
            if let Some(producer) = &column.app_on_update {
                data.insert(column.name.clone(), producer());
            }
        }
        if data.is_empty() {
            return Err(DbError::Validation("update with no columns".into()).into());
        }
        let mut statement = RawSql::new(format!("UPDATE {} SET ", self.table.db_name));
        for (i, (key, value)) in data.iter().enumerate() {
            let column = self
                .table
                .column(key)
                .ok_or_else(|| DbError::Validation(format!("unknown column {key}")))?;
            if column.is_virtual() {
                return Err(
                    DbError::Validation(format!("column {key} is generated")).into()
                );
            }
            if i > 0 {
                statement.push_str(", ");
            }
            statement.push_str(&format!("{} = ", column.db_name));
            statement.bind_encoded(column.encode_value(value)?, value.clone());
        }
        if let Some(filter) = filter {
            statement.push_str(" WHERE ");
            let resolved = self.resolve_single_table_filter(&filter)?;
            statement.append(&resolved.to_sql());
        }
        Ok(statement)
    }

    pub async fn delete(&self, filter: Option<FilterNode>) -> anyhow::Result<()> {
        let statement = self.build_delete(filter)?;
        self.db.execute_write(&statement, &self.table.db_name, &[]).await
    }

    pub(crate) fn build_delete(&self, filter: Option<FilterNode>) -> anyhow::Result<RawSql> {
        let mut statement = RawSql::new(format!("DELETE FROM {}", self.table.db_name));
        if let Some(filter) = filter {
            statement.push_str(" WHERE ");
            let resolved = self.resolve_single_table_filter(&filter)?;
            statement.append(&resolved.to_sql());
        }
        Ok(statement)
    }

    /// Maps application column names in a filter to storage names, for
    /// single-table write statements.
    fn resolve_single_table_filter(&self, filter: &FilterNode) -> anyhow::Result<FilterNode> {
        map_filter_columns(filter, &|name| {
            let bare = name.rsplit('.').next().unwrap_or(name);
            self.table
                .column(bare)
                .map(|c| c.db_name.clone())
                .ok_or_else(|| {
                    DbError::Validation(format!(
                        "unknown column {name} for table {}",
                        self.table.name
                    ))
                    .into()
                })
        })
    }
}

impl SelectBuilder {
    pub fn columns(mut self, columns: Vec<(impl Into<String>, impl Into<String>)>) -> Self {
        self.columns = Some(
            columns
                .into_iter()
                .map(|(alias, source)| (alias.into(), source.into()))
                .collect(),
        );
        self
    }

    pub fn join(mut self, other: &TableHandle, on: FilterNode) -> Self {
        self.joins.push(JoinSpec {
            kind: JoinKind::Inner,
            table: other.table.clone(),
            on,
        });
        self
    }

    pub fn left_join(mut self, other: &TableHandle, on: FilterNode) -> Self {
        self.joins.push(JoinSpec {
            kind: JoinKind::Left,
            table: other.table.clone(),
            on,
        });
        self
    }

    pub fn filter(mut self, filter: FilterNode) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, desc: bool) -> Self {
        self.order_by.push((column.into(), desc));
        self
    }

    pub fn group_by(mut self, column: impl Into<String>) -> Self {
        self.group_by.push(column.into());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    fn shape(&self) -> RowShape {
        match (&self.columns, self.joins.is_empty()) {
            (Some(columns), _) => RowShape::Aliased(columns.clone()),
            (None, true) => RowShape::FlatApp,
            (None, false) => RowShape::Grouped,
        }
    }

    /// The alias a table is visible under in SQL: derived aliases keep their
    /// application name, everything else its storage name.
    fn sql_name(table: &TableMeta) -> &str {
        if table.aliased_from.is_some() {
            &table.name
        } else {
            &table.db_name
        }
    }

    fn tables(&self) -> Vec<&Arc<TableMeta>> {
        let mut out = vec![&self.base];
        out.extend(self.joins.iter().map(|j| &j.table));
        out
    }

    /// Resolves `appColumn` or `table.appColumn` to a qualified storage
    /// reference.
    fn resolve_ref(&self, reference: &str) -> anyhow::Result<String> {
        let (table_part, column_part) = match reference.split_once('.') {
            Some((t, c)) => (Some(t), c),
            None => (None, reference),
        };
        for table in self.tables() {
            if let Some(t) = table_part {
                if t != table.name && t != table.db_name {
                    continue;
                }
            }
            if let Some(column) = table.column(column_part) {
                return Ok(format!("{}.{}", Self::sql_name(table), column.db_name));
            }
        }
        Err(DbError::Validation(format!("unknown column reference {reference}")).into())
    }

    fn resolve_meta(&self, reference: &str) -> Option<(Arc<TableMeta>, ColumnMeta)> {
        let (table_part, column_part) = match reference.split_once('.') {
            Some((t, c)) => (Some(t), c),
            None => (None, reference),
        };
        for table in self.tables() {
            if let Some(t) = table_part {
                if t != table.name && t != table.db_name {
                    continue;
                }
            }
            if let Some(column) = table.column(column_part) {
                return Some(((*table).clone(), column.clone()));
            }
        }
        None
    }

    pub fn to_sql(&self) -> anyhow::Result<RawSql> {
        let mut statement = RawSql::new("SELECT ");
        let mut first = true;
        let mut push_item = |statement: &mut RawSql, item: String| {
            if !first {
                statement.push_str(", ");
            }
            first = false;
            statement.push_str(&item);
        };
        match self.shape() {
            RowShape::FlatApp => {
                for column in self.base.columns.iter().filter(|c| !c.is_virtual()) {
                    push_item(
                        &mut statement,
                        format!(
                            "{}.{} AS {}",
                            Self::sql_name(&self.base),
                            column.db_name,
                            column.name
                        ),
                    );
                }
            },
            RowShape::Grouped => {
                for table in self.tables() {
                    for column in table.columns.iter().filter(|c| !c.is_virtual()) {
                        push_item(
                            &mut statement,
                            format!(
                                "{}.{} AS {}__{}",
                                Self::sql_name(table),
                                column.db_name,
                                table.name,
                                column.name
                            ),
                        );
                    }
                }
            },
            RowShape::Aliased(columns) => {
                for (alias, source) in &columns {
                    push_item(
                        &mut statement,
                        format!("{} AS {}", self.resolve_ref(source)?, alias),
                    );
                }
            },
        }

        statement.push_str(&format!(" FROM {}", self.base.db_name));
        if self.base.aliased_from.is_some() {
            statement.push_str(&format!(" AS {}", self.base.name));
        }
        for join in &self.joins {
            let keyword = match join.kind {
                JoinKind::Inner => "INNER JOIN",
                JoinKind::Left => "LEFT JOIN",
            };
            statement.push_str(&format!(" {keyword} {}", join.table.db_name));
            if join.table.aliased_from.is_some() {
                statement.push_str(&format!(" AS {}", join.table.name));
            }
            statement.push_str(" ON ");
            let on = self.resolve_filter(&join.on)?;
            statement.append(&on.to_sql());
        }
        if let Some(filter) = &self.filter {
            statement.push_str(" WHERE ");
            let resolved = self.resolve_filter(filter)?;
            statement.append(&resolved.to_sql());
        }
        if !self.group_by.is_empty() {
            let refs: Vec<String> = self
                .group_by
                .iter()
                .map(|c| self.resolve_ref(c))
                .collect::<anyhow::Result<_>>()?;
            statement.push_str(&format!(" GROUP BY {}", refs.join(", ")));
        }
        if !self.order_by.is_empty() {
            let mut refs = Vec::new();
            for (column, desc) in &self.order_by {
                let direction = if *desc { " DESC" } else { "" };
                refs.push(format!("{}{direction}", self.resolve_ref(column)?));
            }
            statement.push_str(&format!(" ORDER BY {}", refs.join(", ")));
        }
        if let Some(limit) = self.limit {
            statement.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = self.offset {
            statement.push_str(&format!(" OFFSET {offset}"));
        }
        Ok(statement)
    }

    fn resolve_filter(&self, filter: &FilterNode) -> anyhow::Result<FilterNode> {
        map_filter_columns(filter, &|name| self.resolve_ref(name))
    }

    /// Parses the built SQL back into an AST, the analyzable form of this
    /// query.
    pub fn to_ast(&self) -> anyhow::Result<sql::ast::Statement> {
        let raw = self.to_sql()?;
        sql::parse_statement(&raw.query).context("builder emitted unparseable SQL")
    }

    pub fn analyze(&self) -> anyhow::Result<QueryAnalysis> {
        let raw = self.to_sql()?;
        Ok(analyze(&raw)?)
    }

    /// Descriptor for the reactive cache: key tuple, SQL and affected
    /// tables.
    pub fn options(&self) -> anyhow::Result<QueryDescriptor> {
        let sql = self.to_sql()?;
        let analysis = analyze(&sql)?;
        let key = vec![
            JsonValue::String(self.base.name.clone()),
            JsonValue::String("select".to_owned()),
            JsonValue::String(sql.query.clone()),
            JsonValue::Array(sql.debug_params.clone()),
        ];
        Ok(QueryDescriptor {
            key,
            sql,
            affected_tables: analysis.table_names().map(str::to_owned).collect(),
        })
    }

    pub async fn execute(&self) -> anyhow::Result<Vec<JsonValue>> {
        let statement = self.to_sql()?;
        let analysis = analyze(&statement)?;
        self.db.inner.security.check(&analysis).await?;
        let rows = self.db.inner.driver.run(&statement).await?;
        let shape = self.shape();
        rows.iter().map(|row| self.decode_row(row, &shape)).collect()
    }

    pub async fn execute_and_take_first(&self) -> anyhow::Result<Option<JsonValue>> {
        let mut rows = self.execute().await?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.remove(0))
        })
    }

    fn decode_row(&self, row: &SqlRow, shape: &RowShape) -> anyhow::Result<JsonValue> {
        match shape {
            RowShape::FlatApp => {
                let mut out = JsonMap::new();
                for (name, value) in row {
                    let column = self
                        .base
                        .column(name)
                        .with_context(|| format!("engine returned unknown column {name}"))?;
                    out.insert(name.clone(), column.decode_value(value)?);
                }
                Ok(JsonValue::Object(out))
            },
            RowShape::Grouped => {
                let mut out = JsonMap::new();
                for (name, value) in row {
                    let (table_name, column_name) = name
                        .split_once("__")
                        .with_context(|| format!("engine returned unknown column {name}"))?;
                    let table = self
                        .tables()
                        .into_iter()
                        .find(|t| t.name == table_name)
                        .with_context(|| format!("unknown table {table_name} in result"))?
                        .clone();
                    let column = table
                        .column(column_name)
                        .with_context(|| format!("unknown column {name} in result"))?;
                    let decoded = column.decode_value(value)?;
                    match out
                        .entry(table_name.to_owned())
                        .or_insert_with(|| JsonValue::Object(JsonMap::new()))
                    {
                        JsonValue::Object(group) => {
                            group.insert(column_name.to_owned(), decoded);
                        },
                        _ => unreachable!("group entries are objects"),
                    }
                }
                Ok(JsonValue::Object(out))
            },
            RowShape::Aliased(columns) => {
                let mut out = JsonMap::new();
                for (name, value) in row {
                    let source = columns
                        .iter()
                        .find(|(alias, _)| alias == name)
                        .map(|(_, source)| source.as_str());
                    let decoded = match source.and_then(|s| self.resolve_meta(s)) {
                        Some((_, column)) => column.decode_value(value)?,
                        None => value.to_json(),
                    };
                    out.insert(name.clone(), decoded);
                }
                Ok(JsonValue::Object(out))
            },
        }
    }
}

/// Rewrites every column reference in a filter tree through `resolve`.
fn map_filter_columns(
    filter: &FilterNode,
    resolve: &dyn Fn(&str) -> anyhow::Result<String>,
) -> anyhow::Result<FilterNode> {
    Ok(match filter {
        FilterNode::Cmp { column, op, value } => FilterNode::Cmp {
            column: resolve(column)?,
            op: *op,
            value: value.clone(),
        },
        FilterNode::In { column, values } => FilterNode::In {
            column: resolve(column)?,
            values: values.clone(),
        },
        FilterNode::Between { column, lo, hi } => FilterNode::Between {
            column: resolve(column)?,
            lo: lo.clone(),
            hi: hi.clone(),
        },
        FilterNode::IsNull { column, negated } => FilterNode::IsNull {
            column: resolve(column)?,
            negated: *negated,
        },
        FilterNode::ColumnCmp { left, op, right } => FilterNode::ColumnCmp {
            left: resolve(left)?,
            op: *op,
            right: resolve(right)?,
        },
        FilterNode::And(children) => FilterNode::And(
            children
                .iter()
                .map(|c| map_filter_columns(c, resolve))
                .collect::<anyhow::Result<_>>()?,
        ),
        FilterNode::Or(children) => FilterNode::Or(
            children
                .iter()
                .map(|c| map_filter_columns(c, resolve))
                .collect::<anyhow::Result<_>>()?,
        ),
        FilterNode::Not(child) => FilterNode::Not(Box::new(map_filter_columns(child, resolve)?)),
        FilterNode::Raw(raw) => FilterNode::Raw(raw.clone()),
    })
}
