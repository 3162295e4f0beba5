//! Extracts the tables, columns and filter predicates a statement touches.
//!
//! The output drives both live-query invalidation (affected-table sets) and
//! the security engine (per-table column/filter context), so it errs on the
//! side of recording too much rather than too little.

use std::collections::HashSet;

use serde::Serialize;

use crate::{
    ast::*,
    parser::parse_statement,
    raw::RawSql,
    ParseError,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum StatementKind {
    Select,
    CompoundSelect,
    Insert,
    Update,
    Delete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl FilterOp {
    fn from_binary(op: BinaryOp) -> Option<FilterOp> {
        match op {
            BinaryOp::Eq => Some(FilterOp::Eq),
            BinaryOp::NotEq => Some(FilterOp::Ne),
            BinaryOp::Lt => Some(FilterOp::Lt),
            BinaryOp::LtEq => Some(FilterOp::Lte),
            BinaryOp::Gt => Some(FilterOp::Gt),
            BinaryOp::GtEq => Some(FilterOp::Gte),
            _ => None,
        }
    }

    /// Mirror for a comparison written literal-first: `5 < a` is `a > 5`.
    fn flipped(self) -> FilterOp {
        match self {
            FilterOp::Eq => FilterOp::Eq,
            FilterOp::Ne => FilterOp::Ne,
            FilterOp::Lt => FilterOp::Gt,
            FilterOp::Lte => FilterOp::Gte,
            FilterOp::Gt => FilterOp::Lt,
            FilterOp::Gte => FilterOp::Lte,
        }
    }
}

/// Right-hand side of an extracted filter: either a literal from the query
/// text or an index into the fragment's params.
#[derive(Clone, Debug, PartialEq)]
pub enum FilterValue {
    Literal(Literal),
    Param(usize),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ColumnFilter {
    pub column: String,
    pub op: FilterOp,
    pub value: FilterValue,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AccessedTable {
    pub name: String,
    pub columns: Vec<String>,
    pub filters: Vec<ColumnFilter>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueryAnalysis {
    pub kind: StatementKind,
    pub accessed_tables: Vec<AccessedTable>,
}

impl QueryAnalysis {
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.accessed_tables.iter().map(|t| t.name.as_str())
    }

    pub fn table(&self, name: &str) -> Option<&AccessedTable> {
        self.accessed_tables.iter().find(|t| t.name == name)
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self.kind,
            StatementKind::Insert | StatementKind::Update | StatementKind::Delete
        )
    }
}

pub fn analyze(raw: &RawSql) -> Result<QueryAnalysis, ParseError> {
    let statement = parse_statement(&raw.query)?;
    Ok(analyze_statement(&statement))
}

pub fn analyze_statement(statement: &Statement) -> QueryAnalysis {
    let mut analyzer = Analyzer::default();
    let kind = match statement {
        Statement::Select(query) => {
            analyzer.query(query, &mut Vec::new());
            if query.is_compound() {
                StatementKind::CompoundSelect
            } else {
                StatementKind::Select
            }
        },
        Statement::Insert(insert) => {
            analyzer.insert(insert);
            StatementKind::Insert
        },
        Statement::Update(update) => {
            analyzer.update(update);
            StatementKind::Update
        },
        Statement::Delete(delete) => {
            analyzer.delete(delete);
            StatementKind::Delete
        },
    };
    QueryAnalysis {
        kind,
        accessed_tables: analyzer.tables,
    }
}

/// One name visible in a FROM scope: `handle` is the alias (or the table name
/// itself), `target` the accessed-table entry it resolves to. Derived
/// subqueries have no target; columns referenced through them belong to the
/// subquery output, whose base tables are captured separately. CTE
/// references are emitted like any other entry but are not base tables, so
/// unqualified columns resolve past them.
#[derive(Clone, Debug)]
struct ScopeEntry {
    handle: String,
    target: Option<String>,
    is_cte: bool,
}

type Scope = Vec<ScopeEntry>;

#[derive(Default)]
struct Analyzer {
    tables: Vec<AccessedTable>,
    cte_names: HashSet<String>,
}

impl Analyzer {
    fn register_table(&mut self, name: &str) {
        if !self.tables.iter().any(|t| t.name == name) {
            self.tables.push(AccessedTable {
                name: name.to_owned(),
                columns: Vec::new(),
                filters: Vec::new(),
            });
        }
    }

    fn record_column(&mut self, table: &str, column: &str) {
        self.register_table(table);
        let entry = self
            .tables
            .iter_mut()
            .find(|t| t.name == table)
            .expect("just registered");
        if !entry.columns.iter().any(|c| c == column) {
            entry.columns.push(column.to_owned());
        }
    }

    fn record_filter(&mut self, table: &str, filter: ColumnFilter) {
        self.register_table(table);
        let entry = self
            .tables
            .iter_mut()
            .find(|t| t.name == table)
            .expect("just registered");
        entry.filters.push(filter);
    }

    /// Resolves a column's owning table: an explicit qualifier is looked up
    /// through the scope stack (falling back to treating it as a table name);
    /// an unqualified column resolves to the single visible base table —
    /// CTE names are excluded from that count — else the first table of the
    /// nearest enclosing FROM context.
    fn resolve_column(&self, column: &ColumnRef, scopes: &[Scope]) -> Option<String> {
        if let Some(qualifier) = &column.table {
            for scope in scopes.iter().rev() {
                if let Some(entry) = scope
                    .iter()
                    .find(|e| e.handle.eq_ignore_ascii_case(qualifier))
                {
                    return entry.target.clone();
                }
            }
            return Some(qualifier.clone());
        }
        for scope in scopes.iter().rev() {
            let targets: Vec<&ScopeEntry> =
                scope.iter().filter(|e| e.target.is_some()).collect();
            if targets.is_empty() {
                continue;
            }
            let base_tables: Vec<&ScopeEntry> =
                targets.iter().filter(|e| !e.is_cte).copied().collect();
            let chosen = match base_tables.as_slice() {
                [only] => *only,
                _ => targets[0],
            };
            return chosen.target.clone();
        }
        None
    }

    // SELECT

    fn query(&mut self, query: &Query, scopes: &mut Vec<Scope>) {
        if let Some(with) = &query.with {
            for cte in &with.ctes {
                self.cte_names.insert(cte.name.to_ascii_lowercase());
            }
        }

        let first_scope = self.select_core(&query.first, scopes);
        for (_, core) in &query.compounds {
            self.select_core(core, scopes);
        }

        // ORDER BY / LIMIT / OFFSET see the first core's FROM.
        scopes.push(first_scope);
        for item in &query.order_by {
            self.expr(&item.expr, scopes, false);
        }
        if let Some(limit) = &query.limit {
            self.expr(limit, scopes, false);
        }
        if let Some(offset) = &query.offset {
            self.expr(offset, scopes, false);
        }
        scopes.pop();

        // CTE bodies are traversed after the query that references them.
        if let Some(with) = &query.with {
            for cte in &with.ctes {
                self.query(&cte.query, &mut Vec::new());
            }
        }
    }

    /// Processes one select core and returns its scope. Registration order:
    /// FROM-chain tables first, then projection subqueries, then derived
    /// FROM subqueries, then ON / WHERE / GROUP BY / HAVING.
    fn select_core(&mut self, core: &SelectCore, scopes: &mut Vec<Scope>) -> Scope {
        let mut scope = Scope::new();
        let mut derived = Vec::new();
        if let Some(from) = &core.from {
            self.enter_factor(&from.first, &mut scope, &mut derived);
            for join in &from.joins {
                self.enter_factor(&join.factor, &mut scope, &mut derived);
            }
        }

        scopes.push(scope);

        for item in &core.projection {
            match item {
                SelectItem::Wildcard(None) => {},
                SelectItem::Wildcard(Some(qualifier)) => {
                    // The table itself was registered from FROM; a stray
                    // qualifier still registers its table.
                    if let Some(target) = self.resolve_column(
                        &ColumnRef {
                            table: Some(qualifier.clone()),
                            name: String::new(),
                        },
                        scopes,
                    ) {
                        self.register_table(&target);
                    }
                },
                SelectItem::Expr { expr, .. } => self.expr(expr, scopes, false),
            }
        }

        for subquery in derived {
            self.query(subquery, scopes);
        }

        if let Some(from) = &core.from {
            for join in &from.joins {
                if let Some(on) = &join.on {
                    self.expr(on, scopes, true);
                }
            }
        }
        if let Some(where_clause) = &core.where_clause {
            self.expr(where_clause, scopes, true);
        }
        for expr in &core.group_by {
            self.expr(expr, scopes, false);
        }
        if let Some(having) = &core.having {
            self.expr(having, scopes, true);
        }

        scopes.pop().expect("scope pushed above")
    }

    fn enter_factor<'a>(
        &mut self,
        factor: &'a TableFactor,
        scope: &mut Scope,
        derived: &mut Vec<&'a Query>,
    ) {
        match factor {
            TableFactor::Table(table) => {
                self.register_table(&table.name);
                scope.push(ScopeEntry {
                    handle: table.alias.clone().unwrap_or_else(|| table.name.clone()),
                    target: Some(table.name.clone()),
                    is_cte: self.cte_names.contains(&table.name.to_ascii_lowercase()),
                });
            },
            TableFactor::Derived { subquery, alias } => {
                if let Some(alias) = alias {
                    scope.push(ScopeEntry {
                        handle: alias.clone(),
                        target: None,
                        is_cte: false,
                    });
                }
                derived.push(subquery);
            },
        }
    }

    // Writes

    fn insert(&mut self, insert: &InsertStatement) {
        self.register_table(&insert.table.name);
        for column in &insert.columns {
            self.record_column(&insert.table.name, column);
        }
        let scope = vec![ScopeEntry {
            handle: insert
                .table
                .alias
                .clone()
                .unwrap_or_else(|| insert.table.name.clone()),
            target: Some(insert.table.name.clone()),
            is_cte: false,
        }];
        let mut scopes = vec![scope];
        match &insert.source {
            InsertSource::Values(rows) => {
                for row in rows {
                    for expr in row {
                        self.expr(expr, &mut scopes, false);
                    }
                }
            },
            InsertSource::Select(query) => self.query(query, &mut Vec::new()),
            InsertSource::DefaultValues => {},
        }
        self.returning(&insert.returning, &mut scopes);
    }

    fn update(&mut self, update: &UpdateStatement) {
        self.register_table(&update.table.name);
        let mut scope = vec![ScopeEntry {
            handle: update
                .table
                .alias
                .clone()
                .unwrap_or_else(|| update.table.name.clone()),
            target: Some(update.table.name.clone()),
            is_cte: false,
        }];
        let mut derived = Vec::new();
        if let Some(from) = &update.from {
            self.enter_factor(&from.first, &mut scope, &mut derived);
            for join in &from.joins {
                self.enter_factor(&join.factor, &mut scope, &mut derived);
            }
        }
        let mut scopes = vec![scope];
        for (column, expr) in &update.assignments {
            self.record_column(&update.table.name, column);
            self.expr(expr, &mut scopes, false);
        }
        for subquery in derived {
            self.query(subquery, &mut scopes);
        }
        if let Some(from) = &update.from {
            for join in &from.joins {
                if let Some(on) = &join.on {
                    self.expr(on, &mut scopes, true);
                }
            }
        }
        if let Some(where_clause) = &update.where_clause {
            self.expr(where_clause, &mut scopes, true);
        }
        self.returning(&update.returning, &mut scopes);
    }

    fn delete(&mut self, delete: &DeleteStatement) {
        self.register_table(&delete.table.name);
        let mut scope = vec![ScopeEntry {
            handle: delete
                .table
                .alias
                .clone()
                .unwrap_or_else(|| delete.table.name.clone()),
            target: Some(delete.table.name.clone()),
            is_cte: false,
        }];
        let mut derived = Vec::new();
        if let Some(using) = &delete.using {
            self.enter_factor(&using.first, &mut scope, &mut derived);
            for join in &using.joins {
                self.enter_factor(&join.factor, &mut scope, &mut derived);
            }
        }
        let mut scopes = vec![scope];
        for subquery in derived {
            self.query(subquery, &mut scopes);
        }
        if let Some(where_clause) = &delete.where_clause {
            self.expr(where_clause, &mut scopes, true);
        }
        self.returning(&delete.returning, &mut scopes);
    }

    fn returning(&mut self, items: &[SelectItem], scopes: &mut Vec<Scope>) {
        for item in items {
            if let SelectItem::Expr { expr, .. } = item {
                self.expr(expr, scopes, false);
            }
        }
    }

    // Expression traversal. `filters` is true in WHERE / ON / HAVING
    // position, where comparisons against literals and params become filter
    // entries.

    fn expr(&mut self, expr: &Expr, scopes: &mut Vec<Scope>, filters: bool) {
        match expr {
            Expr::Column(column) => {
                if let Some(table) = self.resolve_column(column, scopes) {
                    self.record_column(&table, &column.name);
                }
            },
            Expr::Literal(_) | Expr::Param(_) => {},
            Expr::Binary { lhs, op, rhs } => {
                if filters && self.try_extract_filter(lhs, *op, rhs, scopes) {
                    return;
                }
                self.expr(lhs, scopes, filters);
                self.expr(rhs, scopes, filters);
            },
            Expr::Not(inner) | Expr::Neg(inner) | Expr::Nested(inner) => {
                self.expr(inner, scopes, filters);
            },
            Expr::Function { args, .. } => {
                for arg in args {
                    self.expr(arg, scopes, false);
                }
            },
            Expr::Subquery(query) => self.query(query, scopes),
            Expr::InList { expr, list, .. } => {
                self.expr(expr, scopes, false);
                for item in list {
                    self.expr(item, scopes, false);
                }
            },
            Expr::InSubquery { expr, subquery, .. } => {
                self.expr(expr, scopes, false);
                self.query(subquery, scopes);
            },
            Expr::Exists { subquery, .. } => self.query(subquery, scopes),
            Expr::Between { expr, lo, hi, .. } => {
                self.expr(expr, scopes, false);
                self.expr(lo, scopes, false);
                self.expr(hi, scopes, false);
            },
            Expr::IsNull { expr, .. } => self.expr(expr, scopes, false),
        }
    }

    /// Emits a filter for `column ⊕ literal|param` (either orientation).
    /// Column-to-column comparisons are join conditions, not filters. A
    /// HAVING comparison over `agg(column)` attaches to the aggregated
    /// column. Returns true if the comparison was fully handled.
    fn try_extract_filter(
        &mut self,
        lhs: &Expr,
        op: BinaryOp,
        rhs: &Expr,
        scopes: &mut Vec<Scope>,
    ) -> bool {
        let Some(filter_op) = FilterOp::from_binary(op) else {
            return false;
        };
        let column_of = |expr: &Expr| -> Option<ColumnRef> {
            match expr {
                Expr::Column(c) => Some(c.clone()),
                Expr::Function { args, .. } => match args.as_slice() {
                    [Expr::Column(c)] => Some(c.clone()),
                    _ => None,
                },
                _ => None,
            }
        };
        let value_of = |expr: &Expr| -> Option<FilterValue> {
            match expr {
                Expr::Literal(l) => Some(FilterValue::Literal(l.clone())),
                Expr::Param(i) => Some(FilterValue::Param(*i)),
                _ => None,
            }
        };

        if let (Some(column), Some(value)) = (column_of(lhs), value_of(rhs)) {
            if let Some(table) = self.resolve_column(&column, scopes) {
                self.record_column(&table, &column.name);
                self.record_filter(
                    &table,
                    ColumnFilter {
                        column: column.name,
                        op: filter_op,
                        value,
                    },
                );
                return true;
            }
        }
        if let (Some(value), Some(column)) = (value_of(lhs), column_of(rhs)) {
            if let Some(table) = self.resolve_column(&column, scopes) {
                self.record_column(&table, &column.name);
                self.record_filter(
                    &table,
                    ColumnFilter {
                        column: column.name,
                        op: filter_op.flipped(),
                        value,
                    },
                );
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn analyze_str(input: &str) -> QueryAnalysis {
        analyze(&RawSql::new(input)).unwrap()
    }

    fn names(analysis: &QueryAnalysis) -> Vec<&str> {
        analysis.table_names().collect()
    }

    #[test]
    fn captures_columns_across_clauses() {
        let a = analyze_str(
            "SELECT u.name, count(o.id) FROM users u JOIN orders o ON o.user_id = u.id \
             WHERE u.age > 21 GROUP BY u.city HAVING count(o.id) > 3 ORDER BY u.name",
        );
        assert_eq!(a.kind, StatementKind::Select);
        assert_eq!(names(&a), vec!["users", "orders"]);
        let users = a.table("users").unwrap();
        assert_eq!(users.columns, vec!["name", "id", "age", "city"]);
        let orders = a.table("orders").unwrap();
        assert_eq!(orders.columns, vec!["id", "user_id"]);
    }

    #[test]
    fn filter_extraction_literal_and_param() {
        let a = analyze_str("SELECT * FROM t WHERE a = 5 AND b >= ? AND t.c != 'x'");
        let t = a.table("t").unwrap();
        assert_eq!(
            t.filters,
            vec![
                ColumnFilter {
                    column: "a".into(),
                    op: FilterOp::Eq,
                    value: FilterValue::Literal(Literal::Integer(5)),
                },
                ColumnFilter {
                    column: "b".into(),
                    op: FilterOp::Gte,
                    value: FilterValue::Param(0),
                },
                ColumnFilter {
                    column: "c".into(),
                    op: FilterOp::Ne,
                    value: FilterValue::Literal(Literal::String("x".into())),
                },
            ]
        );
    }

    #[test]
    fn column_to_column_comparison_is_not_a_filter() {
        let a = analyze_str("SELECT * FROM a JOIN b ON a.x = b.y WHERE a.x = b.z");
        assert!(a.table("a").unwrap().filters.is_empty());
        assert!(a.table("b").unwrap().filters.is_empty());
        assert_eq!(a.table("a").unwrap().columns, vec!["x"]);
        assert_eq!(a.table("b").unwrap().columns, vec!["y", "z"]);
    }

    #[test]
    fn literal_first_comparison_is_flipped() {
        let a = analyze_str("SELECT * FROM t WHERE 5 < a");
        assert_eq!(
            a.table("t").unwrap().filters,
            vec![ColumnFilter {
                column: "a".into(),
                op: FilterOp::Gt,
                value: FilterValue::Literal(Literal::Integer(5)),
            }]
        );
    }

    #[test]
    fn having_on_aggregate_attaches_to_aggregated_column() {
        let a = analyze_str(
            "SELECT city FROM users GROUP BY city HAVING count(id) > 10",
        );
        let users = a.table("users").unwrap();
        assert_eq!(
            users.filters,
            vec![ColumnFilter {
                column: "id".into(),
                op: FilterOp::Gt,
                value: FilterValue::Literal(Literal::Integer(10)),
            }]
        );
    }

    #[test]
    fn unqualified_columns_resolve_to_single_visible_table() {
        let a = analyze_str("SELECT name FROM users WHERE age = 3");
        let users = a.table("users").unwrap();
        assert_eq!(users.columns, vec!["name", "age"]);
    }

    #[test]
    fn cte_names_are_emitted_alongside_their_base_tables() {
        let a = analyze_str(
            "WITH adults AS (SELECT id FROM users WHERE age >= 18) \
             SELECT adults.id FROM adults",
        );
        assert_eq!(names(&a), vec!["adults", "users"]);
        assert_eq!(a.table("users").unwrap().columns, vec!["id", "age"]);
        assert_eq!(a.table("adults").unwrap().columns, vec!["id"]);
    }

    #[test]
    fn unqualified_columns_resolve_past_cte_names_to_the_lone_base_table() {
        let a = analyze_str(
            "WITH recent AS (SELECT id FROM posts) \
             SELECT title FROM articles, recent WHERE num > 3",
        );
        let articles = a.table("articles").unwrap();
        assert_eq!(articles.columns, vec!["title", "num"]);
        assert_eq!(articles.filters.len(), 1);
        assert!(a.table("recent").unwrap().columns.is_empty());
    }

    #[test]
    fn ordering_from_chain_then_projection_subqueries_then_derived() {
        let a = analyze_str(
            "SELECT (SELECT max(x) FROM m), c.z FROM c, (SELECT y FROM d) sub",
        );
        assert_eq!(names(&a), vec!["c", "m", "d"]);
    }

    #[test]
    fn subquery_positions_are_all_captured() {
        let a = analyze_str(
            "SELECT * FROM t WHERE id IN (SELECT t_id FROM x) \
             AND EXISTS (SELECT 1 FROM y WHERE y.k = t.id)",
        );
        assert_eq!(names(&a), vec!["t", "x", "y"]);
        assert_eq!(a.table("y").unwrap().columns, vec!["k"]);
    }

    #[test]
    fn compound_select_kind_and_tables() {
        let a = analyze_str("SELECT a FROM t1 UNION SELECT b FROM t2");
        assert_eq!(a.kind, StatementKind::CompoundSelect);
        assert_eq!(names(&a), vec!["t1", "t2"]);
    }

    #[test]
    fn insert_records_target_and_columns() {
        let a = analyze_str("INSERT INTO users (id, name) VALUES (?, ?)");
        assert_eq!(a.kind, StatementKind::Insert);
        assert_eq!(a.table("users").unwrap().columns, vec!["id", "name"]);
    }

    #[test]
    fn update_records_target_from_and_filters() {
        let a = analyze_str(
            "UPDATE t SET a = ?, b = s.v FROM s WHERE t.id = s.t_id AND t.kind = 'x'",
        );
        assert_eq!(a.kind, StatementKind::Update);
        assert_eq!(names(&a), vec!["t", "s"]);
        let t = a.table("t").unwrap();
        assert_eq!(t.columns, vec!["a", "b", "id", "kind"]);
        assert_eq!(t.filters.len(), 1);
        assert_eq!(t.filters[0].column, "kind");
    }

    #[test]
    fn delete_records_using_sources() {
        let a = analyze_str("DELETE FROM t USING s WHERE t.id = s.t_id");
        assert_eq!(a.kind, StatementKind::Delete);
        assert_eq!(names(&a), vec!["t", "s"]);
    }

    #[test]
    fn unparseable_input_is_rejected(){
        assert!(analyze(&RawSql::new("MERGE INTO t")).is_err());
    }
}
