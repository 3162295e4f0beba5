use crate::{
    raw::RawSql,
    value::SqlValue,
};

/// Comparison operators usable in a filter tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    Like,
}

impl CmpOp {
    pub fn as_sql(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Lte => "<=",
            CmpOp::Gt => ">",
            CmpOp::Gte => ">=",
            CmpOp::Like => "LIKE",
        }
    }
}

/// A declarative predicate tree that compiles to a [`RawSql`] fragment in
/// WHERE/ON context. Column names are emitted verbatim, so callers pass
/// storage names (optionally table-qualified).
#[derive(Clone, Debug, PartialEq)]
pub enum FilterNode {
    Cmp {
        column: String,
        op: CmpOp,
        value: SqlValue,
    },
    In {
        column: String,
        values: Vec<SqlValue>,
    },
    Between {
        column: String,
        lo: SqlValue,
        hi: SqlValue,
    },
    IsNull {
        column: String,
        negated: bool,
    },
    /// Compares two columns, e.g. a join condition.
    ColumnCmp {
        left: String,
        op: CmpOp,
        right: String,
    },
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
    Not(Box<FilterNode>),
    Raw(RawSql),
}

impl FilterNode {
    pub fn to_sql(&self) -> RawSql {
        match self {
            FilterNode::Cmp { column, op, value } => {
                let mut out = RawSql::new(format!("{column} {} ", op.as_sql()));
                out.bind(value.clone());
                out
            },
            FilterNode::In { column, values } => {
                // An empty IN list matches nothing.
                if values.is_empty() {
                    return RawSql::new("0 = 1");
                }
                let mut out = RawSql::new(format!("{column} IN ("));
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.bind(value.clone());
                }
                out.push_str(")");
                out
            },
            FilterNode::Between { column, lo, hi } => {
                let mut out = RawSql::new(format!("{column} BETWEEN "));
                out.bind(lo.clone());
                out.push_str(" AND ");
                out.bind(hi.clone());
                out
            },
            FilterNode::IsNull { column, negated } => {
                let suffix = if *negated { "IS NOT NULL" } else { "IS NULL" };
                RawSql::new(format!("{column} {suffix}"))
            },
            FilterNode::ColumnCmp { left, op, right } => {
                RawSql::new(format!("{left} {} {right}", op.as_sql()))
            },
            FilterNode::And(children) => Self::join_children(children, " AND ", "1 = 1"),
            FilterNode::Or(children) => Self::join_children(children, " OR ", "0 = 1"),
            FilterNode::Not(child) => {
                let mut out = RawSql::new("NOT (");
                out.append(&child.to_sql());
                out.push_str(")");
                out
            },
            FilterNode::Raw(raw) => raw.clone(),
        }
    }

    fn join_children(children: &[FilterNode], separator: &str, empty: &str) -> RawSql {
        if children.is_empty() {
            return RawSql::new(empty);
        }
        let mut out = RawSql::new("(");
        for (i, child) in children.iter().enumerate() {
            if i > 0 {
                out.push_str(separator);
            }
            out.append(&child.to_sql());
        }
        out.push_str(")");
        out
    }
}

impl From<FilterNode> for RawSql {
    fn from(node: FilterNode) -> Self {
        node.to_sql()
    }
}

impl From<&FilterNode> for RawSql {
    fn from(node: &FilterNode) -> Self {
        node.to_sql()
    }
}

pub fn eq(column: impl Into<String>, value: impl Into<SqlValue>) -> FilterNode {
    cmp(column, CmpOp::Eq, value)
}

pub fn ne(column: impl Into<String>, value: impl Into<SqlValue>) -> FilterNode {
    cmp(column, CmpOp::Ne, value)
}

pub fn lt(column: impl Into<String>, value: impl Into<SqlValue>) -> FilterNode {
    cmp(column, CmpOp::Lt, value)
}

pub fn lte(column: impl Into<String>, value: impl Into<SqlValue>) -> FilterNode {
    cmp(column, CmpOp::Lte, value)
}

pub fn gt(column: impl Into<String>, value: impl Into<SqlValue>) -> FilterNode {
    cmp(column, CmpOp::Gt, value)
}

pub fn gte(column: impl Into<String>, value: impl Into<SqlValue>) -> FilterNode {
    cmp(column, CmpOp::Gte, value)
}

pub fn like(column: impl Into<String>, pattern: impl Into<String>) -> FilterNode {
    cmp(column, CmpOp::Like, SqlValue::Text(pattern.into()))
}

pub fn cmp(column: impl Into<String>, op: CmpOp, value: impl Into<SqlValue>) -> FilterNode {
    FilterNode::Cmp {
        column: column.into(),
        op,
        value: value.into(),
    }
}

pub fn in_list(
    column: impl Into<String>,
    values: impl IntoIterator<Item = impl Into<SqlValue>>,
) -> FilterNode {
    FilterNode::In {
        column: column.into(),
        values: values.into_iter().map(Into::into).collect(),
    }
}

pub fn between(
    column: impl Into<String>,
    lo: impl Into<SqlValue>,
    hi: impl Into<SqlValue>,
) -> FilterNode {
    FilterNode::Between {
        column: column.into(),
        lo: lo.into(),
        hi: hi.into(),
    }
}

pub fn is_null(column: impl Into<String>) -> FilterNode {
    FilterNode::IsNull {
        column: column.into(),
        negated: false,
    }
}

pub fn is_not_null(column: impl Into<String>) -> FilterNode {
    FilterNode::IsNull {
        column: column.into(),
        negated: true,
    }
}

pub fn column_eq(left: impl Into<String>, right: impl Into<String>) -> FilterNode {
    FilterNode::ColumnCmp {
        left: left.into(),
        op: CmpOp::Eq,
        right: right.into(),
    }
}

pub fn and(children: impl IntoIterator<Item = FilterNode>) -> FilterNode {
    FilterNode::And(children.into_iter().collect())
}

pub fn or(children: impl IntoIterator<Item = FilterNode>) -> FilterNode {
    FilterNode::Or(children.into_iter().collect())
}

pub fn not(child: FilterNode) -> FilterNode {
    FilterNode::Not(Box::new(child))
}
