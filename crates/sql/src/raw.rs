use serde_json::Value as JsonValue;

use crate::value::SqlValue;

/// A composable parameterized SQL fragment.
///
/// Invariant: the number of `?` placeholders in `query` (outside string
/// literals and quoted identifiers) equals `params.len()`. Fragments
/// concatenate by joining query text and appending params, so a fragment tree
/// flattens to the same `{query, params}` regardless of its shape.
///
/// `debug_params` mirrors `params` but holds the pre-encoding, application-
/// typed values for logging; for values bound at the storage level the two
/// coincide.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawSql {
    pub query: String,
    pub params: Vec<SqlValue>,
    pub debug_params: Vec<JsonValue>,
}

impl RawSql {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            params: Vec::new(),
            debug_params: Vec::new(),
        }
    }

    pub fn with_params(query: impl Into<String>, params: Vec<SqlValue>) -> Self {
        let debug_params = params.iter().map(|p| p.to_json()).collect();
        Self {
            query: query.into(),
            params,
            debug_params,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.query.is_empty() && self.params.is_empty()
    }

    /// Appends raw query text without any parameters.
    pub fn push_str(&mut self, text: &str) -> &mut Self {
        self.query.push_str(text);
        self
    }

    /// Appends one `?` placeholder bound to `value`.
    pub fn bind(&mut self, value: impl Into<SqlValue>) -> &mut Self {
        let value = value.into();
        self.query.push('?');
        self.debug_params.push(value.to_json());
        self.params.push(value);
        self
    }

    /// Appends one `?` placeholder bound to an already-encoded storage value,
    /// keeping the application-typed image for logging.
    pub fn bind_encoded(&mut self, storage: SqlValue, app_image: JsonValue) -> &mut Self {
        self.query.push('?');
        self.params.push(storage);
        self.debug_params.push(app_image);
        self
    }

    /// Splices `other` in place: query text concatenated, params appended in
    /// order.
    pub fn append(&mut self, other: &RawSql) -> &mut Self {
        self.query.push_str(&other.query);
        self.params.extend(other.params.iter().cloned());
        self.debug_params.extend(other.debug_params.iter().cloned());
        self
    }

    /// Joins fragments with a separator, e.g. `", "` for select lists or
    /// `" AND "` for predicate chains.
    pub fn join<'a>(fragments: impl IntoIterator<Item = &'a RawSql>, separator: &str) -> RawSql {
        let mut out = RawSql::default();
        for (i, fragment) in fragments.into_iter().enumerate() {
            if i > 0 {
                out.push_str(separator);
            }
            out.append(fragment);
        }
        out
    }

    /// Counts `?` placeholders, skipping string literals and quoted
    /// identifiers.
    pub fn placeholder_count(&self) -> usize {
        let mut count = 0;
        let mut chars = self.query.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '?' => count += 1,
                '\'' | '"' | '`' => {
                    let quote = c;
                    while let Some(inner) = chars.next() {
                        if inner == quote {
                            // '' inside a string literal is an escaped quote.
                            if quote == '\'' && chars.peek() == Some(&'\'') {
                                chars.next();
                                continue;
                            }
                            break;
                        }
                    }
                },
                _ => {},
            }
        }
        count
    }

    /// Checks the placeholder/param-count invariant.
    pub fn verify(&self) -> bool {
        self.placeholder_count() == self.params.len()
    }
}

impl From<&RawSql> for RawSql {
    fn from(value: &RawSql) -> Self {
        value.clone()
    }
}

impl From<&str> for RawSql {
    fn from(value: &str) -> Self {
        RawSql::new(value)
    }
}

impl From<String> for RawSql {
    fn from(value: String) -> Self {
        RawSql::new(value)
    }
}

/// Builds a [`RawSql`] from alternating text segments and interpolations.
///
/// - a string literal appends query text verbatim;
/// - `{expr}` appends one `?` placeholder bound to `expr`;
/// - `[expr]` splices `expr` (anything `Into<RawSql>`, e.g. another fragment
///   or a filter tree) in place, its params appended in order.
///
/// ```ignore
/// let min_age = 21;
/// let q = sql!("SELECT name FROM users WHERE age > " {min_age} " AND " [filter]);
/// ```
#[macro_export]
macro_rules! sql {
    (@acc $acc:ident,) => {};
    (@acc $acc:ident, $lit:literal $($rest:tt)*) => {
        $acc.push_str($lit);
        $crate::sql!(@acc $acc, $($rest)*);
    };
    (@acc $acc:ident, {$e:expr} $($rest:tt)*) => {
        $acc.bind($e);
        $crate::sql!(@acc $acc, $($rest)*);
    };
    (@acc $acc:ident, [$e:expr] $($rest:tt)*) => {
        {
            let fragment: $crate::RawSql = ::core::convert::Into::into($e);
            $acc.append(&fragment);
        }
        $crate::sql!(@acc $acc, $($rest)*);
    };
    ($($parts:tt)+) => {{
        let mut acc = $crate::RawSql::default();
        $crate::sql!(@acc acc, $($parts)+);
        acc
    }};
}
